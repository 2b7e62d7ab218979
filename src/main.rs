//! PV Migrator
//!
//! One-shot batch that moves claims from a legacy RBD storage class onto the
//! Ceph CSI driver.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          pv-migrator                            │
//! ├────────────────────────────────────────────────────────────────┤
//! │  Pre-flight ──▶ Enumerate claims ──▶ Migrate each claim         │
//! │                                       (Retain, recreate,        │
//! │                                        rbd rm + rbd rename)     │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pv_migrator::adapters::{KubeClusterApi, ProcessCommandRunner};
use pv_migrator::{
    FailurePolicy, Migrator, MigratorConfig, SingleClaim, StorageConfig, WaitConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// PV Migrator - move legacy RBD volumes onto the Ceph CSI driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a kubeconfig; in-cluster or default discovery when absent
    #[arg(long, env = "KUBERNETES_CONFIG_PATH")]
    kubeconfig: Option<PathBuf>,

    /// Storage class whose claims are migrated
    #[arg(long, env = "SOURCE_STORAGE_CLASS", required_unless_present = "pvc")]
    source_storage_class: Option<String>,

    /// CSI storage class the claims are recreated under
    #[arg(long, env = "DESTINATION_STORAGE_CLASS")]
    destination_storage_class: String,

    /// Namespace of the rook operator (CSI cluster config map)
    #[arg(long, env = "ROOK_NAMESPACE", default_value = "rook-ceph")]
    rook_namespace: String,

    /// Namespace of the Ceph cluster (provisioner secret)
    #[arg(long, env = "CEPH_CLUSTER_NAMESPACE", default_value = "rook-ceph")]
    ceph_cluster_namespace: String,

    /// Migrate only this claim
    #[arg(long, requires = "pvc_namespace")]
    pvc: Option<String>,

    /// Namespace of the claim given with --pvc
    #[arg(long, requires = "pvc")]
    pvc_namespace: Option<String>,

    /// What to do after a claim fails (abort-batch, continue)
    #[arg(long, env = "FAILURE_POLICY", default_value = "abort-batch")]
    failure_policy: FailurePolicy,

    /// Enable dry-run mode (resolve only, no changes)
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    /// Interval between convergence checks in seconds
    #[arg(long, default_value = "2", value_parser = clap::value_parser!(u64).range(1..))]
    poll_interval_seconds: u64,

    /// Bound for a deleted claim or volume to disappear in seconds
    #[arg(long, default_value = "60")]
    delete_timeout_seconds: u64,

    /// Bound for a recreated claim to bind in seconds
    #[arg(long, default_value = "300")]
    bind_timeout_seconds: u64,

    /// Directory for temporary Ceph key files
    #[arg(long, env = "PV_MIGRATOR_KEY_DIR", default_value = pv_migrator::storage::DEFAULT_KEY_DIR)]
    key_dir: PathBuf,

    /// rbd executable
    #[arg(long, env = "RBD_BINARY", default_value = "rbd")]
    rbd_binary: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the batch report as JSON on stdout
    #[arg(long)]
    report_json: bool,
}

impl Args {
    fn migrator_config(&self) -> MigratorConfig {
        let single_claim = match (&self.pvc, &self.pvc_namespace) {
            (Some(name), Some(namespace)) => Some(SingleClaim {
                name: name.clone(),
                namespace: namespace.clone(),
            }),
            _ => None,
        };

        MigratorConfig {
            source_storage_class: self.source_storage_class.clone(),
            destination_storage_class: self.destination_storage_class.clone(),
            rook_namespace: self.rook_namespace.clone(),
            ceph_namespace: self.ceph_cluster_namespace.clone(),
            single_claim,
            failure_policy: self.failure_policy,
            dry_run: self.dry_run,
            wait: WaitConfig {
                poll_interval: Duration::from_secs(self.poll_interval_seconds),
                delete_timeout: Duration::from_secs(self.delete_timeout_seconds),
                bind_timeout: Duration::from_secs(self.bind_timeout_seconds),
                ..Default::default()
            },
            storage: StorageConfig {
                program: self.rbd_binary.clone(),
                key_dir: self.key_dir.clone(),
            },
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting PV Migrator");
    info!(
        "  Source storage class: {}",
        args.source_storage_class.as_deref().unwrap_or("-")
    );
    info!("  Destination storage class: {}", args.destination_storage_class);
    info!("  Rook namespace: {}", args.rook_namespace);
    info!("  Ceph cluster namespace: {}", args.ceph_cluster_namespace);
    info!("  Failure policy: {}", args.failure_policy);
    info!("  Dry-run mode: {}", args.dry_run);

    let api = KubeClusterApi::connect(args.kubeconfig.as_deref())
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let migrator = Migrator::new(
        args.migrator_config(),
        Arc::new(api),
        Arc::new(ProcessCommandRunner),
    );

    let report = migrator.run().await.context("migration batch failed")?;

    if args.report_json {
        let json = serde_json::to_string_pretty(&report).context("failed to render report")?;
        println!("{}", json);
    }

    if let Some(failure) = report.first_failure() {
        error!("First failure: {}", failure);
    }
    if report.is_success() {
        info!("PV Migrator finished");
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
