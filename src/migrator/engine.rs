//! Migrator Engine
//!
//! Moves claims from a legacy storage class onto the CSI driver without
//! copying data: the legacy volume is retained, the claim is recreated under
//! the destination class, and the legacy image is renamed onto the identity
//! the driver provisioned.
//!
//! # Safety Guarantees
//!
//! 1. The legacy volume is set to Retain before its claim is deleted
//! 2. Every wait is bounded; a timeout aborts the claim
//! 3. The placeholder image is removed before the rename targets its name
//! 4. Credential files are removed on every exit path
//! 5. Nothing is rolled back; a failed claim is left for the operator with
//!    the step it stopped at

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::domain::{ClusterApi, CommandRunner, PlacementAttributes};
use crate::error::{Error, Result};
use crate::gateway::{claims, volumes, Gateway, WaitConfig};
use crate::storage::{RbdClient, StorageConfig};

use super::resolver::ConnectionResolver;
use super::validate;

// =============================================================================
// Configuration
// =============================================================================

/// What happens to the rest of the batch when one claim fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop at the first failed claim
    #[default]
    AbortBatch,
    /// Record the failure and move on to the next claim
    Continue,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "abort-batch" => Ok(FailurePolicy::AbortBatch),
            "continue" => Ok(FailurePolicy::Continue),
            other => Err(format!(
                "unknown failure policy {:?} (expected abort-batch or continue)",
                other
            )),
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::AbortBatch => write!(f, "abort-batch"),
            FailurePolicy::Continue => write!(f, "continue"),
        }
    }
}

/// A single claim to migrate instead of a whole storage class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleClaim {
    pub name: String,
    pub namespace: String,
}

/// Configuration for the migrator
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Legacy class whose claims are migrated
    pub source_storage_class: Option<String>,

    /// CSI class the claims are recreated under
    pub destination_storage_class: String,

    /// Namespace holding the CSI cluster config map
    pub rook_namespace: String,

    /// Namespace holding the provisioner secret
    pub ceph_namespace: String,

    /// Restrict the batch to one claim
    pub single_claim: Option<SingleClaim>,

    pub failure_policy: FailurePolicy,

    /// Dry-run mode (resolve only, no changes)
    pub dry_run: bool,

    pub wait: WaitConfig,

    pub storage: StorageConfig,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            source_storage_class: None,
            destination_storage_class: String::new(),
            rook_namespace: "rook-ceph".to_string(),
            ceph_namespace: "rook-ceph".to_string(),
            single_claim: None,
            failure_policy: FailurePolicy::default(),
            dry_run: false,
            wait: WaitConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

// =============================================================================
// Migration State Machine
// =============================================================================

/// States in the migration of one claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MigrationState {
    /// Initial state
    Idle,
    /// Fetching the claim's bound volume
    Resolve,
    /// Setting the legacy volume to Retain
    Protect,
    /// Reading the legacy image name
    CaptureIdentity,
    /// Deleting the legacy claim
    ReleaseClaim,
    /// Recreating the claim under the destination class
    Reprovision,
    /// Reading the new volume's placement attributes
    ExtractIdentity,
    /// Opening the storage connection
    Connect,
    /// Removing the placeholder image and renaming the legacy image
    ReparentStorage,
    /// Deleting the legacy volume object
    Finalize,
    /// Migration completed successfully
    Completed,
    /// Migration failed
    Failed,
    /// Claim already on the destination class
    Skipped,
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationState::Idle => write!(f, "Idle"),
            MigrationState::Resolve => write!(f, "Resolve"),
            MigrationState::Protect => write!(f, "Protect"),
            MigrationState::CaptureIdentity => write!(f, "CaptureIdentity"),
            MigrationState::ReleaseClaim => write!(f, "ReleaseClaim"),
            MigrationState::Reprovision => write!(f, "Reprovision"),
            MigrationState::ExtractIdentity => write!(f, "ExtractIdentity"),
            MigrationState::Connect => write!(f, "Connect"),
            MigrationState::ReparentStorage => write!(f, "ReparentStorage"),
            MigrationState::Finalize => write!(f, "Finalize"),
            MigrationState::Completed => write!(f, "Completed"),
            MigrationState::Failed => write!(f, "Failed"),
            MigrationState::Skipped => write!(f, "Skipped"),
        }
    }
}

/// A step in the migration process
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStep {
    pub state: MigrationState,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub duration_ms: Option<u64>,
}

/// Result of migrating one claim
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    pub namespace: String,
    pub claim_name: String,

    /// Legacy volume the claim was bound to
    pub source_volume: Option<String>,

    /// Legacy image name
    pub legacy_image: Option<String>,

    /// Volume provisioned under the destination class
    pub target_volume: Option<String>,

    /// Image name the legacy image was renamed to
    pub target_image: Option<String>,

    /// Final state
    pub state: MigrationState,

    /// Step that was running when the migration failed
    pub failed_step: Option<MigrationState>,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration: Duration,

    /// Error if failed
    pub error: Option<String>,

    /// Step-by-step log
    pub steps: Vec<MigrationStep>,
}

impl MigrationResult {
    pub fn is_success(&self) -> bool {
        self.state == MigrationState::Completed
    }

    fn new(namespace: &str, claim_name: &str) -> Self {
        let now = Utc::now();
        Self {
            namespace: namespace.to_string(),
            claim_name: claim_name.to_string(),
            source_volume: None,
            legacy_image: None,
            target_volume: None,
            target_image: None,
            state: MigrationState::Idle,
            failed_step: None,
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
            error: None,
            steps: vec![],
        }
    }

    fn for_claim(claim: &PersistentVolumeClaim) -> Self {
        Self::new(
            claim.metadata.namespace.as_deref().unwrap_or_default(),
            claim.metadata.name.as_deref().unwrap_or_default(),
        )
    }

    /// Record a state transition
    fn transition(&mut self, state: MigrationState, message: &str) {
        self.state = state;
        self.push_step(message);
    }

    /// Record a message without changing state
    fn note(&mut self, message: &str) {
        self.push_step(message);
    }

    fn push_step(&mut self, message: &str) {
        let now = Utc::now();
        let last_step_time = self
            .steps
            .last()
            .map(|s| s.timestamp)
            .unwrap_or(self.start_time);
        let duration_ms = (now - last_step_time).num_milliseconds().max(0) as u64;

        self.steps.push(MigrationStep {
            state: self.state,
            timestamp: now,
            message: message.to_string(),
            duration_ms: Some(duration_ms),
        });

        self.end_time = now;
        self.duration = (now - self.start_time).to_std().unwrap_or(Duration::ZERO);
    }

    /// Mark as failed, remembering the step that was running
    fn fail(&mut self, error: &Error) {
        let message = error.to_string();
        self.failed_step = Some(self.state);
        self.transition(MigrationState::Failed, &message);
        self.error = Some(message);
    }

    fn skip(&mut self, reason: &str) {
        self.transition(MigrationState::Skipped, reason);
    }
}

/// Outcome of a batch
#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub failure_policy: FailurePolicy,

    pub migrated: usize,
    /// Claims that passed resolution in a dry run; nothing was changed
    pub verified: usize,
    pub failed: usize,
    pub skipped: usize,

    /// Claims never attempted because the batch was aborted
    pub not_attempted: usize,

    pub aborted: bool,
    pub results: Vec<MigrationResult>,

    /// Errors of the failed claims, in order
    #[serde(skip)]
    pub failures: Vec<Error>,
}

impl BatchReport {
    fn new(dry_run: bool, failure_policy: FailurePolicy) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            dry_run,
            failure_policy,
            migrated: 0,
            verified: 0,
            failed: 0,
            skipped: 0,
            not_attempted: 0,
            aborted: false,
            results: vec![],
            failures: vec![],
        }
    }

    fn record(&mut self, result: MigrationResult) {
        match result.state {
            MigrationState::Completed if self.dry_run => self.verified += 1,
            MigrationState::Completed => self.migrated += 1,
            MigrationState::Skipped => self.skipped += 1,
            _ => self.failed += 1,
        }
        self.results.push(result);
    }

    /// True when no claim failed
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn first_failure(&self) -> Option<&Error> {
        self.failures.first()
    }

    pub fn result(&self, namespace: &str, claim_name: &str) -> Option<&MigrationResult> {
        self.results
            .iter()
            .find(|r| r.namespace == namespace && r.claim_name == claim_name)
    }
}

fn in_step(namespace: &str, name: &str, step: MigrationState) -> impl FnOnce(Error) -> Error {
    let namespace = namespace.to_string();
    let name = name.to_string();
    move |source| Error::ClaimMigrationFailed {
        namespace,
        name,
        step: step.to_string(),
        source: Box::new(source),
    }
}

// =============================================================================
// Migrator
// =============================================================================

/// Migrates claims from the legacy provisioner onto the CSI driver
pub struct Migrator {
    config: MigratorConfig,
    gateway: Gateway,
    resolver: ConnectionResolver,
}

impl Migrator {
    pub fn new(
        config: MigratorConfig,
        api: Arc<dyn ClusterApi>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let gateway = Gateway::new(api, config.wait.clone());
        let resolver = ConnectionResolver::new(
            gateway.clone(),
            runner,
            config.storage.clone(),
            config.rook_namespace.clone(),
            config.ceph_namespace.clone(),
        );
        Self {
            config,
            gateway,
            resolver,
        }
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    /// Validates the inputs, then migrates every selected claim in order.
    ///
    /// Only batch-level problems (pre-flight, enumeration) return `Err`;
    /// per-claim failures are recorded in the report.
    #[instrument(skip(self), fields(destination = %self.config.destination_storage_class))]
    pub async fn run(&self) -> Result<BatchReport> {
        validate::preflight(&self.gateway, &self.config).await?;

        let claims = self.list_claims().await?;
        let mut report = BatchReport::new(self.config.dry_run, self.config.failure_policy);

        if claims.is_empty() {
            info!("No PVCs to migrate");
            report.finished_at = Utc::now();
            return Ok(report);
        }
        info!("{} PVC(s) selected for migration", claims.len());

        for (index, claim) in claims.iter().enumerate() {
            let mut result = MigrationResult::for_claim(claim);

            if claims::uses_storage_class(claim, &self.config.destination_storage_class) {
                info!(
                    "PVC {}/{} already uses storage class {}, skipping",
                    result.namespace, result.claim_name, self.config.destination_storage_class
                );
                result.skip("Already on destination storage class");
                report.record(result);
                continue;
            }

            match self.migrate_claim(claim, &mut result).await {
                Ok(()) => report.record(result),
                Err(e) => {
                    error!("{}", e);
                    result.fail(&e);
                    report.record(result);
                    report.failures.push(e);

                    if self.config.failure_policy == FailurePolicy::AbortBatch {
                        report.aborted = true;
                        report.not_attempted = claims.len() - index - 1;
                        warn!(
                            "Aborting batch, {} PVC(s) not attempted",
                            report.not_attempted
                        );
                        break;
                    }
                }
            }
        }

        report.finished_at = Utc::now();
        if report.dry_run {
            info!(
                "Dry run finished: {} verified, {} failed, {} skipped",
                report.verified, report.failed, report.skipped
            );
        } else {
            info!(
                "Batch finished: {} migrated, {} failed, {} skipped",
                report.migrated, report.failed, report.skipped
            );
        }
        Ok(report)
    }

    /// Claims the batch covers, in enumeration order.
    pub async fn list_claims(&self) -> Result<Vec<PersistentVolumeClaim>> {
        match (&self.config.single_claim, &self.config.source_storage_class) {
            (Some(single), _) => {
                self.gateway
                    .list_single_claim(&single.name, &single.namespace)
                    .await
            }
            (None, Some(source)) => self.gateway.list_claims_by_storage_class(source).await,
            (None, None) => Err(Error::Configuration(
                "either a source storage class or a single claim must be given".to_string(),
            )),
        }
    }

    /// Drives one claim through the nine migration steps.
    ///
    /// The first failing step aborts and its error is returned wrapped with
    /// the claim identity and step name. `result` records progress either way.
    #[instrument(
        skip(self, claim, result),
        fields(namespace = ?claim.metadata.namespace, claim = ?claim.metadata.name)
    )]
    pub async fn migrate_claim(
        &self,
        claim: &PersistentVolumeClaim,
        result: &mut MigrationResult,
    ) -> Result<()> {
        let (namespace, name) = claims::claim_identity(claim)
            .map_err(in_step(&result.namespace, &result.claim_name, MigrationState::Resolve))?;
        let step = |state| in_step(&namespace, &name, state);
        info!("Migrating PVC {}/{}", namespace, name);

        // 1. Resolve
        result.transition(MigrationState::Resolve, "Fetching bound volume");
        let volume_name = claims::bound_volume_name(claim)
            .ok_or_else(|| {
                Error::missing_field(
                    format!("PersistentVolumeClaim/{}/{}", namespace, name),
                    "spec.volumeName",
                )
            })
            .map_err(step(MigrationState::Resolve))?
            .to_string();
        let volume = self
            .gateway
            .get_volume(&volume_name)
            .await
            .map_err(step(MigrationState::Resolve))?;
        result.source_volume = Some(volume_name.clone());

        if self.config.dry_run {
            info!(
                "[DRY-RUN] Would migrate PVC {}/{} (PV {}) to storage class {}",
                namespace, name, volume_name, self.config.destination_storage_class
            );
            result.transition(
                MigrationState::Completed,
                "Dry-run completed (no changes made)",
            );
            return Ok(());
        }

        // 2. Protect
        result.transition(MigrationState::Protect, "Setting reclaim policy to Retain");
        info!("Set PV {} reclaim policy to Retain", volume_name);
        self.gateway
            .retain_volume(volume)
            .await
            .map_err(step(MigrationState::Protect))?;

        // 3. Capture identity
        result.transition(MigrationState::CaptureIdentity, "Reading legacy image name");
        let legacy_volume = self
            .gateway
            .get_volume(&volume_name)
            .await
            .map_err(step(MigrationState::CaptureIdentity))?;
        let legacy_image = volumes::legacy_image_name(&legacy_volume)
            .ok_or_else(|| {
                Error::missing_field(format!("PersistentVolume/{}", volume_name), "metadata.name")
            })
            .map_err(step(MigrationState::CaptureIdentity))?;
        result.legacy_image = Some(legacy_image.clone());

        // 4. Release claim
        result.transition(MigrationState::ReleaseClaim, "Deleting legacy PVC");
        info!("Delete PVC {}/{}", namespace, name);
        self.gateway
            .delete_claim(&namespace, &name)
            .await
            .map_err(step(MigrationState::ReleaseClaim))?;

        // 5. Re-provision
        result.transition(
            MigrationState::Reprovision,
            &format!(
                "Recreating PVC under storage class {}",
                self.config.destination_storage_class
            ),
        );
        let replacement = claims::replacement_claim(claim, &self.config.destination_storage_class);
        let target = self
            .gateway
            .create_claim(&replacement)
            .await
            .map_err(step(MigrationState::Reprovision))?;
        let target_volume = volumes::volume_name(&target).to_string();
        result.target_volume = Some(target_volume.clone());

        // 6. Extract new identity
        result.transition(MigrationState::ExtractIdentity, "Reading placement attributes");
        let placement = self
            .gateway
            .wait_for_placement(&target_volume)
            .await
            .map_err(step(MigrationState::ExtractIdentity))?;
        result.target_image = Some(placement.image_name.clone());
        info!(
            "New PV {} uses image {} in pool {}",
            target_volume, placement.image_name, placement.pool
        );

        // 7. Connect
        result.transition(MigrationState::Connect, "Opening storage connection");
        let client = self
            .resolver
            .resolve(&target_volume, &placement)
            .await
            .map_err(step(MigrationState::Connect))?;

        // 8 + 9 run with the connection open; it is closed whatever happens.
        let outcome = self
            .reparent_and_finalize(&client, &placement, &legacy_image, &volume_name, result)
            .await;
        let closed = client.close();
        outcome.map_err(|(state, e)| step(state)(e))?;

        if let Err(e) = closed {
            warn!("Credential cleanup after PVC {}/{}: {}", namespace, name, e);
            result.note(&format!("Warning: {}", e));
        }

        result.transition(MigrationState::Completed, "Migration completed successfully");
        info!("Successfully migrated PVC {}/{}", namespace, name);
        Ok(())
    }

    async fn reparent_and_finalize(
        &self,
        client: &RbdClient,
        placement: &PlacementAttributes,
        legacy_image: &str,
        legacy_volume: &str,
        result: &mut MigrationResult,
    ) -> std::result::Result<(), (MigrationState, Error)> {
        // 8. Reparent storage
        result.transition(
            MigrationState::ReparentStorage,
            &format!(
                "Replacing placeholder image {} with {}",
                placement.image_name, legacy_image
            ),
        );
        info!("Removing placeholder image {}", placement.image_name);
        client
            .remove_image(&placement.pool, &placement.image_name)
            .await
            .map_err(|e| (MigrationState::ReparentStorage, e))?;
        info!("Renaming image {} to {}", legacy_image, placement.image_name);
        client
            .rename_image(legacy_image, &placement.image_name)
            .await
            .map_err(|e| (MigrationState::ReparentStorage, e))?;

        // 9. Finalize
        result.transition(MigrationState::Finalize, "Deleting legacy PV");
        info!("Delete PV {}", legacy_volume);
        self.gateway
            .delete_volume(legacy_volume)
            .await
            .map_err(|e| (MigrationState::Finalize, e))
    }
}
