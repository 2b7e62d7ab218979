//! PV Migrator Integration Tests
//!
//! Drives the whole migration against the in-memory cluster and image pool:
//! - End-to-end migration and the resulting pool contents
//! - Ordering guarantees (Retain before delete, rm before rename)
//! - Failure paths and what they leave behind
//! - Batch policies, dry run, skipping and single-claim mode

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tempfile::TempDir;

use pv_migrator::adapters::{InMemoryCluster, InMemoryImagePool};
use pv_migrator::gateway::{claims, volumes};
use pv_migrator::migrator::MigrationState;
use pv_migrator::{
    Error, FailurePolicy, Gateway, Migrator, MigratorConfig, SingleClaim, StorageConfig,
    WaitConfig,
};

const POOL: &str = "replicapool";
const REGISTRY: &str = r#"[{"clusterID":"rook-ceph","monitors":["10.0.0.1:6789","10.0.0.2:6789"]}]"#;

struct Fixture {
    cluster: Arc<InMemoryCluster>,
    pool: Arc<InMemoryImagePool>,
    keys: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let pool = Arc::new(InMemoryImagePool::new());
        let cluster = Arc::new(InMemoryCluster::with_image_pool(pool.clone()));
        cluster.add_namespace("rook-ceph");
        cluster.add_legacy_storage_class("legacy");
        cluster.add_csi_storage_class("csi", "rook-ceph", POOL);
        cluster.set_registry("rook-ceph", REGISTRY);
        cluster.set_credential("rook-ceph", "csi-rbd-provisioner", "AQBkey==");

        Self {
            cluster,
            pool,
            keys: tempfile::tempdir().unwrap(),
        }
    }

    /// Legacy claim `ns/name` bound to volume `volume` whose image holds `data`.
    fn legacy_claim(&self, namespace: &str, name: &str, volume: &str, data: &[u8]) {
        self.cluster
            .add_bound_claim(namespace, name, Some("legacy"), None, volume);
        self.pool.add_image(POOL, volume, data);
    }

    fn config(&self) -> MigratorConfig {
        MigratorConfig {
            source_storage_class: Some("legacy".to_string()),
            destination_storage_class: "csi".to_string(),
            wait: WaitConfig {
                poll_interval: Duration::from_millis(5),
                delete_timeout: Duration::from_millis(500),
                bind_timeout: Duration::from_millis(300),
                attribute_interval: Duration::from_millis(5),
                attribute_attempts: 5,
            },
            storage: StorageConfig {
                program: "rbd".to_string(),
                key_dir: self.keys.path().to_path_buf(),
            },
            ..Default::default()
        }
    }

    fn migrator(&self, config: MigratorConfig) -> Migrator {
        Migrator::new(config, self.cluster.clone(), self.pool.clone())
    }

    fn position(&self, operation: &str) -> Option<usize> {
        self.cluster
            .operations()
            .iter()
            .position(|op| op == operation)
    }

    fn assert_retained_legacy(&self, volume: &str) {
        let pv = self.cluster.volume(volume).expect("legacy volume removed");
        assert_eq!(volumes::reclaim_policy(&pv), Some(volumes::RECLAIM_RETAIN));
        assert!(self.pool.image(POOL, volume).is_some());
    }
}

fn key_file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

// =============================================================================
// End-to-End Migration
// =============================================================================

mod migration_tests {
    use super::*;

    #[tokio::test]
    async fn test_legacy_claim_moves_onto_csi_image() {
        let fx = Fixture::new();
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"legacy-bytes");
        fx.cluster.queue_image_name("img-123");

        let report = fx.migrator(fx.config()).run().await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.migrated, 1);

        // Same identity, new class, new volume
        let claim = fx.cluster.claim("ns1", "pvc-a").unwrap();
        assert_eq!(claims::effective_storage_class(&claim), Some("csi"));
        let bound = claims::bound_volume_name(&claim).unwrap().to_string();
        assert_ne!(bound, "v-a");
        let pv = fx.cluster.volume(&bound).unwrap();
        assert_eq!(volumes::placement_attributes(&pv).image_name, "img-123");

        // Exactly one image, carrying the legacy bytes
        assert_eq!(fx.pool.images(POOL), vec!["img-123".to_string()]);
        assert_eq!(fx.pool.image(POOL, "img-123"), Some(b"legacy-bytes".to_vec()));
        assert!(fx.cluster.volume("v-a").is_none());

        let result = report.result("ns1", "pvc-a").unwrap();
        assert_eq!(result.target_volume.as_deref(), Some(bound.as_str()));
        assert_eq!(result.target_image.as_deref(), Some("img-123"));
    }

    #[tokio::test]
    async fn test_every_claim_of_the_class_is_migrated() {
        let fx = Fixture::new();
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"a");
        fx.legacy_claim("ns2", "pvc-b", "v-b", b"b");
        fx.legacy_claim("ns2", "pvc-c", "v-c", b"c");

        let report = fx.migrator(fx.config()).run().await.unwrap();

        assert_eq!(report.migrated, 3);
        let images = fx.pool.images(POOL);
        assert_eq!(images.len(), 3);
        assert!(images.iter().all(|i| i.starts_with("csi-vol-")));
        for volume in ["v-a", "v-b", "v-c"] {
            assert!(fx.cluster.volume(volume).is_none());
        }
    }

    #[tokio::test]
    async fn test_late_placement_attributes() {
        let fx = Fixture::new();
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"data");
        fx.cluster.set_provisioned_attribute_delay(3);
        fx.cluster.set_bind_delay(2);
        fx.cluster.set_delete_delay(2);

        let report = fx.migrator(fx.config()).run().await.unwrap();
        assert!(report.is_success());
        assert!(fx.cluster.volume("v-a").is_none());
    }

    #[tokio::test]
    async fn test_no_key_files_left_behind() {
        let fx = Fixture::new();
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"a");
        fx.legacy_claim("ns1", "pvc-b", "v-b", b"b");

        fx.migrator(fx.config()).run().await.unwrap();

        let seen = fx.pool.key_files_seen();
        assert_eq!(seen.len(), 4);
        // one key file per claim
        assert_eq!(seen[0], seen[1]);
        assert_ne!(seen[1], seen[2]);
        assert!(seen.iter().all(|p| !p.exists()));
        assert_eq!(key_file_count(fx.keys.path()), 0);
    }
}

// =============================================================================
// Ordering Guarantees
// =============================================================================

mod ordering_tests {
    use super::*;

    #[tokio::test]
    async fn test_retain_before_claim_deletion() {
        let fx = Fixture::new();
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"data");

        fx.migrator(fx.config()).run().await.unwrap();

        let retain = fx.position("replace_volume v-a Retain").unwrap();
        let delete = fx.position("delete_claim ns1/pvc-a").unwrap();
        assert!(retain < delete);
        // The legacy volume was released, never reclaimed
        assert!(fx.position("release v-a").is_some());
        assert!(fx.position("reclaim v-a").is_none());
    }

    #[tokio::test]
    async fn test_placeholder_removed_before_rename() {
        let fx = Fixture::new();
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"data");
        fx.cluster.queue_image_name("img-123");

        fx.migrator(fx.config()).run().await.unwrap();

        let commands = fx.pool.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0][..2], ["rm", "img-123"]);
        assert_eq!(commands[1][..3], ["rename", "v-a", "img-123"]);
    }

    #[tokio::test]
    async fn test_retain_before_delete_on_failing_path() {
        let fx = Fixture::new();
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"data");
        fx.cluster.fail_operation("create_claim", "admission webhook denied");

        let report = fx.migrator(fx.config()).run().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(
            report.results[0].failed_step,
            Some(MigrationState::Reprovision)
        );
        let retain = fx.position("replace_volume v-a Retain").unwrap();
        let delete = fx.position("delete_claim ns1/pvc-a").unwrap();
        assert!(retain < delete);

        fx.assert_retained_legacy("v-a");
        assert_eq!(
            volumes::volume_phase(&fx.cluster.volume("v-a").unwrap()),
            Some(volumes::VOLUME_RELEASED)
        );
    }

    #[tokio::test]
    async fn test_protect_failure_deletes_nothing() {
        let fx = Fixture::new();
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"data");
        fx.cluster.fail_operation("replace_volume", "conflict");

        let report = fx.migrator(fx.config()).run().await.unwrap();

        assert_eq!(
            report.results[0].failed_step,
            Some(MigrationState::Protect)
        );
        assert!(fx.position("delete_claim ns1/pvc-a").is_none());
        assert!(fx.cluster.claim("ns1", "pvc-a").is_some());
        assert!(fx.pool.image(POOL, "v-a").is_some());
    }
}

// =============================================================================
// Failure Paths
// =============================================================================

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_cluster_aborts_before_storage_commands() {
        let fx = Fixture::new();
        fx.cluster.set_registry(
            "rook-ceph",
            r#"[{"clusterID":"elsewhere","monitors":["10.9.9.9:6789"]}]"#,
        );
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"data");

        let report = fx.migrator(fx.config()).run().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.results[0].failed_step, Some(MigrationState::Connect));
        assert_matches!(
            report.first_failure().map(Error::root),
            Some(Error::MissingField { .. })
        );
        assert!(fx.pool.commands().is_empty());
        assert_eq!(key_file_count(fx.keys.path()), 0);
        fx.assert_retained_legacy("v-a");
    }

    #[tokio::test]
    async fn test_rename_failure_leaves_legacy_untouched() {
        let fx = Fixture::new();
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"data");
        fx.cluster.queue_image_name("img-123");
        fx.pool.fail_command("rename", "rbd: rename error: (5) Input/output error");

        let report = fx.migrator(fx.config()).run().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(
            report.results[0].failed_step,
            Some(MigrationState::ReparentStorage)
        );
        let failure = report.first_failure().unwrap();
        assert_matches!(
            failure,
            Error::ClaimMigrationFailed { step, .. } if step == "ReparentStorage"
        );
        assert_matches!(
            failure.root(),
            Error::StorageCommandFailed { output, .. } if output.contains("Input/output")
        );

        fx.assert_retained_legacy("v-a");
        assert_eq!(fx.pool.image(POOL, "v-a"), Some(b"data".to_vec()));
        // Placeholder already removed
        assert!(fx.pool.image(POOL, "img-123").is_none());
        assert_eq!(key_file_count(fx.keys.path()), 0);
    }

    #[tokio::test]
    async fn test_bind_timeout() {
        let fx = Fixture::new();
        fx.cluster.add_legacy_storage_class("unprovisioned");
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"data");

        let config = MigratorConfig {
            destination_storage_class: "unprovisioned".to_string(),
            ..fx.config()
        };
        let report = fx.migrator(config).run().await.unwrap();

        assert_matches!(
            report.first_failure().map(Error::root),
            Some(Error::Timeout { .. })
        );
        assert_eq!(
            report.results[0].failed_step,
            Some(MigrationState::Reprovision)
        );
        fx.assert_retained_legacy("v-a");
    }

    #[tokio::test]
    async fn test_missing_destination_class_fails_batch() {
        let fx = Fixture::new();
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"data");
        let config = MigratorConfig {
            destination_storage_class: "csi-typo".to_string(),
            ..fx.config()
        };

        let err = fx.migrator(config).run().await.unwrap_err();

        assert!(err.is_not_found());
        assert!(fx.cluster.operations().is_empty());
    }
}

// =============================================================================
// Batch Behaviour
// =============================================================================

mod batch_tests {
    use super::*;

    /// `pvc-a` fails at the rename (its image is missing), `pvc-b` is healthy.
    fn broken_then_healthy() -> Fixture {
        let fx = Fixture::new();
        fx.cluster
            .add_bound_claim("ns1", "pvc-a", Some("legacy"), None, "v-a");
        fx.legacy_claim("ns1", "pvc-b", "v-b", b"b");
        fx
    }

    #[tokio::test]
    async fn test_abort_batch_stops_at_first_failure() {
        let fx = broken_then_healthy();

        let report = fx.migrator(fx.config()).run().await.unwrap();

        assert!(report.aborted);
        assert_eq!((report.migrated, report.failed), (0, 1));
        assert_eq!(report.not_attempted, 1);
        assert!(fx.position("delete_claim ns1/pvc-b").is_none());
        assert!(fx.pool.image(POOL, "v-b").is_some());
    }

    #[tokio::test]
    async fn test_continue_policy_migrates_the_rest() {
        let fx = broken_then_healthy();
        let config = MigratorConfig {
            failure_policy: FailurePolicy::Continue,
            ..fx.config()
        };

        let report = fx.migrator(config).run().await.unwrap();

        assert!(!report.aborted);
        assert_eq!((report.migrated, report.failed), (1, 1));
        assert!(!report.is_success());
        assert!(report.result("ns1", "pvc-b").unwrap().is_success());
        assert!(fx.cluster.volume("v-b").is_none());
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let fx = Fixture::new();
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"data");
        let config = MigratorConfig {
            dry_run: true,
            ..fx.config()
        };

        let report = fx.migrator(config).run().await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.results[0].state, MigrationState::Completed);
        assert_eq!((report.migrated, report.verified), (0, 1));
        assert!(fx.cluster.operations().is_empty());
        assert!(fx.pool.commands().is_empty());
        assert_eq!(
            volumes::reclaim_policy(&fx.cluster.volume("v-a").unwrap()),
            Some(volumes::RECLAIM_DELETE)
        );
    }

    #[tokio::test]
    async fn test_empty_batch_succeeds() {
        let fx = Fixture::new();

        let report = fx.migrator(fx.config()).run().await.unwrap();

        assert!(report.is_success());
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn test_single_claim_mode() {
        let fx = Fixture::new();
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"a");
        fx.legacy_claim("ns1", "pvc-b", "v-b", b"b");
        let config = MigratorConfig {
            source_storage_class: None,
            single_claim: Some(SingleClaim {
                name: "pvc-b".to_string(),
                namespace: "ns1".to_string(),
            }),
            ..fx.config()
        };

        let report = fx.migrator(config).run().await.unwrap();

        assert_eq!(report.migrated, 1);
        assert!(fx.cluster.volume("v-a").is_some());
        assert!(fx.cluster.volume("v-b").is_none());
    }

    #[tokio::test]
    async fn test_single_claim_not_found_is_empty() {
        let fx = Fixture::new();
        let config = MigratorConfig {
            single_claim: Some(SingleClaim {
                name: "ghost".to_string(),
                namespace: "ns1".to_string(),
            }),
            ..fx.config()
        };

        let report = fx.migrator(config).run().await.unwrap();
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn test_claim_on_destination_class_is_skipped() {
        let fx = Fixture::new();
        fx.cluster
            .add_bound_claim("ns1", "pvc-a", Some("csi"), None, "pvc-existing");
        let config = MigratorConfig {
            single_claim: Some(SingleClaim {
                name: "pvc-a".to_string(),
                namespace: "ns1".to_string(),
            }),
            ..fx.config()
        };

        let report = fx.migrator(config).run().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.results[0].state, MigrationState::Skipped);
        assert!(fx.cluster.operations().is_empty());
    }

    #[tokio::test]
    async fn test_report_serializes() {
        let fx = Fixture::new();
        fx.legacy_claim("ns1", "pvc-a", "v-a", b"data");

        let report = fx.migrator(fx.config()).run().await.unwrap();
        let json: serde_json::Value = serde_json::to_value(&report).unwrap();

        assert_eq!(json["migrated"], 1);
        assert_eq!(json["results"][0]["claim_name"], "pvc-a");
        assert_eq!(json["results"][0]["steps"].as_array().unwrap().len(), 10);
    }
}

// =============================================================================
// Claim Enumeration
// =============================================================================

mod enumeration_tests {
    use super::*;

    #[tokio::test]
    async fn test_list_by_class_honours_legacy_annotation() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_bound_claim("ns1", "a", Some("legacy"), None, "v-a");
        cluster.add_bound_claim("ns1", "b", Some("csi"), Some("legacy"), "v-b");
        cluster.add_bound_claim("ns2", "c", Some("legacy"), None, "v-c");
        cluster.add_bound_claim("ns2", "d", None, Some("legacy"), "v-d");
        cluster.add_bound_claim("ns3", "e", Some("legacy"), None, "v-e");
        let gateway = Gateway::new(cluster, WaitConfig::default());

        let claims = gateway.list_claims_by_storage_class("legacy").await.unwrap();
        let names: Vec<_> = claims
            .iter()
            .filter_map(|c| c.metadata.name.as_deref())
            .collect();

        assert_eq!(names, vec!["a", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_list_fails_on_transport_error() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespace("ns1");
        cluster.fail_operation("list_claims", "too many requests");
        let gateway = Gateway::new(cluster, WaitConfig::default());

        assert_matches!(
            gateway.list_claims_by_storage_class("legacy").await,
            Err(Error::Transport(_))
        );
    }
}
