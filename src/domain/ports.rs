//! Domain Ports (Port/Adapter Pattern)
//!
//! The migrator depends on two external collaborators: the Kubernetes
//! control plane and the Ceph `rbd` command line. Both are reached only
//! through the traits below so the orchestration logic can run against the
//! real cluster or against the in-memory adapters used by the tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Migrator / Gateway / Resolver / RbdClient         │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │            ClusterApi   │   CommandRunner            │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  KubeClusterApi │ ProcessCommandRunner │ InMemory* (tests)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// One entry of the CSI cluster registry: a storage cluster and its monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    #[serde(default)]
    pub monitors: Vec<String>,
}

impl RegistryEntry {
    pub fn new(cluster_id: impl Into<String>, monitors: &[&str]) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            monitors: monitors.iter().map(|m| m.to_string()).collect(),
        }
    }

    /// Monitor endpoints in the comma-joined form `rbd -m` expects.
    pub fn monitor_list(&self) -> String {
        self.monitors.join(",")
    }
}

/// Ceph identity used to authenticate storage commands.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user_id: String,
    pub key: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Placement attributes the CSI driver records on a provisioned volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacementAttributes {
    pub image_name: String,
    pub pool: String,
    pub cluster_id: String,
    pub data_pool: Option<String>,
}

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// stdout and stderr, combined
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

// =============================================================================
// Control Plane Port
// =============================================================================

/// Raw control-plane primitives.
///
/// Implementations must report an absent object as
/// [`Error::ResourceNotFound`](crate::error::Error::ResourceNotFound) and
/// every other failure as a transport error. No retries happen at this level;
/// convergence waits live in [`Gateway`](crate::gateway::Gateway).
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_volume(&self, name: &str) -> Result<PersistentVolume>;

    /// Full replace of a volume object (last writer wins).
    async fn replace_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume>;

    /// Request deletion; returns once the request is accepted.
    async fn delete_volume(&self, name: &str) -> Result<()>;

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim>;

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    /// Request deletion; returns once the request is accepted.
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_claims(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>>;

    async fn list_namespaces(&self) -> Result<Vec<String>>;

    async fn get_namespace(&self, name: &str) -> Result<()>;

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass>;

    async fn get_config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>>;

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>>;
}

// =============================================================================
// Storage Command Port
// =============================================================================

/// Runs a storage-cluster command line tool.
///
/// A non-zero exit is reported through [`CommandOutput::success`], not as an
/// `Err`; `Err` is reserved for failing to launch the program at all.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}
