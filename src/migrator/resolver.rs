//! Connection Resolver
//!
//! Turns a provisioned volume's placement attributes into an open
//! [`RbdClient`]: registry lookup for the monitors, secret lookup for the
//! identity. Every input is checked before the credential file is written,
//! so a failed resolve never issues a storage command nor leaves a key file.

use std::sync::Arc;

use tracing::debug;

use crate::domain::{CommandRunner, PlacementAttributes};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::storage::{ClusterConnection, RbdClient, StorageConfig};

pub struct ConnectionResolver {
    gateway: Gateway,
    runner: Arc<dyn CommandRunner>,
    storage: StorageConfig,
    rook_namespace: String,
    ceph_namespace: String,
}

impl ConnectionResolver {
    pub fn new(
        gateway: Gateway,
        runner: Arc<dyn CommandRunner>,
        storage: StorageConfig,
        rook_namespace: impl Into<String>,
        ceph_namespace: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            runner,
            storage,
            rook_namespace: rook_namespace.into(),
            ceph_namespace: ceph_namespace.into(),
        }
    }

    /// Opens a client against the cluster `placement` points at.
    pub async fn resolve(
        &self,
        volume_name: &str,
        placement: &PlacementAttributes,
    ) -> Result<RbdClient> {
        let resource = format!("PersistentVolume/{}", volume_name);
        if placement.pool.is_empty() {
            return Err(Error::missing_field(resource, "spec.csi.volumeAttributes.pool"));
        }
        if placement.cluster_id.is_empty() {
            return Err(Error::missing_field(
                resource,
                "spec.csi.volumeAttributes.clusterID",
            ));
        }

        let registry = self.gateway.storage_registry(&self.rook_namespace).await?;
        let entry = registry
            .iter()
            .find(|e| e.cluster_id == placement.cluster_id)
            .ok_or_else(|| {
                Error::missing_field(
                    format!("csi cluster config in {}", self.rook_namespace),
                    &format!("clusterID {}", placement.cluster_id),
                )
            })?;

        let monitors = entry.monitor_list();
        if monitors.is_empty() {
            return Err(Error::missing_field(
                format!("csi cluster config entry {}", entry.cluster_id),
                "monitors",
            ));
        }
        debug!(
            "Cluster {} resolved to monitors {}",
            placement.cluster_id, monitors
        );

        let credential = self.gateway.credential(&self.ceph_namespace).await?;

        RbdClient::open(
            self.runner.clone(),
            &self.storage,
            ClusterConnection {
                monitors,
                user_id: credential.user_id.clone(),
                pool: placement.pool.clone(),
                data_pool: placement.data_pool.clone(),
            },
            &credential,
        )
    }
}
