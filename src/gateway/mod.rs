//! Cluster-Resource Gateway
//!
//! Typed operations over volumes, claims, the CSI cluster registry and the
//! provisioner credential secret, plus the bounded waits that observe the
//! control plane converging after a delete or create.
//!
//! Direct operations never retry: a failing call propagates immediately.
//! Only the waits below re-query, and they do so on a fixed interval up to a
//! fixed bound.

pub mod claims;
pub mod poll;
pub mod volumes;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use tokio::time::sleep;
use tracing::{debug, info, instrument};

use crate::domain::{ClusterApi, Credential, PlacementAttributes, RegistryEntry};
use crate::error::{Error, Result};

pub use poll::poll_until;

/// Config map rook maintains with the CSI cluster registry.
pub const CSI_CONFIG_MAP: &str = "rook-ceph-csi-config";
/// Key inside [`CSI_CONFIG_MAP`] holding the JSON registry.
pub const CSI_CONFIG_KEY: &str = "csi-cluster-config-json";
/// Secret holding the RBD provisioner identity.
pub const RBD_PROVISIONER_SECRET: &str = "rook-csi-rbd-provisioner";
pub const SECRET_USER_ID: &str = "userID";
pub const SECRET_USER_KEY: &str = "userKey";

// =============================================================================
// Configuration
// =============================================================================

/// Intervals and bounds for every convergence wait
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Interval between phase / deletion checks
    pub poll_interval: Duration,

    /// Bound for a claim or volume to disappear after deletion
    pub delete_timeout: Duration,

    /// Bound for a new claim (and then its volume) to reach Bound
    pub bind_timeout: Duration,

    /// Interval between placement attribute reads
    pub attribute_interval: Duration,

    /// Number of placement attribute reads before giving up
    pub attribute_attempts: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            delete_timeout: Duration::from_secs(60),
            bind_timeout: Duration::from_secs(5 * 60),
            attribute_interval: Duration::from_secs(2),
            attribute_attempts: 15,
        }
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Typed control-plane operations used by the migrator
#[derive(Clone)]
pub struct Gateway {
    api: Arc<dyn ClusterApi>,
    wait: WaitConfig,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").field("wait", &self.wait).finish()
    }
}

impl Gateway {
    pub fn new(api: Arc<dyn ClusterApi>, wait: WaitConfig) -> Self {
        Self { api, wait }
    }

    pub fn wait_config(&self) -> &WaitConfig {
        &self.wait
    }

    pub async fn get_volume(&self, name: &str) -> Result<PersistentVolume> {
        self.api.get_volume(name).await
    }

    pub async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        self.api.get_claim(namespace, name).await
    }

    pub async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        self.api.get_storage_class(name).await
    }

    pub async fn get_namespace(&self, name: &str) -> Result<()> {
        self.api.get_namespace(name).await
    }

    /// Sets the reclaim policy of `volume` to Retain and writes it back.
    ///
    /// This is an unconditional replace of the object passed in; callers must
    /// pass the most recently fetched copy.
    pub async fn retain_volume(&self, mut volume: PersistentVolume) -> Result<PersistentVolume> {
        volume
            .spec
            .get_or_insert_with(Default::default)
            .persistent_volume_reclaim_policy = Some(volumes::RECLAIM_RETAIN.to_string());
        self.api.replace_volume(&volume).await
    }

    /// Deletes a claim and waits until it is gone.
    #[instrument(skip(self))]
    pub async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        self.api.delete_claim(namespace, name).await?;

        let api = &self.api;
        poll_until(
            &format!("PVC {}/{} to be deleted", namespace, name),
            self.wait.poll_interval,
            self.wait.delete_timeout,
            move || async move {
                match api.get_claim(namespace, name).await {
                    Ok(_) => Ok(false),
                    Err(e) if e.is_not_found() => Ok(true),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }

    /// Deletes a volume object and waits until it is gone.
    #[instrument(skip(self))]
    pub async fn delete_volume(&self, name: &str) -> Result<()> {
        self.api.delete_volume(name).await?;

        let api = &self.api;
        poll_until(
            &format!("PV {} to be deleted", name),
            self.wait.poll_interval,
            self.wait.delete_timeout,
            move || async move {
                match api.get_volume(name).await {
                    Ok(_) => Ok(false),
                    Err(e) if e.is_not_found() => Ok(true),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }

    /// Creates a claim and waits until it is bound to a fresh volume.
    ///
    /// Waits for the claim to report Bound, then for its volume to report
    /// Bound, then re-reads both and checks they reference each other.
    /// Returns the bound volume.
    #[instrument(skip(self, claim), fields(claim = ?claim.metadata.name))]
    pub async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolume> {
        let (namespace, name) = claims::claim_identity(claim)?;

        self.api.create_claim(claim).await?;
        info!(
            "Waiting up to {:?} for PVC {}/{} to be Bound",
            self.wait.bind_timeout, namespace, name
        );

        self.wait_for_claim_phase(&namespace, &name, claims::CLAIM_BOUND)
            .await?;

        let bound = self.api.get_claim(&namespace, &name).await?;
        let volume_name = claims::bound_volume_name(&bound)
            .ok_or_else(|| {
                Error::ConsistencyViolation(format!(
                    "PVC {}/{} is Bound but has no volume reference",
                    namespace, name
                ))
            })?
            .to_string();

        self.wait_for_volume_phase(&volume_name, volumes::VOLUME_BOUND)
            .await?;

        let volume = self.api.get_volume(&volume_name).await?;
        let claim = self.api.get_claim(&namespace, &name).await?;
        volumes::verify_binding(&claim, &volume)?;

        info!("PVC {}/{} bound to PV {}", namespace, name, volume_name);
        Ok(volume)
    }

    /// Waits for a claim to report `phase`. A claim not visible yet counts as
    /// not converged; any other read failure is fatal.
    pub async fn wait_for_claim_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: &str,
    ) -> Result<()> {
        let api = &self.api;
        poll_until(
            &format!("PVC {}/{} to have phase {}", namespace, name, phase),
            self.wait.poll_interval,
            self.wait.bind_timeout,
            move || async move {
                match api.get_claim(namespace, name).await {
                    Ok(claim) => {
                        let current = claims::claim_phase(&claim);
                        debug!("PVC {}/{} phase is {:?}", namespace, name, current);
                        Ok(current == Some(phase))
                    }
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }

    /// Waits for a volume to report `phase`.
    pub async fn wait_for_volume_phase(&self, name: &str, phase: &str) -> Result<()> {
        let api = &self.api;
        poll_until(
            &format!("PV {} to have phase {}", name, phase),
            self.wait.poll_interval,
            self.wait.bind_timeout,
            move || async move {
                match api.get_volume(name).await {
                    Ok(volume) => {
                        let current = volumes::volume_phase(&volume);
                        debug!("PV {} phase is {:?}", name, current);
                        Ok(current == Some(phase))
                    }
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            },
        )
        .await
    }

    /// Reads the placement attributes of a freshly provisioned volume.
    ///
    /// The driver fills these in after binding, so the volume is re-read up to
    /// `attribute_attempts` times until the image name shows up.
    #[instrument(skip(self))]
    pub async fn wait_for_placement(&self, volume_name: &str) -> Result<PlacementAttributes> {
        for attempt in 1..=self.wait.attribute_attempts {
            let volume = self.api.get_volume(volume_name).await?;
            let attrs = volumes::placement_attributes(&volume);
            if !attrs.image_name.is_empty() {
                return Ok(attrs);
            }

            debug!(
                "Waiting for PersistentVolume {:?} placement attributes, attempt: {}",
                volume_name, attempt
            );
            if attempt < self.wait.attribute_attempts {
                sleep(self.wait.attribute_interval).await;
            }
        }

        Err(Error::missing_field(
            format!("PersistentVolume/{}", volume_name),
            "spec.csi.volumeAttributes.imageName",
        ))
    }

    /// Every claim, across all namespaces, whose storage class is `class_name`.
    pub async fn list_claims_by_storage_class(
        &self,
        class_name: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let mut matching = Vec::new();
        for namespace in self.api.list_namespaces().await? {
            let claims = self.api.list_claims(&namespace).await?;
            matching.extend(
                claims
                    .into_iter()
                    .filter(|c| claims::uses_storage_class(c, class_name)),
            );
        }
        Ok(matching)
    }

    /// The named claim as a list of zero or one element.
    pub async fn list_single_claim(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        match self.api.get_claim(namespace, name).await {
            Ok(claim) => Ok(vec![claim]),
            Err(e) if e.is_not_found() => Ok(vec![]),
            Err(e) => Err(e),
        }
    }

    /// Parses the CSI cluster registry published in `namespace`.
    pub async fn storage_registry(&self, namespace: &str) -> Result<Vec<RegistryEntry>> {
        let data = self.api.get_config_map_data(namespace, CSI_CONFIG_MAP).await?;
        let payload = data.get(CSI_CONFIG_KEY).ok_or_else(|| {
            Error::MalformedRegistry(format!(
                "config map {}/{} has no {} key",
                namespace, CSI_CONFIG_MAP, CSI_CONFIG_KEY
            ))
        })?;

        serde_json::from_str(payload).map_err(|e| {
            Error::MalformedRegistry(format!("failed to parse csi cluster config: {}", e))
        })
    }

    /// Reads the RBD provisioner identity from `namespace`.
    pub async fn credential(&self, namespace: &str) -> Result<Credential> {
        let data = self
            .api
            .get_secret_data(namespace, RBD_PROVISIONER_SECRET)
            .await?;
        let resource = format!("Secret/{}/{}", namespace, RBD_PROVISIONER_SECRET);

        let field = |key: &str| -> Result<String> {
            data.get(key)
                .map(|v| String::from_utf8_lossy(v).trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::missing_field(resource.clone(), key))
        };

        Ok(Credential {
            user_id: field(SECRET_USER_ID)?,
            key: field(SECRET_USER_KEY)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryCluster;
    use assert_matches::assert_matches;

    fn fast_waits() -> WaitConfig {
        WaitConfig {
            poll_interval: Duration::from_millis(5),
            delete_timeout: Duration::from_millis(500),
            bind_timeout: Duration::from_millis(500),
            attribute_interval: Duration::from_millis(5),
            attribute_attempts: 5,
        }
    }

    fn gateway(cluster: &Arc<InMemoryCluster>) -> Gateway {
        Gateway::new(cluster.clone(), fast_waits())
    }

    #[tokio::test]
    async fn test_retain_volume_sets_policy() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespace("ns1");
        cluster.add_bound_claim("ns1", "pvc-a", Some("legacy"), None, "v-a");
        let gw = gateway(&cluster);

        let pv = gw.get_volume("v-a").await.unwrap();
        assert_eq!(volumes::reclaim_policy(&pv), Some(volumes::RECLAIM_DELETE));

        let updated = gw.retain_volume(pv).await.unwrap();
        assert_eq!(volumes::reclaim_policy(&updated), Some(volumes::RECLAIM_RETAIN));
        assert_eq!(
            volumes::reclaim_policy(&cluster.volume("v-a").unwrap()),
            Some(volumes::RECLAIM_RETAIN)
        );
    }

    #[tokio::test]
    async fn test_delete_claim_waits_until_gone() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespace("ns1");
        cluster.add_bound_claim("ns1", "pvc-a", Some("legacy"), None, "v-a");
        cluster.set_delete_delay(3);
        let gw = gateway(&cluster);

        gw.delete_claim("ns1", "pvc-a").await.unwrap();
        assert!(cluster.claim("ns1", "pvc-a").is_none());
    }

    #[tokio::test]
    async fn test_delete_claim_times_out_when_stuck() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespace("ns1");
        cluster.add_bound_claim("ns1", "pvc-a", Some("legacy"), None, "v-a");
        cluster.set_delete_delay(usize::MAX);
        let gw = gateway(&cluster);

        let err = gw.delete_claim("ns1", "pvc-a").await.unwrap_err();
        assert_matches!(err, Error::Timeout { .. });
    }

    #[tokio::test]
    async fn test_delete_poll_transport_error_is_fatal() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespace("ns1");
        cluster.add_bound_claim("ns1", "pvc-a", Some("legacy"), None, "v-a");
        cluster.set_delete_delay(2);
        cluster.fail_operation("get_claim", "etcd leader changed");
        let gw = gateway(&cluster);

        let err = gw.delete_claim("ns1", "pvc-a").await.unwrap_err();
        assert_matches!(err, Error::Transport(_));
    }

    #[tokio::test]
    async fn test_create_claim_returns_bound_volume() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespace("ns1");
        cluster.add_csi_storage_class("csi", "rook-ceph", "replicapool");
        cluster.set_bind_delay(2);
        cluster.queue_image_name("img-123");
        let gw = gateway(&cluster);

        let claim = cluster.new_claim("ns1", "pvc-a", "csi");
        let pv = gw.create_claim(&claim).await.unwrap();

        let attrs = volumes::placement_attributes(&pv);
        assert_eq!(attrs.image_name, "img-123");
        assert_eq!(volumes::volume_phase(&pv), Some(volumes::VOLUME_BOUND));
    }

    #[tokio::test]
    async fn test_create_claim_detects_misbinding() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespace("ns1");
        cluster.add_csi_storage_class("csi", "rook-ceph", "replicapool");
        cluster.misbind_next_claim();
        let gw = gateway(&cluster);

        let claim = cluster.new_claim("ns1", "pvc-a", "csi");
        let err = gw.create_claim(&claim).await.unwrap_err();
        assert_matches!(err, Error::ConsistencyViolation(_));
    }

    #[tokio::test]
    async fn test_create_claim_times_out_without_provisioner() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespace("ns1");
        cluster.add_legacy_storage_class("legacy");
        let gw = gateway(&cluster);

        let claim = cluster.new_claim("ns1", "pvc-a", "legacy");
        let err = gw.create_claim(&claim).await.unwrap_err();
        assert_matches!(err, Error::Timeout { .. });
    }

    #[tokio::test]
    async fn test_wait_for_placement_retries() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespace("ns1");
        cluster.add_csi_storage_class("csi", "rook-ceph", "replicapool");
        let gw = gateway(&cluster);

        let pv = gw
            .create_claim(&cluster.new_claim("ns1", "pvc-a", "csi"))
            .await
            .unwrap();
        let name = volumes::volume_name(&pv).to_string();
        cluster.set_attribute_delay(&name, 3);

        let attrs = gw.wait_for_placement(&name).await.unwrap();
        assert_eq!(attrs.pool, "replicapool");
        assert_eq!(attrs.cluster_id, "rook-ceph");
    }

    #[tokio::test]
    async fn test_wait_for_placement_gives_up() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespace("ns1");
        cluster.add_csi_storage_class("csi", "rook-ceph", "replicapool");
        let gw = gateway(&cluster);

        let pv = gw
            .create_claim(&cluster.new_claim("ns1", "pvc-a", "csi"))
            .await
            .unwrap();
        let name = volumes::volume_name(&pv).to_string();
        cluster.set_attribute_delay(&name, 100);

        let err = gw.wait_for_placement(&name).await.unwrap_err();
        assert_matches!(err, Error::MissingField { ref field, .. } if field.contains("imageName"));
    }

    #[tokio::test]
    async fn test_list_single_claim() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_namespace("ns1");
        cluster.add_bound_claim("ns1", "pvc-a", Some("legacy"), None, "v-a");
        let gw = gateway(&cluster);

        assert_eq!(gw.list_single_claim("pvc-a", "ns1").await.unwrap().len(), 1);
        assert!(gw.list_single_claim("pvc-x", "ns1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storage_registry_parses_entries() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.set_registry(
            "rook-ceph",
            r#"[{"clusterID":"rook-ceph","monitors":["10.0.0.1:6789"]},{"clusterID":"other","monitors":[]}]"#,
        );
        let gw = gateway(&cluster);

        let entries = gw.storage_registry("rook-ceph").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], RegistryEntry::new("rook-ceph", &["10.0.0.1:6789"]));
    }

    #[tokio::test]
    async fn test_storage_registry_malformed() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.set_registry("rook-ceph", "{not json");
        let gw = gateway(&cluster);

        assert_matches!(
            gw.storage_registry("rook-ceph").await,
            Err(Error::MalformedRegistry(_))
        );
    }

    #[tokio::test]
    async fn test_storage_registry_missing_config_map() {
        let cluster = Arc::new(InMemoryCluster::new());
        let gw = gateway(&cluster);

        let err = gw.storage_registry("rook-ceph").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_credential_fields() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.set_credential("rook-ceph", "csi-rbd-provisioner", "AQBkey==");
        let gw = gateway(&cluster);

        let credential = gw.credential("rook-ceph").await.unwrap();
        assert_eq!(credential.user_id, "csi-rbd-provisioner");
        assert_eq!(credential.key, "AQBkey==");
    }

    #[tokio::test]
    async fn test_credential_missing_key() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.set_secret_data(
            "rook-ceph",
            RBD_PROVISIONER_SECRET,
            [(SECRET_USER_ID.to_string(), b"csi-rbd-provisioner".to_vec())].into(),
        );
        let gw = gateway(&cluster);

        let err = gw.credential("rook-ceph").await.unwrap_err();
        assert_matches!(err, Error::MissingField { ref field, .. } if field == SECRET_USER_KEY);
    }
}
