//! In-Memory Adapters
//!
//! A simulated control plane and a simulated `rbd` pool. Together they model
//! what the migrator relies on: dynamic provisioning on claim creation,
//! reclaim-policy handling on claim deletion, asynchronous deletion, late
//! placement attributes and failure injection.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, FlexPersistentVolumeSource, ObjectReference, PersistentVolume,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
    PersistentVolumeSpec, PersistentVolumeStatus, VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use tracing::debug;

use crate::domain::{ClusterApi, CommandOutput, CommandRunner};
use crate::error::{Error, Result};
use crate::gateway::claims::{self, LEGACY_STORAGE_CLASS_ANNOTATION};
use crate::gateway::volumes::{
    self, ATTR_CLUSTER_ID, ATTR_IMAGE_NAME, ATTR_POOL, RECLAIM_DELETE, VOLUME_BOUND,
    VOLUME_RELEASED,
};
use crate::gateway::{
    CSI_CONFIG_KEY, CSI_CONFIG_MAP, RBD_PROVISIONER_SECRET, SECRET_USER_ID, SECRET_USER_KEY,
};

/// Pool holding legacy flex-provisioned images.
pub const LEGACY_POOL: &str = "replicapool";

const LEGACY_PROVISIONER: &str = "ceph.rook.io/block";
const CSI_PROVISIONER: &str = "rook-ceph.rbd.csi.ceph.com";

// =============================================================================
// Simulated Control Plane
// =============================================================================

#[derive(Debug, Clone)]
enum Provisioner {
    Legacy,
    Csi { cluster_id: String, pool: String },
}

type ClaimKey = (String, String);

#[derive(Default)]
struct ClusterState {
    namespaces: BTreeSet<String>,
    storage_classes: BTreeMap<String, Provisioner>,
    claims: BTreeMap<ClaimKey, PersistentVolumeClaim>,
    volumes: BTreeMap<String, PersistentVolume>,
    config_maps: BTreeMap<ClaimKey, BTreeMap<String, String>>,
    secrets: BTreeMap<ClaimKey, BTreeMap<String, Vec<u8>>>,

    /// Reads left before a deleted claim disappears
    claim_deletes: BTreeMap<ClaimKey, usize>,
    /// Reads left before a deleted volume disappears
    volume_deletes: BTreeMap<String, usize>,
    /// Reads left before a new claim reports Bound
    pending_binds: BTreeMap<ClaimKey, usize>,
    /// Reads left before a volume exposes its CSI attributes
    hidden_attributes: BTreeMap<String, usize>,

    queued_images: VecDeque<String>,
    failures: BTreeMap<String, String>,
    operations: Vec<String>,

    delete_delay: usize,
    bind_delay: usize,
    provisioned_attribute_delay: usize,
    misbind_next: bool,
    sequence: u64,
}

impl ClusterState {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn check(&self, operation: &str) -> Result<()> {
        match self.failures.get(operation) {
            Some(message) => Err(Error::Transport(message.clone())),
            None => Ok(()),
        }
    }

    fn record(&mut self, entry: String) {
        debug!(operation = %entry, "in-memory cluster");
        self.operations.push(entry);
    }
}

/// Simulated control plane implementing [`ClusterApi`].
///
/// Deletions become visible after `delete_delay` reads of the deleted object.
/// Creating a claim against a CSI class provisions a volume immediately (and
/// a placeholder image in the attached [`InMemoryImagePool`]); the claim
/// reports Pending for `bind_delay` reads first. Deleting a bound claim
/// applies the volume's reclaim policy: Delete removes the volume and its
/// image, Retain leaves the volume Released.
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
    images: Option<Arc<InMemoryImagePool>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the pool that provisioning and reclaim act on.
    pub fn with_image_pool(images: Arc<InMemoryImagePool>) -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            images: Some(images),
        }
    }

    // -------------------------------------------------------------------------
    // Fixtures
    // -------------------------------------------------------------------------

    pub fn add_namespace(&self, name: &str) {
        self.state.lock().namespaces.insert(name.to_string());
    }

    pub fn add_legacy_storage_class(&self, name: &str) {
        self.state
            .lock()
            .storage_classes
            .insert(name.to_string(), Provisioner::Legacy);
    }

    pub fn add_csi_storage_class(&self, name: &str, cluster_id: &str, pool: &str) {
        self.state.lock().storage_classes.insert(
            name.to_string(),
            Provisioner::Csi {
                cluster_id: cluster_id.to_string(),
                pool: pool.to_string(),
            },
        );
    }

    /// Adds a claim bound to a flex-provisioned volume named `volume`.
    ///
    /// `class` goes into the spec field, `annotation_class` into the legacy
    /// beta annotation. The volume's reclaim policy is Delete and its image
    /// lives in [`LEGACY_POOL`] under the volume's name.
    pub fn add_bound_claim(
        &self,
        namespace: &str,
        name: &str,
        class: Option<&str>,
        annotation_class: Option<&str>,
        volume: &str,
    ) {
        let mut st = self.state.lock();
        st.namespaces.insert(namespace.to_string());
        let uid = format!("uid-{}", st.next_sequence());

        let mut claim = claim_template(namespace, name, class);
        claim.metadata.uid = Some(uid.clone());
        if let Some(annotated) = annotation_class {
            claim.metadata.annotations = Some(
                [(LEGACY_STORAGE_CLASS_ANNOTATION.to_string(), annotated.to_string())].into(),
            );
        }
        if let Some(spec) = claim.spec.as_mut() {
            spec.volume_name = Some(volume.to_string());
        }
        claim.status = Some(claim_status(claims::CLAIM_BOUND));

        let pv = PersistentVolume {
            metadata: ObjectMeta {
                name: Some(volume.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                storage_class_name: class.or(annotation_class).map(str::to_string),
                persistent_volume_reclaim_policy: Some(RECLAIM_DELETE.to_string()),
                claim_ref: Some(ObjectReference {
                    kind: Some("PersistentVolumeClaim".to_string()),
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    uid: Some(uid),
                    ..Default::default()
                }),
                flex_volume: Some(FlexPersistentVolumeSource {
                    driver: "ceph.rook.io/rook-ceph".to_string(),
                    options: Some(
                        [
                            ("pool".to_string(), LEGACY_POOL.to_string()),
                            ("image".to_string(), volume.to_string()),
                        ]
                        .into(),
                    ),
                    ..Default::default()
                }),
                capacity: Some([("storage".to_string(), Quantity("1Gi".to_string()))].into()),
                ..Default::default()
            }),
            status: Some(volume_status(VOLUME_BOUND)),
        };

        st.claims
            .insert((namespace.to_string(), name.to_string()), claim);
        st.volumes.insert(volume.to_string(), pv);
    }

    /// Adds a claim that never got a volume.
    pub fn add_pending_claim(&self, namespace: &str, name: &str, class: &str) {
        let mut st = self.state.lock();
        st.namespaces.insert(namespace.to_string());
        let mut claim = claim_template(namespace, name, Some(class));
        claim.metadata.uid = Some(format!("uid-{}", st.next_sequence()));
        claim.status = Some(claim_status("Pending"));
        st.claims
            .insert((namespace.to_string(), name.to_string()), claim);
    }

    /// A claim object ready for `create_claim`.
    pub fn new_claim(&self, namespace: &str, name: &str, class: &str) -> PersistentVolumeClaim {
        claim_template(namespace, name, Some(class))
    }

    pub fn set_registry(&self, namespace: &str, payload: &str) {
        self.state.lock().config_maps.insert(
            (namespace.to_string(), CSI_CONFIG_MAP.to_string()),
            [(CSI_CONFIG_KEY.to_string(), payload.to_string())].into(),
        );
    }

    pub fn set_credential(&self, namespace: &str, user_id: &str, key: &str) {
        self.set_secret_data(
            namespace,
            RBD_PROVISIONER_SECRET,
            [
                (SECRET_USER_ID.to_string(), user_id.as_bytes().to_vec()),
                (SECRET_USER_KEY.to_string(), key.as_bytes().to_vec()),
            ]
            .into(),
        );
    }

    pub fn set_secret_data(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) {
        self.state
            .lock()
            .secrets
            .insert((namespace.to_string(), name.to_string()), data);
    }

    // -------------------------------------------------------------------------
    // Behaviour knobs
    // -------------------------------------------------------------------------

    /// Reads a deleted object survives. `usize::MAX` means never.
    pub fn set_delete_delay(&self, reads: usize) {
        self.state.lock().delete_delay = reads;
    }

    /// Reads a new claim stays Pending.
    pub fn set_bind_delay(&self, reads: usize) {
        self.state.lock().bind_delay = reads;
    }

    /// Reads an existing volume hides its CSI attributes.
    pub fn set_attribute_delay(&self, volume: &str, reads: usize) {
        self.state
            .lock()
            .hidden_attributes
            .insert(volume.to_string(), reads);
    }

    /// Reads every newly provisioned volume hides its CSI attributes.
    pub fn set_provisioned_attribute_delay(&self, reads: usize) {
        self.state.lock().provisioned_attribute_delay = reads;
    }

    /// Image name the next provisioned volume gets.
    pub fn queue_image_name(&self, image: &str) {
        self.state.lock().queued_images.push_back(image.to_string());
    }

    /// The next provisioned volume references a different claim UID.
    pub fn misbind_next_claim(&self) {
        self.state.lock().misbind_next = true;
    }

    /// Every call to `operation` fails with a transport error.
    pub fn fail_operation(&self, operation: &str, message: &str) {
        self.state
            .lock()
            .failures
            .insert(operation.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, operation: &str) {
        self.state.lock().failures.remove(operation);
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.state
            .lock()
            .claims
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.state.lock().volumes.get(name).cloned()
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state.lock().volumes.keys().cloned().collect()
    }

    /// Mutations in the order they happened, e.g. `delete_claim ns1/pvc-a`.
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().operations.clone()
    }

    // -------------------------------------------------------------------------
    // Simulation
    // -------------------------------------------------------------------------

    fn finish_claim_delete(&self, st: &mut ClusterState, key: &ClaimKey) {
        let Some(claim) = st.claims.remove(key) else {
            return;
        };
        let Some(volume_name) = claims::bound_volume_name(&claim).map(str::to_string) else {
            return;
        };
        let Some(volume) = st.volumes.get_mut(&volume_name) else {
            return;
        };

        if volumes::reclaim_policy(volume) == Some(RECLAIM_DELETE) {
            let backing = backing_image(volume);
            st.volumes.remove(&volume_name);
            if let (Some(images), Some((pool, image))) = (&self.images, backing) {
                images.remove(&pool, &image);
            }
            st.record(format!("reclaim {}", volume_name));
        } else {
            volume.status = Some(volume_status(VOLUME_RELEASED));
            st.record(format!("release {}", volume_name));
        }
    }

    fn provision(
        &self,
        st: &mut ClusterState,
        claim: &mut PersistentVolumeClaim,
        cluster_id: &str,
        pool: &str,
    ) {
        let sequence = st.next_sequence();
        let volume_name = format!("pvc-{:04}", sequence);
        let image = st
            .queued_images
            .pop_front()
            .unwrap_or_else(|| format!("csi-vol-{:04}", sequence));
        let uid = if std::mem::take(&mut st.misbind_next) {
            Some("uid-someone-else".to_string())
        } else {
            claim.metadata.uid.clone()
        };

        let pv = PersistentVolume {
            metadata: ObjectMeta {
                name: Some(volume_name.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                storage_class_name: claims::effective_storage_class(claim).map(str::to_string),
                persistent_volume_reclaim_policy: Some(RECLAIM_DELETE.to_string()),
                claim_ref: Some(ObjectReference {
                    kind: Some("PersistentVolumeClaim".to_string()),
                    name: claim.metadata.name.clone(),
                    namespace: claim.metadata.namespace.clone(),
                    uid,
                    ..Default::default()
                }),
                csi: Some(CSIPersistentVolumeSource {
                    driver: CSI_PROVISIONER.to_string(),
                    volume_handle: format!("0001-0009-{}-{}", cluster_id, image),
                    volume_attributes: Some(
                        [
                            (ATTR_CLUSTER_ID.to_string(), cluster_id.to_string()),
                            (ATTR_POOL.to_string(), pool.to_string()),
                            (ATTR_IMAGE_NAME.to_string(), image.clone()),
                        ]
                        .into(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(volume_status(VOLUME_BOUND)),
        };

        if let Some(images) = &self.images {
            images.add_image(pool, &image, b"");
        }
        if st.provisioned_attribute_delay > 0 {
            let delay = st.provisioned_attribute_delay;
            st.hidden_attributes.insert(volume_name.clone(), delay);
        }
        if let Some(spec) = claim.spec.as_mut() {
            spec.volume_name = Some(volume_name.clone());
        }
        claim.status = Some(claim_status(claims::CLAIM_BOUND));

        st.volumes.insert(volume_name.clone(), pv);
        st.record(format!("provision {} {}", volume_name, image));
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn get_volume(&self, name: &str) -> Result<PersistentVolume> {
        let mut st = self.state.lock();
        st.check("get_volume")?;

        match st.volume_deletes.get(name).copied() {
            Some(0) => {
                st.volume_deletes.remove(name);
                st.volumes.remove(name);
            }
            Some(remaining) => {
                st.volume_deletes.insert(name.to_string(), remaining - 1);
            }
            None => {}
        }

        let mut volume = st
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("PersistentVolume", name))?;

        if let Some(remaining) = st.hidden_attributes.get(name).copied() {
            if remaining > 0 {
                st.hidden_attributes.insert(name.to_string(), remaining - 1);
                if let Some(csi) = volume.spec.as_mut().and_then(|s| s.csi.as_mut()) {
                    csi.volume_attributes = None;
                }
            } else {
                st.hidden_attributes.remove(name);
            }
        }

        Ok(volume)
    }

    async fn replace_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        let mut st = self.state.lock();
        st.check("replace_volume")?;

        let name = volumes::volume_name(volume).to_string();
        let stored = st
            .volumes
            .get_mut(&name)
            .ok_or_else(|| Error::not_found("PersistentVolume", name.clone()))?;
        // Status is owned by the control plane and survives a replace.
        stored.metadata = volume.metadata.clone();
        stored.spec = volume.spec.clone();
        let updated = stored.clone();

        let policy = volumes::reclaim_policy(&updated).unwrap_or_default().to_string();
        st.record(format!("replace_volume {} {}", name, policy));
        Ok(updated)
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check("delete_volume")?;

        if !st.volumes.contains_key(name) {
            return Err(Error::not_found("PersistentVolume", name));
        }
        st.record(format!("delete_volume {}", name));
        if st.delete_delay == 0 {
            st.volumes.remove(name);
        } else {
            let delay = st.delete_delay;
            st.volume_deletes.entry(name.to_string()).or_insert(delay);
        }
        Ok(())
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        let mut st = self.state.lock();
        st.check("get_claim")?;

        let key = (namespace.to_string(), name.to_string());
        match st.claim_deletes.get(&key).copied() {
            Some(0) => {
                st.claim_deletes.remove(&key);
                self.finish_claim_delete(&mut st, &key);
            }
            Some(remaining) => {
                st.claim_deletes.insert(key.clone(), remaining - 1);
            }
            None => {}
        }

        let claim = st
            .claims
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                Error::not_found("PersistentVolumeClaim", format!("{}/{}", namespace, name))
            })?;

        if let Some(remaining) = st.pending_binds.get(&key).copied() {
            if remaining > 0 {
                st.pending_binds.insert(key, remaining - 1);
                let mut pending = claim;
                pending.status = Some(claim_status("Pending"));
                if let Some(spec) = pending.spec.as_mut() {
                    spec.volume_name = None;
                }
                return Ok(pending);
            }
            st.pending_binds.remove(&key);
        }

        Ok(claim)
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let mut st = self.state.lock();
        st.check("create_claim")?;

        let (namespace, name) = claims::claim_identity(claim)?;
        if !st.namespaces.contains(&namespace) {
            return Err(Error::not_found("Namespace", namespace));
        }
        let key = (namespace.clone(), name.clone());
        if st.claims.contains_key(&key) {
            return Err(Error::Transport(format!(
                "persistentvolumeclaims {:?} already exists",
                name
            )));
        }

        let mut created = claim.clone();
        created.metadata.uid = Some(format!("uid-{}", st.next_sequence()));
        created.status = Some(claim_status("Pending"));
        let class = claims::effective_storage_class(&created).map(str::to_string);
        st.record(format!("create_claim {}/{}", namespace, name));

        let provisioner = class.and_then(|c| st.storage_classes.get(&c).cloned());
        if let Some(Provisioner::Csi { cluster_id, pool }) = provisioner {
            self.provision(&mut st, &mut created, &cluster_id, &pool);
            if st.bind_delay > 0 {
                let delay = st.bind_delay;
                st.pending_binds.insert(key.clone(), delay);
            }
        }

        st.claims.insert(key, created.clone());
        Ok(created)
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let mut st = self.state.lock();
        st.check("delete_claim")?;

        let key = (namespace.to_string(), name.to_string());
        if !st.claims.contains_key(&key) {
            return Err(Error::not_found(
                "PersistentVolumeClaim",
                format!("{}/{}", namespace, name),
            ));
        }
        st.record(format!("delete_claim {}/{}", namespace, name));
        if st.delete_delay == 0 {
            self.finish_claim_delete(&mut st, &key);
        } else {
            let delay = st.delete_delay;
            st.claim_deletes.entry(key).or_insert(delay);
        }
        Ok(())
    }

    async fn list_claims(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let st = self.state.lock();
        st.check("list_claims")?;
        Ok(st
            .claims
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, claim)| claim.clone())
            .collect())
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let st = self.state.lock();
        st.check("list_namespaces")?;
        Ok(st.namespaces.iter().cloned().collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<()> {
        let st = self.state.lock();
        st.check("get_namespace")?;
        if st.namespaces.contains(name) {
            Ok(())
        } else {
            Err(Error::not_found("Namespace", name))
        }
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        let st = self.state.lock();
        st.check("get_storage_class")?;
        let provisioner = st
            .storage_classes
            .get(name)
            .ok_or_else(|| Error::not_found("StorageClass", name))?;

        let (provisioner, parameters) = match provisioner {
            Provisioner::Legacy => (LEGACY_PROVISIONER, BTreeMap::new()),
            Provisioner::Csi { cluster_id, pool } => (
                CSI_PROVISIONER,
                [
                    ("clusterID".to_string(), cluster_id.clone()),
                    ("pool".to_string(), pool.clone()),
                ]
                .into(),
            ),
        };
        Ok(StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            provisioner: provisioner.to_string(),
            parameters: Some(parameters),
            ..Default::default()
        })
    }

    async fn get_config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, String>> {
        let st = self.state.lock();
        st.check("get_config_map_data")?;
        st.config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found("ConfigMap", format!("{}/{}", namespace, name)))
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let st = self.state.lock();
        st.check("get_secret_data")?;
        st.secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found("Secret", format!("{}/{}", namespace, name)))
    }
}

fn claim_template(namespace: &str, name: &str, class: Option<&str>) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some([("app".to_string(), name.to_string())].into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: class.map(str::to_string),
            resources: Some(VolumeResourceRequirements {
                requests: Some([("storage".to_string(), Quantity("1Gi".to_string()))].into()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

fn claim_status(phase: &str) -> PersistentVolumeClaimStatus {
    PersistentVolumeClaimStatus {
        phase: Some(phase.to_string()),
        ..Default::default()
    }
}

fn volume_status(phase: &str) -> PersistentVolumeStatus {
    PersistentVolumeStatus {
        phase: Some(phase.to_string()),
        ..Default::default()
    }
}

/// `(pool, image)` backing a volume, for either provisioner.
fn backing_image(volume: &PersistentVolume) -> Option<(String, String)> {
    let spec = volume.spec.as_ref()?;
    if let Some(flex) = &spec.flex_volume {
        let options = flex.options.as_ref()?;
        return Some((options.get("pool")?.clone(), options.get("image")?.clone()));
    }
    let attrs = volumes::placement_attributes(volume);
    (!attrs.image_name.is_empty()).then_some((attrs.pool, attrs.image_name))
}

// =============================================================================
// Simulated Image Pool
// =============================================================================

#[derive(Default)]
struct PoolState {
    images: BTreeMap<(String, String), Vec<u8>>,
    commands: Vec<Vec<String>>,
    key_files: Vec<PathBuf>,
    failures: BTreeMap<String, String>,
}

/// Simulated `rbd` implementing [`CommandRunner`].
///
/// Understands `rm` and `rename` with `--pool` and `--keyfile=`. A command
/// whose key file does not exist on disk fails the way `rbd` does.
#[derive(Default)]
pub struct InMemoryImagePool {
    state: Mutex<PoolState>,
}

impl InMemoryImagePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&self, pool: &str, name: &str, data: &[u8]) {
        self.state
            .lock()
            .images
            .insert((pool.to_string(), name.to_string()), data.to_vec());
    }

    fn remove(&self, pool: &str, name: &str) {
        self.state
            .lock()
            .images
            .remove(&(pool.to_string(), name.to_string()));
    }

    pub fn image(&self, pool: &str, name: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .images
            .get(&(pool.to_string(), name.to_string()))
            .cloned()
    }

    /// Image names in `pool`, sorted.
    pub fn images(&self, pool: &str) -> Vec<String> {
        self.state
            .lock()
            .images
            .keys()
            .filter(|(p, _)| p == pool)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Arguments of every command run so far (program name excluded).
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().commands.clone()
    }

    /// Key files referenced by commands, in order.
    pub fn key_files_seen(&self) -> Vec<PathBuf> {
        self.state.lock().key_files.clone()
    }

    /// Every `subcommand` exits non-zero with `output`.
    pub fn fail_command(&self, subcommand: &str, output: &str) {
        self.state
            .lock()
            .failures
            .insert(subcommand.to_string(), output.to_string());
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

#[async_trait]
impl CommandRunner for InMemoryImagePool {
    async fn run(&self, _program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut st = self.state.lock();
        st.commands.push(args.to_vec());

        let key_file = args
            .iter()
            .find_map(|a| a.strip_prefix("--keyfile="))
            .map(PathBuf::from);
        match key_file {
            Some(path) if path.is_file() => st.key_files.push(path),
            _ => {
                return Ok(CommandOutput::failed(
                    "rbd: failed to read key file: (2) No such file or directory",
                ))
            }
        }

        let subcommand = args.first().map(String::as_str).unwrap_or_default();
        if let Some(output) = st.failures.get(subcommand) {
            return Ok(CommandOutput::failed(output.clone()));
        }
        let pool = flag_value(args, "--pool").unwrap_or("rbd").to_string();

        match subcommand {
            "rm" => {
                let name = args.get(1).cloned().unwrap_or_default();
                match st.images.remove(&(pool, name.clone())) {
                    Some(_) => Ok(CommandOutput::ok("Removing image: 100% complete...done.\n")),
                    None => Ok(CommandOutput::failed(format!(
                        "rbd: error opening image {}: (2) No such file or directory\n",
                        name
                    ))),
                }
            }
            "rename" => {
                let old = args.get(1).cloned().unwrap_or_default();
                let new = args.get(2).cloned().unwrap_or_default();
                if st.images.contains_key(&(pool.clone(), new.clone())) {
                    return Ok(CommandOutput::failed("rbd: rename error: (17) File exists\n"));
                }
                match st.images.remove(&(pool.clone(), old.clone())) {
                    Some(data) => {
                        st.images.insert((pool, new), data);
                        Ok(CommandOutput::ok(""))
                    }
                    None => Ok(CommandOutput::failed(format!(
                        "rbd: error opening image {}: (2) No such file or directory\n",
                        old
                    ))),
                }
            }
            other => Ok(CommandOutput::failed(format!("rbd: error parsing command '{}'", other))),
        }
    }
}
