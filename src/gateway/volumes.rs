//! Volume helpers: placement attributes, phases and binding verification.

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};

use crate::domain::PlacementAttributes;
use crate::error::{Error, Result};

pub const ATTR_IMAGE_NAME: &str = "imageName";
pub const ATTR_POOL: &str = "pool";
pub const ATTR_CLUSTER_ID: &str = "clusterID";
pub const ATTR_DATA_POOL: &str = "dataPool";

pub const VOLUME_BOUND: &str = "Bound";
pub const VOLUME_RELEASED: &str = "Released";

pub const RECLAIM_RETAIN: &str = "Retain";
pub const RECLAIM_DELETE: &str = "Delete";

pub fn volume_name(volume: &PersistentVolume) -> &str {
    volume.metadata.name.as_deref().unwrap_or_default()
}

pub fn volume_phase(volume: &PersistentVolume) -> Option<&str> {
    volume.status.as_ref().and_then(|s| s.phase.as_deref())
}

pub fn reclaim_policy(volume: &PersistentVolume) -> Option<&str> {
    volume
        .spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
}

/// Name of the RBD image behind a legacy volume.
///
/// Rook names the image after the volume object itself.
pub fn legacy_image_name(volume: &PersistentVolume) -> Option<String> {
    volume.metadata.name.clone().filter(|n| !n.is_empty())
}

fn attribute(volume: &PersistentVolume, key: &str) -> String {
    volume
        .spec
        .as_ref()
        .and_then(|s| s.csi.as_ref())
        .and_then(|csi| csi.volume_attributes.as_ref())
        .and_then(|attrs| attrs.get(key))
        .cloned()
        .unwrap_or_default()
}

/// Placement attributes as currently recorded; absent keys come back empty.
pub fn placement_attributes(volume: &PersistentVolume) -> PlacementAttributes {
    let data_pool = attribute(volume, ATTR_DATA_POOL);
    PlacementAttributes {
        image_name: attribute(volume, ATTR_IMAGE_NAME),
        pool: attribute(volume, ATTR_POOL),
        cluster_id: attribute(volume, ATTR_CLUSTER_ID),
        data_pool: (!data_pool.is_empty()).then_some(data_pool),
    }
}

/// Checks that a Bound claim and a Bound volume actually reference each other.
pub fn verify_binding(claim: &PersistentVolumeClaim, volume: &PersistentVolume) -> Result<()> {
    let pv_name = volume_name(volume);
    let pvc_name = claim.metadata.name.as_deref().unwrap_or_default();
    let pvc_namespace = claim.metadata.namespace.as_deref().unwrap_or_default();

    let claim_ref = volume
        .spec
        .as_ref()
        .and_then(|s| s.claim_ref.as_ref())
        .ok_or_else(|| Error::ConsistencyViolation(format!("PV {:?} ClaimRef is nil", pv_name)))?;

    let ref_name = claim_ref.name.as_deref().unwrap_or_default();
    if ref_name != pvc_name {
        return Err(Error::ConsistencyViolation(format!(
            "PV {:?} ClaimRef's name ({:?}) should be {:?}",
            pv_name, ref_name, pvc_name
        )));
    }

    let ref_namespace = claim_ref.namespace.as_deref().unwrap_or_default();
    if ref_namespace != pvc_namespace {
        return Err(Error::ConsistencyViolation(format!(
            "PV {:?} ClaimRef's namespace ({:?}) should be {:?}",
            pv_name, ref_namespace, pvc_namespace
        )));
    }

    let claim_volume = claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .unwrap_or_default();
    if claim_volume != pv_name {
        return Err(Error::ConsistencyViolation(format!(
            "PVC {:?} VolumeName ({:?}) should be {:?}",
            pvc_name, claim_volume, pv_name
        )));
    }

    if claim_ref.uid != claim.metadata.uid {
        return Err(Error::ConsistencyViolation(format!(
            "PV {:?} ClaimRef's UID ({:?}) should be {:?}",
            pv_name, claim_ref.uid, claim.metadata.uid
        )));
    }

    Ok(())
}
