//! Claim helpers: storage class matching and replacement claim generation.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::error::{Error, Result};

/// Pre-`storageClassName` annotation still carried by claims from older clusters.
pub const LEGACY_STORAGE_CLASS_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-class";

/// Claim phase reported once the claim is bound to a volume.
pub const CLAIM_BOUND: &str = "Bound";

/// Storage class the claim asks for.
///
/// The explicit `spec.storageClassName` wins; the legacy annotation is only
/// consulted when the field is unset.
pub fn effective_storage_class(claim: &PersistentVolumeClaim) -> Option<&str> {
    match claim
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.as_deref())
    {
        Some(class) => Some(class),
        None => claim
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LEGACY_STORAGE_CLASS_ANNOTATION))
            .map(String::as_str),
    }
}

pub fn uses_storage_class(claim: &PersistentVolumeClaim, class_name: &str) -> bool {
    effective_storage_class(claim) == Some(class_name)
}

pub fn claim_phase(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Name of the volume the claim is bound to, if any.
pub fn bound_volume_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// `(namespace, name)` of a claim.
pub fn claim_identity(claim: &PersistentVolumeClaim) -> Result<(String, String)> {
    let name = claim
        .metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::missing_field("PersistentVolumeClaim", "metadata.name"))?;
    let namespace = claim
        .metadata
        .namespace
        .clone()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            Error::missing_field(format!("PersistentVolumeClaim/{}", name), "metadata.namespace")
        })?;
    Ok((namespace, name))
}

/// Builds the claim that replaces `claim` under `storage_class`.
///
/// Name, namespace, labels and the request spec are kept. Server-populated
/// metadata, annotations, the volume binding and the status are dropped.
pub fn replacement_claim(
    claim: &PersistentVolumeClaim,
    storage_class: &str,
) -> PersistentVolumeClaim {
    let mut spec = claim.spec.clone().unwrap_or_default();
    spec.storage_class_name = Some(storage_class.to_string());
    spec.volume_name = None;

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: claim.metadata.name.clone(),
            namespace: claim.metadata.namespace.clone(),
            labels: claim.metadata.labels.clone(),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    }
}
