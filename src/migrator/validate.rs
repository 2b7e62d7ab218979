//! Pre-flight checks run before the first mutation of a batch.

use tracing::debug;

use crate::error::{Error, Result};
use crate::gateway::Gateway;

use super::MigratorConfig;

/// Verifies every object named by `config` exists.
///
/// A missing object is reported as `ResourceNotFound` naming the input that
/// pointed at it; other lookup failures propagate unchanged.
pub async fn preflight(gateway: &Gateway, config: &MigratorConfig) -> Result<()> {
    if config.destination_storage_class.is_empty() {
        return Err(Error::Configuration(
            "destination storage class is required".to_string(),
        ));
    }
    if config.source_storage_class.is_none() && config.single_claim.is_none() {
        return Err(Error::Configuration(
            "either a source storage class or a single claim must be given".to_string(),
        ));
    }

    check(
        "destination storage class",
        &config.destination_storage_class,
        gateway
            .get_storage_class(&config.destination_storage_class)
            .await
            .map(|_| ()),
    )?;

    if let Some(source) = &config.source_storage_class {
        check(
            "source storage class",
            source,
            gateway.get_storage_class(source).await.map(|_| ()),
        )?;
    }

    check(
        "rook namespace",
        &config.rook_namespace,
        gateway.get_namespace(&config.rook_namespace).await,
    )?;
    check(
        "ceph cluster namespace",
        &config.ceph_namespace,
        gateway.get_namespace(&config.ceph_namespace).await,
    )?;

    debug!("Pre-flight checks passed");
    Ok(())
}

fn check(input: &str, value: &str, outcome: Result<()>) -> Result<()> {
    match outcome {
        Err(Error::ResourceNotFound { kind, .. }) => Err(Error::ResourceNotFound {
            kind,
            name: format!("{} (from {})", value, input),
        }),
        other => other,
    }
}
