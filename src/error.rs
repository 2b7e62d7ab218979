//! Error types for the PV Migrator

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while migrating volume claims
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Control Plane Errors
    // =========================================================================
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Control-plane call failed for a reason other than the object being absent
    #[error("Control plane transport failure: {0}")]
    Transport(String),

    /// Control-plane object absent
    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    /// A bounded wait did not converge
    #[error("Timed out after {duration:?} waiting for {what}")]
    Timeout { what: String, duration: Duration },

    /// Both sides report Bound but do not reference each other
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    // =========================================================================
    // Configuration / Credential Data Errors
    // =========================================================================
    /// The storage-cluster registry payload could not be parsed
    #[error("Malformed storage cluster registry: {0}")]
    MalformedRegistry(String),

    /// A required field is absent or empty
    #[error("Missing field {field} in {resource}")]
    MissingField { resource: String, field: String },

    /// Invalid operator input
    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Backing Storage Errors
    // =========================================================================
    /// Storage command exited non-zero
    #[error("Storage command '{command}' failed: {output}")]
    StorageCommandFailed { command: String, output: String },

    /// Credential file could not be written
    #[error("Failed to write credential file: {0}")]
    CredentialWriteFailed(#[source] std::io::Error),

    /// Credential file could not be removed
    #[error("Failed to remove credential file: {0}")]
    CredentialCleanupFailed(#[source] std::io::Error),

    // =========================================================================
    // Migration Errors
    // =========================================================================
    /// A claim's migration aborted at a given step
    #[error("Migration of claim {namespace}/{name} failed at step {step}: {source}")]
    ClaimMigrationFailed {
        namespace: String,
        name: String,
        step: String,
        #[source]
        source: Box<Error>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a `ResourceNotFound` error
    pub fn not_found(kind: &str, name: impl Into<String>) -> Self {
        Error::ResourceNotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    /// Shorthand for a `MissingField` error
    pub fn missing_field(resource: impl Into<String>, field: &str) -> Self {
        Error::MissingField {
            resource: resource.into(),
            field: field.to_string(),
        }
    }

    /// True when the underlying control-plane object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::ResourceNotFound { .. })
    }

    /// Strips claim/step context and returns the error that actually occurred
    pub fn root(&self) -> &Error {
        match self {
            Error::ClaimMigrationFailed { source, .. } => source.root(),
            other => other,
        }
    }
}
