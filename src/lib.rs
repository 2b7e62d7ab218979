//! PV Migrator - Legacy RBD to CSI Volume Migration
//!
//! Moves persistent volume claims from a legacy (flex) Ceph RBD storage class
//! onto the Ceph CSI driver without copying any data. For each claim the
//! legacy volume is retained, the claim is recreated under the CSI class, and
//! the legacy RBD image is renamed onto the identity the driver provisioned.
//!
//! # Architecture
//!
//! ```text
//! Migrator (per-claim state machine)
//!    ├── Gateway             typed cluster operations + bounded waits
//!    ├── ConnectionResolver  registry + secret → RbdClient
//!    └── RbdClient           rbd rm / rbd rename with a scoped key file
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`domain`] - Ports and value objects
//! - [`error`] - Error types
//! - [`gateway`] - Cluster-resource gateway and polling
//! - [`migrator`] - Migration engine
//! - [`storage`] - Backing-storage client

pub mod adapters;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod migrator;
pub mod storage;

// Re-export commonly used types
pub use error::{Error, Result};
pub use gateway::{Gateway, WaitConfig};
pub use migrator::{BatchReport, FailurePolicy, Migrator, MigratorConfig, SingleClaim};
pub use storage::{RbdClient, StorageConfig};
