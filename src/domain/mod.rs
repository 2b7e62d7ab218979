//! Domain Layer
//!
//! Ports (trait seams to the control plane and the storage CLI) and the
//! value objects that cross them.

pub mod ports;

pub use ports::{
    ClusterApi, CommandOutput, CommandRunner, Credential, PlacementAttributes, RegistryEntry,
};
