//! Migrator module
//!
//! Moves claims from a legacy storage class onto the CSI driver path.

mod engine;
mod resolver;
mod validate;

pub use engine::{
    BatchReport, FailurePolicy, MigrationResult, MigrationState, MigrationStep, Migrator,
    MigratorConfig, SingleClaim,
};
pub use resolver::ConnectionResolver;
pub use validate::preflight;
