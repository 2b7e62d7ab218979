//! Infrastructure Adapters
//!
//! Implementations of the domain ports.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Ports (domain::ports)                      │
//! │              ClusterApi      │     CommandRunner              │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Adapters (This Module)                     │
//! │  KubeClusterApi │ ProcessCommandRunner                        │
//! │  InMemoryCluster │ InMemoryImagePool (simulation, tests)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod kubernetes;
mod memory;
mod process;

pub use kubernetes::KubeClusterApi;
pub use memory::{InMemoryCluster, InMemoryImagePool};
pub use process::ProcessCommandRunner;
