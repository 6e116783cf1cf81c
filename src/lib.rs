//! Storage Backend Operator
//!
//! A Kubernetes operator that reconciles declarative storage resources
//! against an external provisioning service. StorageCluster and StorageNode
//! custom resources describe the desired topology; the operator registers
//! clusters, nodes, and raw devices with the provisioning service and runs
//! the per-node storage daemon as a Deployment.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Controller Runtime                       │
//! │   StorageCluster controller        StorageNode controller    │
//! └───────────────┬─────────────────────────────┬───────────────┘
//!                 │                             │
//!         ┌───────┴─────────────────────────────┴───────┐
//!         │            StorageBackend (trait)           │
//!         │        GlusterFS backend implementation     │
//!         └───────┬─────────────────────────┬───────────┘
//!                 │                         │
//!     ┌───────────┴───────────┐  ┌──────────┴──────────────┐
//!     │  Provisioning Service │  │  Daemon Bootstrap +     │
//!     │  (REST client)        │  │  Deployment synthesis   │
//!     └───────────────────────┘  └─────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`backend`]: Storage backend capability trait and implementations
//! - [`crd`]: Custom Resource Definitions
//! - [`deploy`]: Provisioning-daemon bootstrap and readiness
//! - [`operator`]: Controller runtime wiring
//! - [`provisioner`]: Provisioning-service client
//! - [`error`]: Error types and handling

pub mod backend;
pub mod crd;
pub mod deploy;
pub mod error;
pub mod operator;
pub mod provisioner;

// Re-export commonly used types
pub use backend::{
    BackendConfig, BackendFactory, GlusterBackend, GlusterConfig, Operation, StorageBackend,
    StorageBackendRef,
};
pub use crd::{StorageCluster, StorageNode, StorageTypeIdentifier};
pub use error::{Error, ErrorAction, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
