//! Storage backend contract
//!
//! Backends plug into the operator through [`StorageBackend`], an
//! optional-capability trait: every lifecycle operation carries a default
//! no-op-success body, so a backend implements only the operations it
//! supports while the controller treats all backends uniformly. The type
//! identifier is the one mandatory capability and has no default, so a
//! backend that fails to supply it does not compile. The set of operations a
//! backend actually implements is advertised through
//! [`StorageBackend::supported_operations`].

pub mod glusterfs;

pub use glusterfs::{GlusterBackend, GlusterConfig};

use crate::crd::{StorageCluster, StorageNode, StorageTypeIdentifier};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Operations
// =============================================================================

/// Lifecycle operations a backend may implement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Init,
    AddCluster,
    UpdateCluster,
    DeleteCluster,
    MakeDeployment,
    AddNode,
    UpdateNode,
    DeleteNode,
    GetStatus,
}

// =============================================================================
// Derived Snapshots
// =============================================================================

/// Read-only status snapshot returned by [`StorageBackend::get_status`].
/// Derived on demand; holds no independent lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Outcome of one best-effort device sub-operation. Collected per item so
/// partial-failure behavior is observable by callers and tests instead of
/// only in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    /// Device path (registration) or device id (deletion)
    pub device: String,
    pub outcome: DeviceOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    Registered,
    AlreadyRegistered,
    Deleted,
    Failed(String),
}

// =============================================================================
// Storage Backend Trait
// =============================================================================

/// Optional-capability backend contract.
///
/// Mutating operations return `Ok(Some(resource))` when the resource was
/// mutated and must be persisted, `Ok(None)` when nothing changed. The
/// default bodies are the documented no-ops for unimplemented capabilities.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fixed backend type identifier. Mandatory: there is no safe default
    /// for an unidentifiable backend, so this method has no default body.
    fn storage_type(&self) -> StorageTypeIdentifier;

    /// Operations this backend actually implements
    fn supported_operations(&self) -> &[Operation] {
        &[]
    }

    /// Whether the backend implements `operation`
    fn supports(&self, operation: Operation) -> bool {
        self.supported_operations().contains(&operation)
    }

    /// Prepare internal state; no external calls
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Register the cluster with the provisioning service
    async fn add_cluster(&self, _cluster: &StorageCluster) -> Result<Option<StorageCluster>> {
        Ok(None)
    }

    /// React to a cluster spec change
    async fn update_cluster(&self, _old: &StorageCluster, _new: &StorageCluster) -> Result<()> {
        Ok(())
    }

    /// React to a cluster deletion
    async fn delete_cluster(&self, _cluster: &StorageCluster) -> Result<()> {
        Ok(())
    }

    /// Synthesize the daemon Deployment for one node; pure, no external
    /// calls. Annotations of `previous` survive regeneration.
    fn make_deployment(
        &self,
        _cluster: &StorageCluster,
        _node: &StorageNode,
        _previous: Option<&Deployment>,
    ) -> Result<Option<Deployment>> {
        Ok(None)
    }

    /// Register the node (and its devices) with the provisioning service
    async fn add_node(&self, _node: &StorageNode) -> Result<Option<StorageNode>> {
        Ok(None)
    }

    /// React to a node spec change
    async fn update_node(&self, _node: &StorageNode) -> Result<Option<StorageNode>> {
        Ok(None)
    }

    /// Remove the node and its devices from the provisioning service
    async fn delete_node(&self, _node: &StorageNode) -> Result<()> {
        Ok(())
    }

    /// Produce a status snapshot for the cluster
    async fn get_status(&self, _cluster: &StorageCluster) -> Result<StorageStatus> {
        Ok(StorageStatus::default())
    }
}

pub type StorageBackendRef = Arc<dyn StorageBackend>;

// =============================================================================
// Factory
// =============================================================================

/// Combined backend configuration
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub glusterfs: GlusterConfig,
}

/// Factory for creating storage backends
pub struct BackendFactory;

impl BackendFactory {
    /// Create a backend by name
    pub fn create(name: &str, client: Client, config: BackendConfig) -> Result<StorageBackendRef> {
        match name.to_lowercase().as_str() {
            "glusterfs" | "gluster" => {
                Ok(Arc::new(GlusterBackend::new(client, config.glusterfs)))
            }
            _ => Err(Error::Configuration(format!(
                "unknown storage backend: {}",
                name
            ))),
        }
    }
}
