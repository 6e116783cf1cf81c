//! StorageCluster CRD
//!
//! Declares a storage cluster that an external provisioning service creates
//! and manages. The spec records which backend owns the cluster and, once the
//! provisioning service has assigned one, the backend's cluster identifier.
//! That identifier is written exactly once and never reassigned.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// StorageCluster CRD
// =============================================================================

/// StorageCluster declares a distributed storage cluster provisioned by an
/// external service. The operator keeps the declaration in sync with the
/// provisioned state but never owns either side.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storagebackend.io",
    version = "v1alpha1",
    kind = "StorageCluster",
    plural = "storageclusters",
    shortname = "scl",
    status = "StorageClusterStatus",
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.type"}"#,
    printcolumn = r#"{"name": "ClusterID", "type": "string", "jsonPath": ".spec.glusterfs.cluster"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct StorageClusterSpec {
    /// Backend responsible for this cluster
    #[serde(rename = "type")]
    pub storage_type: StorageTypeIdentifier,

    /// GlusterFS backend attributes, populated once the provisioning
    /// service has registered the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glusterfs: Option<GlusterClusterAttributes>,
}

/// Backend type identifier. Every backend must be unambiguously identifiable;
/// the controller uses this to route resources to the right backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StorageTypeIdentifier {
    Glusterfs,
    Mock,
}

impl std::fmt::Display for StorageTypeIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageTypeIdentifier::Glusterfs => write!(f, "glusterfs"),
            StorageTypeIdentifier::Mock => write!(f, "mock"),
        }
    }
}

/// GlusterFS-specific cluster attributes
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlusterClusterAttributes {
    /// Cluster id assigned by the provisioning service
    #[serde(default)]
    pub cluster: String,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the StorageCluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageClusterStatus {
    /// Current phase of the cluster
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human-readable detail for the current phase
    #[serde(default)]
    pub message: Option<String>,
}

/// Cluster lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Registering,
    Ready,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Registering => write!(f, "Registering"),
            ClusterPhase::Ready => write!(f, "Ready"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl StorageCluster {
    /// Provisioning-service cluster id, if one has been assigned
    pub fn cluster_id(&self) -> Option<&str> {
        self.spec
            .glusterfs
            .as_ref()
            .map(|g| g.cluster.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Record the provisioning-service cluster id. Only valid while no id is
    /// assigned; the id is never reassigned once set.
    pub fn set_cluster_id(&mut self, id: impl Into<String>) {
        debug_assert!(self.cluster_id().is_none(), "cluster id is assigned once");
        self.spec.glusterfs = Some(GlusterClusterAttributes { cluster: id.into() });
    }
}
