//! StorageNode CRD
//!
//! Declares one storage node belonging to a StorageCluster: its management
//! hostname, storage-network addresses, and the raw block devices the
//! provisioning service should register. The backend node id is empty until
//! the provisioning service assigns one; a non-empty id marks the node as
//! already known and is verified rather than re-created on later passes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// StorageNode CRD
// =============================================================================

/// StorageNode declares a node inside a StorageCluster together with the raw
/// devices it contributes. Conceptual lifecycle: Unregistered, Registering,
/// Registered, DeviceRegistrationInProgress, Ready, Deleting, Gone; driven
/// entirely by resource-change events.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "storagebackend.io",
    version = "v1alpha1",
    kind = "StorageNode",
    plural = "storagenodes",
    shortname = "sno",
    status = "StorageNodeStatus",
    printcolumn = r#"{"name": "Cluster", "type": "string", "jsonPath": ".spec.clusterRef"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "NodeID", "type": "string", "jsonPath": ".spec.glusterfs.node"}"#,
    printcolumn = r#"{"name": "Ready", "type": "boolean", "jsonPath": ".status.ready"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeSpec {
    /// Name of the StorageCluster this node belongs to (same namespace)
    pub cluster_ref: String,

    /// Management hostname of the node
    pub node_name: String,

    /// Container image for the backend daemon; defaulted by the backend
    /// when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Labels propagated onto the daemon deployment
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Storage-network addresses; the first entry is used as the node's
    /// storage IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_network: Option<StorageNetwork>,

    /// Raw device paths to register with the provisioning service
    #[serde(default)]
    pub devices: Vec<String>,

    /// GlusterFS backend attributes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glusterfs: Option<GlusterNodeAttributes>,
}

/// Storage-network configuration for a node
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageNetwork {
    /// Ordered list of addresses on the storage network
    #[serde(default)]
    pub ips: Vec<String>,
}

/// GlusterFS-specific node attributes
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlusterNodeAttributes {
    /// Cluster id this node was registered under
    #[serde(default)]
    pub cluster: String,

    /// Node id assigned by the provisioning service; empty until AddNode
    /// succeeds
    #[serde(default)]
    pub node: String,

    /// Failure-domain zone passed to the provisioning service
    #[serde(default = "default_zone")]
    pub zone: u64,
}

fn default_zone() -> u64 {
    1
}

// =============================================================================
// Status
// =============================================================================

/// Status of the StorageNode
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageNodeStatus {
    /// Whether the node is registered and usable
    #[serde(default)]
    pub ready: bool,

    /// Current phase of the node
    #[serde(default)]
    pub phase: NodePhase,

    /// Human-readable detail for the current phase
    #[serde(default)]
    pub message: Option<String>,
}

/// Node lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum NodePhase {
    #[default]
    Pending,
    Registering,
    Ready,
    Deleting,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodePhase::Pending => write!(f, "Pending"),
            NodePhase::Registering => write!(f, "Registering"),
            NodePhase::Ready => write!(f, "Ready"),
            NodePhase::Deleting => write!(f, "Deleting"),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl StorageNode {
    /// Provisioning-service node id, if one has been assigned
    pub fn node_id(&self) -> Option<&str> {
        self.spec
            .glusterfs
            .as_ref()
            .map(|g| g.node.as_str())
            .filter(|id| !id.is_empty())
    }

    /// First address on the storage network, if one is configured
    pub fn storage_ip(&self) -> Option<&str> {
        self.spec
            .storage_network
            .as_ref()
            .and_then(|net| net.ips.first())
            .map(String::as_str)
    }

    /// Whether the node has reached the Ready phase
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }
}
