//! Custom Resource Definitions
//!
//! Declarative resources consumed by the operator:
//! - StorageCluster: a storage cluster provisioned by the external service
//! - StorageNode: a node (and its devices) within a StorageCluster

pub mod storage_cluster;
pub mod storage_node;

pub use storage_cluster::{
    ClusterPhase, GlusterClusterAttributes, StorageCluster, StorageClusterSpec,
    StorageClusterStatus, StorageTypeIdentifier,
};
pub use storage_node::{
    GlusterNodeAttributes, NodePhase, StorageNetwork, StorageNode, StorageNodeSpec,
    StorageNodeStatus,
};
