//! Provisioning service client port
//!
//! The external provisioning service owns the real storage cluster, its nodes,
//! and raw block devices; this module defines the operation set the reconciler
//! needs from it, plus namespace-scoped endpoint resolution. The service's
//! address may vary per namespace, so clients are constructed per call through
//! a [`ProvisionerFactory`] rather than cached on the backend.

pub mod rest;

pub use rest::RestProvisioner;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Wire-Level Types
// =============================================================================

/// A cluster registered with the provisioning service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Cluster id assigned by the service
    pub id: String,
    /// Node ids currently in the cluster
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Request to register a node with the provisioning service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAddRequest {
    /// Failure-domain zone
    pub zone: u64,
    /// Cluster the node joins
    pub cluster_id: String,
    /// Management hostname
    pub manage_hostname: String,
    /// Address on the storage network
    pub storage_ip: String,
}

/// A node known to the provisioning service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node id assigned by the service
    pub id: String,
    /// Cluster the node belongs to
    pub cluster_id: String,
    /// Failure-domain zone
    #[serde(default)]
    pub zone: u64,
    /// Devices registered on this node
    #[serde(default)]
    pub devices: Vec<DeviceInfo>,
}

/// A device registered on a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device id assigned by the service
    pub id: String,
    /// Device path as declared (e.g. /dev/sdb)
    pub name: String,
}

/// Request to register a device with the provisioning service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAddRequest {
    /// Node the device is attached to
    pub node_id: String,
    /// Device path (e.g. /dev/sdb)
    pub name: String,
}

// =============================================================================
// Provisioning Service Port
// =============================================================================

/// Operation set the reconciler needs from the provisioning service. Every
/// call is a synchronous network request observing the latest service state;
/// there is no client-side caching.
#[async_trait]
pub trait ProvisioningService: Send + Sync {
    /// Create a new cluster, returning its assigned id
    async fn create_cluster(&self) -> Result<ClusterInfo>;

    /// Register a node, returning the assigned node info
    async fn add_node(&self, request: &NodeAddRequest) -> Result<NodeInfo>;

    /// Fetch node info (devices and status) for an assigned node id
    async fn node_info(&self, node_id: &str) -> Result<NodeInfo>;

    /// Register a device on a node
    async fn add_device(&self, request: &DeviceAddRequest) -> Result<()>;

    /// Delete a registered device
    async fn delete_device(&self, device_id: &str) -> Result<()>;

    /// Delete a registered node
    async fn delete_node(&self, node_id: &str) -> Result<()>;
}

pub type ProvisioningServiceRef = Arc<dyn ProvisioningService>;

// =============================================================================
// Endpoint Resolution
// =============================================================================

/// Resolves the provisioning service's address for a namespace
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self, namespace: &str) -> Result<String>;
}

/// Default resolver: cluster-local service DNS within the given namespace
#[derive(Debug, Clone)]
pub struct DefaultEndpointResolver {
    /// Service name of the provisioning daemon
    pub service: String,
    /// Service port
    pub port: u16,
}

impl Default for DefaultEndpointResolver {
    fn default() -> Self {
        Self {
            service: "heketi".to_string(),
            port: 8080,
        }
    }
}

impl EndpointResolver for DefaultEndpointResolver {
    fn resolve(&self, namespace: &str) -> Result<String> {
        if namespace.is_empty() {
            return Err(Error::Configuration(
                "cannot resolve provisioning service without a namespace".into(),
            ));
        }
        Ok(format!(
            "http://{}.{}.svc:{}",
            self.service, namespace, self.port
        ))
    }
}

// =============================================================================
// Per-Namespace Client Construction
// =============================================================================

/// Builds a provisioning-service client for a namespace. The reconciler calls
/// this per operation so address changes are picked up without restarts.
pub trait ProvisionerFactory: Send + Sync {
    fn for_namespace(&self, namespace: &str) -> Result<ProvisioningServiceRef>;
}

/// Factory producing REST clients against the resolved endpoint
pub struct RestProvisionerFactory {
    resolver: Box<dyn EndpointResolver>,
    http: reqwest::Client,
}

impl RestProvisionerFactory {
    pub fn new(resolver: Box<dyn EndpointResolver>) -> Self {
        Self {
            resolver,
            http: reqwest::Client::new(),
        }
    }
}

impl ProvisionerFactory for RestProvisionerFactory {
    fn for_namespace(&self, namespace: &str) -> Result<ProvisioningServiceRef> {
        let base_url = self.resolver.resolve(namespace)?;
        Ok(Arc::new(RestProvisioner::with_client(
            self.http.clone(),
            base_url,
        )))
    }
}
