//! REST client for the provisioning service
//!
//! Speaks the Heketi-style HTTP API: clusters, nodes, and devices are plain
//! JSON resources. Non-2xx responses are surfaced as
//! [`Error::ProvisionerApi`] with the response body as the message; transport
//! failures map to [`Error::ProvisionerConnection`].

use crate::error::{Error, Result};
use crate::provisioner::{
    ClusterInfo, DeviceAddRequest, DeviceInfo, NodeAddRequest, NodeInfo, ProvisioningService,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

// =============================================================================
// Wire Format
// =============================================================================

#[derive(Debug, Deserialize)]
struct ClusterWire {
    id: String,
    #[serde(default)]
    nodes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct NodeAddWire<'a> {
    zone: u64,
    cluster: &'a str,
    hostnames: HostnamesWire<'a>,
}

#[derive(Debug, Serialize)]
struct HostnamesWire<'a> {
    manage: Vec<&'a str>,
    storage: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct NodeWire {
    id: String,
    cluster: String,
    #[serde(default)]
    zone: u64,
    #[serde(default)]
    devices: Vec<DeviceWire>,
}

#[derive(Debug, Deserialize)]
struct DeviceWire {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct DeviceAddWire<'a> {
    node: &'a str,
    name: &'a str,
}

impl From<NodeWire> for NodeInfo {
    fn from(wire: NodeWire) -> Self {
        NodeInfo {
            id: wire.id,
            cluster_id: wire.cluster,
            zone: wire.zone,
            devices: wire
                .devices
                .into_iter()
                .map(|d| DeviceInfo {
                    id: d.id,
                    name: d.name,
                })
                .collect(),
        }
    }
}

// =============================================================================
// REST Provisioner
// =============================================================================

/// REST client bound to one provisioning-service endpoint
pub struct RestProvisioner {
    http: reqwest::Client,
    base_url: String,
}

impl RestProvisioner {
    /// Create a client against the given base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create a client reusing an existing connection pool
    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { http, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Map a non-success response to a descriptive API error
    async fn check(operation: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        Err(Error::ProvisionerApi {
            operation: operation.to_string(),
            status,
            message,
        })
    }
}

#[async_trait]
impl ProvisioningService for RestProvisioner {
    async fn create_cluster(&self) -> Result<ClusterInfo> {
        debug!("creating cluster at {}", self.base_url);
        let response = self
            .http
            .post(self.url("/clusters"))
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let wire: ClusterWire = Self::check("create cluster", response).await?.json().await?;
        Ok(ClusterInfo {
            id: wire.id,
            nodes: wire.nodes,
        })
    }

    async fn add_node(&self, request: &NodeAddRequest) -> Result<NodeInfo> {
        debug!(
            "adding node {} to cluster {}",
            request.manage_hostname, request.cluster_id
        );
        let body = NodeAddWire {
            zone: request.zone,
            cluster: &request.cluster_id,
            hostnames: HostnamesWire {
                manage: vec![&request.manage_hostname],
                storage: vec![&request.storage_ip],
            },
        };
        let response = self.http.post(self.url("/nodes")).json(&body).send().await?;
        let wire: NodeWire = Self::check("add node", response).await?.json().await?;
        Ok(wire.into())
    }

    async fn node_info(&self, node_id: &str) -> Result<NodeInfo> {
        let response = self
            .http
            .get(self.url(&format!("/nodes/{}", node_id)))
            .send()
            .await?;
        let wire: NodeWire = Self::check("node info", response).await?.json().await?;
        Ok(wire.into())
    }

    async fn add_device(&self, request: &DeviceAddRequest) -> Result<()> {
        debug!("adding device {} on node {}", request.name, request.node_id);
        let body = DeviceAddWire {
            node: &request.node_id,
            name: &request.name,
        };
        let response = self
            .http
            .post(self.url("/devices"))
            .json(&body)
            .send()
            .await?;
        Self::check("add device", response).await?;
        Ok(())
    }

    async fn delete_device(&self, device_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/devices/{}", device_id)))
            .send()
            .await?;
        Self::check("delete device", response).await?;
        Ok(())
    }

    async fn delete_node(&self, node_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/nodes/{}", node_id)))
            .send()
            .await?;
        Self::check("delete node", response).await?;
        Ok(())
    }
}
