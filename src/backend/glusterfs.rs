//! GlusterFS storage backend
//!
//! Reconciles StorageCluster/StorageNode declarations against a Heketi-style
//! provisioning service. The provisioning service is authoritative for every
//! identifier it assigns: once a cluster or node id is recorded on a resource
//! it is verified, never re-created, and never reassigned.
//!
//! Concurrency: every operation here runs synchronously inside one
//! reconciliation. The device-list read followed by per-device registration
//! is not atomic; correctness relies on the controller runtime never running
//! two reconciliations of the same resource concurrently.

use crate::backend::{DeviceOutcome, DeviceReport, Operation, StorageBackend, StorageStatus};
use crate::crd::{
    GlusterNodeAttributes, NodePhase, StorageCluster, StorageNode, StorageNodeStatus,
    StorageTypeIdentifier,
};
use crate::deploy::{BootstrapConfig, KubeProvisionerBootstrap, ProvisionerBootstrap};
use crate::error::{Error, Result};
use crate::provisioner::{
    DefaultEndpointResolver, DeviceAddRequest, DeviceInfo, NodeAddRequest, NodeInfo,
    ProvisionerFactory, ProvisioningService, RestProvisionerFactory,
};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HostPathVolumeSource, PodSpec, PodTemplateSpec, SecurityContext,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::Api;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Label marking a daemon deployment as owned by this operator; the value is
/// the node resource's name.
pub const OPERATOR_LABEL: &str = "storagebackend.io/operator";

const GLUSTER_OPERATIONS: &[Operation] = &[
    Operation::Init,
    Operation::AddCluster,
    Operation::UpdateCluster,
    Operation::DeleteCluster,
    Operation::MakeDeployment,
    Operation::AddNode,
    Operation::UpdateNode,
    Operation::DeleteNode,
    Operation::GetStatus,
];

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the GlusterFS backend
#[derive(Debug, Clone)]
pub struct GlusterConfig {
    /// Daemon image applied when a node spec does not name one
    pub default_image: String,
    /// Provisioning-service endpoint resolution
    pub endpoint: DefaultEndpointResolver,
    /// Provisioning-daemon bootstrap settings
    pub bootstrap: BootstrapConfig,
}

impl Default for GlusterConfig {
    fn default() -> Self {
        Self {
            default_image: "gluster/gluster-centos:latest".to_string(),
            endpoint: DefaultEndpointResolver::default(),
            bootstrap: BootstrapConfig::default(),
        }
    }
}

// =============================================================================
// Cluster Source
// =============================================================================

/// Read access to StorageCluster resources, injected so the reconciler can
/// be exercised without an apiserver
#[async_trait]
pub trait ClusterSource: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<StorageCluster>;
}

/// Cluster source backed by the Kubernetes API
pub struct KubeClusterSource {
    client: Client,
}

impl KubeClusterSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterSource for KubeClusterSource {
    async fn get(&self, namespace: &str, name: &str) -> Result<StorageCluster> {
        let api: Api<StorageCluster> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cluster) => Ok(cluster),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::ResourceNotFound {
                kind: "StorageCluster".into(),
                name: format!("{}/{}", namespace, name),
            }),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}

// =============================================================================
// GlusterFS Backend
// =============================================================================

/// Backend reconciling declarations against the provisioning service
pub struct GlusterBackend {
    config: GlusterConfig,
    clusters: Arc<dyn ClusterSource>,
    provisioners: Arc<dyn ProvisionerFactory>,
    bootstrap: Arc<dyn ProvisionerBootstrap>,
}

impl GlusterBackend {
    /// Create a backend wired to the Kubernetes API and the REST
    /// provisioning client
    pub fn new(client: Client, config: GlusterConfig) -> Self {
        let provisioners = Arc::new(RestProvisionerFactory::new(Box::new(
            config.endpoint.clone(),
        )));
        let bootstrap = Arc::new(KubeProvisionerBootstrap::new(
            client.clone(),
            config.bootstrap.clone(),
        ));
        Self {
            config,
            clusters: Arc::new(KubeClusterSource::new(client)),
            provisioners,
            bootstrap,
        }
    }

    /// Create a backend with explicit dependencies (used by tests)
    pub fn with_dependencies(
        config: GlusterConfig,
        clusters: Arc<dyn ClusterSource>,
        provisioners: Arc<dyn ProvisionerFactory>,
        bootstrap: Arc<dyn ProvisionerBootstrap>,
    ) -> Self {
        Self {
            config,
            clusters,
            provisioners,
            bootstrap,
        }
    }
}

fn resource_id(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

fn namespace_of(meta: &ObjectMeta) -> String {
    meta.namespace.clone().unwrap_or_else(|| "default".to_string())
}

#[async_trait]
impl StorageBackend for GlusterBackend {
    fn storage_type(&self) -> StorageTypeIdentifier {
        StorageTypeIdentifier::Glusterfs
    }

    fn supported_operations(&self) -> &[Operation] {
        GLUSTER_OPERATIONS
    }

    async fn init(&self) -> Result<()> {
        debug!("init glusterfs backend");
        Ok(())
    }

    async fn add_cluster(&self, cluster: &StorageCluster) -> Result<Option<StorageCluster>> {
        let namespace = namespace_of(&cluster.metadata);
        let name = cluster.name_any();
        debug!("add cluster {}/{}", namespace, name);

        // The provisioning daemon must be running and reachable before
        // anything can be registered with it.
        self.bootstrap.ensure_ready(&namespace).await?;

        if let Some(id) = cluster.cluster_id() {
            info!(
                "cluster already registered: {}/{} id {}",
                namespace, name, id
            );
            return Ok(None);
        }

        let service = self.provisioners.for_namespace(&namespace)?;
        let created = service.create_cluster().await?;
        info!("created cluster {}/{} id {}", namespace, name, created.id);

        let mut updated = cluster.clone();
        updated.set_cluster_id(created.id);
        Ok(Some(updated))
    }

    /// Intentionally minimal: the provisioning service is not asked to
    /// rename a cluster.
    async fn update_cluster(&self, old: &StorageCluster, _new: &StorageCluster) -> Result<()> {
        debug!("update cluster {}", old.name_any());
        Ok(())
    }

    /// Intentionally minimal: tearing down the underlying storage cluster is
    /// not automated.
    async fn delete_cluster(&self, cluster: &StorageCluster) -> Result<()> {
        debug!("delete cluster {}", cluster.name_any());
        Ok(())
    }

    fn make_deployment(
        &self,
        _cluster: &StorageCluster,
        node: &StorageNode,
        previous: Option<&Deployment>,
    ) -> Result<Option<Deployment>> {
        let namespace = namespace_of(&node.metadata);
        let name = node.name_any();

        let image = node
            .spec
            .image
            .clone()
            .unwrap_or_else(|| self.config.default_image.clone());
        let spec = make_gluster_deployment_spec(node, &image)?;

        let mut labels = node.spec.labels.clone();
        labels.insert(OPERATOR_LABEL.to_string(), name.clone());

        // Annotations attached to an existing deployment by other parties
        // survive regeneration.
        let annotations = match previous {
            Some(prev) => prev.metadata.annotations.clone(),
            None => node.metadata.annotations.clone(),
        };

        Ok(Some(Deployment {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(namespace),
                labels: Some(labels),
                annotations,
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }))
    }

    async fn add_node(&self, node: &StorageNode) -> Result<Option<StorageNode>> {
        let namespace = namespace_of(&node.metadata);
        let name = node.name_any();

        // 1. Referenced cluster must be readable.
        let cluster = self.clusters.get(&namespace, &node.spec.cluster_ref).await?;

        // 2. Backend fields must be present on both resources.
        let cluster_id = cluster
            .cluster_id()
            .ok_or_else(|| Error::Precondition {
                resource: resource_id(&namespace, &cluster.name_any()),
                reason: "cluster has no provisioning-service id assigned yet".into(),
            })?
            .to_string();
        let zone = node
            .spec
            .glusterfs
            .as_ref()
            .map(|g| g.zone)
            .ok_or_else(|| Error::Precondition {
                resource: resource_id(&namespace, &name),
                reason: "glusterfs attributes missing from node spec".into(),
            })?;

        // 3. A storage-network address is required; the first one is the
        //    node's storage IP.
        let storage_ip = match node.storage_ip() {
            Some(ip) => ip.to_string(),
            None => {
                warn!("StorageNetwork has not been defined for {}/{}", namespace, name);
                return Err(Error::Precondition {
                    resource: resource_id(&namespace, &name),
                    reason: "no storage network address configured".into(),
                });
            }
        };

        let service = self.provisioners.for_namespace(&namespace)?;
        let mut updated = node.clone();

        if let Some(node_id) = node.node_id() {
            // 4. An already-assigned id is verified, never re-created. A
            //    failed lookup means the declared id is stale and automated
            //    repair is unsafe.
            if let Err(err) = service.node_info(node_id).await {
                error!(
                    "node {}/{} has id {} but the provisioning service does not recognize it: {}",
                    namespace, name, node_id, err
                );
                return Err(Error::Consistency {
                    resource: resource_id(&namespace, &name),
                    id: node_id.to_string(),
                });
            }
            debug!("node {}/{} already registered as {}", namespace, name, node_id);
        } else {
            // 5. Register the node and record the assigned identifiers.
            let registered = service
                .add_node(&NodeAddRequest {
                    zone,
                    cluster_id: cluster_id.clone(),
                    manage_hostname: node.spec.node_name.clone(),
                    storage_ip,
                })
                .await?;
            info!(
                "registered node {}/{} with id {}",
                namespace, name, registered.id
            );

            let attrs = updated
                .spec
                .glusterfs
                .get_or_insert_with(GlusterNodeAttributes::default);
            attrs.cluster = cluster_id;
            attrs.node = registered.id;
            let status = updated.status.get_or_insert_with(StorageNodeStatus::default);
            status.ready = true;
            status.phase = NodePhase::Ready;
        }

        // 6. Device-less nodes are valid but noted.
        if updated.spec.devices.is_empty() {
            warn!("no devices defined for node {}/{}", namespace, name);
            return Ok(Some(updated));
        }

        // 7. Diff against the service's current device list and register
        //    what is missing, best-effort per device.
        let node_id = updated
            .node_id()
            .map(str::to_string)
            .ok_or_else(|| Error::Internal("node id missing after registration".into()))?;
        let known = service.node_info(&node_id).await?;
        let reports = register_devices(service.as_ref(), &node_id, &updated.spec.devices, &known).await;
        for report in &reports {
            match &report.outcome {
                DeviceOutcome::Registered => {
                    info!("registered device {}/{} {}", namespace, name, report.device);
                }
                DeviceOutcome::AlreadyRegistered => {
                    debug!("device already registered {}/{} {}", namespace, name, report.device);
                }
                DeviceOutcome::Failed(reason) => {
                    warn!(
                        "unable to add device {}/{} {}: {}",
                        namespace, name, report.device, reason
                    );
                }
                DeviceOutcome::Deleted => {}
            }
        }

        Ok(Some(updated))
    }

    /// Intentionally minimal: node spec changes are not propagated to the
    /// provisioning service.
    async fn update_node(&self, node: &StorageNode) -> Result<Option<StorageNode>> {
        debug!("update node {}", node.name_any());
        Ok(None)
    }

    async fn delete_node(&self, node: &StorageNode) -> Result<()> {
        let namespace = namespace_of(&node.metadata);
        let name = node.name_any();

        let Some(node_id) = node.node_id() else {
            debug!("node {}/{} was never registered, nothing to delete", namespace, name);
            return Ok(());
        };

        let service = self.provisioners.for_namespace(&namespace)?;
        let info = service.node_info(node_id).await?;

        let reports = delete_devices(service.as_ref(), &info.devices).await;
        for report in &reports {
            match &report.outcome {
                DeviceOutcome::Deleted => {
                    debug!("deleted device {} of {}/{}", report.device, namespace, name);
                }
                DeviceOutcome::Failed(reason) => {
                    warn!(
                        "unable to delete device {} of {}/{}: {}",
                        report.device, namespace, name, reason
                    );
                }
                _ => {}
            }
        }

        // The node deletion itself is the one failure that propagates.
        service.delete_node(node_id).await
    }

    async fn get_status(&self, cluster: &StorageCluster) -> Result<StorageStatus> {
        debug!("status for cluster {}", cluster.name_any());
        Ok(StorageStatus::default())
    }
}

// =============================================================================
// Best-Effort Device Loops
// =============================================================================

/// Register every declared device not already present in `known`, continuing
/// past individual failures. Returns one outcome per declared device.
pub async fn register_devices(
    service: &dyn ProvisioningService,
    node_id: &str,
    devices: &[String],
    known: &NodeInfo,
) -> Vec<DeviceReport> {
    let mut reports = Vec::with_capacity(devices.len());
    for device in devices {
        if known.devices.iter().any(|d| d.name == *device) {
            reports.push(DeviceReport {
                device: device.clone(),
                outcome: DeviceOutcome::AlreadyRegistered,
            });
            continue;
        }
        let outcome = match service
            .add_device(&DeviceAddRequest {
                node_id: node_id.to_string(),
                name: device.clone(),
            })
            .await
        {
            Ok(()) => DeviceOutcome::Registered,
            Err(err) => DeviceOutcome::Failed(err.to_string()),
        };
        reports.push(DeviceReport {
            device: device.clone(),
            outcome,
        });
    }
    reports
}

/// Delete every registered device, continuing past individual failures.
/// Returns one outcome per device, keyed by device id.
pub async fn delete_devices(
    service: &dyn ProvisioningService,
    devices: &[DeviceInfo],
) -> Vec<DeviceReport> {
    let mut reports = Vec::with_capacity(devices.len());
    for device in devices {
        let outcome = match service.delete_device(&device.id).await {
            Ok(()) => DeviceOutcome::Deleted,
            Err(err) => DeviceOutcome::Failed(err.to_string()),
        };
        reports.push(DeviceReport {
            device: device.id.clone(),
            outcome,
        });
    }
    reports
}

// =============================================================================
// Deployment Synthesis
// =============================================================================

/// Build the daemon DeploymentSpec for one node. Pure; fails only on a
/// malformed node spec.
fn make_gluster_deployment_spec(node: &StorageNode, image: &str) -> Result<DeploymentSpec> {
    if node.spec.node_name.is_empty() {
        return Err(Error::Precondition {
            resource: node.name_any(),
            reason: "node spec has no node name".into(),
        });
    }

    let mut selector = BTreeMap::new();
    selector.insert("app.kubernetes.io/name".to_string(), "glusterfs".to_string());
    selector.insert("storagebackend.io/node".to_string(), node.name_any());

    let mut node_selector = BTreeMap::new();
    node_selector.insert(
        "kubernetes.io/hostname".to_string(),
        node.spec.node_name.clone(),
    );

    Ok(DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(selector.clone()),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(selector),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                node_selector: Some(node_selector),
                containers: vec![Container {
                    name: "glusterfs".to_string(),
                    image: Some(image.to_string()),
                    ports: Some(vec![
                        ContainerPort {
                            name: Some("management".to_string()),
                            container_port: 24007,
                            ..Default::default()
                        },
                        ContainerPort {
                            name: Some("rdma".to_string()),
                            container_port: 24008,
                            ..Default::default()
                        },
                    ]),
                    // Raw device access requires a privileged container.
                    security_context: Some(SecurityContext {
                        privileged: Some(true),
                        ..Default::default()
                    }),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "dev".to_string(),
                        mount_path: "/dev".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "dev".to_string(),
                    host_path: Some(HostPathVolumeSource {
                        path: "/dev".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        },
        ..Default::default()
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        GlusterClusterAttributes, StorageClusterSpec, StorageNetwork, StorageNodeSpec,
    };
    use crate::provisioner::{ClusterInfo, ProvisioningServiceRef};
    use assert_matches::assert_matches;
    use std::collections::HashSet;
    use std::sync::Mutex;

    // -------------------------------------------------------------------------
    // Mocks
    // -------------------------------------------------------------------------

    #[derive(Default)]
    struct MockState {
        create_cluster_calls: usize,
        add_node_calls: usize,
        node_info_calls: usize,
        add_device_calls: Vec<String>,
        delete_device_calls: Vec<String>,
        delete_node_calls: usize,
        nodes: BTreeMap<String, NodeInfo>,
        fail_add_device: HashSet<String>,
        fail_delete_device: HashSet<String>,
        fail_delete_node: bool,
    }

    #[derive(Default)]
    struct MockProvisioner {
        state: Mutex<MockState>,
    }

    impl MockProvisioner {
        fn with_node(self, info: NodeInfo) -> Self {
            self.state.lock().unwrap().nodes.insert(info.id.clone(), info);
            self
        }

        fn fail_add_device(self, name: &str) -> Self {
            self.state
                .lock()
                .unwrap()
                .fail_add_device
                .insert(name.to_string());
            self
        }

        fn fail_delete_device(self, id: &str) -> Self {
            self.state
                .lock()
                .unwrap()
                .fail_delete_device
                .insert(id.to_string());
            self
        }

        fn api_error(operation: &str) -> Error {
            Error::ProvisionerApi {
                operation: operation.to_string(),
                status: 500,
                message: "injected failure".into(),
            }
        }
    }

    #[async_trait]
    impl ProvisioningService for MockProvisioner {
        async fn create_cluster(&self) -> Result<ClusterInfo> {
            let mut state = self.state.lock().unwrap();
            state.create_cluster_calls += 1;
            Ok(ClusterInfo {
                id: "cluster-1".into(),
                nodes: vec![],
            })
        }

        async fn add_node(&self, request: &NodeAddRequest) -> Result<NodeInfo> {
            let mut state = self.state.lock().unwrap();
            state.add_node_calls += 1;
            let info = NodeInfo {
                id: format!("node-{}", state.add_node_calls),
                cluster_id: request.cluster_id.clone(),
                zone: request.zone,
                devices: vec![],
            };
            state.nodes.insert(info.id.clone(), info.clone());
            Ok(info)
        }

        async fn node_info(&self, node_id: &str) -> Result<NodeInfo> {
            let mut state = self.state.lock().unwrap();
            state.node_info_calls += 1;
            state.nodes.get(node_id).cloned().ok_or(Error::ProvisionerApi {
                operation: "node info".into(),
                status: 404,
                message: "Id not found".into(),
            })
        }

        async fn add_device(&self, request: &DeviceAddRequest) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_add_device.contains(&request.name) {
                return Err(Self::api_error("add device"));
            }
            state.add_device_calls.push(request.name.clone());
            let device_id = format!("dev-{}", state.add_device_calls.len());
            if let Some(node) = state.nodes.get_mut(&request.node_id) {
                node.devices.push(DeviceInfo {
                    id: device_id,
                    name: request.name.clone(),
                });
            }
            Ok(())
        }

        async fn delete_device(&self, device_id: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_delete_device.contains(device_id) {
                return Err(Self::api_error("delete device"));
            }
            state.delete_device_calls.push(device_id.to_string());
            Ok(())
        }

        async fn delete_node(&self, node_id: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if state.fail_delete_node {
                return Err(Self::api_error("delete node"));
            }
            state.delete_node_calls += 1;
            state.nodes.remove(node_id);
            Ok(())
        }
    }

    struct SharedFactory(Arc<MockProvisioner>);

    impl ProvisionerFactory for SharedFactory {
        fn for_namespace(&self, _namespace: &str) -> Result<ProvisioningServiceRef> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct MockBootstrap {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl ProvisionerBootstrap for MockBootstrap {
        async fn ensure_ready(&self, _namespace: &str) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct InMemoryClusters {
        clusters: BTreeMap<String, StorageCluster>,
    }

    impl InMemoryClusters {
        fn new(clusters: Vec<StorageCluster>) -> Self {
            Self {
                clusters: clusters
                    .into_iter()
                    .map(|c| (c.name_any(), c))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl ClusterSource for InMemoryClusters {
        async fn get(&self, namespace: &str, name: &str) -> Result<StorageCluster> {
            self.clusters
                .get(name)
                .cloned()
                .ok_or_else(|| Error::ResourceNotFound {
                    kind: "StorageCluster".into(),
                    name: format!("{}/{}", namespace, name),
                })
        }
    }

    // -------------------------------------------------------------------------
    // Fixtures
    // -------------------------------------------------------------------------

    fn registered_cluster() -> StorageCluster {
        StorageCluster::new(
            "gluster",
            StorageClusterSpec {
                storage_type: StorageTypeIdentifier::Glusterfs,
                glusterfs: Some(GlusterClusterAttributes {
                    cluster: "cluster-1".into(),
                }),
            },
        )
    }

    fn unregistered_cluster() -> StorageCluster {
        StorageCluster::new(
            "gluster",
            StorageClusterSpec {
                storage_type: StorageTypeIdentifier::Glusterfs,
                glusterfs: None,
            },
        )
    }

    fn node_spec() -> StorageNodeSpec {
        StorageNodeSpec {
            cluster_ref: "gluster".into(),
            node_name: "node-0.example.com".into(),
            image: None,
            labels: BTreeMap::new(),
            storage_network: Some(StorageNetwork {
                ips: vec!["10.0.0.5".into()],
            }),
            devices: vec!["/dev/sdb".into(), "/dev/sdc".into()],
            glusterfs: Some(GlusterNodeAttributes {
                zone: 1,
                ..Default::default()
            }),
        }
    }

    fn backend(
        provisioner: Arc<MockProvisioner>,
        bootstrap: Arc<MockBootstrap>,
        clusters: Vec<StorageCluster>,
    ) -> GlusterBackend {
        GlusterBackend::with_dependencies(
            GlusterConfig::default(),
            Arc::new(InMemoryClusters::new(clusters)),
            Arc::new(SharedFactory(provisioner)),
            bootstrap,
        )
    }

    // -------------------------------------------------------------------------
    // AddCluster
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_add_cluster_is_idempotent() {
        let provisioner = Arc::new(MockProvisioner::default());
        let bootstrap = Arc::new(MockBootstrap::default());
        let backend = backend(provisioner.clone(), bootstrap.clone(), vec![]);

        let first = backend
            .add_cluster(&unregistered_cluster())
            .await
            .unwrap()
            .expect("first call mutates the resource");
        assert_eq!(first.cluster_id(), Some("cluster-1"));

        // Second call sees the recorded id: no mutation, no second create.
        let second = backend.add_cluster(&first).await.unwrap();
        assert!(second.is_none());
        assert_eq!(provisioner.state.lock().unwrap().create_cluster_calls, 1);

        // The bootstrap runs on every invocation.
        assert_eq!(*bootstrap.calls.lock().unwrap(), 2);
    }

    // -------------------------------------------------------------------------
    // AddNode
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_add_node_registers_node_and_devices() {
        let provisioner = Arc::new(MockProvisioner::default());
        let backend = backend(
            provisioner.clone(),
            Arc::new(MockBootstrap::default()),
            vec![registered_cluster()],
        );
        let node = StorageNode::new("node-0", node_spec());

        let updated = backend.add_node(&node).await.unwrap().unwrap();
        assert_eq!(updated.node_id(), Some("node-1"));
        assert_eq!(
            updated.spec.glusterfs.as_ref().unwrap().cluster,
            "cluster-1"
        );
        assert!(updated.is_ready());

        let state = provisioner.state.lock().unwrap();
        assert_eq!(state.add_node_calls, 1);
        assert_eq!(state.add_device_calls, vec!["/dev/sdb", "/dev/sdc"]);
    }

    #[tokio::test]
    async fn test_add_node_second_pass_only_verifies() {
        let provisioner = Arc::new(MockProvisioner::default());
        let backend = backend(
            provisioner.clone(),
            Arc::new(MockBootstrap::default()),
            vec![registered_cluster()],
        );
        let node = StorageNode::new("node-0", node_spec());

        let updated = backend.add_node(&node).await.unwrap().unwrap();
        let rerun = backend.add_node(&updated).await.unwrap().unwrap();
        assert_eq!(rerun.node_id(), Some("node-1"));

        let state = provisioner.state.lock().unwrap();
        // Still exactly one registration; the id was verified via lookup and
        // both devices were found already present.
        assert_eq!(state.add_node_calls, 1);
        assert_eq!(state.add_device_calls.len(), 2);
        assert!(state.node_info_calls >= 2);
    }

    #[tokio::test]
    async fn test_add_node_without_storage_network_fails_before_any_call() {
        let provisioner = Arc::new(MockProvisioner::default());
        let backend = backend(
            provisioner.clone(),
            Arc::new(MockBootstrap::default()),
            vec![registered_cluster()],
        );
        let mut spec = node_spec();
        spec.storage_network = None;
        let node = StorageNode::new("node-0", spec);

        let err = backend.add_node(&node).await.unwrap_err();
        assert_matches!(err, Error::Precondition { .. });

        let state = provisioner.state.lock().unwrap();
        assert_eq!(state.add_node_calls, 0);
        assert_eq!(state.node_info_calls, 0);
        assert!(state.add_device_calls.is_empty());
    }

    #[tokio::test]
    async fn test_add_node_requires_cluster_id() {
        let provisioner = Arc::new(MockProvisioner::default());
        let backend = backend(
            provisioner.clone(),
            Arc::new(MockBootstrap::default()),
            vec![unregistered_cluster()],
        );
        let node = StorageNode::new("node-0", node_spec());

        let err = backend.add_node(&node).await.unwrap_err();
        assert_matches!(err, Error::Precondition { .. });
    }

    #[tokio::test]
    async fn test_add_node_requires_backend_attributes() {
        let provisioner = Arc::new(MockProvisioner::default());
        let backend = backend(
            provisioner.clone(),
            Arc::new(MockBootstrap::default()),
            vec![registered_cluster()],
        );
        let mut spec = node_spec();
        spec.glusterfs = None;
        let node = StorageNode::new("node-0", spec);

        let err = backend.add_node(&node).await.unwrap_err();
        assert_matches!(err, Error::Precondition { .. });
    }

    #[tokio::test]
    async fn test_add_node_with_unknown_cluster_ref_fails() {
        let backend = backend(
            Arc::new(MockProvisioner::default()),
            Arc::new(MockBootstrap::default()),
            vec![],
        );
        let node = StorageNode::new("node-0", node_spec());

        let err = backend.add_node(&node).await.unwrap_err();
        assert_matches!(err, Error::ResourceNotFound { .. });
    }

    #[tokio::test]
    async fn test_add_node_stale_id_is_consistency_error() {
        let provisioner = Arc::new(MockProvisioner::default());
        let backend = backend(
            provisioner.clone(),
            Arc::new(MockBootstrap::default()),
            vec![registered_cluster()],
        );
        let mut spec = node_spec();
        spec.glusterfs = Some(GlusterNodeAttributes {
            cluster: "cluster-1".into(),
            node: "ghost".into(),
            zone: 1,
        });
        let node = StorageNode::new("node-0", spec);

        let err = backend.add_node(&node).await.unwrap_err();
        assert_matches!(err, Error::Consistency { ref id, .. } if id == "ghost");
        assert_eq!(provisioner.state.lock().unwrap().add_node_calls, 0);
    }

    #[tokio::test]
    async fn test_add_node_without_devices_succeeds() {
        let provisioner = Arc::new(MockProvisioner::default());
        let backend = backend(
            provisioner.clone(),
            Arc::new(MockBootstrap::default()),
            vec![registered_cluster()],
        );
        let mut spec = node_spec();
        spec.devices = vec![];
        let node = StorageNode::new("node-0", spec);

        let updated = backend.add_node(&node).await.unwrap().unwrap();
        assert!(updated.is_ready());
        assert!(provisioner.state.lock().unwrap().add_device_calls.is_empty());
    }

    // -------------------------------------------------------------------------
    // Device loops
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_register_devices_skips_known_and_continues_past_failure() {
        let provisioner = MockProvisioner::default()
            .with_node(NodeInfo {
                id: "node-1".into(),
                cluster_id: "cluster-1".into(),
                zone: 1,
                devices: vec![DeviceInfo {
                    id: "dev-0".into(),
                    name: "/dev/sdb".into(),
                }],
            })
            .fail_add_device("/dev/sdd");

        let known = provisioner.node_info("node-1").await.unwrap();
        let devices = vec!["/dev/sdb".into(), "/dev/sdc".into(), "/dev/sdd".into()];
        let reports = register_devices(&provisioner, "node-1", &devices, &known).await;

        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].outcome, DeviceOutcome::AlreadyRegistered);
        assert_eq!(reports[1].outcome, DeviceOutcome::Registered);
        assert_matches!(reports[2].outcome, DeviceOutcome::Failed(_));

        // Only the genuinely-missing device reached the service.
        let state = provisioner.state.lock().unwrap();
        assert_eq!(state.add_device_calls, vec!["/dev/sdc"]);
    }

    // -------------------------------------------------------------------------
    // DeleteNode
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_delete_node_without_id_makes_no_calls() {
        let provisioner = Arc::new(MockProvisioner::default());
        let backend = backend(
            provisioner.clone(),
            Arc::new(MockBootstrap::default()),
            vec![registered_cluster()],
        );
        let mut spec = node_spec();
        spec.glusterfs = Some(GlusterNodeAttributes::default());
        let node = StorageNode::new("node-0", spec);

        backend.delete_node(&node).await.unwrap();

        let state = provisioner.state.lock().unwrap();
        assert_eq!(state.node_info_calls, 0);
        assert_eq!(state.delete_node_calls, 0);
        assert!(state.delete_device_calls.is_empty());
    }

    #[tokio::test]
    async fn test_delete_node_continues_past_device_failure() {
        let provisioner = Arc::new(
            MockProvisioner::default()
                .with_node(NodeInfo {
                    id: "node-1".into(),
                    cluster_id: "cluster-1".into(),
                    zone: 1,
                    devices: vec![
                        DeviceInfo {
                            id: "dev-1".into(),
                            name: "/dev/sdb".into(),
                        },
                        DeviceInfo {
                            id: "dev-2".into(),
                            name: "/dev/sdc".into(),
                        },
                    ],
                })
                .fail_delete_device("dev-1"),
        );
        let backend = backend(
            provisioner.clone(),
            Arc::new(MockBootstrap::default()),
            vec![registered_cluster()],
        );
        let mut spec = node_spec();
        spec.glusterfs = Some(GlusterNodeAttributes {
            cluster: "cluster-1".into(),
            node: "node-1".into(),
            zone: 1,
        });
        let node = StorageNode::new("node-0", spec);

        backend.delete_node(&node).await.unwrap();

        let state = provisioner.state.lock().unwrap();
        // dev-1 failed but dev-2 was still attempted, and the node itself
        // was deleted afterwards.
        assert_eq!(state.delete_device_calls, vec!["dev-2"]);
        assert_eq!(state.delete_node_calls, 1);
    }

    #[tokio::test]
    async fn test_delete_node_propagates_node_deletion_error() {
        let provisioner = Arc::new(MockProvisioner::default().with_node(NodeInfo {
            id: "node-1".into(),
            cluster_id: "cluster-1".into(),
            zone: 1,
            devices: vec![],
        }));
        provisioner.state.lock().unwrap().fail_delete_node = true;
        let backend = backend(
            provisioner,
            Arc::new(MockBootstrap::default()),
            vec![registered_cluster()],
        );
        let mut spec = node_spec();
        spec.glusterfs = Some(GlusterNodeAttributes {
            cluster: "cluster-1".into(),
            node: "node-1".into(),
            zone: 1,
        });
        let node = StorageNode::new("node-0", spec);

        let err = backend.delete_node(&node).await.unwrap_err();
        assert_matches!(err, Error::ProvisionerApi { .. });
    }

    // -------------------------------------------------------------------------
    // MakeDeployment
    // -------------------------------------------------------------------------

    fn deployment_backend() -> GlusterBackend {
        backend(
            Arc::new(MockProvisioner::default()),
            Arc::new(MockBootstrap::default()),
            vec![],
        )
    }

    #[test]
    fn test_make_deployment_defaults_image_only_when_unset() {
        let backend = deployment_backend();
        let cluster = registered_cluster();

        let node = StorageNode::new("node-0", node_spec());
        let deployment = backend
            .make_deployment(&cluster, &node, None)
            .unwrap()
            .unwrap();
        let image = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .image
            .clone();
        assert_eq!(image.as_deref(), Some("gluster/gluster-centos:latest"));

        let mut spec = node_spec();
        spec.image = Some("gluster/gluster-centos:gluster4u0_centos7".into());
        let node = StorageNode::new("node-0", spec);
        let deployment = backend
            .make_deployment(&cluster, &node, None)
            .unwrap()
            .unwrap();
        let image = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .image
            .clone();
        assert_eq!(
            image.as_deref(),
            Some("gluster/gluster-centos:gluster4u0_centos7")
        );
    }

    #[test]
    fn test_make_deployment_preserves_previous_annotations() {
        let backend = deployment_backend();
        let cluster = registered_cluster();
        let node = StorageNode::new("node-0", node_spec());

        let mut annotations = BTreeMap::new();
        annotations.insert("external.io/checksum".to_string(), "abc".to_string());
        let previous = Deployment {
            metadata: ObjectMeta {
                annotations: Some(annotations.clone()),
                ..Default::default()
            },
            ..Default::default()
        };

        let regenerated = backend
            .make_deployment(&cluster, &node, Some(&previous))
            .unwrap()
            .unwrap();
        assert_eq!(regenerated.metadata.annotations, Some(annotations));
    }

    #[test]
    fn test_make_deployment_merges_operator_label() {
        let backend = deployment_backend();
        let cluster = registered_cluster();

        let mut spec = node_spec();
        spec.labels.insert("tier".to_string(), "storage".to_string());
        let node = StorageNode::new("node-0", spec);

        let deployment = backend
            .make_deployment(&cluster, &node, None)
            .unwrap()
            .unwrap();
        let labels = deployment.metadata.labels.unwrap();
        assert_eq!(labels.get("tier").map(String::as_str), Some("storage"));
        assert_eq!(labels.get(OPERATOR_LABEL).map(String::as_str), Some("node-0"));
    }

    #[test]
    fn test_make_deployment_rejects_empty_node_name() {
        let backend = deployment_backend();
        let cluster = registered_cluster();
        let mut spec = node_spec();
        spec.node_name = String::new();
        let node = StorageNode::new("node-0", spec);

        let err = backend.make_deployment(&cluster, &node, None).unwrap_err();
        assert_matches!(err, Error::Precondition { .. });
    }

    // -------------------------------------------------------------------------
    // Misc operations
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_noop_operations_and_status() {
        let backend = deployment_backend();
        let cluster = registered_cluster();
        let node = StorageNode::new("node-0", node_spec());

        assert!(backend.init().await.is_ok());
        assert!(backend.update_cluster(&cluster, &cluster).await.is_ok());
        assert!(backend.delete_cluster(&cluster).await.is_ok());
        assert!(backend.update_node(&node).await.unwrap().is_none());
        let status = backend.get_status(&cluster).await.unwrap();
        assert!(!status.healthy);
    }

    #[test]
    fn test_backend_identity_and_capabilities() {
        let backend = deployment_backend();
        assert_eq!(backend.storage_type(), StorageTypeIdentifier::Glusterfs);
        assert!(backend.supports(Operation::AddNode));
        assert!(backend.supports(Operation::GetStatus));
    }
}
