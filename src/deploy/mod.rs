//! Provisioning-service bootstrap
//!
//! AddCluster requires the provisioning daemon to be running and reachable in
//! the cluster's namespace before anything can be registered with it. The
//! [`ProvisionerBootstrap`] trait captures that deploy-and-wait primitive so
//! the reconciler can be exercised without a live apiserver; the Kubernetes
//! implementation creates the Deployment and Service if absent and polls the
//! Deployment until enough replicas report ready, with a hard deadline.

use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the provisioning-daemon bootstrap
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Name of the provisioning daemon Deployment and Service
    pub name: String,
    /// Container image for the provisioning daemon
    pub image: String,
    /// Port the daemon serves its REST API on
    pub port: u16,
    /// Replicas that must report ready before AddCluster proceeds
    pub min_ready: i32,
    /// Hard deadline for the readiness wait
    pub timeout: Duration,
    /// Interval between readiness polls
    pub poll_interval: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            name: "heketi".to_string(),
            image: "heketi/heketi:latest".to_string(),
            port: 8080,
            min_ready: 1,
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
        }
    }
}

// =============================================================================
// Bootstrap Port
// =============================================================================

/// Deploy-and-wait primitive for the provisioning daemon
#[async_trait]
pub trait ProvisionerBootstrap: Send + Sync {
    /// Ensure the daemon runs in `namespace` and is ready, or fail with
    /// [`Error::BootstrapTimeout`] once the deadline passes
    async fn ensure_ready(&self, namespace: &str) -> Result<()>;
}

// =============================================================================
// Kubernetes Implementation
// =============================================================================

/// Bootstrap backed by the Kubernetes API
pub struct KubeProvisionerBootstrap {
    client: Client,
    config: BootstrapConfig,
}

impl KubeProvisionerBootstrap {
    pub fn new(client: Client, config: BootstrapConfig) -> Self {
        Self { client, config }
    }

    async fn ensure_deployment(&self, namespace: &str) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.get(&self.config.name).await {
            Ok(_) => {
                debug!("deployment {}/{} already exists", namespace, self.config.name);
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                info!("deploying {} in namespace {}", self.config.name, namespace);
                let deployment = build_provisioner_deployment(namespace, &self.config);
                api.create(&PostParams::default(), &deployment).await?;
            }
            Err(e) => return Err(Error::Kube(e)),
        }
        Ok(())
    }

    async fn ensure_service(&self, namespace: &str) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match api.get(&self.config.name).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {
                let service = build_provisioner_service(namespace, &self.config);
                api.create(&PostParams::default(), &service).await?;
            }
            Err(e) => return Err(Error::Kube(e)),
        }
        Ok(())
    }
}

#[async_trait]
impl ProvisionerBootstrap for KubeProvisionerBootstrap {
    async fn ensure_ready(&self, namespace: &str) -> Result<()> {
        self.ensure_deployment(namespace).await?;
        self.ensure_service(namespace).await?;
        wait_for_deployment_ready(
            &self.client,
            namespace,
            &self.config.name,
            self.config.min_ready,
            self.config.timeout,
            self.config.poll_interval,
        )
        .await
    }
}

/// Block until `name` reports at least `min_ready` ready replicas, polling
/// every `poll_interval`, failing once `timeout` elapses. This is the only
/// suspension point in the reconciliation core.
pub async fn wait_for_deployment_ready(
    client: &Client,
    namespace: &str,
    name: &str,
    min_ready: i32,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
    let start = Instant::now();
    loop {
        let ready = match api.get(name).await {
            Ok(deployment) => deployment
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0),
            Err(kube::Error::Api(e)) if e.code == 404 => 0,
            Err(e) => return Err(Error::Kube(e)),
        };
        if ready >= min_ready {
            debug!("deployment {}/{} is ready ({} replicas)", namespace, name, ready);
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(Error::BootstrapTimeout {
                namespace: namespace.to_string(),
                name: name.to_string(),
                waited: start.elapsed(),
            });
        }
        sleep(poll_interval).await;
    }
}

// =============================================================================
// Resource Builders
// =============================================================================

fn provisioner_labels(config: &BootstrapConfig) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), config.name.clone());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "storage-backend-operator".to_string(),
    );
    labels
}

/// Build the provisioning-daemon Deployment
pub fn build_provisioner_deployment(namespace: &str, config: &BootstrapConfig) -> Deployment {
    let labels = provisioner_labels(config);
    Deployment {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(config.min_ready),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: config.name.clone(),
                        image: Some(config.image.clone()),
                        ports: Some(vec![ContainerPort {
                            name: Some("api".to_string()),
                            container_port: i32::from(config.port),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the provisioning-daemon Service
pub fn build_provisioner_service(namespace: &str, config: &BootstrapConfig) -> Service {
    let labels = provisioner_labels(config);
    Service {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("api".to_string()),
                port: i32::from(config.port),
                target_port: Some(IntOrString::Int(i32::from(config.port))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn apiserver_client(server: &MockServer) -> Client {
        let config = kube::Config::new(server.uri().parse().unwrap());
        Client::try_from(config).unwrap()
    }

    fn deployment_body(name: &str, ready_replicas: i32) -> serde_json::Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "storage"},
            "status": {"readyReplicas": ready_replicas}
        })
    }

    #[tokio::test]
    async fn test_wait_for_deployment_ready_returns_once_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/apps/v1/namespaces/storage/deployments/heketi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(deployment_body("heketi", 1)))
            .mount(&server)
            .await;

        let client = apiserver_client(&server);
        wait_for_deployment_ready(
            &client,
            "storage",
            "heketi",
            1,
            Duration::from_millis(200),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_deployment_ready_times_out() {
        let server = MockServer::start().await;
        // The deployment never reports a ready replica.
        Mock::given(method("GET"))
            .and(path("/apis/apps/v1/namespaces/storage/deployments/heketi"))
            .respond_with(ResponseTemplate::new(200).set_body_json(deployment_body("heketi", 0)))
            .mount(&server)
            .await;

        let client = apiserver_client(&server);
        let timeout = Duration::from_millis(50);
        let err = wait_for_deployment_ready(
            &client,
            "storage",
            "heketi",
            1,
            timeout,
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();

        assert_matches!(
            err,
            Error::BootstrapTimeout { ref namespace, ref name, waited }
                if namespace == "storage" && name == "heketi" && waited >= timeout
        );
    }

    #[tokio::test]
    async fn test_wait_treats_missing_deployment_as_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/apps/v1/namespaces/storage/deployments/heketi"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "kind": "Status",
                "apiVersion": "v1",
                "status": "Failure",
                "message": "deployments.apps \"heketi\" not found",
                "reason": "NotFound",
                "code": 404
            })))
            .mount(&server)
            .await;

        let client = apiserver_client(&server);
        let err = wait_for_deployment_ready(
            &client,
            "storage",
            "heketi",
            1,
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();

        assert_matches!(err, Error::BootstrapTimeout { .. });
    }

    #[test]
    fn test_bootstrap_config_defaults() {
        let config = BootstrapConfig::default();
        assert_eq!(config.name, "heketi");
        assert_eq!(config.min_ready, 1);
        assert_eq!(config.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_build_deployment_matches_config() {
        let config = BootstrapConfig::default();
        let deployment = build_provisioner_deployment("storage", &config);

        assert_eq!(deployment.metadata.name.as_deref(), Some("heketi"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("storage"));

        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("heketi/heketi:latest"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);
    }

    #[test]
    fn test_build_service_targets_api_port() {
        let config = BootstrapConfig::default();
        let service = build_provisioner_service("storage", &config);

        let spec = service.spec.unwrap();
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.port, 8080);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));
        assert!(spec.selector.unwrap().contains_key("app.kubernetes.io/name"));
    }
}
