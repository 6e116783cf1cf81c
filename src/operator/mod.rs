//! Controller runtime wiring
//!
//! Two controllers share one backend: one reconciles StorageCluster
//! resources, the other StorageNode resources. Backend mutations are
//! persisted back through the apiserver, and node cleanup runs behind a
//! finalizer so external state is released before the resource disappears.

use crate::backend::StorageBackendRef;
use crate::crd::{ClusterPhase, StorageCluster, StorageClusterStatus, StorageNode};
use crate::error::{Error, ErrorAction, Result};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use prometheus::{IntCounterVec, Opts, Registry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Finalizer guarding node cleanup against the provisioning service
pub const NODE_FINALIZER: &str = "storagebackend.io/node-cleanup";

/// Periodic resync interval for healthy resources
const RESYNC_PERIOD: Duration = Duration::from_secs(300);

/// Backoff applied to retryable reconcile failures
const RETRY_PERIOD: Duration = Duration::from_secs(5);

// =============================================================================
// Metrics
// =============================================================================

/// Reconciliation counters exposed on the metrics endpoint
pub struct OperatorMetrics {
    pub reconciliations: IntCounterVec,
    pub reconcile_failures: IntCounterVec,
}

impl OperatorMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let reconciliations = IntCounterVec::new(
            Opts::new(
                "storage_operator_reconciliations_total",
                "Successful reconciliations by resource kind",
            ),
            &["kind"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;
        let reconcile_failures = IntCounterVec::new(
            Opts::new(
                "storage_operator_reconcile_failures_total",
                "Failed reconciliations by resource kind",
            ),
            &["kind"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        registry
            .register(Box::new(reconciliations.clone()))
            .map_err(|e| Error::Internal(e.to_string()))?;
        registry
            .register(Box::new(reconcile_failures.clone()))
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(Self {
            reconciliations,
            reconcile_failures,
        })
    }
}

// =============================================================================
// Operator State
// =============================================================================

/// Shared context handed to every reconciliation
pub struct OperatorState {
    pub client: Client,
    pub backend: StorageBackendRef,
    pub metrics: OperatorMetrics,
}

// =============================================================================
// Entry Point
// =============================================================================

/// Initialize the backend and drive both controllers until shutdown
pub async fn run(state: Arc<OperatorState>) -> Result<()> {
    state.backend.init().await?;

    let clusters: Api<StorageCluster> = Api::all(state.client.clone());
    let nodes: Api<StorageNode> = Api::all(state.client.clone());

    // Fail fast when the CRDs are not installed.
    clusters.list(&Default::default()).await.map_err(|e| {
        error!("StorageCluster CRD is not available: {}", e);
        Error::Configuration("StorageCluster CRD not installed".into())
    })?;
    nodes.list(&Default::default()).await.map_err(|e| {
        error!("StorageNode CRD is not available: {}", e);
        Error::Configuration("StorageNode CRD not installed".into())
    })?;

    info!(
        "starting controllers for backend {}",
        state.backend.storage_type()
    );

    let cluster_controller = Controller::new(clusters, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile_cluster, cluster_error_policy, state.clone())
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!("reconciled cluster {:?}", obj),
                Err(e) => warn!("cluster reconcile error: {}", e),
            }
        });

    let node_controller = Controller::new(nodes, watcher::Config::default())
        .owns::<Deployment>(
            Api::all(state.client.clone()),
            watcher::Config::default(),
        )
        .shutdown_on_signal()
        .run(reconcile_node, node_error_policy, state.clone())
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!("reconciled node {:?}", obj),
                Err(e) => warn!("node reconcile error: {}", e),
            }
        });

    tokio::join!(cluster_controller, node_controller);
    Ok(())
}

// =============================================================================
// Cluster Reconciliation
// =============================================================================

async fn reconcile_cluster(
    cluster: Arc<StorageCluster>,
    ctx: Arc<OperatorState>,
) -> Result<Action> {
    let namespace = cluster.namespace().ok_or_else(|| Error::Precondition {
        resource: cluster.name_any(),
        reason: "resource has no namespace".into(),
    })?;
    let name = cluster.name_any();

    // Only the configured backend's resources are handled here.
    if cluster.spec.storage_type != ctx.backend.storage_type() {
        debug!(
            "ignoring cluster {}/{} of type {}",
            namespace, name, cluster.spec.storage_type
        );
        return Ok(Action::await_change());
    }

    let api: Api<StorageCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    let effective = match ctx.backend.add_cluster(&cluster).await? {
        Some(updated) => {
            api.patch(
                &name,
                &PatchParams::default(),
                &Patch::Merge(serde_json::json!({ "spec": updated.spec })),
            )
            .await?;
            updated
        }
        None => cluster.as_ref().clone(),
    };

    let phase = if effective.cluster_id().is_some() {
        ClusterPhase::Ready
    } else {
        ClusterPhase::Pending
    };
    let current_phase = effective.status.as_ref().map(|s| s.phase);
    if current_phase != Some(phase) {
        let status = StorageClusterStatus {
            phase,
            message: None,
        };
        api.patch_status(
            &name,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
    }

    ctx.metrics
        .reconciliations
        .with_label_values(&["storagecluster"])
        .inc();
    Ok(Action::requeue(RESYNC_PERIOD))
}

// =============================================================================
// Node Reconciliation
// =============================================================================

async fn reconcile_node(node: Arc<StorageNode>, ctx: Arc<OperatorState>) -> Result<Action> {
    let namespace = node.namespace().ok_or_else(|| Error::Precondition {
        resource: node.name_any(),
        reason: "resource has no namespace".into(),
    })?;
    let api: Api<StorageNode> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, NODE_FINALIZER, node, |event| async {
        match event {
            FinalizerEvent::Apply(node) => apply_node(node, &ctx, &namespace).await,
            FinalizerEvent::Cleanup(node) => cleanup_node(node, &ctx).await,
        }
    })
    .await
    .map_err(Error::from)
}

async fn apply_node(
    node: Arc<StorageNode>,
    ctx: &OperatorState,
    namespace: &str,
) -> Result<Action> {
    let name = node.name_any();

    let clusters: Api<StorageCluster> = Api::namespaced(ctx.client.clone(), namespace);
    let cluster = match clusters.get(&node.spec.cluster_ref).await {
        Ok(cluster) => cluster,
        Err(kube::Error::Api(e)) if e.code == 404 => {
            return Err(Error::ResourceNotFound {
                kind: "StorageCluster".into(),
                name: format!("{}/{}", namespace, node.spec.cluster_ref),
            });
        }
        Err(e) => return Err(Error::Kube(e)),
    };

    if cluster.spec.storage_type != ctx.backend.storage_type() {
        debug!(
            "ignoring node {}/{} of type {}",
            namespace, name, cluster.spec.storage_type
        );
        return Ok(Action::await_change());
    }

    // Keep the per-node daemon deployment in sync before touching the
    // provisioning service.
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
    let previous = deployments.get_opt(&name).await?;
    if let Some(mut desired) = ctx
        .backend
        .make_deployment(&cluster, &node, previous.as_ref())?
    {
        // Owned by the node so garbage collection removes it on delete.
        if let Some(owner) = node.controller_owner_ref(&()) {
            desired.metadata.owner_references = Some(vec![owner]);
        }
        match previous {
            Some(_) => {
                deployments
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&desired))
                    .await?;
            }
            None => {
                deployments.create(&PostParams::default(), &desired).await?;
                info!("created daemon deployment {}/{}", namespace, name);
            }
        }
    }

    if let Some(updated) = ctx.backend.add_node(&node).await? {
        persist_node(&ctx.client, namespace, &name, &updated).await?;
    }

    ctx.metrics
        .reconciliations
        .with_label_values(&["storagenode"])
        .inc();
    Ok(Action::requeue(RESYNC_PERIOD))
}

async fn cleanup_node(node: Arc<StorageNode>, ctx: &OperatorState) -> Result<Action> {
    let name = node.name_any();
    info!("cleaning up node {}", name);
    ctx.backend.delete_node(&node).await?;
    Ok(Action::await_change())
}

/// Write a backend-mutated node back: backend attributes into the spec,
/// readiness into the status subresource
async fn persist_node(
    client: &Client,
    namespace: &str,
    name: &str,
    updated: &StorageNode,
) -> Result<()> {
    let api: Api<StorageNode> = Api::namespaced(client.clone(), namespace);
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "spec": { "glusterfs": updated.spec.glusterfs } })),
    )
    .await?;
    if let Some(status) = &updated.status {
        api.patch_status(
            name,
            &PatchParams::default(),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
    }
    Ok(())
}

// =============================================================================
// Error Policy
// =============================================================================

fn requeue_for(error: &Error) -> Action {
    match error.action() {
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::RequeueWithBackoff => Action::requeue(RETRY_PERIOD),
        ErrorAction::NoRequeue => Action::await_change(),
    }
}

fn cluster_error_policy(
    cluster: Arc<StorageCluster>,
    error: &Error,
    ctx: Arc<OperatorState>,
) -> Action {
    warn!("cluster {} reconcile failed: {}", cluster.name_any(), error);
    ctx.metrics
        .reconcile_failures
        .with_label_values(&["storagecluster"])
        .inc();
    requeue_for(error)
}

fn node_error_policy(node: Arc<StorageNode>, error: &Error, ctx: Arc<OperatorState>) -> Action {
    warn!("node {} reconcile failed: {}", node.name_any(), error);
    ctx.metrics
        .reconcile_failures
        .with_label_values(&["storagenode"])
        .inc();
    requeue_for(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_errors_wait_for_change() {
        let err = Error::Precondition {
            resource: "default/node-0".into(),
            reason: "no storage network address configured".into(),
        };
        assert_eq!(requeue_for(&err), Action::await_change());

        let err = Error::Configuration("bad backend".into());
        assert_eq!(requeue_for(&err), Action::await_change());
    }

    #[test]
    fn test_transient_errors_requeue() {
        let err = Error::Internal("boom".into());
        assert_eq!(requeue_for(&err), Action::requeue(RETRY_PERIOD));

        let err = Error::BootstrapTimeout {
            namespace: "default".into(),
            name: "heketi".into(),
            waited: Duration::from_secs(300),
        };
        assert_eq!(
            requeue_for(&err),
            Action::requeue(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new();
        let metrics = OperatorMetrics::new(&registry).unwrap();
        metrics
            .reconciliations
            .with_label_values(&["storagecluster"])
            .inc();
        assert_eq!(registry.gather().len(), 1);
    }
}
