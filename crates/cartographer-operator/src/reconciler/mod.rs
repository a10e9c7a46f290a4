//! Kubernetes reconciliation logic for Workspace resources
//!
//! Each reconcile re-applies defaults and then runs the subsystem steps in a
//! fixed order, stopping at the first failure. The controller runtime retries
//! failed workspaces according to [`error_policy`].

mod compute;
mod storage;
mod tracking;
mod workflow;
mod workload;

use crate::crd::{PostgresCluster, RayCluster, Workspace, WorkspaceSpec};
use crate::defaults::Defaulter;
use crate::error::{ReconcileError, StepError, Subsystem};
use crate::store::{KubeStore, ObjectStore};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    Client, Resource, ResourceExt,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Subsystems in reconcile order. Storage comes first because tracking and
/// workflows read the credentials it generates.
pub const STEPS: [Subsystem; 4] = [
    Subsystem::Storage,
    Subsystem::ExperimentTracking,
    Subsystem::Workflows,
    Subsystem::Compute,
];

/// Everything a subsystem step needs to know about the workspace
pub struct Scope {
    /// Defaulted copy of the workspace spec
    pub spec: WorkspaceSpec,
    pub name: String,
    pub namespace: String,
    pub prune_agent_pools: bool,
    owner: OwnerReference,
}

impl Scope {
    pub fn new(workspace: &Workspace, spec: WorkspaceSpec, prune_agent_pools: bool) -> Result<Self, StepError> {
        let name = workspace
            .metadata
            .name
            .clone()
            .ok_or_else(|| StepError::invariant("workspace has no name"))?;
        let namespace = workspace
            .namespace()
            .ok_or_else(|| StepError::invariant("workspace has no namespace"))?;
        let owner = workspace
            .controller_owner_ref(&())
            .ok_or_else(|| StepError::invariant("workspace has no uid"))?;

        Ok(Self {
            spec,
            name,
            namespace,
            prune_agent_pools,
            owner,
        })
    }

    /// Metadata for a child owned by this workspace
    pub fn metadata(&self, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }

    /// Whether `meta` carries an owner reference to this workspace
    pub fn owns(&self, meta: &ObjectMeta) -> bool {
        meta.owner_references
            .iter()
            .flatten()
            .any(|owner| owner.uid == self.owner.uid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Delete agent pool StatefulSets whose pool was removed from the spec
    pub prune_agent_pools: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            prune_agent_pools: true,
        }
    }
}

/// Runs the subsystem steps for one workspace against an [`ObjectStore`]
pub struct WorkspaceReconciler<S> {
    store: S,
    defaulter: Defaulter,
    options: ReconcileOptions,
}

impl<S: ObjectStore> WorkspaceReconciler<S> {
    pub fn new(store: S, defaulter: Defaulter, options: ReconcileOptions) -> Self {
        Self {
            store,
            defaulter,
            options,
        }
    }

    pub async fn reconcile(&self, workspace: &Workspace) -> Result<(), ReconcileError> {
        let id = format!(
            "{}/{}",
            workspace.namespace().unwrap_or_default(),
            workspace.name_any()
        );

        if workspace.meta().deletion_timestamp.is_some() {
            debug!(workspace = %id, "workspace is being deleted; children are garbage collected");
            return Ok(());
        }

        let spec = self.defaulter.apply(&workspace.spec);
        let scope = Scope::new(workspace, spec, self.options.prune_agent_pools)
            .map_err(|e| ReconcileError::workspace(&id, e))?;

        for step in STEPS {
            debug!(workspace = %id, subsystem = %step, "reconciling subsystem");
            let result = match step {
                Subsystem::Storage => storage::ensure_storage_cluster(&self.store, &scope).await,
                Subsystem::ExperimentTracking => tracking::ensure_experiment_tracking(&self.store, &scope).await,
                Subsystem::Workflows => workflow::ensure_workflows(&self.store, &scope).await,
                Subsystem::Compute => compute::ensure_compute_cluster(&self.store, &scope).await,
            };
            if let Err(source) = result {
                warn!(workspace = %id, subsystem = %step, error = %source, "subsystem reconcile failed");
                return Err(ReconcileError::subsystem(&id, step, source));
            }
        }

        Ok(())
    }
}

/// Controller requeue intervals
#[derive(Debug, Clone, Copy)]
pub struct RequeueSettings {
    /// Periodic resync after a successful reconcile
    pub resync: Duration,
    /// Back-off after a transient failure
    pub transient: Duration,
    /// Back-off after a failure that will not clear on its own
    pub terminal: Duration,
}

impl Default for RequeueSettings {
    fn default() -> Self {
        Self {
            resync: Duration::from_secs(300),
            transient: Duration::from_secs(5),
            terminal: Duration::from_secs(300),
        }
    }
}

/// Reconciler context
pub struct Context {
    pub reconciler: WorkspaceReconciler<KubeStore>,
    pub requeue: RequeueSettings,
}

/// Reconcile a Workspace resource
#[instrument(
    skip(workspace, ctx),
    fields(workspace = %workspace.name_any(), namespace = %workspace.namespace().unwrap_or_default())
)]
pub async fn reconcile(
    workspace: Arc<Workspace>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    ctx.reconciler.reconcile(&workspace).await?;
    debug!("workspace reconciled");
    Ok(Action::requeue(ctx.requeue.resync))
}

/// Error policy for the controller
pub fn error_policy(workspace: Arc<Workspace>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    let delay = if error.is_retryable() {
        ctx.requeue.transient
    } else {
        ctx.requeue.terminal
    };
    error!(
        workspace = %workspace.name_any(),
        retryable = error.is_retryable(),
        requeue_secs = delay.as_secs(),
        "reconcile failed: {}",
        error
    );
    Action::requeue(delay)
}

/// Watch workspaces and their children until the stream ends
pub async fn run(client: Client, namespace: Option<&str>, ctx: Arc<Context>) {
    fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match namespace {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        }
    }

    let config = watcher::Config::default();
    info!(namespace = namespace.unwrap_or("<all>"), "starting workspace controller");

    Controller::new(api::<Workspace>(&client, namespace), config.clone())
        .owns(api::<PostgresCluster>(&client, namespace), config.clone())
        .owns(api::<Deployment>(&client, namespace), config.clone())
        .owns(api::<Service>(&client, namespace), config.clone())
        .owns(api::<StatefulSet>(&client, namespace), config.clone())
        .owns(api::<RayCluster>(&client, namespace), config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(workspace = %obj.name, "reconciled"),
                Err(e) => warn!("reconcile error: {}", e),
            }
        })
        .await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::memory::{MemoryStore, Op};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    pub fn workspace(name: &str) -> Workspace {
        let mut ws = Workspace::new(name, WorkspaceSpec::default());
        ws.metadata.namespace = Some("default".into());
        ws.metadata.uid = Some(format!("uid-{name}"));
        ws
    }

    pub fn scope_for(workspace: &Workspace) -> Scope {
        let spec = Defaulter::default().apply(&workspace.spec);
        Scope::new(workspace, spec, true).unwrap()
    }

    fn reconciler(store: MemoryStore) -> WorkspaceReconciler<MemoryStore> {
        WorkspaceReconciler::new(store, Defaulter::default(), ReconcileOptions::default())
    }

    fn full_workspace() -> Workspace {
        let mut ws = workspace("demo");
        ws.spec.workflows.agents = vec![
            crate::crd::WorkflowAgentPoolSpec {
                name: "a".into(),
                ..Default::default()
            },
            crate::crd::WorkflowAgentPoolSpec {
                name: "b".into(),
                ..Default::default()
            },
        ];
        ws.spec.compute.worker_pools = vec![crate::crd::ComputeWorkerPoolSpec {
            name: "cpu".into(),
            ..Default::default()
        }];
        ws
    }

    #[tokio::test]
    async fn test_create_path_creates_every_child() {
        let r = reconciler(MemoryStore::new());
        r.reconcile(&full_workspace()).await.unwrap();

        let store = &r.store;
        assert_eq!(store.count::<PostgresCluster>(), 1);
        assert_eq!(store.count::<Deployment>(), 2);
        assert_eq!(store.count::<Service>(), 2);
        assert_eq!(store.count::<StatefulSet>(), 2);
        assert_eq!(store.count::<RayCluster>(), 1);
        assert!(store.writes_of(Op::Update).is_empty());

        let cluster: RayCluster = store.object("default", "demo").unwrap();
        assert_eq!(cluster.spec.worker_group_specs.len(), 1);
        assert_eq!(cluster.spec.worker_group_specs[0].group_name, "cpu");
    }

    #[tokio::test]
    async fn test_second_reconcile_is_noop() {
        let r = reconciler(MemoryStore::new());
        let ws = full_workspace();
        r.reconcile(&ws).await.unwrap();
        r.store.clear_writes();

        r.reconcile(&ws).await.unwrap();
        assert!(r.store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_tracking_replica_diff() {
        let r = reconciler(MemoryStore::new());
        let mut ws = full_workspace();
        ws.spec.experiment_tracking.replicas = Some(1);
        r.reconcile(&ws).await.unwrap();
        r.store.clear_writes();

        ws.spec.experiment_tracking.replicas = Some(2);
        r.reconcile(&ws).await.unwrap();

        let writes = r.store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].op, Op::Update);
        assert_eq!(writes[0].name, "demo-mlflow-server");
    }

    #[tokio::test]
    async fn test_demo_scenario() {
        let r = reconciler(MemoryStore::new());
        let mut ws = workspace("demo");
        ws.spec.compute.ray_version = "2.3.0".into();
        ws.spec.storage.database_storage = Some(Quantity("0".into()));
        r.reconcile(&ws).await.unwrap();

        let cluster: RayCluster = r.store.object("default", "demo").unwrap();
        assert!(cluster.spec.worker_group_specs.is_empty());
        let head = &cluster.spec.head_group_spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(head.image.as_deref(), Some("rayproject/ray:2.3.0"));

        let db: PostgresCluster = r.store.object("default", "demo").unwrap();
        let size = &db.spec.instances[0].data_volume_claim_spec.resources.as_ref().unwrap().requests;
        assert_eq!(size.as_ref().unwrap()["storage"].0, "10Gi");
    }

    #[tokio::test]
    async fn test_transient_failure_stops_sequence() {
        let store = MemoryStore::new();
        store.fail_next::<Deployment>(Op::Create, 503);
        let r = reconciler(store);

        let err = r.reconcile(&full_workspace()).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.failed_subsystem(), Some(Subsystem::ExperimentTracking));
        assert_eq!(r.store.count::<PostgresCluster>(), 1);
        assert_eq!(r.store.count::<StatefulSet>(), 0);
        assert_eq!(r.store.count::<RayCluster>(), 0);
    }

    #[tokio::test]
    async fn test_failed_lookup_stops_sequence() {
        let store = MemoryStore::new();
        store.fail_next::<Deployment>(Op::Get, 503);
        let r = reconciler(store);

        let err = r.reconcile(&full_workspace()).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(err.failed_subsystem(), Some(Subsystem::ExperimentTracking));
        let writes = r.store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].kind, "PostgresCluster");
        assert_eq!(r.store.count::<Deployment>(), 0);
        assert_eq!(r.store.count::<StatefulSet>(), 0);
        assert_eq!(r.store.count::<RayCluster>(), 0);
    }

    #[tokio::test]
    async fn test_forbidden_lookup_is_terminal() {
        let store = MemoryStore::new();
        store.fail_next::<Deployment>(Op::Get, 403);
        let r = reconciler(store);

        let err = r.reconcile(&full_workspace()).await.unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(err.failed_subsystem(), Some(Subsystem::ExperimentTracking));
        assert_eq!(r.store.count::<StatefulSet>(), 0);
        assert_eq!(r.store.count::<RayCluster>(), 0);
    }

    #[tokio::test]
    async fn test_rejection_is_terminal() {
        let store = MemoryStore::new();
        store.fail_next::<RayCluster>(Op::Create, 422);
        let r = reconciler(store);

        let err = r.reconcile(&full_workspace()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.failed_subsystem(), Some(Subsystem::Compute));
    }

    #[tokio::test]
    async fn test_workspace_without_uid_is_invariant_error() {
        let r = reconciler(MemoryStore::new());
        let mut ws = workspace("demo");
        ws.metadata.uid = None;

        let err = r.reconcile(&ws).await.unwrap_err();
        assert_eq!(err.failed_subsystem(), None);
        assert!(r.store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_workspace_is_skipped() {
        let r = reconciler(MemoryStore::new());
        let mut ws = workspace("demo");
        ws.metadata.deletion_timestamp = Some(Time(Default::default()));

        r.reconcile(&ws).await.unwrap();
        assert!(r.store.writes().is_empty());
    }
}
