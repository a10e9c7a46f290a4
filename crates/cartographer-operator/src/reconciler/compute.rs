//! Compute subsystem: the Ray cluster
//!
//! The head group and the worker groups live inside a single RayCluster. The
//! worker group list is compared and replaced as one unit, which is how pools
//! are added and removed.

use super::workload::{self, first_container, first_container_mut};
use super::Scope;
use crate::crd::{ComputeWorkerPoolSpec, HeadGroupSpec, RayCluster, RayClusterSpec, WorkerGroupSpec};
use crate::defaults::force_requests_to_limits;
use crate::error::StepError;
use crate::naming::{self, COMPONENT_RAY_CONTROLLER, COMPONENT_RAY_WORKER};
use crate::store::ObjectStore;
use cartographer_common::quantity::requirements_equal;
use k8s_openapi::api::core::v1::{Container, ExecAction, Lifecycle, LifecycleHandler};
use std::collections::BTreeMap;
use tracing::{debug, info};

const HEAD_CONTAINER: &str = "ray-head";
const WORKER_CONTAINER: &str = "ray-worker";
const WORKER_INIT_CONTAINER: &str = "ray-worker-init";
const WORKER_INIT_IMAGE: &str = "busybox:1.28";
const WORKER_INIT_SCRIPT: &str = "until nslookup $RAY_IP.$(cat /var/run/secrets/kubernetes.io/serviceaccount/namespace).svc.cluster.local; do echo waiting for K8s Service $RAY_IP; sleep 2; done";

pub async fn ensure_compute_cluster<S: ObjectStore>(store: &S, scope: &Scope) -> Result<(), StepError> {
    let name = naming::cluster_name(&scope.name);

    let Some(mut existing) = store.get::<RayCluster>(&scope.namespace, &name).await? else {
        let cluster = compute_cluster(scope, &name);
        let groups = cluster.spec.worker_group_specs.len();
        store.create(&scope.namespace, &cluster).await?;
        info!(cluster = %name, worker_groups = groups, "created compute cluster");
        return Ok(());
    };

    let head = head_group(scope);
    let workers = worker_groups(scope);
    let drift = ComputeDrift::compare(&existing.spec, &head, &workers, &name)?;
    if !drift.changed() {
        debug!(cluster = %name, "compute cluster up to date");
        return Ok(());
    }

    let current = &mut existing.spec;
    if drift.head_replicas {
        current.head_group_spec.replicas = head.replicas;
    }
    if drift.head_image || drift.head_resources {
        let wanted = first_container(&head.template, &name)?;
        let container = first_container_mut(&mut current.head_group_spec.template, &name)?;
        if drift.head_image {
            container.image = wanted.image.clone();
        }
        if drift.head_resources {
            container.resources = wanted.resources.clone();
        }
    }
    if drift.worker_groups {
        current.worker_group_specs = workers;
    }

    store.update(&scope.namespace, &existing).await?;
    info!(cluster = %name, changed = ?drift.fields(), "updated compute cluster");
    Ok(())
}

/// Tracked differences between a live RayCluster and the workspace spec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComputeDrift {
    pub head_replicas: bool,
    pub head_image: bool,
    pub head_resources: bool,
    /// Any member of the worker group list differs
    pub worker_groups: bool,
}

impl ComputeDrift {
    pub fn compare(
        existing: &RayClusterSpec,
        head: &HeadGroupSpec,
        workers: &[WorkerGroupSpec],
        name: &str,
    ) -> Result<Self, StepError> {
        let current_head = first_container(&existing.head_group_spec.template, name)?;
        let wanted_head = first_container(&head.template, name)?;

        let worker_groups = existing.worker_group_specs.len() != workers.len()
            || existing
                .worker_group_specs
                .iter()
                .zip(workers)
                .try_fold(false, |drifted, (current, wanted)| {
                    Ok::<_, StepError>(drifted || worker_group_differs(current, wanted)?)
                })?;

        Ok(Self {
            head_replicas: existing.head_group_spec.replicas != head.replicas,
            head_image: current_head.image != wanted_head.image,
            head_resources: !requirements_equal(
                current_head.resources.as_ref(),
                wanted_head.resources.as_ref(),
            ),
            worker_groups,
        })
    }

    pub fn changed(&self) -> bool {
        self.head_replicas || self.head_image || self.head_resources || self.worker_groups
    }

    pub fn fields(&self) -> Vec<&'static str> {
        [
            (self.head_replicas, "head.replicas"),
            (self.head_image, "head.image"),
            (self.head_resources, "head.resources"),
            (self.worker_groups, "workerGroups"),
        ]
        .into_iter()
        .filter_map(|(changed, field)| changed.then_some(field))
        .collect()
    }
}

fn worker_group_differs(current: &WorkerGroupSpec, wanted: &WorkerGroupSpec) -> Result<bool, StepError> {
    let current_container = first_container(&current.template, &current.group_name)?;
    let wanted_container = first_container(&wanted.template, &wanted.group_name)?;

    Ok(current.group_name != wanted.group_name
        || current.min_replicas != wanted.min_replicas
        || current.max_replicas != wanted.max_replicas
        || current_container.image != wanted_container.image
        || !requirements_equal(
            current_container.resources.as_ref(),
            wanted_container.resources.as_ref(),
        ))
}

fn ray_stop_hook() -> Lifecycle {
    Lifecycle {
        pre_stop: Some(LifecycleHandler {
            exec: Some(ExecAction {
                command: Some(vec!["/bin/sh".into(), "-c".into(), "ray stop".into()]),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn compute_cluster(scope: &Scope, name: &str) -> RayCluster {
    let spec = RayClusterSpec {
        ray_version: scope.spec.compute.ray_version.clone(),
        head_group_spec: head_group(scope),
        worker_group_specs: worker_groups(scope),
        extra: BTreeMap::new(),
    };
    let mut cluster = RayCluster::new(name, spec);
    cluster.metadata = scope.metadata(
        name,
        naming::component_labels(&scope.name, COMPONENT_RAY_CONTROLLER),
    );
    cluster
}

fn head_group(scope: &Scope) -> HeadGroupSpec {
    let controller = &scope.spec.compute.controller;

    let mut container = workload::container(HEAD_CONTAINER, &controller.image, &controller.resources);
    container.ports = Some(vec![
        workload::container_port("tcp-gcs", 6379),
        workload::container_port("http-dashboard", 8265),
        workload::container_port("tcp-client", 10001),
    ]);
    container.lifecycle = Some(ray_stop_hook());

    HeadGroupSpec {
        enable_ingress: Some(false),
        replicas: controller.replicas,
        ray_start_params: BTreeMap::from([
            ("dashboard-host".to_string(), "0.0.0.0".to_string()),
            ("block".to_string(), "true".to_string()),
        ]),
        template: workload::pod_template(
            naming::component_labels(&scope.name, COMPONENT_RAY_CONTROLLER),
            vec![container],
        ),
        extra: BTreeMap::new(),
    }
}

fn worker_groups(scope: &Scope) -> Vec<WorkerGroupSpec> {
    scope
        .spec
        .compute
        .worker_pools
        .iter()
        .map(|pool| worker_group(scope, pool))
        .collect()
}

fn worker_group(scope: &Scope, pool: &ComputeWorkerPoolSpec) -> WorkerGroupSpec {
    let mut resources = pool.resources.clone();
    force_requests_to_limits(&mut resources);

    let mut container = workload::container(WORKER_CONTAINER, &pool.image, &resources);
    container.lifecycle = Some(ray_stop_hook());
    container.env = Some(vec![workload::env(
        "MLFLOW_TRACKING_URI",
        naming::tracking_uri(&scope.name),
    )]);

    let init = Container {
        name: WORKER_INIT_CONTAINER.to_string(),
        image: Some(WORKER_INIT_IMAGE.to_string()),
        command: Some(vec!["sh".into(), "-c".into(), WORKER_INIT_SCRIPT.into()]),
        ..Default::default()
    };

    let mut template = workload::pod_template(
        naming::pool_labels(&scope.name, COMPONENT_RAY_WORKER, &pool.name),
        vec![container],
    );
    if let Some(spec) = template.spec.as_mut() {
        spec.init_containers = Some(vec![init]);
    }

    WorkerGroupSpec {
        group_name: pool.name.clone(),
        replicas: pool.min_replicas,
        min_replicas: pool.min_replicas,
        max_replicas: pool.max_replicas,
        ray_start_params: BTreeMap::from([("block".to_string(), "true".to_string())]),
        template,
        extra: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::tests::{scope_for, workspace};
    use crate::store::memory::{MemoryStore, Op};
    use cartographer_common::quantity::cpu_memory;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use serde_json::Value;

    fn pool(name: &str) -> ComputeWorkerPoolSpec {
        ComputeWorkerPoolSpec {
            name: name.into(),
            ..Default::default()
        }
    }

    fn group_names(cluster: &RayCluster) -> Vec<&str> {
        cluster
            .spec
            .worker_group_specs
            .iter()
            .map(|g| g.group_name.as_str())
            .collect()
    }

    #[tokio::test]
    async fn test_demo_creates_head_only_cluster() {
        let mut ws = workspace("demo");
        ws.spec.compute.ray_version = "2.3.0".into();
        let store = MemoryStore::new();

        ensure_compute_cluster(&store, &scope_for(&ws)).await.unwrap();

        let cluster: RayCluster = store.object("default", "demo").unwrap();
        assert!(cluster.spec.worker_group_specs.is_empty());
        assert_eq!(cluster.spec.ray_version, "2.3.0");
        assert_eq!(cluster.spec.head_group_spec.replicas, Some(1));
        assert_eq!(cluster.spec.head_group_spec.ray_start_params["dashboard-host"], "0.0.0.0");

        let head = &cluster.spec.head_group_spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(head.name, "ray-head");
        assert_eq!(head.image.as_deref(), Some("rayproject/ray:2.3.0"));
        let ports: Vec<_> = head.ports.as_ref().unwrap().iter().map(|p| p.container_port).collect();
        assert_eq!(ports, [6379, 8265, 10001]);
        assert!(head.lifecycle.as_ref().unwrap().pre_stop.is_some());
    }

    #[tokio::test]
    async fn test_worker_groups_match_pools() {
        let mut ws = workspace("demo");
        ws.spec.compute.worker_pools = vec![pool("cpu"), pool("gpu")];
        ws.spec.compute.worker_pools[1].min_replicas = Some(2);
        ws.spec.compute.worker_pools[1].max_replicas = Some(4);
        let store = MemoryStore::new();

        ensure_compute_cluster(&store, &scope_for(&ws)).await.unwrap();

        let cluster: RayCluster = store.object("default", "demo").unwrap();
        assert_eq!(group_names(&cluster), ["cpu", "gpu"]);
        let gpu = &cluster.spec.worker_group_specs[1];
        assert_eq!(gpu.replicas, Some(2));
        assert_eq!(gpu.min_replicas, Some(2));
        assert_eq!(gpu.max_replicas, Some(4));

        let pod = gpu.template.spec.as_ref().unwrap();
        assert_eq!(pod.init_containers.as_ref().unwrap()[0].name, "ray-worker-init");
        let worker = &pod.containers[0];
        assert_eq!(worker.env.as_ref().unwrap()[0].value.as_deref(), Some("http://demo-mlflow-server:5000"));
        let resources = worker.resources.as_ref().unwrap();
        assert_eq!(resources.requests, resources.limits);
    }

    #[tokio::test]
    async fn test_roster_is_replaced_wholesale() {
        let mut ws = workspace("demo");
        ws.spec.compute.worker_pools = vec![pool("a"), pool("b")];
        let store = MemoryStore::new();
        ensure_compute_cluster(&store, &scope_for(&ws)).await.unwrap();
        store.clear_writes();

        ws.spec.compute.worker_pools = vec![pool("a"), pool("c")];
        ensure_compute_cluster(&store, &scope_for(&ws)).await.unwrap();

        assert_eq!(store.writes_of(Op::Update).len(), 1);
        let cluster: RayCluster = store.object("default", "demo").unwrap();
        assert_eq!(group_names(&cluster), ["a", "c"]);
    }

    #[tokio::test]
    async fn test_converged_cluster_is_not_written() {
        let mut ws = workspace("demo");
        ws.spec.compute.worker_pools = vec![pool("a")];
        let store = MemoryStore::new();
        ensure_compute_cluster(&store, &scope_for(&ws)).await.unwrap();
        store.clear_writes();

        ensure_compute_cluster(&store, &scope_for(&ws)).await.unwrap();
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_head_update_keeps_unmodelled_fields() {
        let mut ws = workspace("demo");
        let store = MemoryStore::new();
        ensure_compute_cluster(&store, &scope_for(&ws)).await.unwrap();

        let mut cluster: RayCluster = store.object("default", "demo").unwrap();
        cluster.spec.extra.insert("enableInTreeAutoscaling".into(), Value::Bool(true));
        store.insert("default", &cluster);
        store.clear_writes();

        ws.spec.compute.controller.resources = ResourceRequirements {
            requests: Some(cpu_memory("2", "4Gi")),
            limits: Some(cpu_memory("2", "4Gi")),
            ..Default::default()
        };
        ensure_compute_cluster(&store, &scope_for(&ws)).await.unwrap();

        assert_eq!(store.writes_of(Op::Update).len(), 1);
        let cluster: RayCluster = store.object("default", "demo").unwrap();
        assert_eq!(cluster.spec.extra["enableInTreeAutoscaling"], Value::Bool(true));
        let head = &cluster.spec.head_group_spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(head.resources.as_ref().unwrap().limits, Some(cpu_memory("2", "4Gi")));
    }

    #[test]
    fn test_drift_fields_name_changes() {
        let drift = ComputeDrift {
            head_image: true,
            worker_groups: true,
            ..Default::default()
        };
        assert_eq!(drift.fields(), ["head.image", "workerGroups"]);
    }
}
