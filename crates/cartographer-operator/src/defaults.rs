//! Workspace defaulting
//!
//! Fills unset fields of a [`WorkspaceSpec`] with fixed defaults. Runs in the
//! mutating admission webhook so defaults are persisted with the object, and
//! again at the start of every reconcile for objects that bypassed admission.
//!
//! A field counts as unset when it is empty: an empty string, an absent or
//! zero replica count, an absent or empty resource list, or a zero quantity.
//! Set fields are never touched, with one exception: compute worker requests
//! are always overwritten with the limits because Ray rejects pods whose
//! requests and limits diverge.

use crate::crd::{
    ComputeSpec, ExperimentTrackingComponentSpec, WorkflowComponentSpec, WorkspaceSpec,
    WorkspaceStorageSpec,
};
use cartographer_common::quantity::{cpu_memory, is_zero, resource_lists_equal, ResourceList};
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Ray version assumed when the workspace does not declare one
pub const DEFAULT_RAY_VERSION: &str = "2.3.0";

/// Database and backup volume size when none is declared
pub const DEFAULT_STORAGE_SIZE: &str = "10Gi";

/// Images used when a component does not declare one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultImages {
    /// Repository for Ray images; tagged with the workspace's ray version
    pub compute_base: String,
    pub experiment_tracking: String,
    pub workflow_controller: String,
    pub workflow_agent: String,
}

impl Default for DefaultImages {
    fn default() -> Self {
        Self {
            compute_base: "rayproject/ray".to_string(),
            experiment_tracking: "willemmeints/experiment-tracking:latest".to_string(),
            workflow_controller: "willemmeints/workflow-controller:latest".to_string(),
            workflow_agent: "willemmeints/workflow-agent:latest".to_string(),
        }
    }
}

/// Applies defaults to workspace specifications
#[derive(Debug, Clone, Default)]
pub struct Defaulter {
    images: DefaultImages,
}

impl Defaulter {
    pub fn new(images: DefaultImages) -> Self {
        Self { images }
    }

    pub fn images(&self) -> &DefaultImages {
        &self.images
    }

    /// Return a fully specified copy of `spec`.
    ///
    /// Deterministic and idempotent: applying it to its own output is a no-op.
    pub fn apply(&self, spec: &WorkspaceSpec) -> WorkspaceSpec {
        let mut spec = spec.clone();

        self.default_workflows(&mut spec.workflows);
        self.default_experiment_tracking(&mut spec.experiment_tracking);
        default_storage(&mut spec.storage);
        self.default_compute(&mut spec.compute);

        spec
    }

    fn default_compute(&self, compute: &mut ComputeSpec) {
        default_string(&mut compute.ray_version, DEFAULT_RAY_VERSION);
        let image = format!("{}:{}", self.images.compute_base, compute.ray_version);

        let controller = &mut compute.controller;
        default_string(&mut controller.image, &image);
        default_replicas(&mut controller.replicas);
        default_resources(
            &mut controller.resources,
            cpu_memory("500m", "500Mi"),
            cpu_memory("1", "1Gi"),
        );

        for pool in &mut compute.worker_pools {
            default_string(&mut pool.image, &image);
            default_replicas(&mut pool.min_replicas);
            default_replicas(&mut pool.max_replicas);
            default_resources(
                &mut pool.resources,
                cpu_memory("1", "4Gi"),
                cpu_memory("1", "4Gi"),
            );
            force_requests_to_limits(&mut pool.resources);
        }
    }

    fn default_workflows(&self, workflows: &mut WorkflowComponentSpec) {
        let controller = &mut workflows.controller;
        default_string(&mut controller.image, &self.images.workflow_controller);
        default_replicas(&mut controller.replicas);
        default_resources(
            &mut controller.resources,
            cpu_memory("100m", "200Mi"),
            cpu_memory("1", "1Gi"),
        );

        for agent in &mut workflows.agents {
            default_string(&mut agent.image, &self.images.workflow_agent);
            default_replicas(&mut agent.replicas);
            default_resources(
                &mut agent.resources,
                cpu_memory("500m", "2Gi"),
                cpu_memory("2", "16Gi"),
            );
        }
    }

    fn default_experiment_tracking(&self, tracking: &mut ExperimentTrackingComponentSpec) {
        default_string(&mut tracking.image, &self.images.experiment_tracking);
        default_replicas(&mut tracking.replicas);
        default_resources(
            &mut tracking.resources,
            cpu_memory("500m", "512Mi"),
            cpu_memory("1", "1Gi"),
        );
    }
}

fn default_storage(storage: &mut WorkspaceStorageSpec) {
    for quantity in [
        &mut storage.database_storage,
        &mut storage.database_backup_storage,
    ] {
        if is_zero(quantity.as_ref()) {
            *quantity = Some(Quantity(DEFAULT_STORAGE_SIZE.to_string()));
        }
    }
}

fn default_string(value: &mut String, default: &str) {
    if value.is_empty() {
        *value = default.to_string();
    }
}

fn default_replicas(replicas: &mut Option<i32>) {
    if matches!(replicas, None | Some(0)) {
        *replicas = Some(1);
    }
}

fn default_resource_list(list: &mut Option<ResourceList>, default: ResourceList) {
    if list.as_ref().map_or(true, |l| l.is_empty()) {
        *list = Some(default);
    }
}

fn default_resources(
    resources: &mut ResourceRequirements,
    requests: ResourceList,
    limits: ResourceList,
) {
    default_resource_list(&mut resources.requests, requests);
    default_resource_list(&mut resources.limits, limits);
}

/// Copy limits over requests whenever the two differ by value.
pub fn force_requests_to_limits(resources: &mut ResourceRequirements) {
    if !resource_lists_equal(resources.requests.as_ref(), resources.limits.as_ref()) {
        resources.requests = resources.limits.clone();
    }
}
