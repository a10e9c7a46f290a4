//! Workspace Custom Resource

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Workspace Custom Resource
///
/// A single declaration for an ML workspace. The operator fans it out into a
/// PostgreSQL cluster, an MLflow tracking server, a Prefect workflow server
/// with agent pools, and a Ray compute cluster.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "mlops.aigency.com",
    version = "v1alpha1",
    kind = "Workspace",
    plural = "workspaces",
    shortname = "ws",
    status = "WorkspaceStatus",
    namespaced,
    printcolumn = r#"{"name":"Ray","type":"string","jsonPath":".spec.compute.rayVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// Workflow server and agent pools
    #[serde(default)]
    pub workflows: WorkflowComponentSpec,

    /// MLflow experiment tracking component
    #[serde(default)]
    pub experiment_tracking: ExperimentTrackingComponentSpec,

    /// Database storage sizing
    #[serde(default)]
    pub storage: WorkspaceStorageSpec,

    /// Ray compute cluster
    #[serde(default)]
    pub compute: ComputeSpec,
}

/// Observed state of a Workspace (currently unused)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct WorkspaceStatus {}

/// Configuration for the workflow component
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowComponentSpec {
    /// The workflow server
    #[serde(default)]
    pub controller: WorkflowControllerSpec,

    /// Agent pools to deploy; names must be unique
    #[serde(default, rename = "agentPools")]
    pub agents: Vec<WorkflowAgentPoolSpec>,
}

/// Configuration for the workflow server
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowControllerSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub resources: ResourceRequirements,
}

/// Shape of a single workflow agent pool
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAgentPoolSpec {
    /// Name of the pool and the work queue it serves
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub resources: ResourceRequirements,
}

/// Configuration for the experiment tracking component
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentTrackingComponentSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub resources: ResourceRequirements,
}

/// Storage requirements for the workspace database
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStorageSpec {
    /// Size of the database volume
    #[serde(default, rename = "database", skip_serializing_if = "Option::is_none")]
    pub database_storage: Option<Quantity>,

    /// Size of the database backup volume
    #[serde(default, rename = "databaseBackup", skip_serializing_if = "Option::is_none")]
    pub database_backup_storage: Option<Quantity>,
}

/// Configuration for the Ray compute cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputeSpec {
    /// The cluster head
    #[serde(default)]
    pub controller: ComputeControllerSpec,

    /// Worker pools; replaced as a whole on the RayCluster when any of them changes
    #[serde(default, rename = "workers")]
    pub worker_pools: Vec<ComputeWorkerPoolSpec>,

    /// Ray version used for the cluster and the default images
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ray_version: String,
}

/// Configuration for the compute cluster head
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputeControllerSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub resources: ResourceRequirements,
}

/// A named group of Ray workers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputeWorkerPoolSpec {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub min_replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub max_replicas: Option<i32>,

    /// Requests are forced equal to limits; Ray rejects divergent values
    #[serde(default)]
    pub resources: ResourceRequirements,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_crd_identity() {
        let crd = Workspace::crd();
        assert_eq!(crd.spec.group, "mlops.aigency.com");
        assert_eq!(crd.spec.names.kind, "Workspace");
        assert_eq!(crd.spec.names.plural, "workspaces");
        assert_eq!(crd.spec.versions[0].name, "v1alpha1");
    }

    #[test]
    fn test_spec_json_field_names() {
        let spec: WorkspaceSpec = serde_json::from_value(serde_json::json!({
            "workflows": {
                "controller": { "replicas": 2 },
                "agentPools": [{ "name": "default", "replicas": 1 }]
            },
            "experimentTracking": { "image": "mlflow:custom" },
            "storage": { "database": "20Gi", "databaseBackup": "5Gi" },
            "compute": {
                "rayVersion": "2.3.0",
                "workers": [{ "name": "cpu", "minReplicas": 1, "maxReplicas": 3 }]
            }
        }))
        .unwrap();

        assert_eq!(spec.workflows.controller.replicas, Some(2));
        assert_eq!(spec.workflows.agents[0].name, "default");
        assert_eq!(spec.experiment_tracking.image, "mlflow:custom");
        assert_eq!(spec.storage.database_storage, Some(Quantity("20Gi".into())));
        assert_eq!(spec.storage.database_backup_storage, Some(Quantity("5Gi".into())));
        assert_eq!(spec.compute.worker_pools[0].max_replicas, Some(3));
    }

    #[test]
    fn test_empty_spec_deserializes() {
        let spec: WorkspaceSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec, WorkspaceSpec::default());
    }
}
