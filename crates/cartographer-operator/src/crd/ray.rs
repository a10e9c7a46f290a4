//! KubeRay RayCluster (ray.io/v1alpha1)
//!
//! The head group and worker groups are embedded in the cluster resource.
//! Fields the operator does not model are kept in `extra` so read-modify-write
//! updates do not strip settings applied by other tooling.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "ray.io",
    version = "v1alpha1",
    kind = "RayCluster",
    plural = "rayclusters",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RayClusterSpec {
    #[serde(default)]
    pub ray_version: String,
    pub head_group_spec: HeadGroupSpec,
    #[serde(default)]
    pub worker_group_specs: Vec<WorkerGroupSpec>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeadGroupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_ingress: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,
    pub template: PodTemplateSpec,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGroupSpec {
    pub group_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,
    pub template: PodTemplateSpec,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}
