//! Child resource names and labels
//!
//! Every child is named from the workspace name plus a fixed suffix, so a
//! lookup by name is enough to decide between create and update.

use std::collections::BTreeMap;

/// Workspace label on the storage and compute custom resources
pub const LABEL_WORKSPACE: &str = "mlops.aigency.com/workspace";
/// Workspace label on Deployments, StatefulSets and Services. Their
/// selectors are immutable, so the key must not change between releases.
pub const LABEL_ENVIRONMENT: &str = "mlops.aigency.com/environment";
pub const LABEL_COMPONENT: &str = "mlops.aigency.com/component";
pub const LABEL_POOL: &str = "mlops.aigency.com/pool";

pub const COMPONENT_STORAGE: &str = "postgres-cluster";
pub const COMPONENT_EXPERIMENT_TRACKING: &str = "experiment-tracking";
pub const COMPONENT_WORKFLOW_SERVER: &str = "workflow-server";
pub const COMPONENT_WORKFLOW_AGENT: &str = "workflow-agent";
pub const COMPONENT_RAY_CONTROLLER: &str = "ray-controller";
pub const COMPONENT_RAY_WORKER: &str = "ray-worker";

pub const TRACKING_PORT: i32 = 5000;
pub const WORKFLOW_PORT: i32 = 4200;

/// The storage cluster and the compute cluster share the workspace name
pub fn cluster_name(workspace: &str) -> String {
    workspace.to_string()
}

pub fn tracking_server_name(workspace: &str) -> String {
    format!("{workspace}-mlflow-server")
}

pub fn workflow_server_name(workspace: &str) -> String {
    format!("{workspace}-orion-server")
}

pub fn agent_pool_name(workspace: &str, pool: &str) -> String {
    format!("{workspace}-agent-{pool}")
}

/// Secret the storage operator generates for a database user
pub fn credentials_secret_name(workspace: &str, user: &str) -> String {
    format!("{}-pguser-{user}", cluster_name(workspace))
}

pub fn tracking_uri(workspace: &str) -> String {
    format!("http://{}:{TRACKING_PORT}", tracking_server_name(workspace))
}

pub fn workflow_api_url(workspace: &str) -> String {
    format!("http://{}:{WORKFLOW_PORT}/api", workflow_server_name(workspace))
}

pub fn component_labels(workspace: &str, component: &str) -> BTreeMap<String, String> {
    labels(LABEL_WORKSPACE, workspace, component)
}

pub fn pool_labels(workspace: &str, component: &str, pool: &str) -> BTreeMap<String, String> {
    let mut labels = component_labels(workspace, component);
    labels.insert(LABEL_POOL.to_string(), pool.to_string());
    labels
}

/// Labels and selector for a workload (Deployment, StatefulSet, Service)
pub fn workload_labels(workspace: &str, component: &str) -> BTreeMap<String, String> {
    labels(LABEL_ENVIRONMENT, workspace, component)
}

pub fn agent_pool_labels(workspace: &str, pool: &str) -> BTreeMap<String, String> {
    let mut labels = workload_labels(workspace, COMPONENT_WORKFLOW_AGENT);
    labels.insert(LABEL_POOL.to_string(), pool.to_string());
    labels
}

/// Label selector matching every agent pool of one workspace
pub fn agent_pool_selector(workspace: &str) -> String {
    format!("{LABEL_ENVIRONMENT}={workspace},{LABEL_COMPONENT}={COMPONENT_WORKFLOW_AGENT}")
}

fn labels(key: &str, workspace: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (key.to_string(), workspace.to_string()),
        (LABEL_COMPONENT.to_string(), component.to_string()),
    ])
}
