//! Workflow subsystem: the Prefect Orion server and one StatefulSet per agent pool

use super::workload::{self, ensure_deployment, ensure_service, first_container, first_container_mut};
use super::Scope;
use crate::crd::WorkflowAgentPoolSpec;
use crate::error::StepError;
use crate::naming::{self, COMPONENT_WORKFLOW_SERVER, LABEL_POOL, WORKFLOW_PORT};
use crate::reconciler::storage::WORKFLOW_USER;
use crate::store::ObjectStore;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use std::collections::BTreeSet;
use tracing::{debug, info};

const SERVER_CONTAINER: &str = "orion";
const AGENT_CONTAINER: &str = "agent";
const PORT_NAME: &str = "http-orion";

/// Connection string assembled by the container runtime from the DB_* variables
pub const DATABASE_URL_TEMPLATE: &str =
    "postgresql+asyncpg://$(DB_USER):$(DB_PASS)@$(DB_HOST):$(DB_PORT)/$(DB_NAME)";

pub async fn ensure_workflows<S: ObjectStore>(store: &S, scope: &Scope) -> Result<(), StepError> {
    ensure_deployment(store, scope, server_deployment(scope)).await?;
    ensure_service(store, scope, server_service(scope)).await?;

    if scope.prune_agent_pools {
        prune_agent_pools(store, scope).await?;
    }

    for pool in &scope.spec.workflows.agents {
        ensure_agent_pool(store, scope, pool).await?;
    }
    Ok(())
}

fn server_deployment(scope: &Scope) -> Deployment {
    let spec = &scope.spec.workflows.controller;
    let labels = naming::workload_labels(&scope.name, COMPONENT_WORKFLOW_SERVER);

    let mut container = workload::container(SERVER_CONTAINER, &spec.image, &spec.resources);
    container.command = Some(vec!["prefect".into(), "orion".into(), "start".into()]);

    // DB_* must precede the variable that references them
    let mut env = workload::database_env(&naming::credentials_secret_name(&scope.name, WORKFLOW_USER));
    env.push(workload::env("PREFECT_ORION_DATABASE_CONNECTION_URL", DATABASE_URL_TEMPLATE));
    container.env = Some(env);
    container.ports = Some(vec![workload::container_port(PORT_NAME, WORKFLOW_PORT)]);

    let name = naming::workflow_server_name(&scope.name);
    workload::deployment(scope.metadata(&name, labels.clone()), labels, spec.replicas, container)
}

fn server_service(scope: &Scope) -> Service {
    let labels = naming::workload_labels(&scope.name, COMPONENT_WORKFLOW_SERVER);
    let name = naming::workflow_server_name(&scope.name);
    workload::cluster_ip_service(scope.metadata(&name, labels.clone()), labels, PORT_NAME, WORKFLOW_PORT)
}

fn agent_pool(scope: &Scope, pool: &WorkflowAgentPoolSpec) -> StatefulSet {
    let labels = naming::agent_pool_labels(&scope.name, &pool.name);

    let mut container = workload::container(AGENT_CONTAINER, &pool.image, &pool.resources);
    container.command = Some(
        ["prefect", "agent", "start", "-q", pool.name.as_str()]
            .into_iter()
            .map(String::from)
            .collect(),
    );
    container.env = Some(vec![
        workload::env("PREFECT_API_URL", naming::workflow_api_url(&scope.name)),
        workload::env("MLFLOW_TRACKING_URI", naming::tracking_uri(&scope.name)),
    ]);

    let name = naming::agent_pool_name(&scope.name, &pool.name);
    workload::stateful_set(scope.metadata(&name, labels.clone()), labels, pool.replicas, container)
}

/// Agent pools only track replicas and image; resource changes need a new pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentPoolDrift {
    pub replicas: bool,
    pub image: bool,
}

impl AgentPoolDrift {
    pub fn compare(existing: &StatefulSet, pool: &WorkflowAgentPoolSpec) -> Result<Self, StepError> {
        let name = existing.name_any();
        let spec = existing
            .spec
            .as_ref()
            .ok_or_else(|| StepError::invariant(format!("stateful set {name} has no spec")))?;
        let container = first_container(&spec.template, &name)?;

        Ok(Self {
            replicas: spec.replicas != pool.replicas,
            image: container.image.as_deref() != Some(pool.image.as_str()),
        })
    }

    pub fn changed(&self) -> bool {
        self.replicas || self.image
    }
}

async fn ensure_agent_pool<S: ObjectStore>(
    store: &S,
    scope: &Scope,
    pool: &WorkflowAgentPoolSpec,
) -> Result<(), StepError> {
    let name = naming::agent_pool_name(&scope.name, &pool.name);

    let Some(mut existing) = store.get::<StatefulSet>(&scope.namespace, &name).await? else {
        store.create(&scope.namespace, &agent_pool(scope, pool)).await?;
        info!(pool = %pool.name, stateful_set = %name, "created agent pool");
        return Ok(());
    };

    let drift = AgentPoolDrift::compare(&existing, pool)?;
    if !drift.changed() {
        debug!(pool = %pool.name, "agent pool up to date");
        return Ok(());
    }

    if let Some(spec) = existing.spec.as_mut() {
        if drift.replicas {
            spec.replicas = pool.replicas;
        }
        if drift.image {
            first_container_mut(&mut spec.template, &name)?.image = Some(pool.image.clone());
        }
    }
    store.update(&scope.namespace, &existing).await?;
    info!(pool = %pool.name, replicas = drift.replicas, image = drift.image, "updated agent pool");
    Ok(())
}

/// Delete agent pool StatefulSets owned by this workspace whose pool is no
/// longer declared.
async fn prune_agent_pools<S: ObjectStore>(store: &S, scope: &Scope) -> Result<(), StepError> {
    let declared: BTreeSet<&str> = scope
        .spec
        .workflows
        .agents
        .iter()
        .map(|pool| pool.name.as_str())
        .collect();

    let selector = naming::agent_pool_selector(&scope.name);
    let existing: Vec<StatefulSet> = store.list(&scope.namespace, &selector).await?;

    for set in existing {
        if !scope.owns(&set.metadata) {
            continue;
        }
        let pool = set.labels().get(LABEL_POOL).cloned().unwrap_or_default();
        if declared.contains(pool.as_str()) {
            continue;
        }
        let name = set.name_any();
        store.delete::<StatefulSet>(&scope.namespace, &name).await?;
        info!(pool = %pool, stateful_set = %name, "deleted undeclared agent pool");
    }
    Ok(())
}
