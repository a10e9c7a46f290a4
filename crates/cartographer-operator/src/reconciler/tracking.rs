//! Experiment tracking subsystem: the MLflow server deployment and service

use super::workload::{self, ensure_deployment, ensure_service};
use super::Scope;
use crate::error::StepError;
use crate::naming::{self, COMPONENT_EXPERIMENT_TRACKING, TRACKING_PORT};
use crate::reconciler::storage::TRACKING_USER;
use crate::store::ObjectStore;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;

const CONTAINER_NAME: &str = "mlflow";
const PORT_NAME: &str = "http-mlflow";

pub async fn ensure_experiment_tracking<S: ObjectStore>(store: &S, scope: &Scope) -> Result<(), StepError> {
    ensure_deployment(store, scope, tracking_deployment(scope)).await?;
    ensure_service(store, scope, tracking_service(scope)).await
}

fn tracking_deployment(scope: &Scope) -> Deployment {
    let spec = &scope.spec.experiment_tracking;
    let labels = naming::workload_labels(&scope.name, COMPONENT_EXPERIMENT_TRACKING);

    let mut container = workload::container(CONTAINER_NAME, &spec.image, &spec.resources);
    container.env = Some(workload::database_env(&naming::credentials_secret_name(
        &scope.name,
        TRACKING_USER,
    )));
    container.ports = Some(vec![workload::container_port(PORT_NAME, TRACKING_PORT)]);

    let name = naming::tracking_server_name(&scope.name);
    workload::deployment(scope.metadata(&name, labels.clone()), labels, spec.replicas, container)
}

fn tracking_service(scope: &Scope) -> Service {
    let labels = naming::workload_labels(&scope.name, COMPONENT_EXPERIMENT_TRACKING);
    let name = naming::tracking_server_name(&scope.name);
    workload::cluster_ip_service(scope.metadata(&name, labels.clone()), labels, PORT_NAME, TRACKING_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::tests::{scope_for, workspace};
    use crate::store::memory::{MemoryStore, Op};
    use cartographer_common::quantity::cpu_memory;

    fn replicas(store: &MemoryStore) -> Option<i32> {
        let d: Deployment = store.object("default", "demo-mlflow-server").unwrap();
        d.spec.unwrap().replicas
    }

    #[tokio::test]
    async fn test_creates_deployment_and_service() {
        let ws = workspace("demo");
        let store = MemoryStore::new();

        ensure_experiment_tracking(&store, &scope_for(&ws)).await.unwrap();

        let d: Deployment = store.object("default", "demo-mlflow-server").unwrap();
        let container = &d.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.name, "mlflow");
        assert_eq!(container.image.as_deref(), Some("willemmeints/experiment-tracking:latest"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 5000);
        let secret = container.env.as_ref().unwrap()[0]
            .value_from
            .as_ref()
            .unwrap()
            .secret_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(secret.name, "demo-pguser-mlflow");

        let svc: Service = store.object("default", "demo-mlflow-server").unwrap();
        assert_eq!(svc.spec.unwrap().ports.unwrap()[0].port, 5000);
        assert_eq!(store.writes_of(Op::Create).len(), 2);
    }

    #[tokio::test]
    async fn test_replica_change_is_single_update() {
        let mut ws = workspace("demo");
        let store = MemoryStore::new();
        ensure_experiment_tracking(&store, &scope_for(&ws)).await.unwrap();
        store.clear_writes();

        ws.spec.experiment_tracking.replicas = Some(2);
        ensure_experiment_tracking(&store, &scope_for(&ws)).await.unwrap();

        let updates = store.writes_of(Op::Update);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].name, "demo-mlflow-server");
        assert_eq!(replicas(&store), Some(2));

        let d: Deployment = store.object("default", "demo-mlflow-server").unwrap();
        let container = &d.spec.unwrap().template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("willemmeints/experiment-tracking:latest"));
        assert_eq!(
            container.resources.as_ref().unwrap().limits,
            Some(cpu_memory("1", "1Gi"))
        );
    }

    #[tokio::test]
    async fn test_converged_deployment_is_not_written() {
        let ws = workspace("demo");
        let store = MemoryStore::new();
        ensure_experiment_tracking(&store, &scope_for(&ws)).await.unwrap();
        store.clear_writes();

        ensure_experiment_tracking(&store, &scope_for(&ws)).await.unwrap();
        assert!(store.writes().is_empty());
    }
}
