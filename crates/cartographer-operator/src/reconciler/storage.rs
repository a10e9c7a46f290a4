//! Storage subsystem: the PostgreSQL cluster backing tracking and workflows
//!
//! Create-only. Storage sizes are immutable once the cluster exists; the
//! admission webhook rejects updates that try to change them.

use super::Scope;
use crate::crd::{
    Backups, PgBackRestArchive, PgBackRestRepo, PostgresCluster, PostgresClusterSpec,
    PostgresInstanceSetSpec, PostgresUserSpec, RepoPvc,
};
use crate::error::StepError;
use crate::naming::{self, COMPONENT_STORAGE};
use crate::store::ObjectStore;
use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const POSTGRES_IMAGE: &str =
    "registry.developers.crunchydata.com/crunchydata/crunchy-postgres:ubi8-14.6-2";
pub const POSTGRES_VERSION: i32 = 14;
pub const INSTANCE_SET: &str = "db01";
pub const BACKUP_REPO: &str = "repo1";

/// Database user for the experiment tracking server
pub const TRACKING_USER: &str = "mlflow";
/// Database user for the workflow server
pub const WORKFLOW_USER: &str = "prefect";

pub async fn ensure_storage_cluster<S: ObjectStore>(store: &S, scope: &Scope) -> Result<(), StepError> {
    let name = naming::cluster_name(&scope.name);

    if store.get::<PostgresCluster>(&scope.namespace, &name).await?.is_some() {
        debug!(cluster = %name, "storage cluster exists");
        return Ok(());
    }

    let cluster = storage_cluster(scope, &name);
    store.create(&scope.namespace, &cluster).await?;
    info!(cluster = %name, "created storage cluster");
    Ok(())
}

fn storage_cluster(scope: &Scope, name: &str) -> PostgresCluster {
    let storage = &scope.spec.storage;
    let spec = PostgresClusterSpec {
        image: POSTGRES_IMAGE.to_string(),
        postgres_version: POSTGRES_VERSION,
        instances: vec![PostgresInstanceSetSpec {
            name: INSTANCE_SET.to_string(),
            data_volume_claim_spec: volume_claim(storage.database_storage.as_ref()),
        }],
        backups: Backups {
            pgbackrest: PgBackRestArchive {
                repos: vec![PgBackRestRepo {
                    name: BACKUP_REPO.to_string(),
                    volume: Some(RepoPvc {
                        volume_claim_spec: volume_claim(storage.database_backup_storage.as_ref()),
                    }),
                }],
            },
        },
        users: [TRACKING_USER, WORKFLOW_USER]
            .into_iter()
            .map(|user| PostgresUserSpec {
                name: user.to_string(),
                databases: vec![user.to_string()],
            })
            .collect(),
    };

    let mut cluster = PostgresCluster::new(name, spec);
    cluster.metadata = scope.metadata(
        name,
        naming::component_labels(&scope.name, COMPONENT_STORAGE),
    );
    cluster
}

fn volume_claim(size: Option<&Quantity>) -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
        resources: Some(VolumeResourceRequirements {
            requests: size.map(|q| BTreeMap::from([("storage".to_string(), q.clone())])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::tests::{scope_for, workspace};
    use crate::store::memory::{MemoryStore, Op};

    #[tokio::test]
    async fn test_creates_cluster_sized_from_spec() {
        let mut ws = workspace("demo");
        ws.spec.storage.database_storage = Some(Quantity("20Gi".into()));
        let scope = scope_for(&ws);
        let store = MemoryStore::new();

        ensure_storage_cluster(&store, &scope).await.unwrap();

        let cluster: PostgresCluster = store.object("default", "demo").unwrap();
        let data = &cluster.spec.instances[0].data_volume_claim_spec;
        assert_eq!(cluster.spec.instances[0].name, "db01");
        assert_eq!(data.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"].0, "20Gi");

        let repo = &cluster.spec.backups.pgbackrest.repos[0];
        assert_eq!(repo.name, "repo1");
        let backup = &repo.volume.as_ref().unwrap().volume_claim_spec;
        assert_eq!(backup.resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"].0, "10Gi");

        let users: Vec<_> = cluster.spec.users.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(users, ["mlflow", "prefect"]);
        assert_eq!(cluster.metadata.owner_references.as_ref().unwrap()[0].uid, "uid-demo");
    }

    #[tokio::test]
    async fn test_existing_cluster_is_never_updated() {
        let ws = workspace("demo");
        let scope = scope_for(&ws);
        let store = MemoryStore::new();
        store.insert("default", &PostgresCluster::new("demo", PostgresClusterSpec::default()));

        ensure_storage_cluster(&store, &scope).await.unwrap();

        assert!(store.writes().is_empty());
        assert!(store.writes_of(Op::Update).is_empty());
    }
}
