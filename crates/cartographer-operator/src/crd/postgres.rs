//! Crunchy Data PostgresCluster (postgres-operator.crunchydata.com/v1beta1)
//!
//! Only the fields the workspace operator writes are modelled. The schema is
//! owned by the Crunchy operator, so none is generated here.

use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "postgres-operator.crunchydata.com",
    version = "v1beta1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    pub image: String,
    pub postgres_version: i32,
    pub instances: Vec<PostgresInstanceSetSpec>,
    pub backups: Backups,
    #[serde(default)]
    pub users: Vec<PostgresUserSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresInstanceSetSpec {
    pub name: String,
    pub data_volume_claim_spec: PersistentVolumeClaimSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Backups {
    pub pgbackrest: PgBackRestArchive,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PgBackRestArchive {
    pub repos: Vec<PgBackRestRepo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PgBackRestRepo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<RepoPvc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepoPvc {
    pub volume_claim_spec: PersistentVolumeClaimSpec,
}

/// A database user; the Crunchy operator publishes its credentials in a
/// secret named `<cluster>-pguser-<user>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PostgresUserSpec {
    pub name: String,
    #[serde(default)]
    pub databases: Vec<String>,
}
