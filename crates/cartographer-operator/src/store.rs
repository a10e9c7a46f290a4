//! Object store seam
//!
//! Subsystem reconcilers only see [`ObjectStore`]. In production it is backed
//! by the Kubernetes API; tests use an in-memory store that records writes.

use crate::error::StoreError;
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use tracing::debug;

/// A typed, namespaced resource the store can persist
pub trait StoredObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoredObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

fn kind_of<K: StoredObject>() -> String {
    K::kind(&()).into_owned()
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; `None` when it does not exist
    async fn get<K: StoredObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;

    async fn create<K: StoredObject>(&self, namespace: &str, object: &K) -> Result<(), StoreError>;

    /// Replace an object previously fetched with [`ObjectStore::get`]. The
    /// fetched resourceVersion makes this an optimistic-concurrency write.
    async fn update<K: StoredObject>(&self, namespace: &str, object: &K) -> Result<(), StoreError>;

    async fn list<K: StoredObject>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, StoreError>;

    /// Delete an object; deleting a missing object succeeds
    async fn delete<K: StoredObject>(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// [`ObjectStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: StoredObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoredObject>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(kind_of::<K>(), name, e))
    }

    async fn create<K: StoredObject>(&self, namespace: &str, object: &K) -> Result<(), StoreError> {
        let name = object.name_any();
        self.api::<K>(namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| StoreError::from_kube(kind_of::<K>(), &name, e))?;
        debug!(kind = %kind_of::<K>(), %name, "created");
        Ok(())
    }

    async fn update<K: StoredObject>(&self, namespace: &str, object: &K) -> Result<(), StoreError> {
        let name = object.name_any();
        self.api::<K>(namespace)
            .replace(&name, &PostParams::default(), object)
            .await
            .map_err(|e| StoreError::from_kube(kind_of::<K>(), &name, e))?;
        debug!(kind = %kind_of::<K>(), %name, "replaced");
        Ok(())
    }

    async fn list<K: StoredObject>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, StoreError> {
        let params = ListParams::default().labels(label_selector);
        let list = self
            .api::<K>(namespace)
            .list(&params)
            .await
            .map_err(|e| StoreError::from_kube(kind_of::<K>(), label_selector, e))?;
        Ok(list.items)
    }

    async fn delete<K: StoredObject>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self.api::<K>(namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(kind = %kind_of::<K>(), %name, "deleted");
                Ok(())
            }
            Err(kube::Error::Api(status)) if status.code == 404 => Ok(()),
            Err(e) => Err(StoreError::from_kube(kind_of::<K>(), name, e)),
        }
    }
}
