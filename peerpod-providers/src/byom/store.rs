//! Backing stores for the shared allocation object.

use super::state::{state_labels, STATE_DATA_KEY};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, PostParams};
use peerpod_common::ProviderError;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, info};

/// The shared object as read: payload plus the version token used for the next write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// `None` when the object exists without a state payload.
    pub data: Option<String>,
    pub resource_version: String,
}

/// Compare-and-set store holding one document.
///
/// `create` fails with `Conflict` when the object already exists, `update` fails with
/// `Conflict` when `resource_version` is stale.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self) -> Result<Option<StoredObject>, ProviderError>;
    async fn create(&self, data: &str) -> Result<(), ProviderError>;
    async fn update(&self, data: &str, resource_version: &str) -> Result<(), ProviderError>;
    fn describe(&self) -> String;
}

// --- ConfigMap ---

pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
}

impl ConfigMapStore {
    pub fn new(client: kube::Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn object(&self, data: &str, resource_version: Option<&str>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(state_labels()),
                resource_version: resource_version.map(str::to_string),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(STATE_DATA_KEY.to_string(), data.to_string())])),
            ..Default::default()
        }
    }
}

fn write_error(err: kube::Error, what: &str) -> ProviderError {
    match err {
        kube::Error::Api(api_error) if api_error.code == 409 => {
            ProviderError::Conflict(format!("{}: {}", what, api_error.message))
        }
        e => ProviderError::UpdatingPoolState(format!("{}: {}", what, e)),
    }
}

#[async_trait]
impl StateStore for ConfigMapStore {
    async fn get(&self) -> Result<Option<StoredObject>, ProviderError> {
        match self.api.get(&self.name).await {
            Ok(cm) => Ok(Some(StoredObject {
                data: cm
                    .data
                    .and_then(|mut d| d.remove(STATE_DATA_KEY))
                    .filter(|d| !d.trim().is_empty()),
                resource_version: cm.metadata.resource_version.unwrap_or_default(),
            })),
            Err(kube::Error::Api(api_error)) if api_error.code == 404 => Ok(None),
            Err(e) => Err(ProviderError::RetrievingPoolState(format!(
                "getting configmap {}/{}: {}",
                self.namespace, self.name, e
            ))),
        }
    }

    async fn create(&self, data: &str) -> Result<(), ProviderError> {
        self.api
            .create(&PostParams::default(), &self.object(data, None))
            .await
            .map_err(|e| write_error(e, "creating pool state configmap"))?;
        info!("created configmap {}/{}", self.namespace, self.name);
        Ok(())
    }

    async fn update(&self, data: &str, resource_version: &str) -> Result<(), ProviderError> {
        self.api
            .replace(
                &self.name,
                &PostParams::default(),
                &self.object(data, Some(resource_version)),
            )
            .await
            .map_err(|e| write_error(e, "updating pool state configmap"))?;
        debug!("updated configmap {}/{}", self.namespace, self.name);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("configmap {}/{}", self.namespace, self.name)
    }
}

// --- In-memory ---

/// Process-local store with the same compare-and-set contract.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    object: Option<(Option<String>, u64)>,
    next_version: u64,
    writes: u64,
    forced_conflicts: u32,
}

impl MemoryInner {
    fn commit(&mut self, data: &str) {
        self.next_version += 1;
        self.writes += 1;
        self.object = Some((Some(data.to_string()), self.next_version));
    }

    fn take_forced_conflict(&mut self) -> bool {
        if self.forced_conflicts > 0 {
            self.forced_conflicts -= 1;
            true
        } else {
            false
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with an existing payload.
    pub fn with_data(data: impl Into<String>) -> Self {
        let store = Self::default();
        {
            let mut inner = store.lock();
            inner.next_version = 1;
            inner.object = Some((Some(data.into()), 1));
        }
        store
    }

    /// Current payload.
    pub fn data(&self) -> Option<String> {
        self.lock().object.as_ref().and_then(|(d, _)| d.clone())
    }

    /// Number of accepted writes.
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    /// Make the next `n` writes fail with a conflict, as if another writer got in first.
    pub fn inject_conflicts(&self, n: u32) {
        self.lock().forced_conflicts = n;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self) -> Result<Option<StoredObject>, ProviderError> {
        Ok(self.lock().object.as_ref().map(|(data, version)| StoredObject {
            data: data.clone().filter(|d| !d.trim().is_empty()),
            resource_version: version.to_string(),
        }))
    }

    async fn create(&self, data: &str) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        if inner.object.is_some() || inner.take_forced_conflict() {
            return Err(ProviderError::Conflict("pool state already exists".to_string()));
        }
        inner.commit(data);
        Ok(())
    }

    async fn update(&self, data: &str, resource_version: &str) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        let current = match &inner.object {
            Some((_, v)) => v.to_string(),
            None => return Err(ProviderError::Conflict("pool state was deleted".to_string())),
        };
        if current != resource_version || inner.take_forced_conflict() {
            return Err(ProviderError::Conflict(format!(
                "stale resource version {} (current {})",
                resource_version, current
            )));
        }
        inner.commit(data);
        Ok(())
    }

    fn describe(&self) -> String {
        "in-memory pool state".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_is_compare_and_set() {
        let store = MemoryStore::new();
        assert_eq!(store.get().await.unwrap(), None);

        store.create("{}").await.unwrap();
        assert_eq!(store.create("{}").await.unwrap_err().kind(), "conflict");

        let first = store.get().await.unwrap().unwrap();
        store.update("{\"a\":1}", &first.resource_version).await.unwrap();
        let err = store.update("{\"a\":2}", &first.resource_version).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");

        assert_eq!(store.data().as_deref(), Some("{\"a\":1}"));
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn injected_conflicts_are_consumed() {
        let store = MemoryStore::with_data("{}");
        store.inject_conflicts(1);
        let obj = store.get().await.unwrap().unwrap();
        assert!(store.update("x", &obj.resource_version).await.is_err());
        store.update("x", &obj.resource_version).await.unwrap();
    }

    #[test]
    fn configmap_carries_labels_and_key() {
        // Building the object needs no cluster; only the client type is required.
        let labels = state_labels();
        assert_eq!(labels["app.kubernetes.io/name"], "cloud-api-adaptor");
        assert_eq!(labels["app.kubernetes.io/component"], "byom-ip-pool-state");
    }
}
