use crate::store::{normalize_alias, DataStore};
use indexmap::IndexMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Central data management facility composing uniquely aliased store
/// backends. The manager owns a root path which it hands to registered
/// stores without one, routes reads and writes by store alias, and
/// coordinates syncing and the final release of IO handles.
pub struct DataManager {
    path: PathBuf,
    stores: Mutex<IndexMap<String, Arc<dyn DataStore>>>,
}

impl DataManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if !path.is_dir() {
            tracing::error!(path = %path.display(), "cannot access provided storage path");
        }
        tracing::debug!(path = %path.display(), "using data storage location");
        Self {
            path,
            stores: Mutex::new(IndexMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registers a store under its alias. Rejects duplicate aliases. Stores
    /// without a path inherit the manager's root; afterwards the store is
    /// activated (synced stores hook up their observers there).
    pub async fn register_store(&self, store: Arc<dyn DataStore>) -> bool {
        let alias = store.options().alias.clone();
        let count = {
            let mut stores = self.stores.lock().unwrap();
            if stores.contains_key(&alias) {
                tracing::warn!(alias = %alias, "cannot register a store with the same alias twice");
                return false;
            }
            stores.insert(alias.clone(), store.clone());
            stores.len()
        };

        if store.options().path().is_none() && store.options().assign_path(&self.path) && count >= 2
        {
            tracing::warn!(
                path = %self.path.display(),
                "registered store uses the manager root; beware of same-type stores sharing a path"
            );
        }
        if let Err(err) = store.clone().activate().await {
            tracing::warn!(alias = %alias, error = %err, "store activation failed");
        }
        tracing::debug!(alias = %alias, "registered data store");
        true
    }

    /// Unregisters a store by alias (or name), syncing it first.
    pub async fn unregister_store(&self, alias: &str) -> bool {
        let alias = normalize_alias(alias);
        let store = self.stores.lock().unwrap().get(&alias).cloned();
        match store {
            Some(store) => {
                store.sync(false).await;
                self.stores.lock().unwrap().shift_remove(&alias);
                tracing::debug!(alias = %alias, "unregistered data store");
                true
            }
            None => {
                tracing::warn!(alias = %alias, "data store not registered");
                false
            }
        }
    }

    /// A typed handle to the store registered under `alias`.
    pub fn store(&self, alias: &str) -> Option<StoreHandle> {
        let alias = normalize_alias(alias);
        let store = self.stores.lock().unwrap().get(&alias).cloned();
        if store.is_none() {
            tracing::warn!(alias = %alias, "data store not registered");
        }
        store.map(|store| StoreHandle { store })
    }

    pub fn stores(&self) -> Vec<Arc<dyn DataStore>> {
        self.stores.lock().unwrap().values().cloned().collect()
    }

    /// Routes a read to the aliased store.
    pub async fn get_value(&self, alias: &str, token: &str, default: Option<Value>) -> Option<Value> {
        match self.store(alias) {
            Some(handle) => handle.get(token, default).await,
            None => None,
        }
    }

    /// Routes a write to the aliased store.
    pub async fn set_value(&self, alias: &str, token: &str, value: Value) -> bool {
        match self.store(alias) {
            Some(handle) => handle.set(token, value).await,
            None => false,
        }
    }

    /// Syncs one store, or all of them.
    pub async fn sync(&self, alias: Option<&str>) {
        match alias {
            Some(alias) => {
                if let Some(handle) = self.store(alias) {
                    handle.sync().await;
                }
            }
            None => {
                tracing::debug!("syncing all persistent data store backends");
                for store in self.stores() {
                    store.sync(false).await;
                }
            }
        }
    }

    /// Concurrently releases every store's IO handles, reporting per-store
    /// errors without aborting the batch.
    pub async fn release(&self) {
        tracing::debug!("releasing data store backends");
        let stores = self.stores();
        let releases = stores.iter().map(|store| {
            let alias = store.options().alias.clone();
            let store = store.clone();
            async move { (alias, store.release_handle().await) }
        });
        for (alias, result) in futures::future::join_all(releases).await {
            if let Err(err) = result {
                tracing::warn!(alias = %alias, error = %err, "store could not release its handle");
            }
        }
    }
}

/// Cloneable, typed façade over one registered store.
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<dyn DataStore>,
}

impl StoreHandle {
    pub async fn get(&self, token: &str, default: Option<Value>) -> Option<Value> {
        self.store.get_value(token, default).await
    }

    pub async fn set(&self, token: &str, value: Value) -> bool {
        self.store.set_value(token, value).await
    }

    pub async fn sync(&self) {
        self.store.sync(false).await;
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::sqlite::SqliteStore;
    use crate::store::StoreConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_route() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DataManager::new(dir.path());

        let cache = Arc::new(MemoryStore::new(StoreConfig::default()).unwrap());
        assert!(manager.register_store(cache).await);
        // Duplicate aliases are rejected.
        let twin = Arc::new(MemoryStore::new(StoreConfig::default()).unwrap());
        assert!(!manager.register_store(twin).await);

        assert!(manager.set_value("cache", "run.state", json!("up")).await);
        assert_eq!(
            manager.get_value("Cache", "run.state", None).await,
            Some(json!("up"))
        );
        // Unknown aliases route nowhere.
        assert!(!manager.set_value("nope", "run.state", json!(1)).await);
        assert_eq!(manager.get_value("nope", "run.state", None).await, None);
    }

    #[tokio::test]
    async fn test_store_handle_facade() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DataManager::new(dir.path());
        manager
            .register_store(Arc::new(MemoryStore::new(StoreConfig::default()).unwrap()))
            .await;

        let handle = manager.store("Cache").unwrap();
        assert!(handle.set("run.jobs.[]", json!("one")).await);
        assert_eq!(handle.get("run.jobs.0", None).await, Some(json!("one")));
        handle.sync().await;
    }

    #[tokio::test]
    async fn test_path_assignment_and_unregister() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DataManager::new(dir.path());

        let database = Arc::new(SqliteStore::new(StoreConfig::default()).unwrap());
        assert!(manager.register_store(database.clone()).await);
        // The store inherited the manager root.
        assert_eq!(database.options().path(), Some(dir.path().to_path_buf()));

        assert!(manager.set_value("database", "cfg.answer", json!(42)).await);
        // Unregistering syncs first; a fresh store over the same path sees
        // the data.
        assert!(manager.unregister_store("database").await);
        assert!(manager.store("database").is_none());

        let fresh = Arc::new(SqliteStore::new(StoreConfig {
            path: Some(dir.path().to_path_buf()),
            ..StoreConfig::default()
        })
        .unwrap());
        assert_eq!(
            fresh.get_value("cfg.answer", None).await,
            Some(json!(42))
        );
        manager.release().await;
    }
}
