use crate::object::DataObject;
use async_trait::async_trait;
use indexmap::IndexMap;
use models::ModelRegistry;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid store name \"{0}\" (must be an alphabetical string)")]
    InvalidName(String),
    #[error("store \"{0}\" has no storage path configured")]
    NoPath(String),
    #[error("cannot access storage path \"{}\"", .0.display())]
    InaccessiblePath(PathBuf),
    #[error("backend file \"{}\" does not exist", .0.display())]
    MissingBackend(PathBuf),
    #[error("failed to parse \"{path}\" ({reason})")]
    Parse { path: String, reason: String },
    #[error("domain \"{0}\" is not resident")]
    NotResident(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
    #[error(transparent)]
    Observer(#[from] notify::Error),
    #[error("{0}")]
    Backend(String),
}

/// The store's capitalized alias derived from a name.
pub fn normalize_alias(name: &str) -> String {
    let lower = name.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => lower,
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphabetic())
}

/// Caller-facing construction parameters, applied over each store kind's own
/// defaults.
#[derive(Debug, Default, Clone)]
pub struct StoreConfig {
    pub name: Option<String>,
    pub alias: Option<String>,
    pub description: Option<String>,
    pub path: Option<PathBuf>,
    pub filetype: Option<String>,
    pub writable: Option<bool>,
    pub persistent: Option<bool>,
    pub synced: bool,
}

/// Resolved attributes of a store.
#[derive(Debug)]
pub struct StoreOptions {
    pub name: String,
    pub alias: String,
    pub description: String,
    pub filetype: String,
    pub persistent: bool,
    writable: bool,
    pub synced: bool,
    /// Whether tainted domains may sync concurrently, or one at a time.
    pub sync_parallel: bool,
    /// Worker bound for the parallel sync scheduler.
    pub sync_max_tasks: usize,
    /// `true` pins the store path-less: a manager never assigns its root.
    pathless: bool,
    path: Mutex<Option<PathBuf>>,
}

impl StoreOptions {
    /// Builds options from a config over a store kind's defaults.
    pub fn build(
        config: StoreConfig,
        default_name: &str,
        default_filetype: &str,
        description: &str,
        persistent: bool,
        writable: bool,
    ) -> Result<Self, StoreError> {
        let name = config.name.unwrap_or_else(|| default_name.to_string());
        if !valid_name(&name) {
            return Err(StoreError::InvalidName(name));
        }
        let alias = match config.alias {
            Some(alias) if valid_name(&alias) => normalize_alias(&alias),
            Some(alias) => return Err(StoreError::InvalidName(alias)),
            None => normalize_alias(&name),
        };
        let filetype = config
            .filetype
            .map(|ft| ft.trim_start_matches('.').to_string())
            .unwrap_or_else(|| default_filetype.to_string());

        let options = Self {
            name,
            alias,
            description: config.description.unwrap_or_else(|| description.to_string()),
            filetype,
            persistent: config.persistent.unwrap_or(persistent),
            writable: config.writable.unwrap_or(writable),
            synced: config.synced,
            sync_parallel: true,
            sync_max_tasks: 10,
            pathless: false,
            path: Mutex::new(config.path),
        };
        if !options.writable() && options.persistent {
            tracing::warn!(
                store = %options.alias,
                "persistent data store cannot save data (configured as non writable)"
            );
        }
        Ok(options)
    }

    /// A persistent store must be able to write its backend.
    pub fn writable(&self) -> bool {
        self.persistent || self.writable
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().unwrap().clone()
    }

    /// Assigns a path unless the store pins itself path-less or already has
    /// one. Inaccessible paths are refused.
    pub fn assign_path(&self, path: &Path) -> bool {
        if self.pathless {
            return false;
        }
        let mut guard = self.path.lock().unwrap();
        if guard.is_some() {
            return false;
        }
        if !path.is_dir() {
            tracing::error!(path = %path.display(), "cannot access provided storage path");
            return false;
        }
        *guard = Some(path.to_path_buf());
        true
    }

    pub(crate) fn pin_pathless(mut self) -> Self {
        self.pathless = true;
        *self.path.get_mut().unwrap() = None;
        self
    }
}

/// Shared residency and sync-scheduler state embedded by every store kind.
#[derive(Default)]
pub struct StoreState {
    domains: Mutex<IndexMap<String, Arc<AsyncMutex<DataObject>>>>,
    queue: Mutex<VecDeque<String>>,
    draining: AtomicBool,
}

impl StoreState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resident(&self, name: &str) -> Option<Arc<AsyncMutex<DataObject>>> {
        self.domains.lock().unwrap().get(name).cloned()
    }

    pub fn insert(&self, name: &str, object: Arc<AsyncMutex<DataObject>>) {
        self.domains.lock().unwrap().insert(name.to_string(), object);
    }

    pub fn remove(&self, name: &str) {
        self.domains.lock().unwrap().shift_remove(name);
    }

    pub fn names(&self) -> Vec<String> {
        self.domains.lock().unwrap().keys().cloned().collect()
    }

    pub fn all(&self) -> Vec<(String, Arc<AsyncMutex<DataObject>>)> {
        self.domains
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn enqueue(&self, names: Vec<String>) {
        let mut queue = self.queue.lock().unwrap();
        for name in names {
            if !queue.contains(&name) {
                queue.push_back(name);
            }
        }
    }

    fn dequeue(&self) -> Option<String> {
        self.queue.lock().unwrap().pop_front()
    }

    fn queue_is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Single-flight guard: true when this caller becomes the drainer.
    fn begin_drain(&self) -> bool {
        !self.draining.swap(true, Ordering::SeqCst)
    }

    fn end_drain(&self) {
        self.draining.store(false, Ordering::SeqCst);
    }
}

/// A store owns a set of data domains and distinguishes how they are read
/// from and written to a backend. The provided methods implement the shared
/// residency, validation, taint and sync machinery; implementors supply the
/// backend-specific raw operations.
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    fn options(&self) -> &StoreOptions;
    fn state(&self) -> &StoreState;

    /// The model registry gating reads and writes. Defaults to the
    /// process-global one.
    fn registry(&self) -> &ModelRegistry {
        models::global()
    }

    /// Parses the backend of one domain into a fresh data object.
    async fn load_domain_raw(&self, domain: &str) -> Result<DataObject, StoreError>;

    /// Writes one raw value to the backend.
    async fn set_raw(&self, domain: &str, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Fetches one raw value from the backend, for values not resident in
    /// the domain tree.
    async fn get_raw(&self, _domain: &str, _key: &str) -> Result<Option<Value>, StoreError> {
        Ok(None)
    }

    /// Backend-side cleanup when a domain is unloaded.
    async fn unload_domain_raw(&self, _domain: &str) -> Result<(), StoreError> {
        Ok(())
    }

    /// Closes any IO handle owned by the store (observers, database
    /// connections). Called by the manager on shutdown.
    async fn release_handle(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Called once the store is registered and its path is settled. Synced
    /// stores hook their observers up here.
    async fn activate(self: Arc<Self>) -> Result<(), StoreError> {
        Ok(())
    }

    /// Returns the resident domain, loading it from the backend on a miss.
    async fn get_domain(&self, domain: &str) -> Option<Arc<AsyncMutex<DataObject>>> {
        let name = domain.to_lowercase();
        if let Some(found) = self.state().resident(&name) {
            return Some(found);
        }
        self.load_domain(&name).await
    }

    /// Loads a domain from its backend and makes it resident. The loaded
    /// tree is validated first; when the domain is already resident (and not
    /// mid-sync) its object is updated in place so held references observe
    /// the reload.
    async fn load_domain(&self, domain: &str) -> Option<Arc<AsyncMutex<DataObject>>> {
        let name = domain.to_lowercase();
        tracing::debug!(
            domain = %name,
            store = %self.options().alias,
            persistent = self.options().persistent,
            "loading data domain"
        );
        let loaded = match self.load_domain_raw(&name).await {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::warn!(domain = %name, error = %err, "failed to load data domain");
                return None;
            }
        };
        if !loaded.is_empty() && self.registry().validated_value(&name, &loaded.as_value()).is_none()
        {
            tracing::warn!(domain = %name, "loaded domain data failed model validation");
            return None;
        }

        if let Some(existing) = self.state().resident(&name) {
            let mut guard = existing.lock().await;
            if !guard.syncing() {
                guard.update_data(loaded);
            }
            drop(guard);
            return Some(existing);
        }
        let object = Arc::new(AsyncMutex::new(loaded));
        self.state().insert(&name, object.clone());
        Some(object)
    }

    /// Unloads a domain, optionally syncing pending changes first.
    async fn unload_domain(&self, domain: &str, sync: bool) {
        let name = domain.to_lowercase();
        tracing::debug!(
            domain = %name,
            store = %self.options().alias,
            "unloading data domain"
        );
        let Some(object) = self.state().resident(&name) else {
            tracing::warn!(domain = %name, "cannot unload a domain which is not loaded");
            return;
        };
        if sync && object.lock().await.tainted() {
            self.sync_domain(&name, false).await;
        }
        if let Err(err) = self.unload_domain_raw(&name).await {
            tracing::warn!(domain = %name, error = %err, "failed to unload data domain");
        }
        self.state().remove(&name);
    }

    /// Resolves a token to a value: the resident tree first, the backend
    /// lazily on a miss. The result is validated against the domain model.
    /// When nothing resolves, the supplied default is used; a default equal
    /// to the token itself stands for the schema's computed default.
    async fn get_value(&self, token: &str, default: Option<Value>) -> Option<Value> {
        tracing::debug!(token, store = %self.options().alias, "getting value");

        // A trailing ".[]" means the same as the bare collection.
        let token = token.strip_suffix(".[]").unwrap_or(token);
        let Some((domain, key)) = models::split_token(token) else {
            tracing::warn!(token, "invalid data token");
            return None;
        };
        let domain = domain.to_lowercase();

        let mut value = None;
        match self.get_domain(&domain).await {
            Some(object) => {
                let resident = object.lock().await.get_value(key);
                match resident {
                    Ok(found) => value = Some(found),
                    Err(_) => match self.get_raw(&domain, key).await {
                        Ok(found) => value = found,
                        Err(err) => {
                            tracing::warn!(token, error = %err, "backend value lookup failed")
                        }
                    },
                }
            }
            None => tracing::warn!(token, domain = %domain, "data domain unavailable"),
        }

        match value {
            Some(found) => self.registry().validated_value(token, &found),
            None => {
                let fallback = self.fallback_default(token, default);
                if fallback.is_some() {
                    tracing::debug!(token, "lookup failed, using default value");
                }
                fallback
            }
        }
    }

    /// Computes the stand-in value for a failed lookup.
    fn fallback_default(&self, token: &str, default: Option<Value>) -> Option<Value> {
        let default = default?;
        if default.as_str() == Some(token) {
            self.registry().default_value(token)
        } else {
            self.registry().validated_value(token, &default)
        }
    }

    /// Validates and writes a value. In a synced persistent store the value
    /// is written through to the backend at once, and the just-written token
    /// leaves the taint log again on success.
    async fn set_value(&self, token: &str, value: Value) -> bool {
        let options = self.options();
        if !options.writable() {
            tracing::warn!(
                token,
                store = %options.alias,
                persistent = options.persistent,
                "data store is not writable"
            );
            return false;
        }
        tracing::debug!(token, store = %options.alias, "setting value");
        if value.is_null() {
            tracing::warn!(token, "refusing to set a null value");
            return false;
        }
        if self.registry().validated_value(token, &value).is_none() {
            return false;
        }
        let Some((domain, key)) = models::split_token(token) else {
            tracing::warn!(token, "invalid data token");
            return false;
        };
        let domain = domain.to_lowercase();

        let Some(object) = self.get_domain(&domain).await else {
            tracing::warn!(token, domain = %domain, "data domain unavailable");
            return false;
        };
        let canonical = {
            let mut guard = object.lock().await;
            match guard.set_value(key, value.clone()) {
                Ok(canonical) => canonical,
                Err(err) => {
                    tracing::warn!(token, error = %err, "setting value failed");
                    return false;
                }
            }
        };

        if options.synced && options.persistent {
            match self.set_raw(&domain, &canonical, &value).await {
                Ok(()) => object.lock().await.remove_tainted(&canonical),
                Err(err) => {
                    tracing::warn!(token, error = %err, "syncing new value to backend failed")
                }
            }
        }
        true
    }

    /// Syncs every tainted domain (or all, when forced) back to the backend.
    ///
    /// Tainted domain names drain through a FIFO queue, either sequentially
    /// or through a bounded worker pool, per the store's declared strategy.
    /// Concurrent calls while a drain is in flight enqueue their domains and
    /// return; the active drainer picks them up before finishing.
    async fn sync(&self, force: bool) {
        if !self.options().persistent {
            // Ephemeral stores only reset their change logs.
            for (_, object) in self.state().all() {
                object.lock().await.clear_tainted();
            }
            tracing::debug!(store = %self.options().alias, "reset change logs of ephemeral store");
            return;
        }
        tracing::debug!(store = %self.options().alias, "syncing persistent store");

        let domains = if force {
            self.state().names()
        } else {
            self.tainted_domains().await
        };
        if domains.is_empty() {
            return;
        }
        self.state().enqueue(domains);

        if !self.state().begin_drain() {
            // Another task is draining; it will coalesce our domains.
            return;
        }
        loop {
            if self.options().sync_parallel {
                let workers: Vec<_> = (0..self.options().sync_max_tasks.max(1))
                    .map(|_| self.sync_worker(force))
                    .collect();
                futures::future::join_all(workers).await;
            } else {
                while let Some(domain) = self.state().dequeue() {
                    self.sync_domain(&domain, force).await;
                }
            }
            self.state().end_drain();
            // Pick up work enqueued while we were finishing.
            if self.state().queue_is_empty() || !self.state().begin_drain() {
                break;
            }
        }
    }

    /// One worker of the parallel sync pool: drains the queue one domain at
    /// a time until it is empty.
    async fn sync_worker(&self, force: bool) {
        while let Some(domain) = self.state().dequeue() {
            self.sync_domain(&domain, force).await;
        }
    }

    /// Syncs a single domain when tainted or forced. The object's syncing
    /// flag serializes this against loads and other syncs of the same
    /// domain.
    async fn sync_domain(&self, domain: &str, force: bool) {
        let name = domain.to_lowercase();
        let Some(object) = self.state().resident(&name) else {
            return;
        };
        if !self.options().persistent {
            object.lock().await.clear_tainted();
            tracing::debug!(
                domain = %name,
                store = %self.options().alias,
                "reset change log of ephemeral domain"
            );
            return;
        }
        let proceed = {
            let mut guard = object.lock().await;
            if (guard.tainted() || force) && !guard.syncing() {
                guard.set_syncing(true);
                true
            } else {
                false
            }
        };
        if !proceed {
            return;
        }
        tracing::debug!(domain = %name, store = %self.options().alias, "syncing data domain");
        if let Err(err) = self.sync_domain_raw(&name, &object).await {
            tracing::warn!(domain = %name, error = %err, "failed to sync data domain");
        }
        object.lock().await.set_syncing(false);
    }

    /// Default per-domain sync: writes each reduced tainted token through
    /// [`DataStore::set_raw`]. Tokens whose write fails are re-tainted and
    /// picked up by the next sync; the remaining tokens continue.
    async fn sync_domain_raw(
        &self,
        domain: &str,
        object: &Arc<AsyncMutex<DataObject>>,
    ) -> Result<(), StoreError> {
        let tainted = { object.lock().await.get_tainted(true) };
        for token in tainted {
            let (key, value) = {
                let guard = object.lock().await;
                if token == "*" {
                    (String::new(), Some(guard.as_value()))
                } else {
                    (token.clone(), guard.get_value(&token).ok())
                }
            };
            let result = match value {
                Some(value) => self.set_raw(domain, &key, &value).await,
                None => Err(StoreError::Backend(format!(
                    "tainted token \"{token}\" no longer resolves"
                ))),
            };
            if let Err(err) = result {
                tracing::warn!(domain, token = %token, error = %err, "token sync failed");
                object.lock().await.set_tainted(&token);
            }
        }
        Ok(())
    }

    /// Domains whose change logs are pending a sync.
    async fn tainted_domains(&self) -> Vec<String> {
        let mut tainted = Vec::new();
        for (name, object) in self.state().all() {
            if object.lock().await.tainted() {
                tainted.push(name);
            }
        }
        tainted
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// A persistent in-memory backend with an adjustable per-write delay,
    /// for exercising the sync scheduler.
    struct SlowStore {
        options: StoreOptions,
        state: StoreState,
        registry: Arc<ModelRegistry>,
        delay: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        writes: AtomicUsize,
        fail_tokens: Vec<String>,
    }

    impl SlowStore {
        fn new(delay: Duration, parallel: bool, max_tasks: usize) -> Arc<Self> {
            let mut options = StoreOptions::build(
                StoreConfig::default(),
                "slow",
                "none",
                "a deliberately slow test backend",
                true,
                true,
            )
            .unwrap()
            .pin_pathless();
            options.sync_parallel = parallel;
            options.sync_max_tasks = max_tasks;
            Arc::new(Self {
                options,
                state: StoreState::new(),
                registry: Arc::new(ModelRegistry::new()),
                delay,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                fail_tokens: Vec::new(),
            })
        }
    }

    #[async_trait]
    impl DataStore for SlowStore {
        fn options(&self) -> &StoreOptions {
            &self.options
        }
        fn state(&self) -> &StoreState {
            &self.state
        }
        fn registry(&self) -> &ModelRegistry {
            &self.registry
        }

        async fn load_domain_raw(&self, _domain: &str) -> Result<DataObject, StoreError> {
            Ok(DataObject::new())
        }

        async fn set_raw(
            &self,
            _domain: &str,
            key: &str,
            _value: &Value,
        ) -> Result<(), StoreError> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_tokens.iter().any(|t| t == key) {
                return Err(StoreError::Backend("synthetic write failure".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_parallel_sync_respects_worker_bound() {
        let store = SlowStore::new(Duration::from_millis(40), true, 2);
        for i in 0..5 {
            assert!(store.set_value(&format!("domain{i}.key"), json!(i)).await);
        }
        assert_eq!(store.tainted_domains().await.len(), 5);

        let begin = std::time::Instant::now();
        store.sync(false).await;
        let elapsed = begin.elapsed();

        // Five domains over two workers take at least three rounds.
        assert!(elapsed >= Duration::from_millis(100), "elapsed {elapsed:?}");
        assert!(store.peak.load(Ordering::SeqCst) <= 2);
        assert!(store.tainted_domains().await.is_empty());
    }

    #[tokio::test]
    async fn test_sequential_sync_never_overlaps() {
        let store = SlowStore::new(Duration::from_millis(10), false, 10);
        for i in 0..3 {
            assert!(store.set_value(&format!("d{i}.key"), json!(i)).await);
        }
        store.sync(false).await;
        assert_eq!(store.peak.load(Ordering::SeqCst), 1);
        assert!(store.tainted_domains().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sync_coalesces() {
        let store = SlowStore::new(Duration::from_millis(20), true, 2);
        for i in 0..4 {
            assert!(store.set_value(&format!("d{i}.key"), json!(i)).await);
        }
        let (first, second) = tokio::join!(store.sync(false), store.sync(false));
        let _ = (first, second);
        assert!(store.tainted_domains().await.is_empty());
        // Every domain synced exactly once.
        assert_eq!(store.writes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failed_token_write_is_retainted() {
        let mut store = SlowStore::new(Duration::ZERO, false, 1);
        Arc::get_mut(&mut store).unwrap().fail_tokens = vec!["bad".to_string()];

        assert!(store.set_value("d.bad", json!(1)).await);
        assert!(store.set_value("d.good", json!(2)).await);
        store.sync(false).await;

        let object = store.state().resident("d").unwrap();
        assert_eq!(object.lock().await.get_tainted(false), vec!["bad"]);
    }

    #[tokio::test]
    async fn test_validation_failure_rejects_write_without_taint() {
        let store = SlowStore::new(Duration::ZERO, true, 2);
        store.registry.register(
            "modeled",
            json!({"network": {"type": "object", "properties": {"name": {"type": "string"}}}}),
        );

        assert!(!store.set_value("modeled.network.name", json!(42)).await);
        // The rejected write left no residue: the domain is either absent or
        // untainted.
        if let Some(object) = store.state().resident("modeled") {
            assert!(!object.lock().await.tainted());
        }

        assert!(store.set_value("modeled.network.name", json!("lan")).await);
        assert_eq!(
            store.get_value("modeled.network.name", None).await,
            Some(json!("lan"))
        );
    }

    #[tokio::test]
    async fn test_schema_default_when_default_equals_token() {
        let store = SlowStore::new(Duration::ZERO, true, 2);
        store.registry.register(
            "modeled",
            json!({"network": {"type": "object", "properties": {
                "port": {"type": "integer", "default": 3127},
            }}}),
        );

        let token = "modeled.network.port";
        assert_eq!(
            store.get_value(token, Some(json!(token))).await,
            Some(json!(3127))
        );
        // A plain default passes through (validated).
        assert_eq!(
            store.get_value(token, Some(json!(9000))).await,
            Some(json!(9000))
        );
        // An invalid default is rejected.
        assert_eq!(store.get_value(token, Some(json!("no"))).await, None);
    }
}
