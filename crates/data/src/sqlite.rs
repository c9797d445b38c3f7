use crate::object::DataObject;
use crate::store::{DataStore, StoreConfig, StoreError, StoreOptions, StoreState};
use async_trait::async_trait;
use models::ModelRegistry;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const BOOTSTRAP: &str = "
CREATE TABLE IF NOT EXISTS hearth_values (
    domain TEXT NOT NULL,
    token  TEXT NOT NULL,
    value  TEXT NOT NULL,
    PRIMARY KEY (domain, token)
);
";

/// A data store backed by one SQLite database file. Domains map to row
/// groups keyed by `(domain, token)` with JSON-encoded values; loading a
/// domain folds its rows (in token order, so coarse rows layer below finer
/// ones) into a tree. The single backend makes the sequential sync strategy
/// the right one, so the store declares it.
///
/// All rusqlite calls run on the blocking pool.
pub struct SqliteStore {
    options: StoreOptions,
    state: StoreState,
    registry: Option<Arc<ModelRegistry>>,
    conn: Arc<Mutex<Option<rusqlite::Connection>>>,
}

impl SqliteStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let mut options = StoreOptions::build(
            config,
            "database",
            "db",
            "A persistent SQLite database store",
            true,
            true,
        )?;
        options.sync_parallel = false;
        Ok(Self {
            options,
            state: StoreState::new(),
            registry: None,
            conn: Arc::new(Mutex::new(None)),
        })
    }

    /// Replaces the process-global model registry with a dedicated one.
    pub fn with_registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    fn database_file(&self) -> Result<PathBuf, StoreError> {
        let path = self
            .options
            .path()
            .ok_or_else(|| StoreError::NoPath(self.options.alias.clone()))?;
        Ok(path.join(format!("{}.{}", self.options.name, self.options.filetype)))
    }

    /// Opens the database on first use and bootstraps the value table.
    async fn ensure_open(&self) -> Result<(), StoreError> {
        if self.conn.lock().unwrap().is_some() {
            return Ok(());
        }
        let file = self.database_file()?;
        let conn = self.conn.clone();
        run_blocking(move || {
            let mut guard = conn.lock().unwrap();
            if guard.is_some() {
                return Ok(());
            }
            let opened = rusqlite::Connection::open(&file)?;
            opened.execute_batch(BOOTSTRAP)?;
            tracing::debug!(file = %file.display(), "opened sqlite store backend");
            *guard = Some(opened);
            Ok(())
        })
        .await
    }
}

/// Offloads one rusqlite call to the blocking pool.
async fn run_blocking<T, F>(work: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| StoreError::Backend(format!("blocking task failed ({err})")))?
}

#[async_trait]
impl DataStore for SqliteStore {
    fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn state(&self) -> &StoreState {
        &self.state
    }

    fn registry(&self) -> &ModelRegistry {
        match &self.registry {
            Some(registry) => registry,
            None => models::global(),
        }
    }

    async fn load_domain_raw(&self, domain: &str) -> Result<DataObject, StoreError> {
        self.ensure_open().await?;
        let conn = self.conn.clone();
        let name = domain.to_string();
        let rows: Vec<(String, String)> = run_blocking(move || {
            let guard = conn.lock().unwrap();
            let conn = guard.as_ref().expect("connection is open");
            let mut stmt = conn
                .prepare("SELECT token, value FROM hearth_values WHERE domain = ?1 ORDER BY token")?;
            let rows = stmt
                .query_map([&name], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?;

        let mut object = DataObject::with_backend(
            serde_json::Map::new(),
            self.database_file()?.display().to_string(),
        );
        for (token, encoded) in rows {
            let value: Value =
                serde_json::from_str(&encoded).map_err(|err| StoreError::Parse {
                    path: format!("{domain}:{token}"),
                    reason: err.to_string(),
                })?;
            let key = if token == "*" { "" } else { token.as_str() };
            if let Err(err) = object.set_value(key, value) {
                tracing::warn!(domain, token = %token, error = %err, "skipping stored row");
            }
        }
        object.clear_tainted();
        Ok(object)
    }

    async fn set_raw(&self, domain: &str, key: &str, value: &Value) -> Result<(), StoreError> {
        self.ensure_open().await?;
        let conn = self.conn.clone();
        let domain = domain.to_string();
        let token = if key.is_empty() { "*" } else { key }.to_string();
        let encoded = serde_json::to_string(value)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        run_blocking(move || {
            let guard = conn.lock().unwrap();
            let conn = guard.as_ref().expect("connection is open");
            // A coarser write supersedes any finer rows below it.
            conn.execute(
                "DELETE FROM hearth_values WHERE domain = ?1 AND (token = ?2 OR token LIKE ?2 || '.%')",
                rusqlite::params![domain, token],
            )?;
            if token == "*" {
                conn.execute(
                    "DELETE FROM hearth_values WHERE domain = ?1",
                    rusqlite::params![domain],
                )?;
            }
            conn.execute(
                "INSERT OR REPLACE INTO hearth_values (domain, token, value) VALUES (?1, ?2, ?3)",
                rusqlite::params![domain, token, encoded],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_raw(&self, domain: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.ensure_open().await?;
        let conn = self.conn.clone();
        let domain = domain.to_string();
        let token = key.to_string();
        let encoded: Option<String> = run_blocking(move || {
            let guard = conn.lock().unwrap();
            let conn = guard.as_ref().expect("connection is open");
            let mut stmt = conn
                .prepare("SELECT value FROM hearth_values WHERE domain = ?1 AND token = ?2")?;
            let mut rows = stmt.query_map(rusqlite::params![domain, token], |row| row.get(0))?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
        .await?;
        match encoded {
            Some(encoded) => {
                let value = serde_json::from_str(&encoded).map_err(|err| StoreError::Parse {
                    path: token_path(&self.options.name, key),
                    reason: err.to_string(),
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn release_handle(&self) -> Result<(), StoreError> {
        if let Some(conn) = self.conn.lock().unwrap().take() {
            drop(conn);
            tracing::debug!(store = %self.options.alias, "closed sqlite store backend");
        }
        Ok(())
    }
}

fn token_path(store: &str, token: &str) -> String {
    format!("{store}:{token}")
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn store_at(dir: &std::path::Path) -> SqliteStore {
        SqliteStore::new(StoreConfig {
            path: Some(dir.to_path_buf()),
            ..StoreConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_set_sync_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store_at(dir.path());
            assert!(store.set_value("media.movies.[]", json!({"title": "a"})).await);
            assert!(store.set_value("media.music.genre", json!("jazz")).await);
            store.sync(false).await;
            store.release_handle().await.unwrap();
        }

        // A fresh store over the same database sees the synced rows.
        let store = store_at(dir.path());
        assert_eq!(
            store.get_value("media.movies.0.title", None).await,
            Some(json!("a"))
        );
        assert_eq!(
            store.get_value("media.music.genre", None).await,
            Some(json!("jazz"))
        );
        assert!(!store
            .state()
            .resident("media")
            .unwrap()
            .lock()
            .await
            .tainted());
    }

    #[tokio::test]
    async fn test_synced_store_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(StoreConfig {
            path: Some(dir.path().to_path_buf()),
            synced: true,
            ..StoreConfig::default()
        })
        .unwrap();

        assert!(store.set_value("run.counter", json!(7)).await);
        // The write-through removed the token from the change log again.
        let object = store.state().resident("run").unwrap();
        assert!(!object.lock().await.tainted());

        // And it is durable without an explicit sync.
        assert_eq!(
            store.get_raw("run", "counter").await.unwrap(),
            Some(json!(7))
        );
    }

    #[tokio::test]
    async fn test_coarse_write_supersedes_finer_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());

        assert!(store.set_value("cfg.net.host", json!("a")).await);
        assert!(store.set_value("cfg.net.port", json!(1)).await);
        store.sync(false).await;

        assert!(store.set_value("cfg.net", json!({"host": "b"})).await);
        store.sync(false).await;

        // Reload from scratch: the old finer rows are gone.
        store.state().remove("cfg");
        assert_eq!(
            store.get_value("cfg.net", None).await,
            Some(json!({"host": "b"}))
        );
    }
}
