use crate::object::DataObject;
use crate::store::{DataStore, StoreConfig, StoreError, StoreOptions, StoreState};
use async_trait::async_trait;
use models::ModelRegistry;
use serde_json::Value;
use std::sync::Arc;

/// A data store which keeps its data in plain memory. Ephemeral: a "sync"
/// only resets the change logs. The store pins itself path-less so a data
/// manager never assigns its root path to it.
pub struct MemoryStore {
    options: StoreOptions,
    state: StoreState,
    registry: Option<Arc<ModelRegistry>>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let options = StoreOptions::build(
            config,
            "cache",
            "",
            "An ephemeral memory store",
            false,
            true,
        )?
        .pin_pathless();
        Ok(Self {
            options,
            state: StoreState::new(),
            registry: None,
        })
    }

    /// Replaces the process-global model registry with a dedicated one.
    pub fn with_registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }
}

#[async_trait]
impl DataStore for MemoryStore {
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

    async fn load_domain_raw(&self, _domain: &str) -> Result<DataObject, StoreError> {
        Ok(DataObject::new())
    }

    async fn set_raw(&self, _domain: &str, _key: &str, _value: &Value) -> Result<(), StoreError> {
        Ok(())
    }
}
