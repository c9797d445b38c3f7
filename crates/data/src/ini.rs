use crate::object::DataObject;
use crate::observer::{FilesystemObserver, FsEvent, PauseSwitch};
use crate::store::{DataStore, StoreConfig, StoreError, StoreOptions, StoreState};
use async_trait::async_trait;
use models::ModelRegistry;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

/// A data store which reads and writes its data from and to INI files, one
/// file per domain. A token dissects into the domain (the file), a category
/// (an INI section) and a key (a `key = value` pair); any deeper token maps
/// to a JSON-encoded value inside the file.
///
/// In `synced` mode the store bulk-loads every matching file on activation
/// and installs a filesystem observer on its path: external modifications
/// reload the affected domain, deletions unload it, and renames process both
/// ends. The store pauses the observer around its own writes.
pub struct IniFileStore {
    options: StoreOptions,
    state: StoreState,
    registry: Option<Arc<ModelRegistry>>,
    observer: Mutex<Option<FilesystemObserver>>,
    switch: Mutex<Option<PauseSwitch>>,
    watch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl IniFileStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let options = StoreOptions::build(
            config,
            "config",
            "cfg",
            "A persistent INI file store",
            true,
            true,
        )?;
        Ok(Self {
            options,
            state: StoreState::new(),
            registry: None,
            observer: Mutex::new(None),
            switch: Mutex::new(None),
            watch_task: Mutex::new(None),
        })
    }

    /// Replaces the process-global model registry with a dedicated one.
    pub fn with_registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    fn domain_file(&self, domain: &str) -> Result<PathBuf, StoreError> {
        let path = self
            .options
            .path()
            .ok_or_else(|| StoreError::NoPath(self.options.alias.clone()))?;
        Ok(path.join(format!("{domain}.{}", self.options.filetype)))
    }

    /// The domain a file below the store path belongs to, if it carries the
    /// store's filetype.
    fn domain_of(&self, file: &Path) -> Option<String> {
        let extension = file.extension()?.to_str()?;
        if extension != self.options.filetype {
            return None;
        }
        Some(file.file_stem()?.to_str()?.to_lowercase())
    }

    /// Renders the resident domain tree and writes it out, with the observer
    /// paused so the write does not come back as a reload.
    async fn write_domain_file(&self, domain: &str) -> Result<(), StoreError> {
        let file = self.domain_file(domain)?;
        let object = self
            .state
            .resident(domain)
            .ok_or_else(|| StoreError::NotResident(domain.to_string()))?;
        let text = {
            let guard = object.lock().await;
            render_ini(guard.data()).map_err(|reason| StoreError::Parse {
                path: file.display().to_string(),
                reason,
            })?
        };

        let switch = self.switch.lock().unwrap().clone();
        match switch {
            Some(switch) => {
                switch
                    .while_paused(tokio::fs::write(&file, text))
                    .await
                    .map_err(StoreError::Io)?;
            }
            None => tokio::fs::write(&file, text).await?,
        }
        Ok(())
    }

    async fn handle_event(&self, event: FsEvent) {
        match event {
            FsEvent::Modified(path) => {
                if let Some(domain) = self.domain_of(&path) {
                    self.load_domain(&domain).await;
                }
            }
            // The modify event following a create carries the content.
            FsEvent::Created(_) => {}
            FsEvent::Deleted(path) => {
                if let Some(domain) = self.domain_of(&path) {
                    self.unload_domain(&domain, false).await;
                }
            }
            FsEvent::Moved { from, to } => {
                let source = self.domain_of(&from);
                let target = self.domain_of(&to);
                if let Some(source) = &source {
                    if target.as_deref() != Some(source.as_str()) {
                        self.unload_domain(source, false).await;
                    }
                }
                if let Some(target) = target {
                    self.load_domain(&target).await;
                }
            }
        }
    }
}

#[async_trait]
impl DataStore for IniFileStore {
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

    async fn activate(self: Arc<Self>) -> Result<(), StoreError> {
        if !self.options.synced {
            return Ok(());
        }
        let Some(path) = self.options.path() else {
            return Err(StoreError::NoPath(self.options.alias.clone()));
        };

        // Load all existing file backends up front.
        let suffix = format!(".{}", self.options.filetype);
        let mut entries = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(&suffix) {
                self.load_domain(&stem.to_lowercase()).await;
            }
        }

        // Then observe the path for external changes.
        let mut observer =
            FilesystemObserver::new(&path, &[self.options.filetype.clone()], false)?;
        let mut events = observer
            .take_events()
            .expect("fresh observer holds its receiver");
        *self.switch.lock().unwrap() = Some(observer.switch());
        *self.observer.lock().unwrap() = Some(observer);

        let store = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                store.handle_event(event).await;
            }
        });
        *self.watch_task.lock().unwrap() = Some(task);

        tracing::debug!(
            store = %self.options.alias,
            path = %path.display(),
            filetype = %self.options.filetype,
            "data store now observes its path"
        );
        Ok(())
    }

    async fn load_domain_raw(&self, domain: &str) -> Result<DataObject, StoreError> {
        let file = self.domain_file(domain)?;
        let text = match tokio::fs::read_to_string(&file).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::MissingBackend(file))
            }
            Err(err) => return Err(err.into()),
        };
        let sections = parse_ini(&text).map_err(|reason| StoreError::Parse {
            path: file.display().to_string(),
            reason,
        })?;
        Ok(DataObject::with_backend(
            sections,
            file.display().to_string(),
        ))
    }

    async fn set_raw(&self, domain: &str, _key: &str, _value: &Value) -> Result<(), StoreError> {
        // INI files have no sub-file write granularity; render the whole
        // domain.
        self.write_domain_file(domain).await
    }

    async fn get_raw(&self, domain: &str, key: &str) -> Result<Option<Value>, StoreError> {
        // A fresh parse of the backend file, for values which are not (or no
        // longer) resident.
        let object = self.load_domain_raw(domain).await?;
        Ok(object.get_value(key).ok())
    }

    async fn sync_domain_raw(
        &self,
        domain: &str,
        object: &Arc<AsyncMutex<DataObject>>,
    ) -> Result<(), StoreError> {
        // One whole-file write covers every tainted token at once.
        let tainted = { object.lock().await.get_tainted(true) };
        match self.write_domain_file(domain).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let mut guard = object.lock().await;
                for token in tainted {
                    guard.set_tainted(&token);
                }
                Err(err)
            }
        }
    }

    async fn release_handle(&self) -> Result<(), StoreError> {
        if let Some(mut observer) = self.observer.lock().unwrap().take() {
            observer.stop();
            tracing::debug!(
                store = %self.options.alias,
                path = %observer.path().display(),
                "data store stopped observing its path"
            );
        }
        self.switch.lock().unwrap().take();
        if let Some(task) = self.watch_task.lock().unwrap().take() {
            task.abort();
        }
        Ok(())
    }
}

/// Parses INI text into a section map. Comment lines start with `;` or `#`;
/// option values go through the coercion rules of [`coerce_value`]. Option
/// keys are lowercased.
pub(crate) fn parse_ini(text: &str) -> Result<Map<String, Value>, String> {
    let mut sections: Map<String, Value> = Map::new();
    let mut current: Option<String> = None;

    for (number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim();
            if name.is_empty() {
                return Err(format!("empty section name on line {}", number + 1));
            }
            sections
                .entry(name.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            current = Some(name.to_string());
        } else if let Some((key, value)) = line.split_once('=') {
            let Some(section) = &current else {
                return Err(format!("option outside of a section on line {}", number + 1));
            };
            let options = sections
                .get_mut(section)
                .and_then(Value::as_object_mut)
                .expect("section was inserted as a mapping");
            options.insert(key.trim().to_lowercase(), coerce_value(value.trim()));
        } else {
            return Err(format!("cannot parse line {}", number + 1));
        }
    }
    Ok(sections)
}

/// Coerces an INI option value, in order: integer, float, boolean, JSON
/// (`{…}` / `[…]`), quoted string (stripped), bare string.
pub(crate) fn coerce_value(raw: &str) -> Value {
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(number) = raw.parse::<i64>() {
            return Value::from(number);
        }
    }
    if raw.contains('.') && !raw.starts_with('.') && !raw.ends_with('.') {
        if let Ok(number) = raw.parse::<f64>() {
            if let Some(number) = serde_json::Number::from_f64(number) {
                return Value::Number(number);
            }
        }
    }
    match raw.to_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => return Value::Bool(true),
        "0" | "no" | "false" | "off" => return Value::Bool(false),
        _ => {}
    }
    if (raw.starts_with('{') && raw.ends_with('}')) || (raw.starts_with('[') && raw.ends_with(']'))
    {
        if let Ok(value) = serde_json::from_str(raw) {
            return value;
        }
    }
    if raw.len() >= 2 {
        let first = raw.chars().next().unwrap();
        let last = raw.chars().last().unwrap();
        if (first == '"' || first == '\'') && last == first {
            return Value::String(raw[1..raw.len() - 1].to_string());
        }
    }
    Value::String(raw.to_string())
}

/// Renders a domain tree back to INI text: top-level mappings become
/// sections, scalar options print in their coercible form, nested structures
/// JSON-encode onto one line.
pub(crate) fn render_ini(sections: &Map<String, Value>) -> Result<String, String> {
    use std::fmt::Write;

    let mut out = String::new();
    for (name, section) in sections {
        let Some(options) = section.as_object() else {
            return Err(format!(
                "top-level value \"{name}\" is not a section mapping"
            ));
        };
        writeln!(out, "[{name}]").unwrap();
        for (key, value) in options {
            writeln!(out, "{key} = {}", render_value(value)).unwrap();
        }
        out.push('\n');
    }
    Ok(out)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            // Quote strings which would coerce into something else.
            if coerce_value(s) != Value::String(s.clone()) {
                format!("\"{s}\"")
            } else {
                s.clone()
            }
        }
        nested => serde_json::to_string(nested).unwrap_or_default(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_coercion() {
        assert_eq!(coerce_value("8080"), json!(8080));
        // All-digit values are integers before they are booleans.
        assert_eq!(coerce_value("1"), json!(1));
        assert_eq!(coerce_value("0"), json!(0));
        assert_eq!(coerce_value("2.5"), json!(2.5));
        assert_eq!(coerce_value("yes"), json!(true));
        assert_eq!(coerce_value("off"), json!(false));
        assert_eq!(coerce_value("{\"a\": 1}"), json!({"a": 1}));
        assert_eq!(coerce_value("[1, 2]"), json!([1, 2]));
        assert_eq!(coerce_value("\"8080\""), json!("8080"));
        assert_eq!(coerce_value("'quoted'"), json!("quoted"));
        assert_eq!(coerce_value("free.dm"), json!("free.dm"));
        assert_eq!(coerce_value("plain"), json!("plain"));
    }

    #[test]
    fn test_parse_sections_and_comments() {
        let text = "\
; leading comment
[network]
name = free.dm
port = 3127
# another comment
[flags]
debug = on
empty =
";
        let sections = parse_ini(text).unwrap();
        assert_eq!(
            Value::Object(sections),
            json!({
                "network": {"name": "free.dm", "port": 3127},
                "flags": {"debug": true, "empty": ""},
            })
        );
    }

    #[test]
    fn test_parse_rejects_orphan_options() {
        assert!(parse_ini("name = value\n").is_err());
        assert!(parse_ini("[]\n").is_err());
    }

    #[test]
    fn test_render_round_trips() {
        let sections = match json!({
            "network": {
                "name": "free.dm",
                "port": 3127,
                "debug": false,
                "ratio": 0.5,
                "hosts": ["a", "b"],
                "nested": {"x": 1},
                "tricky": "42",
            },
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let text = render_ini(&sections).unwrap();
        let reparsed = parse_ini(&text).unwrap();
        assert_eq!(reparsed, sections);
    }

    #[test]
    fn test_render_refuses_scalar_top_level() {
        let sections = match json!({"loose": 5}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert!(render_ini(&sections).is_err());
    }
}
