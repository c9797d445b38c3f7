use crate::token::{Segment, Token};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::RwLock;

/// Registry of per-domain model schemas.
///
/// A registered model is a JSON-Schema fragment: either a proper schema
/// (carrying a `type`) describing the whole domain, or a bag whose entries
/// map top-level property names to their sub-schemas. The registry computes
/// schema defaults and validates values against the sub-schema a token
/// resolves to.
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Value>>,
}

lazy_static::lazy_static! {
    static ref GLOBAL: ModelRegistry = ModelRegistry::new();
}

/// The process-global registry consulted by stores which are not constructed
/// with their own.
pub fn global() -> &'static ModelRegistry {
    &GLOBAL
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the model schema for a domain.
    pub fn register(&self, domain: &str, schema: Value) {
        self.models
            .write()
            .unwrap()
            .insert(domain.to_lowercase(), schema);
    }

    pub fn unregister(&self, domain: &str) {
        self.models.write().unwrap().remove(&domain.to_lowercase());
    }

    pub fn schema(&self, domain: &str) -> Option<Value> {
        self.models
            .read()
            .unwrap()
            .get(&domain.to_lowercase())
            .cloned()
    }

    /// Computes the default value for a token from its domain's schema:
    /// `array` schemas default to `[]`, `object` schemas to a map of their
    /// required (or, absent `required`, all) properties recursively
    /// defaulted, scalars to their declared `default` or null. A bare `[]`
    /// or `+` segment collapses to `[]`. Returns `None` when no schema
    /// resolves for the token.
    pub fn default_value(&self, token: &str) -> Option<Value> {
        let token: Token = token.parse().ok()?;
        let root = self.schema(token.domain())?;

        if token.is_domain_only() {
            return Some(build_default(&root));
        }

        let mut segments = token.segments().iter();
        let mut schema = match segments.next() {
            Some(Segment::Key(key)) => top_property(&root, key)?.clone(),
            Some(Segment::Append) | Some(Segment::Wildcard) => {
                return Some(Value::Array(Vec::new()))
            }
            _ => return None,
        };

        for segment in segments {
            match segment {
                Segment::Index(_) if schema_type(&schema) == Some("array") => {
                    schema = schema.get("items")?.clone();
                }
                // A collection segment always defaults to an empty one.
                Segment::Append | Segment::Wildcard => return Some(Value::Array(Vec::new())),
                Segment::Key(key) => {
                    schema = sub_property(&schema, key)?.clone();
                }
                Segment::Index(_) => return None,
            }
        }
        Some(build_default(&schema))
    }
}

/// Looks up the schema of a top-level domain property: from `properties`
/// when the model is a proper schema, directly from the bag otherwise.
pub(crate) fn top_property<'s>(root: &'s Value, key: &str) -> Option<&'s Value> {
    match root.get("properties").and_then(Value::as_object) {
        Some(properties) => properties.get(key),
        None => root.as_object()?.get(key),
    }
}

/// Looks up a key below `schema`: as a direct entry, under `properties`, or
/// under `items.properties` for arrays of objects.
pub(crate) fn sub_property<'s>(schema: &'s Value, key: &str) -> Option<&'s Value> {
    if let Some(found) = schema.get(key) {
        return Some(found);
    }
    if let Some(properties) = schema.get("properties") {
        return properties.get(key);
    }
    schema.get("items")?.get("properties")?.get(key)
}

pub(crate) fn schema_type(schema: &Value) -> Option<&str> {
    schema.get("type").and_then(Value::as_str)
}

/// Builds the default data structure described by a schema fragment.
pub(crate) fn build_default(schema: &Value) -> Value {
    match schema_type(schema) {
        Some("array") => Value::Array(Vec::new()),
        Some("object") => {
            let properties = schema
                .get("properties")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let required: Option<Vec<&str>> = schema
                .get("required")
                .and_then(Value::as_array)
                .map(|keys| keys.iter().filter_map(Value::as_str).collect());

            let mut default = Map::new();
            for (key, sub) in &properties {
                if let Some(required) = &required {
                    if !required.contains(&key.as_str()) {
                        continue;
                    }
                }
                let value = match schema_type(sub) {
                    Some("array") | Some("object") => build_default(sub),
                    _ => sub.get("default").cloned().unwrap_or(Value::Null),
                };
                default.insert(key.clone(), value);
            }
            Value::Object(default)
        }
        Some(_) => schema.get("default").cloned().unwrap_or(Value::Null),
        None => match schema.as_object() {
            // A bag of property schemas: default every entry.
            Some(bag) => {
                let mut default = Map::new();
                for (key, sub) in bag {
                    default.insert(key.clone(), build_default(sub));
                }
                Value::Object(default)
            }
            None => Value::Null,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn registry() -> ModelRegistry {
        let registry = ModelRegistry::new();
        registry.register(
            "daemon",
            json!({
                "general": {
                    "type": "object",
                    "required": ["version", "workers"],
                    "properties": {
                        "version": {"type": "string", "default": "0.1.0"},
                        "workers": {"type": "integer", "default": 4, "minimum": 1},
                        "comment": {"type": "string"},
                    },
                },
                "listeners": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {"port": {"type": "integer", "default": 5000}},
                    },
                },
            }),
        );
        registry
    }

    #[test]
    fn test_scalar_default() {
        let registry = registry();
        assert_eq!(
            registry.default_value("daemon.general.version"),
            Some(json!("0.1.0"))
        );
        assert_eq!(registry.default_value("daemon.general.workers"), Some(json!(4)));
        // Declared without a default.
        assert_eq!(
            registry.default_value("daemon.general.comment"),
            Some(Value::Null)
        );
    }

    #[test]
    fn test_collection_defaults() {
        let registry = registry();
        assert_eq!(registry.default_value("daemon.listeners"), Some(json!([])));
        assert_eq!(registry.default_value("daemon.listeners.[]"), Some(json!([])));
        // An element of the collection defaults from the items schema.
        assert_eq!(
            registry.default_value("daemon.listeners.0"),
            Some(json!({"port": 5000}))
        );
        assert_eq!(
            registry.default_value("daemon.listeners.0.port"),
            Some(json!(5000))
        );
    }

    #[test]
    fn test_object_default_covers_required_keys() {
        let registry = registry();
        assert_eq!(
            registry.default_value("daemon.general"),
            Some(json!({"version": "0.1.0", "workers": 4}))
        );
    }

    #[test]
    fn test_whole_domain_default() {
        let registry = registry();
        assert_eq!(
            registry.default_value("daemon"),
            Some(json!({
                "general": {"version": "0.1.0", "workers": 4},
                "listeners": [],
            }))
        );
    }

    #[test]
    fn test_unknown_tokens() {
        let registry = registry();
        assert_eq!(registry.default_value("nosuch.key"), None);
        assert_eq!(registry.default_value("daemon.nosuch"), None);
        assert_eq!(registry.default_value(""), None);
    }
}
