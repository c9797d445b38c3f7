use models::{parse_key_path, Segment};
use serde_json::{Map, Value};

/// Lookup failure inside a data object's tree.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("key \"{key}\" of token \"{token}\" not found")]
    NotFound { token: String, key: String },
    #[error("key \"{key}\" of token \"{token}\" is out of index")]
    OutOfIndex { token: String, key: String },
    #[error("token \"{token}\" lookup failed ({reason})")]
    Mismatch { token: String, reason: String },
}

impl LookupError {
    fn not_found(token: &str, key: impl ToString) -> Self {
        LookupError::NotFound {
            token: token.to_string(),
            key: key.to_string(),
        }
    }

    fn mismatch(token: &str, reason: impl Into<String>) -> Self {
        LookupError::Mismatch {
            token: token.to_string(),
            reason: reason.into(),
        }
    }
}

/// A data object is the materialized state of one thematic data domain: a
/// mutable nested tree addressed by key paths, an optional backend
/// descriptor, and an ordered change log of tokens whose values were written
/// since the last sync.
#[derive(Debug, Default)]
pub struct DataObject {
    data: Map<String, Value>,
    backend: Option<String>,
    changed: Vec<String>,
    syncing: bool,
}

impl DataObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Map<String, Value>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn with_backend(data: Map<String, Value>, backend: impl Into<String>) -> Self {
        Self {
            data,
            backend: Some(backend.into()),
            ..Self::default()
        }
    }

    /// The opaque backend descriptor (a file path, a database URI, ...).
    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// The whole tree as one value.
    pub fn as_value(&self) -> Value {
        Value::Object(self.data.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn syncing(&self) -> bool {
        self.syncing
    }

    pub fn set_syncing(&mut self, syncing: bool) {
        self.syncing = syncing;
    }

    /// Whether changes are pending a sync to the backend.
    pub fn tainted(&self) -> bool {
        !self.changed.is_empty()
    }

    /// Adds a token to the change log, once.
    pub fn set_tainted(&mut self, token: &str) {
        if !self.changed.iter().any(|t| t == token) {
            self.changed.push(token.to_string());
        }
    }

    pub fn remove_tainted(&mut self, token: &str) {
        self.changed.retain(|t| t != token);
    }

    pub fn clear_tainted(&mut self) {
        self.changed.clear();
    }

    /// Returns the reduced change log: tokens are sorted, and a token whose
    /// strict (dot-boundary) prefix is already listed is swallowed by it, so
    /// one coarse sync covers all finer changes below it. A logged change of
    /// the whole domain reduces to the single token `*`.
    pub fn get_tainted(&mut self, reset: bool) -> Vec<String> {
        let tokens = if reset {
            std::mem::take(&mut self.changed)
        } else {
            self.changed.clone()
        };
        reduce_tainted(tokens)
    }

    /// Replaces this object's contents in place, without changing its
    /// identity: observers holding a reference see the new data. The other
    /// object's backend descriptor is adopted, and its taint log inherited
    /// when non-empty (cleared otherwise).
    pub fn update_data(&mut self, other: DataObject) {
        self.data = other.data;
        if other.backend.is_some() {
            self.backend = other.backend;
        }
        if other.changed.is_empty() {
            self.changed.clear();
        } else {
            self.changed = other.changed;
        }
    }

    /// Retrieves the value at the given key path. An empty path returns the
    /// whole domain tree. Integer segments index sequences and fall back to
    /// string lookup in mappings; `[]` yields the collection itself; `+`
    /// yields all children and projects any remaining path through every one
    /// of them.
    pub fn get_value(&self, key_path: &str) -> Result<Value, LookupError> {
        let segments = parse_key_path(key_path)
            .map_err(|err| LookupError::mismatch(key_path, err.to_string()))?;
        if segments.is_empty() {
            return Ok(self.as_value());
        }
        let root = Value::Object(self.data.clone());
        resolve(&root, &segments, key_path)
    }

    /// Writes a value at the given key path, creating intermediate
    /// containers as needed, and records the canonical written token (with
    /// `[]` segments resolved to concrete indices) in the change log.
    /// Returns that canonical token.
    pub fn set_value(&mut self, key_path: &str, value: Value) -> Result<String, LookupError> {
        let segments = parse_key_path(key_path)
            .map_err(|err| LookupError::mismatch(key_path, err.to_string()))?;

        if segments.is_empty() {
            // Merge the value into the domain root.
            let Value::Object(entries) = value else {
                return Err(LookupError::mismatch(
                    key_path,
                    "only a mapping can be set as the whole domain",
                ));
            };
            for (key, entry) in entries {
                self.data.insert(key, entry);
            }
            self.set_tainted("");
            return Ok(String::new());
        }

        let mut root = Value::Object(std::mem::take(&mut self.data));
        let result = write(&mut root, &segments, value, key_path);
        self.data = match root {
            Value::Object(map) => map,
            _ => unreachable!("domain root stays a mapping"),
        };

        let canonical = result?;
        self.set_tainted(&canonical);
        Ok(canonical)
    }
}

/// Reduces a raw change log: tokens sort and de-duplicate, a token whose
/// strict dot-boundary prefix is already listed is swallowed by that prefix,
/// and a logged whole-domain change (the empty token) collapses the whole
/// log to `*`.
fn reduce_tainted(mut tokens: Vec<String>) -> Vec<String> {
    if tokens.iter().any(|token| token.is_empty()) {
        return vec!["*".to_string()];
    }
    tokens.sort();
    tokens.dedup();

    let mut reduced: Vec<String> = Vec::new();
    for token in tokens {
        let swallowed = reduced.last().map_or(false, |prev| {
            token.starts_with(prev.as_str()) && token.as_bytes().get(prev.len()) == Some(&b'.')
        });
        if !swallowed {
            reduced.push(token);
        }
    }
    reduced
}

fn numeric_keys(map: &Map<String, Value>) -> bool {
    !map.is_empty()
        && map
            .keys()
            .all(|k| !k.is_empty() && k.bytes().all(|b| b.is_ascii_digit()))
}

/// Children of a collection under the `+` wildcard: raw values for numeric
/// keys and sequence elements, single-key wrappers for named mapping keys.
fn wildcard_children(data: &Value) -> Option<Vec<Value>> {
    match data {
        Value::Object(map) => Some(
            map.iter()
                .map(|(k, v)| {
                    if k.bytes().all(|b| b.is_ascii_digit()) && !k.is_empty() {
                        v.clone()
                    } else {
                        let mut wrapper = Map::new();
                        wrapper.insert(k.clone(), v.clone());
                        Value::Object(wrapper)
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Some(items.clone()),
        _ => None,
    }
}

fn resolve(data: &Value, segments: &[Segment], token: &str) -> Result<Value, LookupError> {
    let Some((segment, rest)) = segments.split_first() else {
        return Ok(data.clone());
    };

    match segment {
        Segment::Index(index) => {
            let next = match data {
                Value::Object(map) => map.get(&index.to_string()),
                Value::Array(items) => items.get(*index),
                _ => None,
            };
            match next {
                Some(found) => resolve(found, rest, token),
                None if data.is_array() => Err(LookupError::OutOfIndex {
                    token: token.to_string(),
                    key: index.to_string(),
                }),
                None => Err(LookupError::not_found(token, index)),
            }
        }
        Segment::Append => {
            // `[]` addresses the collection itself; numeric-keyed mappings
            // count as one.
            let collection = match data {
                Value::Object(map) if numeric_keys(map) => {
                    let mut entries: Vec<(usize, &Value)> = map
                        .iter()
                        .map(|(k, v)| (k.parse::<usize>().unwrap_or(usize::MAX), v))
                        .collect();
                    entries.sort_by_key(|(k, _)| *k);
                    Value::Array(entries.into_iter().map(|(_, v)| v.clone()).collect())
                }
                Value::Array(_) => data.clone(),
                _ => {
                    return Err(LookupError::mismatch(
                        token,
                        "key \"[]\" cannot be resolved as collection",
                    ))
                }
            };
            resolve(&collection, rest, token)
        }
        Segment::Wildcard => {
            // A terminal `+` yields the children themselves, named keys
            // wrapped; with more path to walk, it projects through the raw
            // child values instead.
            if rest.is_empty() {
                let children = wildcard_children(data).ok_or_else(|| {
                    LookupError::mismatch(token, "key \"+\" cannot be resolved as collection")
                })?;
                return Ok(Value::Array(children));
            }
            let values: Vec<Value> = match data {
                Value::Object(map) => map.values().cloned().collect(),
                Value::Array(items) => items.clone(),
                _ => {
                    return Err(LookupError::mismatch(
                        token,
                        "key \"+\" cannot be resolved as collection",
                    ))
                }
            };
            let mut projected = Vec::new();
            for child in &values {
                if let Ok(found) = resolve(child, rest, token) {
                    projected.push(found);
                }
            }
            if projected.is_empty() && !values.is_empty() {
                Err(LookupError::not_found(token, "+"))
            } else {
                Ok(Value::Array(projected))
            }
        }
        Segment::Key(key) => match data {
            Value::Object(map) => match map.get(key) {
                Some(found) => resolve(found, rest, token),
                None => Err(LookupError::not_found(token, key)),
            },
            Value::Array(items) => {
                // A plain key applied to a sequence projects through every
                // element which carries it.
                let collected: Vec<Value> = items
                    .iter()
                    .filter_map(|item| item.get(key).cloned())
                    .collect();
                if collected.is_empty() {
                    Err(LookupError::mismatch(
                        token,
                        format!("key \"{key}\" not set in any objects"),
                    ))
                } else {
                    resolve(&Value::Array(collected), rest, token)
                }
            }
            _ => Err(LookupError::mismatch(
                token,
                format!("key/value mismatch for \"{key}\""),
            )),
        },
    }
}

/// Walks the tree creating locations as needed and writes `value` at the
/// final one. Missing or scalar intermediates are instantiated as a mapping
/// or sequence depending on the upcoming segment.
fn write(
    root: &mut Value,
    segments: &[Segment],
    value: Value,
    token: &str,
) -> Result<String, LookupError> {
    let mut canonical: Vec<String> = Vec::with_capacity(segments.len());
    let mut value = Some(value);
    let mut cursor = root;

    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();

        if !cursor.is_object() && !cursor.is_array() {
            *cursor = match segment {
                Segment::Key(_) => Value::Object(Map::new()),
                _ => Value::Array(Vec::new()),
            };
        }

        cursor = match segment {
            Segment::Key(key) => {
                canonical.push(key.clone());
                match cursor {
                    Value::Object(map) => {
                        let entry = map.entry(key.clone()).or_insert(Value::Null);
                        if last {
                            *entry = value.take().unwrap();
                        }
                        entry
                    }
                    Value::Array(items) => {
                        // A trailing key lands on the newest element of the
                        // sequence.
                        if !last {
                            return Err(LookupError::mismatch(
                                token,
                                format!("key \"{key}\" cannot descend through a sequence"),
                            ));
                        }
                        match items.last_mut() {
                            Some(Value::Object(tail)) => {
                                tail.insert(key.clone(), value.take().unwrap());
                                break;
                            }
                            _ => {
                                return Err(LookupError::mismatch(
                                    token,
                                    format!("key \"{key}\" requires a mapping element"),
                                ))
                            }
                        }
                    }
                    _ => unreachable!("cursor was normalized to a container"),
                }
            }
            Segment::Index(index) => {
                canonical.push(index.to_string());
                match cursor {
                    Value::Array(items) => {
                        // Pad the sequence with nulls up to the index.
                        if items.len() <= *index {
                            items.resize(*index + 1, Value::Null);
                        }
                        if last {
                            items[*index] = value.take().unwrap();
                        }
                        &mut items[*index]
                    }
                    Value::Object(map) => {
                        let entry = map.entry(index.to_string()).or_insert(Value::Null);
                        if last {
                            *entry = value.take().unwrap();
                        }
                        entry
                    }
                    _ => unreachable!("cursor was normalized to a container"),
                }
            }
            Segment::Append => match cursor {
                Value::Array(items) => {
                    canonical.push(items.len().to_string());
                    items.push(if last {
                        value.take().unwrap()
                    } else {
                        Value::Null
                    });
                    items.last_mut().unwrap()
                }
                Value::Object(map) => {
                    // On a mapping, `[]` allocates the next integer key.
                    let next = map
                        .keys()
                        .filter_map(|k| k.parse::<usize>().ok())
                        .max()
                        .map(|max| max + 1)
                        .unwrap_or(0)
                        .to_string();
                    canonical.push(next.clone());
                    let entry = map.entry(next).or_insert(Value::Null);
                    if last {
                        *entry = value.take().unwrap();
                    }
                    entry
                }
                _ => unreachable!("cursor was normalized to a container"),
            },
            Segment::Wildcard => {
                return Err(LookupError::mismatch(
                    token,
                    "wildcard segments cannot be written",
                ))
            }
        };
    }

    Ok(canonical.join("."))
}
