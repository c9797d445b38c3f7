use crate::registry::{schema_type, sub_property, top_property, ModelRegistry};
use crate::token::{Segment, Token};
use serde_json::{Map, Value};

/// Result of checking one value against the sub-schema its token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Accept,
    /// Accepted, but the traversal ran past the registered schema coverage.
    AcceptWarn(String),
    Reject(String),
}

impl ModelRegistry {
    /// Returns the value when it passes validation against the token's model
    /// schema, `None` when validation rejects it. Values without schema
    /// coverage pass with a logged note; only an actual schema mismatch (or
    /// running past a schema with `additionalProperties: false`) rejects.
    pub fn validated_value(&self, token: &str, value: &Value) -> Option<Value> {
        match self.check(token, value) {
            Outcome::Accept => Some(value.clone()),
            Outcome::AcceptWarn(warning) => {
                tracing::debug!(token, %warning, "accepting value without schema coverage");
                Some(value.clone())
            }
            Outcome::Reject(reason) => {
                tracing::warn!(token, %reason, "value failed model validation");
                None
            }
        }
    }

    /// Thin wrapper surfacing the first validation failure reason.
    pub fn is_valid(&self, token: &str, value: &Value) -> (bool, Result<Value, String>) {
        match self.check(token, value) {
            Outcome::Accept | Outcome::AcceptWarn(_) => (true, Ok(value.clone())),
            Outcome::Reject(reason) => (false, Err(reason)),
        }
    }

    fn check(&self, token: &str, value: &Value) -> Outcome {
        let parsed: Token = match token.parse() {
            Ok(parsed) => parsed,
            Err(err) => return Outcome::Reject(err.to_string()),
        };
        let Some(root) = self.schema(parsed.domain()) else {
            return Outcome::AcceptWarn(format!(
                "no model registered for domain \"{}\"",
                parsed.domain()
            ));
        };

        let segments = parsed.segments();
        if segments.is_empty() {
            return check_domain(token, &root, value);
        }

        if segments[0] == Segment::Wildcard {
            // At the first position there is no enclosing collection schema
            // the `[]` substitution could resolve against; children validate
            // strictly under their own keys.
            return self.check_wildcard(parsed.domain(), &[], &segments[1..], value, false);
        }
        let first = match &segments[0] {
            Segment::Key(key) => key.as_str(),
            other => {
                return Outcome::AcceptWarn(format!(
                    "no model schema addressable by \"{}.{}\"",
                    parsed.domain(),
                    other
                ))
            }
        };
        let Some(mut schema) = top_property(&root, first).cloned() else {
            return Outcome::AcceptWarn(format!(
                "no model schema for token \"{}.{}.*\"",
                parsed.domain(),
                first
            ));
        };

        let has_append = segments.contains(&Segment::Append);
        let has_index = segments.iter().any(Segment::is_index);

        for (i, segment) in segments.iter().enumerate().skip(1) {
            let last = i + 1 == segments.len();
            let resolved = match segment {
                Segment::Wildcard => {
                    return self.check_wildcard(
                        parsed.domain(),
                        &segments[..i],
                        &segments[i + 1..],
                        value,
                        true,
                    );
                }
                Segment::Index(_) | Segment::Append
                    if schema_type(&schema) == Some("array") =>
                {
                    if last {
                        // A terminal collection member validates against the
                        // collection schema itself (wrapped below).
                        Some(schema.clone())
                    } else {
                        schema.get("items").cloned()
                    }
                }
                Segment::Key(key) => sub_property(&schema, key).cloned(),
                // A member of a collection previously addressed by `[]`
                // keeps the collection's schema.
                Segment::Index(_) if has_append => Some(schema.clone()),
                Segment::Index(_) | Segment::Append => None,
            };
            match resolved {
                Some(next) => schema = next,
                None => return past_schema(token, &schema),
            }
        }

        let prepared = normalize_collections(value);
        if schema_type(&schema) == Some("array") && has_index && !prepared.is_array() {
            // A single member of a collection is validated as a one-element
            // list against the collection schema.
            validate_instance(token, &schema, &Value::Array(vec![prepared]))
        } else if schema_type(&schema) != Some("array") && has_append {
            match &prepared {
                // Every element of the collection is checked individually;
                // the first invalid element fails the whole list.
                Value::Array(items) => {
                    for item in items {
                        match validate_instance(token, &schema, item) {
                            Outcome::Accept => {}
                            other => return other,
                        }
                    }
                    Outcome::Accept
                }
                _ => validate_instance(token, &schema, &prepared),
            }
        } else {
            validate_instance(token, &schema, &prepared)
        }
    }

    /// Validates a wildcard position by substituting the `+` per child:
    /// first by the child's own key, then by `[]`, accepting whichever
    /// validates first.
    fn check_wildcard(
        &self,
        domain: &str,
        before: &[Segment],
        after: &[Segment],
        value: &Value,
        collection_fallback: bool,
    ) -> Outcome {
        let prefix = join_token(domain, before, None, &[]);
        let substituted = |mid: &Segment| join_token(domain, before, Some(mid), after);

        let check_entry = |key: &str, child: &Value| -> Outcome {
            let attempt = self.check(&substituted(&Segment::Key(key.to_string())), child);
            if !collection_fallback || !matches!(attempt, Outcome::Reject(_)) {
                return attempt;
            }
            // Second attempt: the wildcard stands for a collection.
            let mut wrapper = Map::new();
            wrapper.insert(key.to_string(), child.clone());
            self.check(
                &substituted(&Segment::Append),
                &Value::Array(vec![Value::Object(wrapper)]),
            )
        };

        let mut warning = None;
        let mut note = |outcome: Outcome| -> Option<Outcome> {
            match outcome {
                Outcome::Accept => None,
                Outcome::AcceptWarn(w) => {
                    warning.get_or_insert(w);
                    None
                }
                reject => Some(reject),
            }
        };

        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    if let Some(reject) = note(check_entry(key, child)) {
                        return reject;
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    let outcome = match item {
                        Value::Object(map) if map.len() == 1 => {
                            let (key, child) = map.iter().next().unwrap();
                            check_entry(key, child)
                        }
                        Value::Object(_) if after.is_empty() => {
                            // A multi-key element validates whole against the
                            // wildcard-less token.
                            self.check(&prefix, item)
                        }
                        Value::Array(_) => self.check(&substituted(&Segment::Append), item),
                        _ => {
                            // A scalar element; an invalid one fails the
                            // whole list at once.
                            match self.check(&substituted(&Segment::Append), item) {
                                Outcome::Reject(reason) => return Outcome::Reject(reason),
                                other => other,
                            }
                        }
                    };
                    if let Some(reject) = note(outcome) {
                        return reject;
                    }
                }
            }
            _ => {
                if let Some(reject) = note(self.check(&substituted(&Segment::Append), value)) {
                    return reject;
                }
            }
        }
        match warning {
            Some(warning) => Outcome::AcceptWarn(warning),
            None => Outcome::Accept,
        }
    }
}

/// Validation of a whole domain object against its model.
fn check_domain(token: &str, root: &Value, value: &Value) -> Outcome {
    if schema_type(root).is_some() {
        return validate_instance(token, root, &normalize_collections(value));
    }
    let Some(bag) = root.as_object() else {
        return Outcome::AcceptWarn(format!("model for \"{token}\" is not an object"));
    };
    let Some(object) = value.as_object() else {
        return Outcome::AcceptWarn(format!(
            "domain \"{token}\" value is not an object; nothing addressable to validate"
        ));
    };

    let missing: Vec<&str> = bag
        .keys()
        .filter(|k| !object.contains_key(*k))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Outcome::AcceptWarn(format!(
            "domain data does not define values for: {}",
            missing.join(", ")
        ));
    }
    let extra: Vec<&str> = object
        .keys()
        .filter(|k| !bag.contains_key(*k))
        .map(String::as_str)
        .collect();
    if !extra.is_empty() {
        return Outcome::Reject(format!(
            "domain data contains additional values ({})",
            extra.join(", ")
        ));
    }
    for (key, sub) in bag {
        match validate_instance(token, sub, &normalize_collections(&object[key])) {
            Outcome::Accept => {}
            other => return other,
        }
    }
    Outcome::Accept
}

fn past_schema(token: &str, schema: &Value) -> Outcome {
    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        Outcome::Reject(format!(
            "no validation schema found for token \"{token}\" and the model does not allow additional properties"
        ))
    } else if matches!(schema_type(schema), Some("object") | None) {
        Outcome::AcceptWarn(format!("no validation schema found for token \"{token}\""))
    } else {
        Outcome::Reject(format!(
            "token \"{token}\" refers to a sub-element of a scalar \"{}\" property",
            schema_type(schema).unwrap_or("unknown")
        ))
    }
}

fn validate_instance(token: &str, schema: &Value, instance: &Value) -> Outcome {
    match jsonschema::validator_for(schema) {
        Ok(validator) => match validator.validate(instance) {
            Ok(()) => Outcome::Accept,
            Err(err) => Outcome::Reject(err.to_string()),
        },
        Err(err) => {
            Outcome::AcceptWarn(format!("model schema for \"{token}\" is malformed ({err})"))
        }
    }
}

fn join_token(domain: &str, before: &[Segment], mid: Option<&Segment>, after: &[Segment]) -> String {
    let mut out = domain.to_string();
    for segment in before {
        out.push('.');
        out.push_str(&segment.to_string());
    }
    if let Some(mid) = mid {
        out.push('.');
        out.push_str(&mid.to_string());
        for segment in after {
            out.push('.');
            out.push_str(&segment.to_string());
        }
    }
    out
}

/// Reshapes every mapping whose keys are all decimal integers into a
/// sequence, ordered by the integer value of its keys. Purely computational:
/// the input is never mutated.
pub fn normalize_collections(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let numeric = !map.is_empty()
                && map
                    .keys()
                    .all(|k| !k.is_empty() && k.bytes().all(|b| b.is_ascii_digit()));
            if numeric {
                let mut entries: Vec<(u64, &Value)> = map
                    .iter()
                    .map(|(k, v)| (k.parse::<u64>().unwrap_or(u64::MAX), v))
                    .collect();
                entries.sort_by_key(|(k, _)| *k);
                Value::Array(
                    entries
                        .into_iter()
                        .map(|(_, v)| normalize_collections(v))
                        .collect(),
                )
            } else {
                Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), normalize_collections(v)))
                        .collect(),
                )
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_collections).collect()),
        other => other.clone(),
    }
}
