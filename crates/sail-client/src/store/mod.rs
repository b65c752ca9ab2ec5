//! Parsed content of a single config entry.
//!
//! The format of an entry is chosen by its name suffix: `mysql.toml` is
//! TOML, `redis.properties` is a properties file, and `cfg.custom` is an
//! opaque string stored under its own full name. Structured content is kept
//! as a JSON value tree with lower-cased keys, so lookups are
//! case-insensitive and every format merges the same way.

pub mod format;
pub mod properties;
pub mod value;

use serde_json::{Map, Value};

use crate::error::StoreError;

pub use format::TextFormat;

/// Extension of entries stored as opaque strings.
pub const CUSTOM_EXTENSION: &str = "custom";

/// How an entry's content is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Structured(TextFormat),
    Opaque,
}

impl EntryKind {
    /// Picks the kind from an entry name like `base.ext`.
    pub fn from_name(name: &str) -> Result<Self, StoreError> {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
            .ok_or_else(|| StoreError::UnsupportedFormat(name.to_string()))?;

        if ext.eq_ignore_ascii_case(CUSTOM_EXTENSION) {
            return Ok(EntryKind::Opaque);
        }
        TextFormat::from_extension(ext)
            .map(EntryKind::Structured)
            .ok_or_else(|| StoreError::UnsupportedFormat(ext.to_string()))
    }
}

/// Structured store over one entry's parsed content.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigStore {
    Structured {
        format: TextFormat,
        values: Map<String, Value>,
    },
    Opaque {
        key: String,
        value: String,
    },
}

impl ConfigStore {
    /// Parses plaintext content of the entry `name`.
    pub fn parse(name: &str, content: &str) -> Result<Self, StoreError> {
        match EntryKind::from_name(name)? {
            EntryKind::Opaque => Ok(ConfigStore::Opaque {
                key: name.to_lowercase(),
                value: content.to_string(),
            }),
            EntryKind::Structured(format) => Ok(ConfigStore::Structured {
                format,
                values: lowercase_keys(format.parse(content)?),
            }),
        }
    }

    /// Rebuilds a store from a value tree, as found in the merged cache file.
    pub fn from_value(name: &str, tree: Value) -> Result<Self, StoreError> {
        match EntryKind::from_name(name)? {
            EntryKind::Opaque => {
                let key = name.to_lowercase();
                let raw = match tree {
                    Value::Object(mut map) => map.remove(&key).unwrap_or(Value::Null),
                    other => other,
                };
                Ok(ConfigStore::Opaque {
                    key,
                    value: value::as_string(&raw),
                })
            }
            EntryKind::Structured(format) => match tree {
                Value::Object(map) => Ok(ConfigStore::Structured {
                    format,
                    values: lowercase_keys(map),
                }),
                _ => Err(StoreError::NotATable {
                    format: format.name(),
                }),
            },
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            ConfigStore::Structured { format, .. } => EntryKind::Structured(*format),
            ConfigStore::Opaque { .. } => EntryKind::Opaque,
        }
    }

    /// Looks up a dotted key path, e.g. `sail.project_key`.
    ///
    /// Literal keys containing dots (`mysql.toml`) match before nested paths.
    pub fn get(&self, key: &str) -> Option<Value> {
        let key = key.to_lowercase();
        match self {
            ConfigStore::Structured { values, .. } => search(values, &key).cloned(),
            ConfigStore::Opaque { key: own, value } => {
                (own == &key).then(|| Value::String(value.clone()))
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// The whole content as a JSON object.
    pub fn to_value(&self) -> Value {
        match self {
            ConfigStore::Structured { values, .. } => Value::Object(values.clone()),
            ConfigStore::Opaque { key, value } => {
                let mut map = Map::new();
                map.insert(key.clone(), Value::String(value.clone()));
                Value::Object(map)
            }
        }
    }

    /// Serializes the content back into the entry's own format.
    pub fn serialize(&self) -> Result<String, StoreError> {
        match self {
            ConfigStore::Structured { format, values } => format.serialize(values),
            ConfigStore::Opaque { value, .. } => Ok(value.clone()),
        }
    }
}

/// Deep-merges `src` into `dst`; on collision the value from `src` wins.
pub fn merge_into(dst: &mut Map<String, Value>, src: Map<String, Value>) {
    for (key, value) in src {
        match (dst.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, incoming);
            }
            (_, value) => {
                dst.insert(key, value);
            }
        }
    }
}

fn search<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(value) = map.get(path) {
        return Some(value);
    }
    for (idx, _) in path.match_indices('.') {
        let (head, tail) = (&path[..idx], &path[idx + 1..]);
        if let Some(Value::Object(child)) = map.get(head) {
            if let Some(found) = search(child, tail) {
                return Some(found);
            }
        }
    }
    None
}

fn lowercase_keys(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(k, v)| (k.to_lowercase(), lowercase_value(v)))
        .collect()
}

fn lowercase_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(lowercase_keys(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_value).collect()),
        other => other,
    }
}
