use serde_json::{Map, Number, Value};

use super::properties;
use crate::error::StoreError;

/// Structured text formats an entry can be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Toml,
    Json,
    Yaml,
    Properties,
}

impl TextFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "toml" => Some(TextFormat::Toml),
            "json" => Some(TextFormat::Json),
            "yaml" | "yml" => Some(TextFormat::Yaml),
            "properties" | "props" | "prop" => Some(TextFormat::Properties),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TextFormat::Toml => "toml",
            TextFormat::Json => "json",
            TextFormat::Yaml => "yaml",
            TextFormat::Properties => "properties",
        }
    }

    pub fn parse(&self, content: &str) -> Result<Map<String, Value>, StoreError> {
        match self {
            TextFormat::Toml => {
                let table: toml::Table =
                    toml::from_str(content).map_err(|e| StoreError::Toml(e.to_string()))?;
                Ok(table
                    .into_iter()
                    .map(|(k, v)| (k, toml_to_json(v)))
                    .collect())
            }
            TextFormat::Json | TextFormat::Yaml if content.trim().is_empty() => Ok(Map::new()),
            TextFormat::Json => into_table(serde_json::from_str(content)?, self.name()),
            TextFormat::Yaml => into_table(serde_yaml::from_str(content)?, self.name()),
            TextFormat::Properties => properties::parse(content),
        }
    }

    pub fn serialize(&self, values: &Map<String, Value>) -> Result<String, StoreError> {
        match self {
            TextFormat::Toml => {
                let table = json_to_toml_table(values, "")?;
                toml::to_string(&table).map_err(|e| StoreError::Toml(e.to_string()))
            }
            TextFormat::Json => Ok(serde_json::to_string_pretty(values)?),
            TextFormat::Yaml => Ok(serde_yaml::to_string(values)?),
            TextFormat::Properties => Ok(properties::write(values)),
        }
    }
}

fn into_table(value: Value, format: &'static str) -> Result<Map<String, Value>, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(StoreError::NotATable { format }),
    }
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

fn json_to_toml_table(values: &Map<String, Value>, path: &str) -> Result<toml::Table, StoreError> {
    let mut table = toml::Table::new();
    for (key, value) in values {
        let child_path = if path.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", path, key)
        };
        if let Some(converted) = json_to_toml(value, &child_path)? {
            table.insert(key.clone(), converted);
        }
    }
    Ok(table)
}

// TOML has no null; nulls are dropped.
fn json_to_toml(value: &Value, path: &str) -> Result<Option<toml::Value>, StoreError> {
    let converted = match value {
        Value::Null => return Ok(None),
        Value::Bool(b) => toml::Value::Boolean(*b),
        Value::String(s) => toml::Value::String(s.clone()),
        Value::Number(n) => match n.as_i64() {
            Some(i) => toml::Value::Integer(i),
            None => toml::Value::Float(n.as_f64().ok_or_else(|| StoreError::Unrepresentable {
                key: path.to_string(),
                format: "toml",
            })?),
        },
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if let Some(converted) = json_to_toml(item, path)? {
                    out.push(converted);
                }
            }
            toml::Value::Array(out)
        }
        Value::Object(map) => toml::Value::Table(json_to_toml_table(map, path)?),
    };
    Ok(Some(converted))
}
