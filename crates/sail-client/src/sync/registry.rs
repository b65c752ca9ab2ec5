//! Live in-memory state: entry name to parsed content.
//!
//! Entries are immutable and shared behind `Arc`; an update swaps the whole
//! entry under the write lock. The map is ordered by name so merges and
//! persistence are deterministic.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value};

use crate::error::{Result, SailError};
use crate::store::{merge_into, ConfigStore};

/// Where an entry's content was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Remote,
    Disk,
}

/// One named config unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEntry {
    pub name: String,
    /// Plaintext content as received, after decryption.
    pub raw: Vec<u8>,
    pub origin: Origin,
    pub store: ConfigStore,
}

impl ConfigEntry {
    /// Parses plaintext `content` for the entry `name`.
    pub fn parse(name: &str, content: &str, origin: Origin) -> Result<Self> {
        let store = ConfigStore::parse(name, content).map_err(|source| SailError::Decode {
            name: name.to_string(),
            source,
        })?;
        Ok(Self {
            name: name.to_string(),
            raw: content.as_bytes().to_vec(),
            origin,
            store,
        })
    }
}

#[derive(Debug, Default)]
pub struct ConfigStoreRegistry {
    entries: RwLock<BTreeMap<String, Arc<ConfigEntry>>>,
}

impl ConfigStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<ConfigEntry>>> {
        match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Config registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<ConfigEntry>>> {
        match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Config registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Looks `key` up across every entry.
    ///
    /// Fails with [`SailError::AmbiguousKey`] when more than one entry
    /// defines it.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self.read();
        let mut found: Option<Value> = None;
        let mut owners = Vec::new();
        for (name, entry) in entries.iter() {
            if let Some(value) = entry.store.get(key) {
                owners.push(name.clone());
                found.get_or_insert(value);
            }
        }
        if owners.len() > 1 {
            return Err(SailError::AmbiguousKey {
                key: key.to_string(),
                entries: owners,
            });
        }
        Ok(found)
    }

    /// Looks `key` up in the entry `name` only.
    pub fn get_in(&self, name: &str, key: &str) -> Option<Value> {
        self.read().get(name).and_then(|entry| entry.store.get(key))
    }

    pub fn entry(&self, name: &str) -> Option<Arc<ConfigEntry>> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Every entry, in name order.
    pub fn snapshot(&self) -> Vec<Arc<ConfigEntry>> {
        self.read().values().cloned().collect()
    }

    /// Swaps in `entry`, returning the one it replaced.
    pub fn replace(&self, entry: ConfigEntry) -> Option<Arc<ConfigEntry>> {
        let entry = Arc::new(entry);
        self.write().insert(entry.name.clone(), entry)
    }

    /// Swaps in every entry under a single write lock.
    pub fn replace_all(&self, entries: impl IntoIterator<Item = ConfigEntry>) {
        let mut map = self.write();
        for entry in entries {
            map.insert(entry.name.clone(), Arc::new(entry));
        }
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Deep-merges every entry's content in name order; later entries win.
    pub fn merge_all(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for entry in self.snapshot() {
            if let Value::Object(values) = entry.store.to_value() {
                merge_into(&mut merged, values);
            }
        }
        merged
    }

    /// Nests every entry's content under its own name.
    pub fn merge_all_namespaced(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for entry in self.snapshot() {
            let mut nested = Map::new();
            nested.insert(entry.name.clone(), entry.store.to_value());
            merge_into(&mut merged, nested);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> ConfigStoreRegistry {
        let registry = ConfigStoreRegistry::new();
        registry.replace_all(vec![
            ConfigEntry::parse("mysql.toml", "database = \"127.0.0.1:3306\"\nport = 3306", Origin::Remote).unwrap(),
            ConfigEntry::parse("redis.properties", "host=0.0.0.0\nport=6379", Origin::Remote).unwrap(),
            ConfigEntry::parse("cfg.custom", "CA", Origin::Remote).unwrap(),
        ]);
        registry
    }

    #[test]
    fn test_get_unique_and_missing() {
        let registry = registry();
        assert_eq!(registry.get("database").unwrap(), Some(json!("127.0.0.1:3306")));
        assert_eq!(registry.get("host").unwrap(), Some(json!("0.0.0.0")));
        assert_eq!(registry.get("cfg.custom").unwrap(), Some(json!("CA")));
        assert_eq!(registry.get("missing").unwrap(), None);
    }

    #[test]
    fn test_get_ambiguous_names_every_owner() {
        let registry = registry();
        match registry.get("port") {
            Err(SailError::AmbiguousKey { key, entries }) => {
                assert_eq!(key, "port");
                assert_eq!(entries, vec!["mysql.toml", "redis.properties"]);
            }
            other => panic!("expected ambiguity, got {:?}", other),
        }
        assert_eq!(registry.get_in("mysql.toml", "port"), Some(json!(3306)));
        assert_eq!(registry.get_in("redis.properties", "port"), Some(json!("6379")));
        assert_eq!(registry.get_in("absent.toml", "port"), None);
    }

    #[test]
    fn test_replace_swaps_whole_entry() {
        let registry = registry();
        let old = registry
            .replace(ConfigEntry::parse("mysql.toml", "database = \"0.0.0.0:3306\"", Origin::Remote).unwrap())
            .unwrap();
        assert_eq!(old.store.get("port"), Some(json!(3306)));
        assert_eq!(registry.get_in("mysql.toml", "database"), Some(json!("0.0.0.0:3306")));
        // No field-level merge with the old entry.
        assert_eq!(registry.get_in("mysql.toml", "port"), None);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_merge_all_last_wins_in_name_order() {
        let registry = registry();
        let merged = registry.merge_all();
        assert_eq!(merged["database"], json!("127.0.0.1:3306"));
        // redis.properties sorts after mysql.toml.
        assert_eq!(merged["port"], json!("6379"));
        assert_eq!(merged["cfg.custom"], json!("CA"));
    }

    #[test]
    fn test_merge_all_namespaced() {
        let registry = registry();
        let merged = registry.merge_all_namespaced();
        assert_eq!(
            Value::Object(merged),
            json!({
                "cfg.custom": { "cfg.custom": "CA" },
                "mysql.toml": { "database": "127.0.0.1:3306", "port": 3306 },
                "redis.properties": { "host": "0.0.0.0", "port": "6379" }
            })
        );
    }

    #[test]
    fn test_names_sorted_and_clear() {
        let registry = registry();
        assert_eq!(registry.names(), vec!["cfg.custom", "mysql.toml", "redis.properties"]);
        assert!(registry.contains("cfg.custom"));
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_parse_unknown_format_is_decode_error() {
        let err = ConfigEntry::parse("ca.cert", "x", Origin::Disk).unwrap_err();
        assert!(matches!(err, SailError::Decode { name, .. } if name == "ca.cert"));
    }
}
