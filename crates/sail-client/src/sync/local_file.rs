//! Cold load of the registry from the cache directory.

use std::fs;
use std::path::Path;

use log::{debug, warn};
use serde_json::Value;

use super::file_maintainer::{list_files, MERGE_CONFIG_NAME};
use super::intersect_sorted;
use super::registry::{ConfigEntry, Origin};
use crate::error::{Result, SailError};
use crate::secrets::DecryptionGate;
use crate::store::{ConfigStore, TextFormat};

/// Reads the requested entries back from `dir`.
///
/// `requested` must be sorted. Entries the gate rejects are skipped; read
/// and parse errors are returned.
pub fn load_local(
    dir: &Path,
    requested: &[String],
    merge_config: bool,
    gate: &DecryptionGate,
) -> Result<Vec<ConfigEntry>> {
    if merge_config {
        return load_merged(dir, requested, gate);
    }

    let files = list_files(dir)?;
    let mut entries = Vec::new();
    for name in intersect_sorted(&files, requested) {
        let Some(content) = read_plaintext(dir, name, gate)? else {
            continue;
        };
        entries.push(ConfigEntry::parse(name, &content, Origin::Disk)?);
    }
    debug!("Loaded {} cached entries from {}", entries.len(), dir.display());
    Ok(entries)
}

fn load_merged(dir: &Path, requested: &[String], gate: &DecryptionGate) -> Result<Vec<ConfigEntry>> {
    let Some(content) = read_plaintext(dir, MERGE_CONFIG_NAME, gate)? else {
        return Ok(Vec::new());
    };
    let decode_error = |source| SailError::Decode {
        name: MERGE_CONFIG_NAME.to_string(),
        source,
    };
    let mut tables = TextFormat::Toml.parse(&content).map_err(decode_error)?;

    let mut entries = Vec::new();
    for name in requested {
        let Some(tree) = tables.remove(&name.to_lowercase()) else {
            continue;
        };
        entries.push(entry_from_tree(name, tree)?);
    }
    debug!(
        "Loaded {} cached entries from {}",
        entries.len(),
        dir.join(MERGE_CONFIG_NAME).display()
    );
    Ok(entries)
}

fn entry_from_tree(name: &str, tree: Value) -> Result<ConfigEntry> {
    let decode_error = |source| SailError::Decode {
        name: name.to_string(),
        source,
    };
    let store = ConfigStore::from_value(name, tree).map_err(decode_error)?;
    let raw = store.serialize().map_err(decode_error)?;
    Ok(ConfigEntry {
        name: name.to_string(),
        raw: raw.into_bytes(),
        origin: Origin::Disk,
        store,
    })
}

fn read_plaintext(dir: &Path, name: &str, gate: &DecryptionGate) -> Result<Option<String>> {
    let path = dir.join(name);
    let content = fs::read_to_string(&path).map_err(|source| SailError::LocalCache {
        path: path.clone(),
        source,
    })?;
    let plain = gate.open(name, &content);
    if plain.is_empty() {
        warn!("Skipping cached config '{}': empty after decoding", name);
        return Ok(None);
    }
    Ok(Some(plain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::file_maintainer::FileMaintainer;
    use crate::sync::registry::ConfigStoreRegistry;
    use secrecy::SecretString;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_load_only_requested_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("mysql.toml"), "database = \"127.0.0.1:3306\"").unwrap();
        fs::write(dir.path().join("other.toml"), "x = 1").unwrap();

        let entries = load_local(
            dir.path(),
            &names(&["mysql.toml", "redis.properties"]),
            false,
            &DecryptionGate::new(None),
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "mysql.toml");
        assert_eq!(entries[0].origin, Origin::Disk);
        assert_eq!(entries[0].store.get("database"), Some(json!("127.0.0.1:3306")));
    }

    #[test]
    fn test_load_decrypts_cached_content() {
        let gate = DecryptionGate::new(Some(SecretString::from(
            "NTUZNTNQNUKYEL4GP5SGVDV9LEYZAWBD".to_string(),
        )));
        let dir = TempDir::new().unwrap();
        let encrypted = gate.encrypt("host=0.0.0.0").unwrap();
        fs::write(dir.path().join("redis.properties"), encrypted).unwrap();

        let entries =
            load_local(dir.path(), &names(&["redis.properties"]), false, &gate).unwrap();
        assert_eq!(entries[0].store.get("host"), Some(json!("0.0.0.0")));
    }

    #[test]
    fn test_load_skips_undecryptable() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("redis.properties"), "aGVsbG8gd29ybGQ=").unwrap();

        let entries = load_local(
            dir.path(),
            &names(&["redis.properties"]),
            false,
            &DecryptionGate::new(None),
        )
        .unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_load_parse_error_is_returned() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("mysql.toml"), "database = ").unwrap();
        let err = load_local(
            dir.path(),
            &names(&["mysql.toml"]),
            false,
            &DecryptionGate::new(None),
        )
        .unwrap_err();
        assert!(matches!(err, SailError::Decode { .. }));
    }

    #[test]
    fn test_load_missing_dir_is_error() {
        let dir = TempDir::new().unwrap();
        let err = load_local(
            &dir.path().join("absent"),
            &names(&["mysql.toml"]),
            false,
            &DecryptionGate::new(None),
        )
        .unwrap_err();
        assert!(matches!(err, SailError::LocalCache { .. }));
    }

    #[test]
    fn test_merged_round_trip() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(ConfigStoreRegistry::new());
        registry.replace_all(vec![
            ConfigEntry::parse("mysql.toml", "database = \"127.0.0.1:3306\"", Origin::Remote).unwrap(),
            ConfigEntry::parse("cfg.custom", "CA", Origin::Remote).unwrap(),
        ]);
        FileMaintainer::new(Some(dir.path().to_path_buf()), true, registry.clone())
            .save_all()
            .unwrap();

        let entries = load_local(
            dir.path(),
            &names(&["cfg.custom", "mysql.toml"]),
            true,
            &DecryptionGate::new(None),
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        for entry in entries {
            let original = registry.entry(&entry.name).unwrap();
            assert_eq!(entry.store, original.store);
        }
    }
}
