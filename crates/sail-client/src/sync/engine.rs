//! Bulk fetch of the requested entries.

use log::{debug, warn};

use super::{intersect_sorted_by, is_requested};
use super::publish::check_publish;
use super::registry::{ConfigEntry, Origin};
use crate::error::{Result, SailError};
use crate::remote::{key_after, prefix_range_end, KeyValue, RemoteStore};
use crate::secrets::DecryptionGate;

/// Reads the requested entries under `prefix` in as few range reads as
/// possible.
///
/// `requested` must be sorted. Entry names sort the same way their keys
/// do, so the read starts at the smallest requested name and runs to the
/// end of the prefix, with a limit of the number of names. Unrelated keys
/// can fill a page; reading then continues after the last returned key
/// until every name is found or the prefix is exhausted.
///
/// Fails with [`SailError::Fetch`] when the prefix holds nothing at or
/// after the smallest requested name.
/// Entries that can't be decoded are skipped with a warning.
pub async fn fetch_entries(
    remote: &dyn RemoteStore,
    prefix: &str,
    requested: &[String],
    gate: &DecryptionGate,
) -> Result<Vec<ConfigEntry>> {
    let Some(first) = requested.first() else {
        return Ok(Vec::new());
    };
    debug!("Pulling config keys {:?}", requested);

    let limit = requested.len();
    let end = prefix_range_end(prefix);
    let mut from = format!("{}{}", prefix, first);
    let mut kvs: Vec<KeyValue> = Vec::new();
    let mut found = 0;

    loop {
        let page = remote.range(&from, &end, limit).await?;
        found += page
            .kvs
            .iter()
            .filter(|kv| {
                kv.key
                    .strip_prefix(prefix)
                    .is_some_and(|name| is_requested(requested, name))
            })
            .count();
        let next = page.kvs.last().map(|kv| key_after(&kv.key));
        kvs.extend(page.kvs);

        match next {
            Some(next) if page.more && found < requested.len() => from = next,
            _ => break,
        }
    }

    if kvs.is_empty() {
        return Err(SailError::Fetch {
            prefix: prefix.to_string(),
        });
    }

    let named: Vec<(&str, &KeyValue)> = kvs
        .iter()
        .filter_map(|kv| kv.key.strip_prefix(prefix).map(|name| (name, kv)))
        .collect();
    let matched = intersect_sorted_by(&named, |item| item.0, requested);
    debug!(
        "Matched config keys {:?}",
        matched.iter().map(|(name, _)| *name).collect::<Vec<_>>()
    );

    Ok(matched
        .into_iter()
        .filter_map(|(name, kv)| build_entry(name, &kv.value, gate))
        .collect())
}

/// Turns one raw remote value into an entry.
///
/// Returns `None`, after logging why, for publish markers and for values
/// that are empty or fail to decrypt or parse.
pub(crate) fn build_entry(name: &str, value: &[u8], gate: &DecryptionGate) -> Option<ConfigEntry> {
    if value.is_empty() {
        debug!("Skipping config '{}': empty value", name);
        return None;
    }
    if let Some(revision) = check_publish(value) {
        debug!("Skipping publish marker for '{}' at revision {}", name, revision);
        return None;
    }

    let content = match std::str::from_utf8(value) {
        Ok(content) => content,
        Err(e) => {
            warn!("Skipping config '{}': not UTF-8: {}", name, e);
            return None;
        }
    };
    let plain = gate.open(name, content);
    if plain.is_empty() {
        warn!("Decrypt config '{}' failed, skipping it", name);
        return None;
    }

    match ConfigEntry::parse(name, &plain, Origin::Remote) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!("Skipping config '{}': {}", name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryStore, RemoteStore};
    use secrecy::SecretString;
    use serde_json::json;

    const PREFIX: &str = "/conf/p/ns/";
    const NAMESPACE_KEY: &str = "NTUZNTNQNUKYEL4GP5SGVDV9LEYZAWBD";

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn gate() -> DecryptionGate {
        DecryptionGate::new(Some(SecretString::from(NAMESPACE_KEY.to_string())))
    }

    async fn fetched(store: &std::sync::Arc<MemoryStore>, requested: &[&str]) -> Vec<String> {
        let conn = store.connect();
        fetch_entries(&conn, PREFIX, &names(requested), &gate())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect()
    }

    #[tokio::test]
    async fn test_fetch_decrypts_and_parses() {
        let store = MemoryStore::new();
        store.put(format!("{}mysql.toml", PREFIX), "database = \"127.0.0.1:3306\"");
        store.put(
            format!("{}redis.properties", PREFIX),
            gate().encrypt("host=0.0.0.0\nport=6379").unwrap(),
        );

        let conn = store.connect();
        let entries = fetch_entries(
            &conn,
            PREFIX,
            &names(&["mysql.toml", "redis.properties"]),
            &gate(),
        )
        .await
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].store.get("database"), Some(json!("127.0.0.1:3306")));
        assert_eq!(entries[1].store.get("host"), Some(json!("0.0.0.0")));
        assert_eq!(entries[1].raw, b"host=0.0.0.0\nport=6379");
    }

    #[tokio::test]
    async fn test_fetch_sees_past_interleaved_keys() {
        let store = MemoryStore::new();
        for name in ["a.toml", "b.toml", "b1.toml", "b2.toml", "b3.toml", "c.toml", "d.toml"] {
            store.put(format!("{}{}", PREFIX, name), "x = 1");
        }
        store.put("/conf/p/other/a.toml", "x = 1");

        assert_eq!(
            fetched(&store, &["a.toml", "c.toml", "d.toml"]).await,
            vec!["a.toml", "c.toml", "d.toml"]
        );
        assert_eq!(fetched(&store, &["b3.toml", "z.toml"]).await, vec!["b3.toml"]);
        assert_eq!(fetched(&store, &["a.toml"]).await, vec!["a.toml"]);
    }

    #[tokio::test]
    async fn test_fetch_empty_range_is_fetch_error() {
        let store = MemoryStore::new();
        store.put(format!("{}a.toml", PREFIX), "x = 1");
        let conn = store.connect();
        let err = fetch_entries(&conn, PREFIX, &names(&["b.toml"]), &gate())
            .await
            .unwrap_err();
        assert!(matches!(err, SailError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_fetch_keys_after_requested_names_are_not_empty() {
        let store = MemoryStore::new();
        store.put(format!("{}z.toml", PREFIX), "x = 1");
        assert!(fetched(&store, &["mysql.toml"]).await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_stops_at_prefix_end() {
        let store = MemoryStore::new();
        store.put("/conf/p/nt/mysql.toml", "x = 1");
        store.put("/conf/p/ns0", "x = 1");
        let conn = store.connect();
        let err = fetch_entries(&conn, PREFIX, &names(&["mysql.toml"]), &gate())
            .await
            .unwrap_err();
        assert!(matches!(err, SailError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_fetch_skips_bad_entries() {
        let store = MemoryStore::new();
        store.put(format!("{}a.toml", PREFIX), "x = ");
        store.put(format!("{}b.toml", PREFIX), "PUBLISH&t&1&22&p");
        store.put(format!("{}c.custom", PREFIX), "CA");
        // Valid base64 that isn't ciphertext for this key.
        store.put(format!("{}d.json", PREFIX), "aGVsbG8gd29ybGQ=");

        assert_eq!(
            fetched(&store, &["a.toml", "b.toml", "c.custom", "d.json"]).await,
            vec!["c.custom"]
        );
    }

    #[tokio::test]
    async fn test_fetch_no_names() {
        let store = MemoryStore::new();
        let conn = store.connect();
        assert!(fetch_entries(&conn, PREFIX, &[], &gate())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_fetch_closed_connection() {
        let store = MemoryStore::new();
        let conn = store.connect();
        conn.close().await.unwrap();
        let err = fetch_entries(&conn, PREFIX, &names(&["a.toml"]), &gate())
            .await
            .unwrap_err();
        assert!(matches!(err, SailError::Remote(_)));
    }
}
