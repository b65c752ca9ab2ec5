//! Synchronization engine: pull, watch, local cache and reconnects.

pub mod engine;
pub mod file_maintainer;
pub mod local_file;
pub mod publish;
pub mod reconnect;
pub mod registry;
pub mod watcher;

pub use engine::fetch_entries;
pub use file_maintainer::{FileMaintainer, MERGE_CONFIG_NAME};
pub use local_file::load_local;
pub use publish::{check_publish, PublishMarker};
pub use reconnect::ConnectionState;
pub use registry::{ConfigEntry, ConfigStoreRegistry, Origin};

/// Whether `name` is one of the sorted `requested` names.
pub fn is_requested(requested: &[String], name: &str) -> bool {
    requested.binary_search_by(|r| r.as_str().cmp(name)).is_ok()
}

/// Items of `items` whose key is in `requested`.
///
/// Both sequences must be sorted by key; runs in linear time.
pub fn intersect_sorted_by<'a, T>(
    items: &'a [T],
    key: impl Fn(&T) -> &str,
    requested: &[String],
) -> Vec<&'a T> {
    let mut matched = Vec::with_capacity(items.len().min(requested.len()));
    let (mut i, mut j) = (0, 0);
    while i < items.len() && j < requested.len() {
        match key(&items[i]).cmp(requested[j].as_str()) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                matched.push(&items[i]);
                i += 1;
                j += 1;
            }
        }
    }
    matched
}

pub fn intersect_sorted<'a>(names: &'a [String], requested: &[String]) -> Vec<&'a String> {
    intersect_sorted_by(names, |name| name.as_str(), requested)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_intersect_sorted() {
        let found = names(&["a.toml", "b.json", "c.yaml", "mysql.toml", "mysql.toml.bak"]);
        let requested = names(&["b.json", "mysql.toml", "z.toml"]);
        let matched: Vec<&str> = intersect_sorted(&found, &requested)
            .into_iter()
            .map(|s| s.as_str())
            .collect();
        assert_eq!(matched, vec!["b.json", "mysql.toml"]);
    }

    #[test]
    fn test_is_requested() {
        let requested = names(&["b.json", "mysql.toml"]);
        assert!(is_requested(&requested, "mysql.toml"));
        assert!(!is_requested(&requested, "mysql.toml.bak"));
        assert!(!is_requested(&[], "b.json"));
    }

    #[test]
    fn test_intersect_sorted_empty() {
        assert!(intersect_sorted(&[], &names(&["a"])).is_empty());
        assert!(intersect_sorted(&names(&["a"]), &[]).is_empty());
    }
}
