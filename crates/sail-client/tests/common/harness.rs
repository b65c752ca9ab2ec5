//! Test harness for isolated client runs.
//!
//! The `TestHarness` owns an in-memory remote store, a connector that can be
//! scripted to fail, and a temporary cache directory.

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::SecretString;
use tempfile::TempDir;

use sail::{ConnectionState, DecryptionGate, MemoryConnector, MemoryStore, Sail, SailBuilder};

use super::builders::{remote_key, MetaBuilder, NAMESPACE_KEY};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestHarness {
    temp_dir: TempDir,
    /// Cache directory inside temp_dir; not created up front.
    pub cache_dir: PathBuf,
    pub store: Arc<MemoryStore>,
    pub connector: Arc<MemoryConnector>,
    /// Remote keys passed to the change callback, in order.
    pub changes: Arc<Mutex<Vec<String>>>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let cache_dir = temp_dir.path().join("cache");
        let store = MemoryStore::new();
        let connector = Arc::new(MemoryConnector::new(store.clone()));
        Self {
            temp_dir,
            cache_dir,
            store,
            connector,
            changes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn gate(&self) -> DecryptionGate {
        DecryptionGate::new(Some(SecretString::from(NAMESPACE_KEY.to_string())))
    }

    /// Stores plaintext content for `name`.
    pub fn put(&self, name: &str, content: &str) {
        self.store.put(remote_key(name), content);
    }

    /// Stores content for `name` encrypted with the namespace key.
    pub fn put_encrypted(&self, name: &str, plaintext: &str) {
        let ciphertext = self.gate().encrypt(plaintext).expect("encrypt test content");
        self.store.put(remote_key(name), ciphertext);
    }

    /// A builder for a client on this harness, caching into `cache_dir`.
    pub fn builder(&self, configs: &[&str], merge: bool) -> SailBuilder {
        let meta = MetaBuilder::new()
            .configs(configs)
            .cache_dir(&self.cache_dir)
            .merge_config(merge)
            .build();
        let changes = self.changes.clone();
        Sail::builder(meta)
            .connector(self.connector.clone())
            .on_change(move |key, _| changes.lock().unwrap().push(key.to_string()))
    }

    pub fn client(&self, configs: &[&str]) -> Sail {
        self.builder(configs, false).build().expect("build client")
    }

    pub fn merged_client(&self, configs: &[&str]) -> Sail {
        self.builder(configs, true).build().expect("build client")
    }

    /// Sorted names of the files in the cache directory.
    pub fn cache_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.cache_dir)
            .map(|items| {
                items
                    .filter_map(|item| item.ok())
                    .filter(|item| item.path().is_file())
                    .map(|item| item.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn cache_file(&self, name: &str) -> String {
        std::fs::read_to_string(self.cache_dir.join(name)).expect("read cache file")
    }

    pub fn base(&self) -> &Path {
        self.temp_dir.path()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `check` until it holds, failing the test after [`WAIT`].
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let result = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

/// Waits until the client reports `state`.
pub async fn wait_for_state(sail: &Sail, state: ConnectionState) {
    let mut states = sail.subscribe_state();
    let reached = tokio::time::timeout(WAIT, states.wait_for(|s| *s == state)).await;
    assert!(
        matches!(reached, Ok(Ok(_))),
        "timed out waiting for state {}, last was {}",
        state,
        sail.state()
    );
}

/// Runs `fut` with the [`WAIT`] bound.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut)
        .await
        .expect("operation timed out")
}
