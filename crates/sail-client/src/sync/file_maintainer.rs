//! Mirrors the registry into the local cache directory.
//!
//! Per-entry mode writes one file per entry, named after it, in the entry's
//! own format. Merge mode writes a single TOML file holding every entry
//! nested under its name. Cache files are plaintext.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, warn};
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;

use super::registry::ConfigStoreRegistry;
use crate::error::{Result, SailError};
use crate::store::TextFormat;

/// File name used by merge mode.
pub const MERGE_CONFIG_NAME: &str = "config.toml";

/// Writes to the cache directory, one at a time.
///
/// Clones share one write lock, held from the registry read to the final
/// rename, so a file always ends up holding the latest registry content.
#[derive(Debug, Clone)]
pub struct FileMaintainer {
    cache_dir: Option<PathBuf>,
    merge_config: bool,
    registry: Arc<ConfigStoreRegistry>,
    writes: Arc<Mutex<()>>,
}

impl FileMaintainer {
    pub fn new(
        cache_dir: Option<PathBuf>,
        merge_config: bool,
        registry: Arc<ConfigStoreRegistry>,
    ) -> Self {
        Self {
            cache_dir,
            merge_config,
            registry,
            writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Rewrites the whole cache directory from the registry.
    ///
    /// Files that no longer belong to any entry are removed; failing to
    /// remove one only logs a warning.
    pub fn save_all(&self) -> Result<()> {
        let Some(dir) = self.cache_dir.as_deref() else {
            return Ok(());
        };
        let _writes = self.lock_writes();
        fs::create_dir_all(dir).map_err(|source| SailError::Persist {
            path: dir.to_path_buf(),
            source,
        })?;

        let keep: Vec<String> = if self.merge_config {
            self.write_merged(dir)?;
            vec![MERGE_CONFIG_NAME.to_string()]
        } else {
            let entries = self.registry.snapshot();
            for entry in &entries {
                let content = entry.store.serialize().map_err(|source| SailError::Serialize {
                    name: entry.name.clone(),
                    source,
                })?;
                write_atomic(&dir.join(&entry.name), content.as_bytes())?;
            }
            entries.iter().map(|e| e.name.clone()).collect()
        };

        for stale in list_files(dir)?.into_iter().filter(|f| !keep.contains(f)) {
            let path = dir.join(&stale);
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed stale cache file {}", path.display()),
                Err(e) => warn!("Can't delete cache file {}: {}", path.display(), e),
            }
        }
        Ok(())
    }

    /// Rewrites the cache file holding `name` on a blocking task.
    ///
    /// Failures are logged and never reach the caller. Returns `None` when
    /// there is nothing to write.
    pub fn persist_entry_async(&self, name: &str) -> Option<JoinHandle<()>> {
        self.cache_dir.as_ref()?;
        let maintainer = self.clone();
        let name = name.to_string();
        Some(tokio::task::spawn_blocking(move || {
            if let Err(e) = maintainer.persist_entry(&name) {
                error!("Refresh of cache file for '{}' failed: {}", name, e);
            }
        }))
    }

    fn persist_entry(&self, name: &str) -> Result<()> {
        let Some(dir) = self.cache_dir.as_deref() else {
            return Ok(());
        };
        let _writes = self.lock_writes();
        fs::create_dir_all(dir).map_err(|source| SailError::Persist {
            path: dir.to_path_buf(),
            source,
        })?;

        if self.merge_config {
            return self.write_merged(dir);
        }
        let Some(entry) = self.registry.entry(name) else {
            return Ok(());
        };
        let content = entry.store.serialize().map_err(|source| SailError::Serialize {
            name: entry.name.clone(),
            source,
        })?;
        write_atomic(&dir.join(&entry.name), content.as_bytes())?;
        debug!("Refreshed cache file for '{}'", name);
        Ok(())
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        match self.writes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Cache write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_merged(&self, dir: &Path) -> Result<()> {
        let merged = self.registry.merge_all_namespaced();
        let content = TextFormat::Toml
            .serialize(&merged)
            .map_err(|source| SailError::Serialize {
                name: MERGE_CONFIG_NAME.to_string(),
                source,
            })?;
        write_atomic(&dir.join(MERGE_CONFIG_NAME), content.as_bytes())
    }
}

/// Regular file names in `dir`, sorted.
pub(crate) fn list_files(dir: &Path) -> Result<Vec<String>> {
    let read_error = |source| SailError::LocalCache {
        path: dir.to_path_buf(),
        source,
    };
    let mut names = Vec::new();
    for item in fs::read_dir(dir).map_err(read_error)? {
        let item = item.map_err(read_error)?;
        if !item.file_type().map_err(read_error)?.is_file() {
            continue;
        }
        if let Some(name) = item.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

// Fresh temp file in the same directory, renamed over the target.
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let persist_error = |source| SailError::Persist {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir).map_err(persist_error)?;
    tmp.write_all(content).map_err(persist_error)?;
    tmp.persist(path).map_err(|e| persist_error(e.error))?;
    Ok(())
}
