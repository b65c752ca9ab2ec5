//! Live updates from the namespace prefix.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::build_entry;
use super::file_maintainer::FileMaintainer;
use super::publish::check_publish;
use super::registry::ConfigStoreRegistry;
use crate::error::RemoteError;
use crate::remote::{EventKind, RemoteStore, WatchEvent, WatchStream};
use crate::secrets::DecryptionGate;

/// Pause before subscribing again after a watch stream broke.
pub const REWATCH_DELAY: Duration = Duration::from_secs(1);

/// Called with the full remote key after an entry was replaced.
pub(crate) type ChangeNotifier = Box<dyn Fn(&str) + Send + Sync>;

/// Everything the watch loop needs to apply one event.
pub(crate) struct Watcher {
    pub prefix: String,
    pub remote: Arc<dyn RemoteStore>,
    pub rewatch_delay: Duration,
    pub gate: DecryptionGate,
    pub registry: Arc<ConfigStoreRegistry>,
    pub maintainer: FileMaintainer,
    pub notify: Option<ChangeNotifier>,
}

impl Watcher {
    /// Applies events one at a time until `token` is cancelled.
    ///
    /// A stream that fails or ends is replaced by a new subscription on the
    /// same connection. The loop only gives up once that connection is
    /// closed.
    pub async fn run(self, mut events: WatchStream, token: CancellationToken) {
        info!("Watching config changes under {}", self.prefix);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = events.next() => match next {
                    Some(Ok(batch)) => {
                        for event in batch {
                            self.handle(event);
                        }
                        continue;
                    }
                    Some(Err(e)) => error!("Watch on {} failed: {}", self.prefix, e),
                    None => warn!("Watch stream on {} ended", self.prefix),
                }
            }

            match self.resubscribe(&token).await {
                Some(stream) => events = stream,
                None => break,
            }
        }
        info!("Close watch on {}, bye", self.prefix);
    }

    /// Subscribes again, pausing before each try. `None` once cancelled or
    /// the connection is gone.
    async fn resubscribe(&self, token: &CancellationToken) -> Option<WatchStream> {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(self.rewatch_delay) => {}
            }
            match self.remote.watch_prefix(&self.prefix).await {
                Ok(stream) => {
                    info!("Watch on {} re-established", self.prefix);
                    return Some(stream);
                }
                Err(RemoteError::Closed) => {
                    warn!("Connection closed, stop watching {}", self.prefix);
                    return None;
                }
                Err(e) => warn!(
                    "Can't watch {} again, retrying in {:?}: {}",
                    self.prefix, self.rewatch_delay, e
                ),
            }
        }
    }

    fn handle(&self, event: WatchEvent) {
        debug!("Got a watch event for {}", event.key);
        match event.kind {
            EventKind::Put => {
                self.handle_put(&event.key, &event.value);
            }
            // Removal upstream leaves the last known content in place.
            EventKind::Delete => {}
        }
    }

    /// Swaps in the entry carried by a PUT, then refreshes its cache file
    /// and runs the change callback. Returns the persistence task, if any.
    pub fn handle_put(&self, key: &str, value: &[u8]) -> Option<JoinHandle<()>> {
        if value.is_empty() {
            return None;
        }
        let Some(name) = key.strip_prefix(&self.prefix) else {
            return None;
        };
        if let Some(revision) = check_publish(value) {
            debug!("Ignoring publish marker on '{}' at revision {}", name, revision);
            return None;
        }

        let Some(entry) = build_entry(name, value, &self.gate) else {
            error!("Dropping change of config '{}'", name);
            return None;
        };
        self.registry.replace(entry);
        info!("Config '{}' updated", name);

        let persist = self.maintainer.persist_entry_async(name);
        if let Some(notify) = &self.notify {
            notify(key);
        }
        persist
    }
}
