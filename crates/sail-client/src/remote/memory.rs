//! In-process remote store.
//!
//! [`MemoryStore`] holds keys in a sorted map and fans every change out to
//! open watches. Each [`MemoryConnector::connect`] hands out a fresh
//! [`MemoryConnection`] over the shared store, so closing one connection
//! never loses data. Failures can be scripted to exercise reconnects.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};

use super::{ConnectOptions, Connector, EventKind, KeyValue, RangePage, RemoteStore, WatchEvent, WatchStream};
use crate::error::{ConnectError, RemoteError};

const EVENT_CAPACITY: usize = 256;

pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            data: RwLock::new(BTreeMap::new()),
            events,
        }
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.keys())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stores `value` under `key` and notifies watchers.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let value = value.into();
        {
            let mut data = match self.data.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            data.insert(key.clone(), value.clone());
        }
        // No receivers is fine.
        let _ = self.events.send(WatchEvent {
            kind: EventKind::Put,
            key,
            value,
        });
    }

    /// Removes `key` and notifies watchers if it existed.
    pub fn delete(&self, key: &str) {
        let removed = {
            let mut data = match self.data.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            data.remove(key).is_some()
        };
        if removed {
            let _ = self.events.send(WatchEvent {
                kind: EventKind::Delete,
                key: key.to_string(),
                value: Vec::new(),
            });
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.data.read() {
            Ok(data) => data.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        match self.data.read() {
            Ok(data) => data.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        }
    }

    /// Number of open watches.
    pub fn watcher_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Opens a connection over this store.
    pub fn connect(self: &Arc<Self>) -> MemoryConnection {
        MemoryConnection {
            store: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }

    fn range(&self, from: &str, end: &str, limit: usize) -> RangePage {
        let data = match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if from >= end {
            return RangePage::default();
        }
        let mut iter = data.range::<str, _>((
            std::ops::Bound::Included(from),
            std::ops::Bound::Excluded(end),
        ));
        let kvs: Vec<KeyValue> = iter
            .by_ref()
            .take(limit)
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        let more = iter.next().is_some();
        RangePage { kvs, more }
    }
}

/// One connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    store: Arc<MemoryStore>,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), RemoteError> {
        if self.is_closed() {
            Err(RemoteError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryConnection {
    async fn range(&self, from: &str, end: &str, limit: usize) -> Result<RangePage, RemoteError> {
        self.ensure_open()?;
        Ok(self.store.range(from, end, limit))
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, RemoteError> {
        self.ensure_open()?;
        let rx = self.store.events.subscribe();
        let prefix = prefix.to_string();

        let events = stream::unfold(rx, move |mut rx| {
            let prefix = prefix.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) if event.key.starts_with(&prefix) => {
                            return Some((Ok(vec![event]), rx));
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("Memory watch lagged, {} events skipped", skipped);
                            continue;
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(events.boxed())
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`MemoryConnection`]s, optionally failing first.
#[derive(Debug)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    failures: Mutex<VecDeque<ConnectError>>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            failures: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Queues an error for the next connect attempt.
    pub fn fail_next(&self, error: ConnectError) {
        let mut failures = match self.failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        failures.push_back(error);
    }

    /// Connect attempts made so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _options: &ConnectOptions,
    ) -> Result<Arc<dyn RemoteStore>, ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let scripted = {
            let mut failures = match self.failures.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            failures.pop_front()
        };
        match scripted {
            Some(error) => Err(error),
            None => Ok(Arc::new(self.store.connect())),
        }
    }
}
