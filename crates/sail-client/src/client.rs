//! The [`Sail`] client.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::meta::normalize_configs;
use crate::config::MetaConfig;
use crate::error::{Result, SailError, StoreError};
use crate::remote::{ConnectOptions, Connector, EtcdConnector, RemoteStore};
use crate::secrets::DecryptionGate;
use crate::store::value;
use crate::sync::reconnect::{retry_loop, Attempt, RECONNECT_INTERVAL};
use crate::sync::watcher::{ChangeNotifier, Watcher, REWATCH_DELAY};
use crate::sync::{
    fetch_entries, load_local, ConfigEntry, ConfigStoreRegistry, ConnectionState, FileMaintainer,
};

/// Called after a watched entry changed, with its full remote key.
pub type OnConfigChange = Arc<dyn Fn(&str, &Sail) + Send + Sync>;

/// Remote config client.
///
/// Cheap to clone; clones share one registry and one connection.
#[derive(Clone)]
pub struct Sail {
    inner: Arc<SailInner>,
}

struct SailInner {
    meta: MetaConfig,
    prefix: String,
    requested: Arc<Vec<String>>,
    gate: DecryptionGate,
    registry: Arc<ConfigStoreRegistry>,
    maintainer: FileMaintainer,
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    reconnect_interval: Duration,
    on_change: Option<OnConfigChange>,

    remote: RwLock<Option<Arc<dyn RemoteStore>>>,
    // Serializes connect and install of a connection.
    transition: tokio::sync::Mutex<()>,
    retrying: AtomicBool,
    closed: AtomicBool,
    state: watch::Sender<ConnectionState>,
    token: CancellationToken,
    watch_token: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for SailInner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for Sail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sail")
            .field("prefix", &self.inner.prefix)
            .field("configs", &self.inner.requested)
            .field("state", &self.state())
            .finish()
    }
}

/// Configures a [`Sail`] before construction.
pub struct SailBuilder {
    meta: MetaConfig,
    on_change: Option<OnConfigChange>,
    connector: Option<Arc<dyn Connector>>,
    options: Option<ConnectOptions>,
    reconnect_interval: Duration,
}

impl SailBuilder {
    /// Replaces the requested entry names.
    pub fn configs<I, S>(mut self, configs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta.configs = normalize_configs(configs.into_iter().map(Into::into).collect());
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.meta.cache_dir = Some(dir.into());
        self
    }

    /// Writes the cache as one `config.toml`. Needs a cache dir to matter.
    pub fn merge_config(mut self, merge: bool) -> Self {
        self.meta.merge_config = merge;
        self
    }

    pub fn on_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &Sail) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(callback));
        self
    }

    /// Uses `connector` instead of the etcd gateway.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Overrides timeouts. Endpoints and credentials always come from the
    /// meta config.
    pub fn connect_options(mut self, options: ConnectOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn build(self) -> Result<Sail> {
        if self.reconnect_interval.is_zero() {
            return Err(SailError::configuration("reconnect interval must be positive"));
        }

        let base = ConnectOptions::from_meta(&self.meta);
        let options = match self.options {
            Some(custom) => ConnectOptions {
                endpoints: base.endpoints,
                username: base.username,
                password: base.password,
                ..custom
            },
            None => base,
        };

        let meta = self.meta;
        let registry = Arc::new(ConfigStoreRegistry::new());
        let maintainer =
            FileMaintainer::new(meta.cache_dir.clone(), meta.merge_config, registry.clone());
        let (state, _) = watch::channel(ConnectionState::Idle);

        Ok(Sail {
            inner: Arc::new(SailInner {
                prefix: meta.key_prefix(),
                requested: Arc::new(meta.configs.clone()),
                gate: DecryptionGate::new(meta.namespace_key.clone()),
                registry,
                maintainer,
                connector: self
                    .connector
                    .unwrap_or_else(|| Arc::new(EtcdConnector)),
                options,
                reconnect_interval: self.reconnect_interval,
                on_change: self.on_change,
                remote: RwLock::new(None),
                transition: tokio::sync::Mutex::new(()),
                retrying: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                state,
                token: CancellationToken::new(),
                watch_token: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                meta,
            }),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Sail client lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl Sail {
    pub fn builder(meta: MetaConfig) -> SailBuilder {
        SailBuilder {
            meta,
            on_change: None,
            connector: None,
            options: None,
            reconnect_interval: RECONNECT_INTERVAL,
        }
    }

    /// Builds a client with default settings.
    pub fn new(meta: MetaConfig) -> Result<Self> {
        Self::builder(meta).build()
    }

    /// Builds a client from the `[sail]` table of a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(MetaConfig::from_toml_file(path)?)
    }

    pub fn meta(&self) -> &MetaConfig {
        &self.inner.meta
    }

    /// Connects if needed and loads every requested entry.
    ///
    /// When the remote store can't be reached in time and the cache
    /// directory has files, the cached entries are loaded instead and a
    /// background task keeps retrying. Calling it again after success
    /// re-syncs from the remote.
    pub async fn pull(&self) -> Result<()> {
        self.ensure_open()?;
        let _transition = self.inner.transition.lock().await;
        self.ensure_open()?;

        let remote = match self.current_remote() {
            Some(remote) => remote,
            None => {
                debug!("Start to connect the remote store");
                match self.inner.connector.connect(&self.inner.options).await {
                    Ok(remote) if self.is_closed() => {
                        // Closed while dialing; nobody else will release it.
                        remote.close().await?;
                        return Err(SailError::Closed);
                    }
                    Ok(remote) => remote,
                    Err(e) if e.is_timeout() && self.cache_available() => {
                        warn!(
                            "Using local cache because the remote store is unreachable ({}), retrying every {:?}",
                            e, self.inner.reconnect_interval
                        );
                        self.load_cache()?;
                        self.set_state(ConnectionState::UsingCache);
                        self.spawn_retry();
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        self.install(remote.clone());

        self.sync_from(remote.as_ref()).await?;
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Starts following changes under the namespace prefix.
    ///
    /// Replaces any previous watch, which is how a watch is re-armed after
    /// a reconnect.
    pub async fn watch(&self) -> Result<()> {
        self.ensure_open()?;
        let remote = self.current_remote().ok_or(SailError::NotConnected)?;
        let events = remote.watch_prefix(&self.inner.prefix).await?;

        let token = self.inner.token.child_token();
        if let Some(previous) = lock(&self.inner.watch_token).replace(token.clone()) {
            previous.cancel();
        }

        let watcher = Watcher {
            prefix: self.inner.prefix.clone(),
            remote,
            rewatch_delay: REWATCH_DELAY,
            gate: self.inner.gate.clone(),
            registry: self.inner.registry.clone(),
            maintainer: self.inner.maintainer.clone(),
            notify: self.notifier(),
        };
        let handle = tokio::spawn(watcher.run(events, token));
        self.track(handle);
        Ok(())
    }

    /// Stops background tasks and releases the connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.token.cancel();

        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Background task panicked: {}", e);
                }
            }
        }

        // Waits out a pull that is still installing a connection.
        let _transition = self.inner.transition.lock().await;
        let remote = self.write_remote().take();
        self.set_state(ConnectionState::Closed);
        if let Some(remote) = remote {
            remote.close().await?;
        }
        info!("Sail client closed");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Looks `key` up across all entries; fails if more than one defines it.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.registry.get(key)
    }

    /// Looks `key` up in entry `name` only.
    pub fn get_in(&self, name: &str, key: &str) -> Option<Value> {
        self.inner.registry.get_in(name, key)
    }

    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get(key)?.map(|v| value::as_string(&v)))
    }

    pub fn get_string_in(&self, name: &str, key: &str) -> Option<String> {
        self.get_in(name, key).map(|v| value::as_string(&v))
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        Ok(self.get(key)?.as_ref().and_then(value::as_bool))
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.get(key)?.as_ref().and_then(value::as_i64))
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        Ok(self.get(key)?.as_ref().and_then(value::as_f64))
    }

    /// Deserializes the value under `key`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)?.map(|v| deserialize(key, v)).transpose()
    }

    pub fn get_as_in<T: DeserializeOwned>(&self, name: &str, key: &str) -> Result<Option<T>> {
        self.get_in(name, key)
            .map(|v| deserialize(key, v))
            .transpose()
    }

    pub fn entry(&self, name: &str) -> Option<Arc<ConfigEntry>> {
        self.inner.registry.entry(name)
    }

    /// Names of loaded entries, sorted.
    pub fn entry_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    pub fn merge_all(&self) -> Map<String, Value> {
        self.inner.registry.merge_all()
    }

    pub fn merge_all_namespaced(&self) -> Map<String, Value> {
        self.inner.registry.merge_all_namespaced()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(SailError::Closed)
        } else {
            Ok(())
        }
    }

    fn current_remote(&self) -> Option<Arc<dyn RemoteStore>> {
        match self.inner.remote.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write_remote(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn RemoteStore>>> {
        match self.inner.remote.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Remote handle lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn install(&self, remote: Arc<dyn RemoteStore>) {
        *self.write_remote() = Some(remote);
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == state {
                return false;
            }
            debug!("Connection state {} -> {}", current, state);
            *current = state;
            true
        });
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn cache_available(&self) -> bool {
        self.inner
            .meta
            .cache_dir
            .as_deref()
            .and_then(|dir| std::fs::read_dir(dir).ok())
            .is_some_and(|mut items| items.next().is_some())
    }

    fn load_cache(&self) -> Result<()> {
        let Some(dir) = self.inner.meta.cache_dir.as_deref() else {
            return Ok(());
        };
        let entries = load_local(
            dir,
            &self.inner.requested,
            self.inner.meta.merge_config,
            &self.inner.gate,
        )?;
        info!("Loaded {} entries from local cache", entries.len());
        self.inner.registry.replace_all(entries);
        Ok(())
    }

    async fn sync_from(&self, remote: &dyn RemoteStore) -> Result<()> {
        if self.inner.requested.is_empty() {
            return Ok(());
        }
        let entries =
            fetch_entries(remote, &self.inner.prefix, &self.inner.requested, &self.inner.gate)
                .await?;
        self.inner.registry.replace_all(entries);
        self.inner.maintainer.save_all()
    }

    fn notifier(&self) -> Option<ChangeNotifier> {
        let callback = self.inner.on_change.clone()?;
        let weak = Arc::downgrade(&self.inner);
        Some(Box::new(move |key: &str| {
            if let Some(inner) = weak.upgrade() {
                callback(key, &Sail { inner });
            }
        }))
    }

    fn spawn_retry(&self) {
        if self.inner.retrying.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.token.clone();
        let interval = self.inner.reconnect_interval;

        let handle = tokio::spawn(async move {
            let exit = retry_loop(interval, token, || reconnect_attempt(weak.clone())).await;
            debug!("Reconnect loop finished: {:?}", exit);
            if let Some(inner) = weak.upgrade() {
                inner.retrying.store(false, Ordering::SeqCst);
            }
        });
        self.track(handle);
    }
}

async fn reconnect_attempt(weak: Weak<SailInner>) -> Attempt {
    let Some(inner) = weak.upgrade() else {
        return Attempt::Abandon;
    };
    let sail = Sail { inner };
    if sail.is_closed() {
        return Attempt::Abandon;
    }

    let _transition = sail.inner.transition.lock().await;
    if sail.is_closed() {
        return Attempt::Abandon;
    }
    if sail.current_remote().is_some() {
        // A concurrent pull got there first.
        sail.set_state(ConnectionState::Connected);
        return Attempt::Recovered;
    }

    sail.set_state(ConnectionState::Retrying);
    let remote = match sail.inner.connector.connect(&sail.inner.options).await {
        Ok(remote) => remote,
        Err(e) if e.is_timeout() => {
            debug!("Reconnect timed out, retrying in {:?}", sail.inner.reconnect_interval);
            return Attempt::Retry;
        }
        Err(e) => {
            error!("Reconnect exits because of: {}", e);
            sail.set_state(ConnectionState::UsingCache);
            return Attempt::Abandon;
        }
    };

    info!("Reconnected to the remote store");
    match sail.sync_from(remote.as_ref()).await {
        Ok(()) => {
            sail.install(remote);
            sail.set_state(ConnectionState::Connected);
            Attempt::Recovered
        }
        Err(e) => {
            error!(
                "Pull after reconnect failed, retrying in {:?}: {}",
                sail.inner.reconnect_interval, e
            );
            if let Err(e) = remote.close().await {
                debug!("Closing the failed connection: {}", e);
            }
            Attempt::Retry
        }
    }
}

fn deserialize<T: DeserializeOwned>(key: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| SailError::Decode {
        name: key.to_string(),
        source: StoreError::Json(e),
    })
}
