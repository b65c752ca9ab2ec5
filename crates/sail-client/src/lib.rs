pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod remote;
pub mod secrets;
pub mod store;
pub mod sync;

pub use client::{OnConfigChange, Sail, SailBuilder};
pub use config::{LogLevel, MetaConfig, RawMetaConfig};
pub use error::{ConnectError, RemoteError, Result, SailError, StoreError};
pub use remote::{ConnectOptions, Connector, EtcdConnector, MemoryConnector, MemoryStore, RemoteStore};
pub use secrets::{DecryptionGate, SecretError};
pub use store::{ConfigStore, EntryKind, TextFormat};
pub use sync::{ConfigEntry, ConfigStoreRegistry, ConnectionState, Origin, MERGE_CONFIG_NAME};
