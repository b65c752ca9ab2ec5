//! Remote key-value store seam.
//!
//! The client talks to the remote store only through [`RemoteStore`], and
//! obtains connections through a [`Connector`]. [`etcd`] implements both
//! against the etcd v3 JSON gateway; [`memory`] keeps everything in
//! process.

pub mod etcd;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use secrecy::{ExposeSecret, SecretString};

use crate::config::MetaConfig;
use crate::error::{ConnectError, RemoteError};

pub use etcd::{EtcdConnector, EtcdGateway};
pub use memory::{MemoryConnection, MemoryConnector, MemoryStore};

/// Default dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Default TCP keep-alive interval.
pub const KEEP_ALIVE: Duration = Duration::from_secs(10);
/// Default timeout of unary requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One stored key and its raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Result of a bounded range read.
#[derive(Debug, Clone, Default)]
pub struct RangePage {
    /// Keys in ascending order.
    pub kvs: Vec<KeyValue>,
    /// True when the limit cut the range short.
    pub more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A change observed on a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: Vec<u8>,
}

/// Batches of events as delivered by the remote; dropping it ends the watch.
pub type WatchStream = BoxStream<'static, Result<Vec<WatchEvent>, RemoteError>>;

/// An established connection to the remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Reads keys in `[from, end)` in ascending order, at most `limit` of them.
    async fn range(&self, from: &str, end: &str, limit: usize) -> Result<RangePage, RemoteError>;

    /// Subscribes to every change under `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, RemoteError>;

    /// Releases the connection. Further calls fail with [`RemoteError::Closed`].
    async fn close(&self) -> Result<(), RemoteError>;
}

/// Dials the remote store.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions)
        -> Result<Arc<dyn RemoteStore>, ConnectError>;
}

/// Dial parameters handed to a [`Connector`].
#[derive(Debug)]
pub struct ConnectOptions {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub dial_timeout: Duration,
    pub keep_alive: Duration,
    pub request_timeout: Duration,
}

impl ConnectOptions {
    pub fn from_meta(meta: &MetaConfig) -> Self {
        Self {
            endpoints: meta.endpoints.clone(),
            username: meta.username.clone(),
            password: meta
                .password
                .as_ref()
                .map(|p| SecretString::from(p.expose_secret().to_string())),
            dial_timeout: DIAL_TIMEOUT,
            keep_alive: KEEP_ALIVE,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

/// The smallest key sorting after `key`.
pub fn key_after(key: &str) -> String {
    let mut next = String::with_capacity(key.len() + 1);
    next.push_str(key);
    next.push('\0');
    next
}

/// End of the key range holding every key that starts with `prefix`.
///
/// The last character that has a successor is bumped and everything after
/// it dropped. With no such character the range runs to the end of the
/// keyspace, which etcd spells as a single NUL.
pub fn prefix_range_end(prefix: &str) -> String {
    let mut end: Vec<char> = prefix.chars().collect();
    while let Some(last) = end.pop() {
        if let Some(next) = successor(last) {
            end.push(next);
            return end.into_iter().collect();
        }
    }
    "\0".to_string()
}

fn successor(c: char) -> Option<char> {
    match c {
        '\u{d7ff}' => Some('\u{e000}'),
        char::MAX => None,
        c => char::from_u32(c as u32 + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end("/conf/p/ns/"), "/conf/p/ns0");
        assert_eq!(prefix_range_end("a\u{10ffff}"), "b");
        assert_eq!(prefix_range_end("\u{10ffff}"), "\0");

        let end = prefix_range_end("/conf/p/ns/");
        assert!("/conf/p/ns/zzz.toml" < end.as_str());
        assert!("/conf/p/ns0" >= end.as_str());
    }

    #[test]
    fn test_key_after_sorts_directly_after() {
        let key = "/conf/p/ns/mysql.toml";
        let next = key_after(key);
        assert!(next.as_str() > key);
        assert!(next.as_str() < "/conf/p/ns/mysql.toml.bak");
        assert!(next.as_str() < "/conf/p/ns/mysql.tomm");
    }

    #[test]
    fn test_connect_options_from_meta() {
        let meta = MetaConfig::from_toml_str(
            r#"
[sail]
etcd_endpoints = "127.0.0.1:2379"
etcd_username = "root"
etcd_password = "secret"
project_key = "p"
namespace = "ns"
"#,
        )
        .unwrap();
        let options = ConnectOptions::from_meta(&meta);
        assert_eq!(options.endpoints, vec!["127.0.0.1:2379"]);
        assert_eq!(options.username.as_deref(), Some("root"));
        assert_eq!(options.password.unwrap().expose_secret(), "secret");
        assert_eq!(options.dial_timeout, DIAL_TIMEOUT);
    }
}
