use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SailError {
    #[error("Invalid meta config: {message}")]
    Configuration { message: String },

    #[error("Can't connect to the remote store: {0}")]
    Connect(#[from] ConnectError),

    #[error("Read empty config from remote under '{prefix}'")]
    Fetch { prefix: String },

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Failed to decode config '{name}': {source}")]
    Decode {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("Key '{key}' is defined by more than one config: {entries:?}")]
    AmbiguousKey { key: String, entries: Vec<String> },

    #[error("Failed to persist config cache '{path}': {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize config '{name}' for the cache: {source}")]
    Serialize {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("Failed to read local config '{path}': {source}")]
    LocalCache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not connected to the remote store")]
    NotConnected,

    #[error("Client is closed")]
    Closed,
}

impl SailError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        SailError::Configuration {
            message: message.into(),
        }
    }

    /// Returns true if the error came from the remote connection timing out.
    pub fn is_timeout(&self) -> bool {
        match self {
            SailError::Connect(e) => e.is_timeout(),
            SailError::Remote(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Errors that can occur while dialing the remote store.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

impl ConnectError {
    /// Returns true if the dial timed out and a later attempt may succeed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectError::Timeout(_))
    }
}

/// Errors returned by an established remote store connection.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Watch canceled by remote: {0}")]
    WatchCanceled(String),

    #[error("Connection closed")]
    Closed,
}

impl RemoteError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RemoteError::Timeout)
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if let Some(status) = err.status() {
            RemoteError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            RemoteError::Malformed(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

/// Errors raised while parsing or serializing a single config entry.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Unsupported config type '{0}'")]
    UnsupportedFormat(String),

    #[error("Invalid TOML: {0}")]
    Toml(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid properties at line {line}: {message}")]
    Properties { line: usize, message: String },

    #[error("Top level of a {format} config must be a table")]
    NotATable { format: &'static str },

    #[error("Value at '{key}' can't be represented as {format}")]
    Unrepresentable { key: String, format: &'static str },
}

pub type Result<T> = std::result::Result<T, SailError>;
