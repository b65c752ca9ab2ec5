//! Validated run parameters for a [`Sail`](crate::Sail) client.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Result, SailError};

/// Log verbosity accepted in the meta config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = SailError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(SailError::configuration(format!(
                "log level must be one of DEBUG, INFO, WARN, ERROR (got '{}')",
                other
            ))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unvalidated parameters as they appear in a bootstrap source.
///
/// Field names match the `[sail]` table of the TOML bootstrap file.
/// Lists (`etcd_endpoints`, `configs`) are comma separated.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawMetaConfig {
    pub etcd_endpoints: String,
    pub etcd_username: String,
    pub etcd_password: String,
    pub project_key: String,
    pub namespace: String,
    pub namespace_key: String,
    /// e.g. `mysql.toml,cfg.json,redis.yaml`; empty means pull nothing.
    pub configs: String,
    /// Local cache directory; empty disables the cache.
    pub config_file_path: String,
    /// `DEBUG`, `INFO`, `WARN` or `ERROR`; empty keeps the default.
    pub log_level: String,
    /// Write every entry into one namespaced `config.toml`.
    pub merge_config: bool,
}

/// Validated, immutable client parameters.
#[derive(Debug)]
pub struct MetaConfig {
    pub endpoints: Vec<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub project_key: String,
    pub namespace: String,
    /// Enables decryption of base64 encoded entries.
    pub namespace_key: Option<SecretString>,
    /// Requested entry names, sorted and de-duplicated.
    pub configs: Vec<String>,
    pub cache_dir: Option<PathBuf>,
    pub merge_config: bool,
    pub log_level: Option<LogLevel>,
}

impl MetaConfig {
    /// Validates raw parameters.
    pub fn from_raw(raw: RawMetaConfig) -> Result<Self> {
        let endpoints = split_list(&raw.etcd_endpoints);
        if endpoints.is_empty() {
            return Err(SailError::configuration("please set etcd endpoints"));
        }
        for endpoint in &endpoints {
            validate_endpoint(endpoint)?;
        }

        let project_key = raw.project_key.trim().to_string();
        if project_key.is_empty() {
            return Err(SailError::configuration("please set project key"));
        }

        let namespace = raw.namespace.trim().to_string();
        if namespace.is_empty() {
            return Err(SailError::configuration("please set namespace"));
        }
        if project_key.contains('/') || namespace.contains('/') {
            return Err(SailError::configuration(
                "project key and namespace must not contain '/'",
            ));
        }

        let log_level = match raw.log_level.trim() {
            "" => None,
            level => Some(level.parse::<LogLevel>()?),
        };

        Ok(Self {
            endpoints,
            username: non_empty(raw.etcd_username),
            password: non_empty(raw.etcd_password).map(SecretString::from),
            project_key,
            namespace,
            namespace_key: non_empty(raw.namespace_key).map(SecretString::from),
            configs: normalize_configs(split_list(&raw.configs)),
            cache_dir: non_empty(raw.config_file_path).map(PathBuf::from),
            merge_config: raw.merge_config,
            log_level,
        })
    }

    /// Key prefix of this namespace: `/conf/{project_key}/{namespace}/`.
    pub fn key_prefix(&self) -> String {
        format!("/conf/{}/{}/", self.project_key, self.namespace)
    }

    /// Full remote key of one entry.
    pub fn remote_key(&self, name: &str) -> String {
        let mut key = self.key_prefix();
        key.push_str(name);
        key
    }

    pub fn is_requested(&self, name: &str) -> bool {
        crate::sync::is_requested(&self.configs, name)
    }
}

/// Sorts and de-duplicates requested names.
pub(crate) fn normalize_configs(configs: Vec<String>) -> Vec<String> {
    let mut configs: Vec<String> = configs
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    configs.sort();
    configs.dedup();
    configs
}

pub(crate) fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let invalid = |reason: &str| {
        SailError::configuration(format!("parse endpoint '{}' fail: {}", endpoint, reason))
    };

    let address = endpoint
        .strip_prefix("http://")
        .or_else(|| endpoint.strip_prefix("https://"))
        .unwrap_or(endpoint);

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, port) = rest
            .split_once("]:")
            .ok_or_else(|| invalid("missing port after IPv6 address"))?;
        (host, port)
    } else {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if host.contains(':') {
            return Err(invalid("too many colons"));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    Ok(())
}
