use std::path::Path;

use serde::Deserialize;

use crate::config::meta::{MetaConfig, RawMetaConfig};
use crate::error::{Result, SailError};

/// Environment variables read by [`MetaConfig::from_env`].
pub const ENV_ETCD_ENDPOINTS: &str = "SAIL_ETCD_ENDPOINTS";
pub const ENV_ETCD_USERNAME: &str = "SAIL_ETCD_USERNAME";
pub const ENV_ETCD_PASSWORD: &str = "SAIL_ETCD_PASSWORD";
pub const ENV_PROJECT_KEY: &str = "SAIL_PROJECT_KEY";
pub const ENV_NAMESPACE: &str = "SAIL_NAMESPACE";
pub const ENV_NAMESPACE_KEY: &str = "SAIL_NAMESPACE_KEY";
pub const ENV_CONFIGS: &str = "SAIL_CONFIGS";
pub const ENV_CONFIG_FILE_PATH: &str = "SAIL_CONFIG_FILE_PATH";
pub const ENV_LOG_LEVEL: &str = "SAIL_LOG_LEVEL";
pub const ENV_MERGE_CONFIG: &str = "SAIL_MERGE_CONFIG";

#[derive(Deserialize)]
struct BootstrapFile {
    sail: RawMetaConfig,
}

impl RawMetaConfig {
    /// Reads the `[sail]` table of a TOML bootstrap file without validating it.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SailError::configuration(format!("read toml file '{}' err: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: BootstrapFile = toml::from_str(content)
            .map_err(|e| SailError::configuration(format!("unmarshal toml file err: {}", e)))?;
        Ok(file.sail)
    }

    /// Reads the `SAIL_*` environment variables; unset ones stay empty.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).unwrap_or_default();
        RawMetaConfig {
            etcd_endpoints: var(ENV_ETCD_ENDPOINTS),
            etcd_username: var(ENV_ETCD_USERNAME),
            etcd_password: var(ENV_ETCD_PASSWORD),
            project_key: var(ENV_PROJECT_KEY),
            namespace: var(ENV_NAMESPACE),
            namespace_key: var(ENV_NAMESPACE_KEY),
            configs: var(ENV_CONFIGS),
            config_file_path: var(ENV_CONFIG_FILE_PATH),
            log_level: var(ENV_LOG_LEVEL),
            merge_config: parse_bool(&var(ENV_MERGE_CONFIG)),
        }
    }
}

impl MetaConfig {
    /// Loads the `[sail]` table of a TOML bootstrap file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_raw(RawMetaConfig::from_toml_file(path)?)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::from_raw(RawMetaConfig::from_toml_str(content)?)
    }

    /// Reads the `SAIL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_raw(RawMetaConfig::from_env())
    }
}

/// Lenient boolean parsing; anything unrecognized is false.
pub(crate) fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "t" | "true" | "y" | "yes" | "on"
    )
}
