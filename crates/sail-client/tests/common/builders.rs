//! Builder for meta configs used in tests.

#![allow(dead_code)]

use std::path::Path;

use sail::{MetaConfig, RawMetaConfig};

pub const PROJECT_KEY: &str = "8a1b491062690963bd978fb8a6958371";
pub const NAMESPACE: &str = "dev";
pub const NAMESPACE_KEY: &str = "NTUZNTNQNUKYEL4GP5SGVDV9LEYZAWBD";

/// Builder for creating `MetaConfig` instances.
pub struct MetaBuilder {
    raw: RawMetaConfig,
}

impl MetaBuilder {
    /// A valid config for one local endpoint and nothing requested.
    pub fn new() -> Self {
        Self {
            raw: RawMetaConfig {
                etcd_endpoints: "127.0.0.1:2379".to_string(),
                project_key: PROJECT_KEY.to_string(),
                namespace: NAMESPACE.to_string(),
                namespace_key: NAMESPACE_KEY.to_string(),
                ..RawMetaConfig::default()
            },
        }
    }

    pub fn configs(mut self, configs: &[&str]) -> Self {
        self.raw.configs = configs.join(",");
        self
    }

    pub fn cache_dir(mut self, path: &Path) -> Self {
        self.raw.config_file_path = path.to_string_lossy().into_owned();
        self
    }

    pub fn merge_config(mut self, merge: bool) -> Self {
        self.raw.merge_config = merge;
        self
    }

    pub fn namespace_key(mut self, key: &str) -> Self {
        self.raw.namespace_key = key.to_string();
        self
    }

    pub fn build(self) -> MetaConfig {
        MetaConfig::from_raw(self.raw).expect("test meta config is valid")
    }
}

impl Default for MetaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Full remote key of an entry in the test namespace.
pub fn remote_key(name: &str) -> String {
    format!("/conf/{}/{}/{}", PROJECT_KEY, NAMESPACE, name)
}
