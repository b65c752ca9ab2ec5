use std::path::PathBuf;

use clap::Parser;
use sail::RawMetaConfig;

#[derive(Parser, Debug)]
#[command(name = "sail", version)]
#[command(about = "Pull remote configuration from etcd and keep a local cache in sync")]
pub struct Cli {
    /// TOML bootstrap file with a [sail] table; flags override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Comma separated etcd endpoints, e.g. 127.0.0.1:2379,127.0.0.1:12379
    #[arg(long = "sail-etcd-endpoints", env = "SAIL_ETCD_ENDPOINTS")]
    pub etcd_endpoints: Option<String>,

    #[arg(long = "sail-etcd-username", env = "SAIL_ETCD_USERNAME")]
    pub etcd_username: Option<String>,

    #[arg(long = "sail-etcd-password", env = "SAIL_ETCD_PASSWORD", hide_env_values = true)]
    pub etcd_password: Option<String>,

    #[arg(long = "sail-project-key", env = "SAIL_PROJECT_KEY")]
    pub project_key: Option<String>,

    #[arg(long = "sail-namespace", env = "SAIL_NAMESPACE")]
    pub namespace: Option<String>,

    /// Key used to decrypt encrypted entries
    #[arg(long = "sail-namespace-key", env = "SAIL_NAMESPACE_KEY", hide_env_values = true)]
    pub namespace_key: Option<String>,

    /// Comma separated entry names, e.g. mysql.toml,cfg.json,redis.yaml
    #[arg(long = "sail-configs", env = "SAIL_CONFIGS")]
    pub configs: Option<String>,

    /// Local cache directory
    #[arg(long = "sail-config-file-path", env = "SAIL_CONFIG_FILE_PATH")]
    pub config_file_path: Option<String>,

    /// DEBUG, INFO, WARN or ERROR
    #[arg(long = "sail-log-level", env = "SAIL_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Write all entries into one config.toml
    #[arg(long = "sail-merge-config", env = "SAIL_MERGE_CONFIG")]
    pub merge_config: bool,

    /// Keep following changes until Ctrl-C
    #[arg(short, long)]
    pub watch: bool,

    /// Print the merged configuration as JSON after pulling
    #[arg(long)]
    pub print: bool,
}

impl Cli {
    /// Layers flags and environment over the bootstrap file, if any.
    pub fn raw_meta(&self) -> sail::Result<RawMetaConfig> {
        let mut raw = match &self.config {
            Some(path) => RawMetaConfig::from_toml_file(path)?,
            None => RawMetaConfig::default(),
        };

        let overrides = [
            (&self.etcd_endpoints, &mut raw.etcd_endpoints),
            (&self.etcd_username, &mut raw.etcd_username),
            (&self.etcd_password, &mut raw.etcd_password),
            (&self.project_key, &mut raw.project_key),
            (&self.namespace, &mut raw.namespace),
            (&self.namespace_key, &mut raw.namespace_key),
            (&self.configs, &mut raw.configs),
            (&self.config_file_path, &mut raw.config_file_path),
            (&self.log_level, &mut raw.log_level),
        ];
        for (flag, field) in overrides {
            if let Some(value) = flag {
                *field = value.clone();
            }
        }
        if self.merge_config {
            raw.merge_config = true;
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_flags_only() {
        let cli = Cli::try_parse_from([
            "sail",
            "--sail-etcd-endpoints",
            "127.0.0.1:2379",
            "--sail-project-key",
            "p",
            "--sail-namespace",
            "ns",
            "--sail-configs",
            "mysql.toml,redis.yaml",
            "--sail-merge-config",
            "--watch",
        ])
        .unwrap();
        assert!(cli.watch);

        let raw = cli.raw_meta().unwrap();
        assert_eq!(raw.etcd_endpoints, "127.0.0.1:2379");
        assert_eq!(raw.configs, "mysql.toml,redis.yaml");
        assert!(raw.merge_config);
    }

    #[test]
    #[serial]
    fn test_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
[sail]
etcd_endpoints = "127.0.0.1:2379"
project_key = "p"
namespace = "dev"
configs = "mysql.toml"
"#,
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::try_parse_from(["sail", "--config", &path, "--sail-namespace", "prod"])
            .unwrap();
        let raw = cli.raw_meta().unwrap();
        assert_eq!(raw.namespace, "prod");
        assert_eq!(raw.project_key, "p");
        assert_eq!(raw.configs, "mysql.toml");
        assert!(!raw.merge_config);
    }

    #[test]
    #[serial]
    fn test_env_fallback() {
        std::env::set_var("SAIL_NAMESPACE", "from-env");
        let cli = Cli::try_parse_from(["sail"]).unwrap();
        std::env::remove_var("SAIL_NAMESPACE");
        assert_eq!(cli.namespace.as_deref(), Some("from-env"));
    }
}
