//! Configuration parsing for kind cluster management.
//!
//! Every recognised option is a field of [`Config`] with its default in
//! `impl Default`. Files use a `key=value` format with `#` comments.
//! Precedence: CLI flags > `--config` file > defaults.

use crate::types::{LogLevel, PortMapping};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Default template for streamed output lines.
pub const DEFAULT_LOG_FORMAT: &str = "[KIND {stream}] {message}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid log level for {key}: {value}")]
    InvalidLevel { key: String, value: String },
    #[error("invalid port mapping: {0}")]
    InvalidPortMapping(String),
    #[error("cluster_timeout_sec must not be negative, got {0}")]
    NegativeTimeout(i64),
}

/// Cluster and streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Executables
    pub kind_bin: PathBuf,
    pub docker_bin: PathBuf,
    pub kubectl_bin: PathBuf,

    // Cluster identity and creation parameters
    pub cluster_name: Option<String>,
    /// Bound for every blocking lifecycle operation. Zero disables the bound
    /// for command execution.
    pub cluster_timeout_sec: i64,
    pub keep_cluster: bool,
    pub node_image: Option<String>,
    pub cluster_config: Option<PathBuf>,
    pub extra_port_mappings: Vec<PortMapping>,
    /// Value passed to `kind create cluster --wait=`.
    pub create_wait: String,

    // Readiness and inventory
    pub ready_poll_interval_ms: u64,
    pub probe_timeout_sec: u64,
    pub ready_check_timeout_sec: u64,
    pub prerequisite_timeout_sec: u64,
    pub node_query_timeout_sec: u64,

    // Streaming
    pub stream_logs: bool,
    pub stdout_level: LogLevel,
    pub stderr_level: LogLevel,
    pub log_format: String,
    pub drain_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kind_bin: PathBuf::from("kind"),
            docker_bin: PathBuf::from("docker"),
            kubectl_bin: PathBuf::from("kubectl"),
            cluster_name: None,
            cluster_timeout_sec: 300,
            keep_cluster: false,
            node_image: None,
            cluster_config: None,
            extra_port_mappings: Vec::new(),
            create_wait: "60s".to_string(),
            ready_poll_interval_ms: 2000,
            probe_timeout_sec: 10,
            ready_check_timeout_sec: 10,
            prerequisite_timeout_sec: 10,
            node_query_timeout_sec: 30,
            stream_logs: true,
            stdout_level: LogLevel::Info,
            stderr_level: LogLevel::Warning,
            log_format: DEFAULT_LOG_FORMAT.to_string(),
            drain_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "kind_bin" => self.kind_bin = PathBuf::from(value),
            "docker_bin" => self.docker_bin = PathBuf::from(value),
            "kubectl_bin" => self.kubectl_bin = PathBuf::from(value),
            "cluster_name" => self.cluster_name = Self::optional(value),
            "cluster_timeout_sec" => {
                let timeout: i64 = Self::parse_int(key, value)?;
                if timeout < 0 {
                    return Err(ConfigError::NegativeTimeout(timeout));
                }
                self.cluster_timeout_sec = timeout;
            }
            "keep_cluster" => self.keep_cluster = Self::parse_bool(key, value)?,
            "node_image" => self.node_image = Self::optional(value),
            "cluster_config" => self.cluster_config = Self::optional(value).map(PathBuf::from),
            "extra_port_mappings" => {
                self.extra_port_mappings = value
                    .split_whitespace()
                    .map(|entry| entry.parse().map_err(ConfigError::InvalidPortMapping))
                    .collect::<Result<Vec<PortMapping>, _>>()?;
            }
            "create_wait" => self.create_wait = value.to_string(),
            "ready_poll_interval_ms" => self.ready_poll_interval_ms = Self::parse_int(key, value)?,
            "probe_timeout_sec" => self.probe_timeout_sec = Self::parse_int(key, value)?,
            "ready_check_timeout_sec" => {
                self.ready_check_timeout_sec = Self::parse_int(key, value)?;
            }
            "prerequisite_timeout_sec" => {
                self.prerequisite_timeout_sec = Self::parse_int(key, value)?;
            }
            "node_query_timeout_sec" => self.node_query_timeout_sec = Self::parse_int(key, value)?,
            "stream_logs" => self.stream_logs = Self::parse_bool(key, value)?,
            "stdout_level" => self.stdout_level = Self::parse_level(key, value)?,
            "stderr_level" => self.stderr_level = Self::parse_level(key, value)?,
            "log_format" => self.log_format = value.to_string(),
            "drain_timeout_ms" => self.drain_timeout_ms = Self::parse_int(key, value)?,
            _ => {
                warn!(key, "unknown config key");
            }
        }
        Ok(())
    }

    fn optional(value: &str) -> Option<String> {
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_level(key: &str, value: &str) -> Result<LogLevel, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidLevel {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Check invariants that field assignment alone cannot enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_timeout_sec < 0 {
            return Err(ConfigError::NegativeTimeout(self.cluster_timeout_sec));
        }
        Ok(())
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_sec)
    }

    pub fn ready_check_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_check_timeout_sec)
    }

    pub fn prerequisite_timeout(&self) -> Duration {
        Duration::from_secs(self.prerequisite_timeout_sec)
    }

    pub fn node_query_timeout(&self) -> Duration {
        Duration::from_secs(self.node_query_timeout_sec)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Resolve a relative `cluster_config` against a base directory.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        if let Some(ref cluster_config) = self.cluster_config {
            if cluster_config.is_relative() {
                self.cluster_config = Some(base_dir.join(cluster_config));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use tempfile::TempDir;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.kind_bin, PathBuf::from("kind"));
        assert_eq!(config.cluster_timeout_sec, 300);
        assert!(!config.keep_cluster);
        assert!(config.stream_logs);
        assert_eq!(config.stdout_level, LogLevel::Info);
        assert_eq!(config.stderr_level, LogLevel::Warning);
        assert_eq!(config.log_format, "[KIND {stream}] {message}");
        assert_eq!(config.create_wait, "60s");
        assert_eq!(config.probe_timeout(), Duration::from_secs(10));
        assert_eq!(config.node_query_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# cluster settings
cluster_name="ci-cluster"
cluster_timeout_sec=600
keep_cluster=yes
node_image='kindest/node:v1.30.0'
stdout_level=debug
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.cluster_name.as_deref(), Some("ci-cluster"));
        assert_eq!(config.cluster_timeout_sec, 600);
        assert!(config.keep_cluster);
        assert_eq!(config.node_image.as_deref(), Some("kindest/node:v1.30.0"));
        assert_eq!(config.stdout_level, LogLevel::Debug);
    }

    #[test]
    fn parse_port_mappings() {
        let mut config = Config::default();
        config
            .parse_content("extra_port_mappings=80:8080 443:8443/TCP")
            .unwrap();
        assert_eq!(
            config.extra_port_mappings,
            vec![
                PortMapping::new(80, 8080),
                PortMapping::new(443, 8443).with_protocol(Protocol::Tcp),
            ]
        );
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let mut config = Config::default();
        let err = config.parse_content("cluster_timeout_sec=-1").unwrap_err();
        assert!(matches!(err, ConfigError::NegativeTimeout(-1)));

        let config = Config {
            cluster_timeout_sec: -5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_is_accepted() {
        let mut config = Config::default();
        config.parse_content("cluster_timeout_sec=0").unwrap();
        assert_eq!(config.cluster_timeout_sec, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_level_is_rejected() {
        let mut config = Config::default();
        let err = config.parse_content("stderr_level=LOUD").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLevel { .. }));
    }

    #[test]
    fn line_without_equals_is_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("stream_logs"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = Config::default();
        config.parse_content("colour=blue\nstream_logs=off").unwrap();
        assert!(!config.stream_logs);
    }

    #[test]
    fn empty_value_clears_optional_fields() {
        let mut config = Config::default();
        config.parse_content("node_image=foo\nnode_image=").unwrap();
        assert!(config.node_image.is_none());
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("test", "true").unwrap());
        assert!(Config::parse_bool("test", "on").unwrap());
        assert!(!Config::parse_bool("test", "0").unwrap());
        assert!(!Config::parse_bool("test", "off").unwrap());
        assert!(Config::parse_bool("test", "maybe").is_err());
    }

    #[test]
    fn resolve_paths_joins_relative_cluster_config() {
        let mut config = Config {
            cluster_config: Some(PathBuf::from("kind.yaml")),
            ..Default::default()
        };
        config.resolve_paths(Path::new("/work"));
        assert_eq!(config.cluster_config, Some(PathBuf::from("/work/kind.yaml")));
    }

    #[test]
    fn from_file_reads_and_merges() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "kind_bin=/opt/kind\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.kind_bin, PathBuf::from("/opt/kind"));
        assert_eq!(config.docker_bin, PathBuf::from("docker"));
    }
}
