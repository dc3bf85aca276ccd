//! Server configuration, loadable from a TOML file with serde defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_listen_addr() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_diagnostics_addr() -> String {
    "127.0.0.1:7421".to_string()
}

/// A peer that sends nothing (not even a heartbeat) for this long is dead.
fn default_read_timeout_secs() -> u64 {
    65
}

fn default_diagnostics_timeout_secs() -> u64 {
    10
}

/// Configuration for the archive server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Root directory of the archive store.
    pub root: PathBuf,
    /// Address the client protocol listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Address the diagnostics protocol listens on.
    #[serde(default = "default_diagnostics_addr")]
    pub diagnostics_addr: String,
    /// Idle read timeout per connection, in seconds.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Per-request timeout on the diagnostics socket, in seconds.
    #[serde(default = "default_diagnostics_timeout_secs")]
    pub diagnostics_timeout_secs: u64,
}

impl ServerConfig {
    /// Builds a config with defaults for everything but the store root.
    #[must_use]
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        ServerConfig {
            root: root.into(),
            listen_addr: default_listen_addr(),
            diagnostics_addr: default_diagnostics_addr(),
            read_timeout_secs: default_read_timeout_secs(),
            diagnostics_timeout_secs: default_diagnostics_timeout_secs(),
        }
    }

    /// Parses a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    #[must_use]
    pub fn diagnostics_timeout(&self) -> Duration {
        Duration::from_secs(self.diagnostics_timeout_secs)
    }
}

/// Failure to load the server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: ServerConfig = toml::from_str(r#"root = "/var/lib/harbor""#).unwrap();
        assert_eq!(config.root, PathBuf::from("/var/lib/harbor"));
        assert_eq!(config.read_timeout_secs, 65);
        assert_eq!(config.diagnostics_timeout_secs, 10);
        assert_eq!(config.listen_addr, "127.0.0.1:7420");
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            root = "/data/archive"
            listen_addr = "0.0.0.0:9000"
            read_timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.read_timeout_secs, 5);
    }
}
