use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tileworld_net::TunnelConfig;

/// Errors from loading a server configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Server settings, read from a JSON file. Missing keys take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the tunnel listener binds.
    pub bind: String,
    /// Snapshot that seeds the world. Empty world when unset.
    #[serde(alias = "entitiesPath")]
    pub entities_path: Option<PathBuf>,
    /// Capacity of every internal queue.
    pub queue_capacity: usize,
    /// Per-operation idle deadline on each connection.
    pub idle_timeout_secs: u64,
    /// Subscribe every connection to broadcast notifications.
    pub subscribe_broadcast: bool,
    /// Move a connection's position subscription along with its entity.
    pub follow_entity: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
            entities_path: None,
            queue_capacity: 100,
            idle_timeout_secs: 120,
            subscribe_broadcast: true,
            follow_entity: true,
        }
    }
}

impl ServerConfig {
    /// Read and check a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        // Relative snapshot paths are relative to the config file.
        if let Some(dir) = path.parent() {
            if let Some(entities) = config.entities_path.as_mut().filter(|p| p.is_relative()) {
                *entities = dir.join(&*entities);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("bind address is empty".into()));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            idle_timeout: self.idle_timeout(),
            queue_capacity: self.queue_capacity,
        }
    }
}
