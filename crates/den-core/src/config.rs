//! Agent configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for the workspace agent, immutable for the process
/// lifetime. Loadable from TOML; the non-serializable collaborators (control
/// plane client, token exchanger) are injected separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory for agent-owned scratch files (startup script log,
    /// forwarded-agent sockets).
    pub temp_dir: PathBuf,

    /// How long a reconnecting-PTY session survives with no subscriber
    /// heartbeats before it is torn down.
    #[serde(with = "duration_secs")]
    pub reconnecting_pty_timeout: Duration,

    /// Static environment overrides applied to every child process, after
    /// everything else.
    pub env: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            reconnecting_pty_timeout: Duration::from_secs(5 * 60),
            env: HashMap::new(),
        }
    }
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("den")
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("failed to read config: {}", e)))?;

    Ok(toml::from_str(&content)?)
}

/// Serialize `Duration` as whole seconds in config files
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
