use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mcp::{AuthPolicy, ServerIdentity};
use crate::session::{ReconnectPolicy, SessionPolicy};

/// Process configuration, loaded from TOML. Every key is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name reported in `initialize`.
    pub server_name: String,
    pub max_connections: usize,
    /// Default timeout for `ssh_execute` calls without one, and for file
    /// operations.
    pub command_timeout_secs: u64,
    pub health: HealthConfig,
    pub reconnect: ReconnectConfig,
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "ssh-mcp".to_string(),
            max_connections: 10,
            command_timeout_secs: 60,
            health: HealthConfig::default(),
            reconnect: ReconnectConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

/// `[health]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// How often the pool sweeps sessions.
    pub sweep_interval_secs: u64,
    /// Minimum age of the last check before a session is probed again.
    pub check_interval_secs: u64,
    pub check_timeout_secs: u64,
    /// Consecutive failures that force a disconnect.
    pub max_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 15,
            check_interval_secs: 30,
            check_timeout_secs: 10,
            max_failures: 3,
        }
    }
}

/// `[reconnect]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            delay_secs: 5,
        }
    }
}

/// `[auth]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub allow_key: bool,
    pub allow_password: bool,
    pub allow_agent: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_key: true,
            allow_password: true,
            allow_agent: true,
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file path. Returns None if the file doesn't
    /// exist. The loaded config is validated.
    pub fn load(path: &Path) -> Result<Option<Self>, ServerConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|source| ServerConfigError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let config: Self = toml::from_str(&contents)
            .map_err(|source| ServerConfigError::ParseFailed {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ServerConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    pub fn validate(&self) -> Result<(), ServerConfigError> {
        let at_least_one = [
            ("max_connections", self.max_connections as u64),
            ("command_timeout_secs", self.command_timeout_secs),
            ("health.sweep_interval_secs", self.health.sweep_interval_secs),
            ("health.check_interval_secs", self.health.check_interval_secs),
            ("health.check_timeout_secs", self.health.check_timeout_secs),
            ("health.max_failures", u64::from(self.health.max_failures)),
        ];
        for (key, value) in at_least_one {
            if value < 1 {
                return Err(ServerConfigError::Invalid {
                    key,
                    reason: format!("must be >= 1, got {value}"),
                });
            }
        }
        if self.server_name.trim().is_empty() {
            return Err(ServerConfigError::Invalid {
                key: "server_name",
                reason: "cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            health_check_interval: Duration::from_secs(self.health.check_interval_secs),
            health_check_timeout: Duration::from_secs(self.health.check_timeout_secs),
            max_health_check_failures: self.health.max_failures,
            reconnect: ReconnectPolicy {
                enabled: self.reconnect.enabled,
                max_attempts: self.reconnect.max_attempts,
                delay: Duration::from_secs(self.reconnect.delay_secs),
                ..ReconnectPolicy::default()
            },
            ..SessionPolicy::default()
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.health.sweep_interval_secs)
    }

    pub fn auth_policy(&self) -> AuthPolicy {
        AuthPolicy {
            allow_key: self.auth.allow_key,
            allow_password: self.auth.allow_password,
            allow_agent: self.auth.allow_agent,
        }
    }

    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity {
            name: self.server_name.clone(),
            ..ServerIdentity::default()
        }
    }

    pub fn to_toml(&self) -> Result<String, ServerConfigError> {
        toml::to_string_pretty(self).map_err(ServerConfigError::SerializeFailed)
    }
}

/// `<config_dir>/ssh-mcp/config.toml`, or a relative path when the platform
/// has no config directory.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ssh-mcp")
        .join("config.toml")
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ServerConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config {}: {source}", path.display())]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[source] toml::ser::Error),
    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Warn when the config file is world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            path = %path.display(),
            mode = format_args!("{:o}", mode & 0o7777),
            "config file is world-readable; consider restricting permissions to 600",
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
