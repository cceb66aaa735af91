//! Path/env resolver & configuration loading.
//!
//! TOML file + environment variable overrides, following the same
//! `#[serde(default)]`-per-section / `with_env_overrides` shape the daemon's
//! original Postgres-backed config used.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MessagingConfig {
    pub storage: StorageConfig,
    pub ipc: IpcConfig,
    pub platforms: PlatformsConfig,
    pub health: HealthConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the embedded SQLite state store.
    pub state_db_path: String,
    /// Directory holding per-platform private session material and blobs.
    pub state_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_db_path: "messages/state.db".to_string(),
            state_dir: "messages".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub socket_path: String,
    pub pid_file_path: String,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/messages-daemon.sock".to_string(),
            pid_file_path: "/tmp/messages-daemon.pid".to_string(),
            connect_timeout_ms: 5_000,
            response_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformsConfig {
    /// Startup priority order, most reliable first. Shutdown is the reverse.
    pub priority: Vec<String>,
    pub backoff_schedule_ms: Vec<u64>,
    pub max_reconnect_attempts: u32,
}

impl Default for PlatformsConfig {
    fn default() -> Self {
        Self {
            priority: vec![
                "signal".to_string(),
                "whatsapp".to_string(),
                "discord".to_string(),
                "telegram".to_string(),
                "gmail".to_string(),
            ],
            backoff_schedule_ms: vec![10_000, 30_000, 60_000, 120_000, 300_000],
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    pub stale_threshold_ms: i64,
    pub error_window_ms: i64,
    pub max_errors_before_unhealthy: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
            stale_threshold_ms: 5 * 60 * 1000,
            error_window_ms: 5 * 60 * 1000,
            max_errors_before_unhealthy: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub log_path: String,
    pub dedup_window_ms: i64,
    pub log_rotate_bytes: u64,
    pub desktop_enabled: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            log_path: "logging/daemon.log".to_string(),
            dedup_window_ms: 60_000,
            log_rotate_bytes: 10 * 1024 * 1024,
            desktop_enabled: false,
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<MessagingConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(MessagingConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let parsed: MessagingConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    Ok(parsed.with_env_overrides())
}

impl MessagingConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var("MESSAGED_STATE_DIR") {
            if !path.trim().is_empty() {
                self.storage.state_dir = path;
            }
        }

        if let Ok(sock) = std::env::var("MESSAGED_IPC_SOCKET") {
            if !sock.trim().is_empty() {
                self.ipc.socket_path = sock;
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_five_platforms_in_priority_order() {
        let cfg = MessagingConfig::default();
        assert_eq!(
            cfg.platforms.priority,
            vec!["signal", "whatsapp", "discord", "telegram", "gmail"]
        );
    }

    #[test]
    fn parse_toml_uses_defaults_for_missing_fields() {
        let parsed: MessagingConfig = toml::from_str(
            r#"
            [ipc]
            socket_path = "/tmp/custom.sock"
            "#,
        )
        .expect("parse toml");

        assert_eq!(parsed.ipc.socket_path, "/tmp/custom.sock");
        assert_eq!(parsed.ipc.response_timeout_ms, 30_000);
        assert_eq!(parsed.platforms.max_reconnect_attempts, 5);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let cfg = load_config("/nonexistent/path/messaged.toml").expect("defaults");
        assert_eq!(cfg.ipc.pid_file_path, "/tmp/messages-daemon.pid");
    }
}
