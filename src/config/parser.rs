use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for the install/update pipeline and the game's on-disk layout.
///
/// The pipeline only needs to know how to reach the distribution tool, which
/// app to fetch, and where the server executable lands inside an install
/// directory.
///
/// # Examples
///
/// ```
/// use gameserver_runner::config::InstallConfig;
///
/// let install = InstallConfig::default();
/// assert_eq!(install.app_id, 2430930);
/// assert!(install.validate);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallConfig {
    /// Path to the `steamcmd` executable.
    pub steamcmd_path: PathBuf,

    /// Steam app id of the dedicated server.
    pub app_id: u32,

    /// Server executable, relative to a server's install path.
    pub executable: PathBuf,

    /// Ask the distribution tool to verify every file on update.
    pub validate: bool,

    /// Upper bound on a single distribution tool invocation.
    pub timeout_secs: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            steamcmd_path: PathBuf::from("steamcmd"),
            app_id: 2430930,
            executable: PathBuf::from("ShooterGame/Binaries/Win64/ArkAscendedServer.exe"),
            validate: true,
            timeout_secs: 3600,
        }
    }
}

impl InstallConfig {
    /// Timeout for one distribution tool invocation.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Settings for the status cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusConfig {
    /// How long a cached liveness answer stays fresh, in milliseconds.
    pub freshness_ms: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { freshness_ms: 2000 }
    }
}

impl StatusConfig {
    /// Freshness threshold as a `Duration`.
    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_ms)
    }
}

/// Settings for the remote command (RCON) client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteCommandConfig {
    /// Upper bound on one connect/auth/command/response exchange, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for RemoteCommandConfig {
    fn default() -> Self {
        Self { timeout_ms: 5000 }
    }
}

impl RemoteCommandConfig {
    /// Round trip bound as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Settings for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventsConfig {
    /// Broadcast channel capacity per subscriber.
    pub capacity: usize,

    /// Number of past events kept for `recent_events` queries.
    pub history_limit: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            history_limit: 1000,
        }
    }
}

/// Main configuration for the Gameserver Runner.
///
/// # JSON Schema
///
/// Every section is optional and falls back to its defaults:
///
/// ```json
/// {
///   "serversDir": "/srv/gameservers",
///   "install": {
///     "steamcmdPath": "/usr/games/steamcmd",
///     "appId": 2430930,
///     "executable": "ShooterGame/Binaries/Win64/ArkAscendedServer.exe",
///     "validate": true,
///     "timeoutSecs": 3600
///   },
///   "status": { "freshnessMs": 2000 },
///   "remoteCommand": { "timeoutMs": 5000 },
///   "events": { "capacity": 256, "historyLimit": 1000 }
/// }
/// ```
///
/// # Examples
///
/// ```
/// use gameserver_runner::config::RunnerConfig;
///
/// let config = RunnerConfig::parse_from_str(r#"{ "serversDir": "/srv/gs" }"#).unwrap();
/// assert_eq!(config.servers_dir.to_str(), Some("/srv/gs"));
/// assert_eq!(config.remote_command.timeout_ms, 5000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerConfig {
    /// Directory holding one profile directory per managed server.
    pub servers_dir: PathBuf,

    /// Install/update pipeline settings.
    pub install: InstallConfig,

    /// Status cache settings.
    pub status: StatusConfig,

    /// Remote command client settings.
    pub remote_command: RemoteCommandConfig,

    /// Event bus settings.
    pub events: EventsConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            servers_dir: PathBuf::from("servers"),
            install: InstallConfig::default(),
            status: StatusConfig::default(),
            remote_command: RemoteCommandConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Loads a configuration from a file path.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, everything else
    /// as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The file contents are not valid JSON/YAML
    /// * The document does not conform to the expected schema
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );

        if is_yaml {
            Self::parse_from_yaml_str(&content)
        } else {
            Self::parse_from_str(&content)
        }
    }

    /// Parses a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Parses a configuration from a YAML string.
    pub fn parse_from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML config: {}", e)))
    }
}
