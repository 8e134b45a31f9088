use crate::remote::RemoteTarget;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Unique identifier for a managed server
///
/// Ids are assigned by [`ServerStore::create`](crate::server::ServerStore::create)
/// and never change afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(u32);

impl ServerId {
    /// Wrap a raw id
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw integer value
    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for ServerId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a managed server as published on the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Install/update pipeline is running ahead of a start
    Installing,
    /// Server process is being launched
    Starting,
    /// Server process is running
    Running,
    /// Graceful shutdown was accepted by the server
    Stopping,
    /// Server process has exited
    Stopped,
}

/// Identity and configuration of one managed server instance.
///
/// Records are persisted as JSON by the [`ServerStore`](crate::server::ServerStore).
/// Unknown or missing fields fall back to the defaults of a freshly created
/// server, so older profiles keep loading.
///
/// # Examples
///
/// ```
/// use gameserver_runner::server::{ServerId, ServerRecord};
///
/// let mut record = ServerRecord::new(ServerId::new(7));
/// record.install_path = "/srv/7".into();
/// record.remote_command_secret = "hunter2".to_string();
///
/// let target = record.remote_target();
/// assert_eq!(target.port, 27020);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    /// Server id, immutable after creation
    pub id: ServerId,

    /// Display name
    #[serde(default)]
    pub alias: String,

    /// Location of the installed server files; empty until set by the operator
    #[serde(default)]
    pub install_path: PathBuf,

    /// Address the remote command endpoint listens on
    #[serde(default = "default_network_address")]
    pub network_address: String,

    /// RCON port
    #[serde(default = "default_remote_command_port")]
    pub remote_command_port: u16,

    /// RCON admin password
    #[serde(default)]
    pub remote_command_secret: String,

    /// Skip the install/update pipeline when starting
    #[serde(default)]
    pub update_on_start_disabled: bool,

    /// Game settings come from the on-disk ini files instead of the command line
    #[serde(default)]
    pub uses_external_config: bool,

    /// Map to load
    #[serde(default = "default_map")]
    pub map: String,

    /// Session name advertised in the server browser
    #[serde(default)]
    pub session_name: String,

    /// Game port
    #[serde(default = "default_game_port")]
    pub game_port: u16,

    /// Query port
    #[serde(default = "default_query_port")]
    pub query_port: u16,

    /// Player slots
    #[serde(default = "default_max_players")]
    pub max_players: u32,

    /// Extra command line arguments appended verbatim
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_network_address() -> String {
    "0.0.0.0".to_string()
}

fn default_remote_command_port() -> u16 {
    27020
}

fn default_map() -> String {
    "TheIsland_WP".to_string()
}

fn default_game_port() -> u16 {
    7777
}

fn default_query_port() -> u16 {
    27015
}

fn default_max_players() -> u32 {
    70
}

impl ServerRecord {
    /// Create a record with default settings for the given id
    pub fn new(id: ServerId) -> Self {
        Self {
            id,
            alias: format!("Server {}", id),
            install_path: PathBuf::new(),
            network_address: default_network_address(),
            remote_command_port: default_remote_command_port(),
            remote_command_secret: String::new(),
            update_on_start_disabled: false,
            uses_external_config: false,
            map: default_map(),
            session_name: format!("Server {}", id),
            game_port: default_game_port(),
            query_port: default_query_port(),
            max_players: default_max_players(),
            extra_args: Vec::new(),
        }
    }

    /// Whether an install path has been configured
    pub fn has_install_path(&self) -> bool {
        !self.install_path.as_os_str().is_empty()
    }

    /// Coordinates of this server's remote command endpoint
    pub fn remote_target(&self) -> RemoteTarget {
        RemoteTarget {
            address: self.network_address.clone(),
            port: self.remote_command_port,
            secret: self.remote_command_secret.clone(),
        }
    }

    /// Command line passed to the server executable.
    ///
    /// With an external config only the map and `listen` are passed; the ini
    /// files on disk provide everything else.
    pub fn launch_arguments(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.uses_external_config {
            args.push(format!("{}?listen", self.map));
        } else {
            args.push(format!(
                "{}?listen?SessionName={}?Port={}?QueryPort={}?RCONEnabled=True?RCONPort={}?ServerAdminPassword={}",
                self.map,
                self.session_name,
                self.game_port,
                self.query_port,
                self.remote_command_port,
                self.remote_command_secret,
            ));
            args.push(format!("-WinLiveMaxPlayers={}", self.max_players));
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}
