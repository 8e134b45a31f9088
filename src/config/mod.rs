//! Configuration module for Gameserver Runner.
//!
//! This module handles parsing, validation, and access to the runner's own
//! settings: where server profiles live, how the install pipeline reaches the
//! distribution tool, and the bounds used by the status cache and remote
//! command client. Per-server records are persisted separately by
//! [`ServerStore`](crate::server::ServerStore).
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use gameserver_runner::config::RunnerConfig;
//!
//! let config = RunnerConfig::from_file("runner.yaml").unwrap();
//! println!("Server profiles live in {}", config.servers_dir.display());
//! ```
//!
//! Creating a configuration programmatically:
//!
//! ```
//! use gameserver_runner::config::{RunnerConfig, validate_config};
//!
//! let mut config = RunnerConfig::default();
//! config.servers_dir = "/srv/gameservers".into();
//! config.install.validate = false;
//!
//! validate_config(&config).unwrap();
//! ```
mod parser;
pub mod validator;

pub use parser::{EventsConfig, InstallConfig, RemoteCommandConfig, RunnerConfig, StatusConfig};
pub use validator::validate_config;
