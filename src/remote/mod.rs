//! Remote administrative commands for running servers.
//!
//! A running server exposes an RCON endpoint. The [`RemoteCommand`] trait is
//! the seam the orchestrator talks through; [`RconClient`] is the Source RCON
//! implementation used in production.
//!
//! Graceful shutdown is a two step protocol: the server is first told to
//! persist its world, and only once that succeeded is it told to exit. A
//! failed save never escalates on its own; the caller decides whether to
//! retry or force-stop.
mod rcon;

pub use rcon::{RconClient, RconPacket};

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fmt;

/// Command asking the server to write its world state to disk
pub const SAVE_WORLD_COMMAND: &str = "saveworld";

/// Command asking the server to shut down
pub const EXIT_COMMAND: &str = "doexit";

/// Coordinates of a server's remote command endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Host name or IP address
    pub address: String,
    /// RCON port
    pub port: u16,
    /// Admin password
    pub secret: String,
}

impl RemoteTarget {
    /// Create a target
    pub fn new(address: impl Into<String>, port: u16, secret: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port,
            secret: secret.into(),
        }
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

// Keeps the password out of logs
impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// A short-lived administrative channel to a running server.
///
/// One call opens a connection, authenticates, sends `command`, reads a
/// single response and closes.
#[async_trait]
pub trait RemoteCommand: Send + Sync {
    /// Send one command and return the server's response text.
    ///
    /// # Errors
    ///
    /// * `ConnectionRefused` when the endpoint is unreachable
    /// * `AuthFailed` when the secret is rejected
    /// * `Timeout` when the round trip exceeds the client's bound
    async fn send(&self, command: &str, target: &RemoteTarget) -> Result<String>;
}

/// Responses collected from a successful graceful stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GracefulStop {
    /// Response to the save command
    pub save_response: String,
    /// Response to the exit command
    pub exit_response: String,
}

/// Ask a server to save its world and then exit.
///
/// The exit command is only sent after the save succeeded. Transport errors
/// come back as `CommandFailed` naming the command that failed.
#[tracing::instrument(skip(client, target), fields(target = %target))]
pub async fn graceful_stop(client: &dyn RemoteCommand, target: &RemoteTarget) -> Result<GracefulStop> {
    let save_response = send_command(client, SAVE_WORLD_COMMAND, target).await?;
    tracing::info!("World saved, requesting exit");

    let exit_response = send_command(client, EXIT_COMMAND, target).await?;
    tracing::info!("Exit accepted");

    Ok(GracefulStop {
        save_response,
        exit_response,
    })
}

async fn send_command(client: &dyn RemoteCommand, command: &str, target: &RemoteTarget) -> Result<String> {
    client.send(command, target).await.map_err(|e| {
        tracing::error!(command, error = %e, "Remote command failed");
        Error::CommandFailed {
            command: command.to_string(),
            source: Box::new(e),
        }
    })
}
