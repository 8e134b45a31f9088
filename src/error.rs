/// Error handling module for Gameserver Runner.
///
/// This module defines the error types used throughout the library.
/// It provides the set of errors that can occur when installing, starting,
/// stopping and commanding game servers, along with context for debugging.
///
/// # Example
///
/// ```
/// use gameserver_runner::error::{Error, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Operation succeeded"),
///         Err(Error::AlreadyRunning) => println!("Server is already running"),
///         Err(Error::PipelineFailed { stage, cause }) => println!("Install failed at {}: {}", stage, cause),
///         Err(Error::Timeout(msg)) => println!("Operation timed out: {}", msg),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use thiserror::Error;

use crate::server::ServerId;

/// Errors that can occur in the gameserver-runner library.
///
/// This enum represents all possible error types that can be returned from
/// operations in the library. Each variant includes context information to
/// help diagnose and handle the error appropriately.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to parse configuration from a file or string.
    ///
    /// This error occurs when:
    /// - The configuration JSON or YAML is malformed
    /// - Field types are incorrect
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration parsed but contains invalid values.
    ///
    /// This error occurs when:
    /// - The server executable path is empty or absolute
    /// - A timeout or channel capacity is zero
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A lifecycle operation or install run is already active.
    ///
    /// This error occurs when:
    /// - Starting a server whose process is already held by the supervisor
    /// - Beginning an install while another run for the same server is running
    #[error("Already running")]
    AlreadyRunning,

    /// There is nothing running to act on.
    ///
    /// This error occurs when:
    /// - Force-stopping a server with no live process
    /// - Cancelling an install when no run is active
    #[error("Not running")]
    NotRunning,

    /// The server executable could not be launched.
    ///
    /// This error occurs when:
    /// - The executable is missing from the install path
    /// - The operating system refuses to spawn the process
    #[error("Failed to launch server: {0}")]
    LaunchFailure(String),

    /// The termination signal could not be delivered, even after a retry.
    ///
    /// The supervisor still releases its handle when this is returned.
    #[error("Force stop failed: {0}")]
    ForceStopFailed(String),

    /// The remote command endpoint is unreachable.
    ///
    /// This error occurs when:
    /// - The server is not running
    /// - The RCON port is closed or filtered
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// The remote command endpoint rejected the admin password.
    #[error("Authentication failed")]
    AuthFailed,

    /// Operation timed out.
    ///
    /// This error occurs when:
    /// - A remote command round trip exceeds the configured bound
    /// - The distribution tool stops producing output for too long
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An install/update stage failed and the run was halted.
    #[error("Install pipeline failed at stage '{stage}': {cause}")]
    PipelineFailed {
        /// Name of the stage that failed
        stage: String,
        /// Human readable failure cause
        cause: String,
    },

    /// An install/update run was cancelled before it completed.
    #[error("Install pipeline was cancelled")]
    PipelineCancelled,

    /// A remote command could not be delivered.
    ///
    /// Wraps the transport error together with the command that failed so
    /// callers can tell a failed `saveworld` from a failed `doexit`.
    #[error("Remote command '{command}' failed: {source}")]
    CommandFailed {
        /// Command text that was being sent
        command: String,
        /// Underlying transport error
        #[source]
        source: Box<Error>,
    },

    /// The server still has a live process.
    ///
    /// This error occurs when:
    /// - Deleting a server that has not been stopped
    /// - Installing over the files of a running server
    #[error("Server is running")]
    ServerRunning,

    /// A filesystem path is empty or unusable.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Starting a server that uses an external config file needs explicit confirmation.
    #[error("Server {0} uses an external configuration; start must be confirmed")]
    ConfirmationRequired(ServerId),

    /// Requested server was not found in the store.
    #[error("Server not found: {0}")]
    ServerNotFound(ServerId),

    /// Reading or writing a persisted server record failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Error in communication with a remote command endpoint.
    ///
    /// This error occurs when:
    /// - The connection drops mid-exchange
    /// - A malformed or oversized packet is received
    #[error("Communication error: {0}")]
    Communication(String),

    /// Error in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other error not covered by the above categories.
    ///
    /// This is a catch-all error for cases not explicitly handled elsewhere.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Name of the install stage this error originated from, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Error::PipelineFailed { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Remote command this error originated from, if any.
    pub fn command(&self) -> Option<&str> {
        match self {
            Error::CommandFailed { command, .. } => Some(command),
            _ => None,
        }
    }
}

/// Result type for gameserver-runner operations.
///
/// This is a convenience type alias for `std::result::Result` with the `Error` type
/// from this module.
pub type Result<T> = std::result::Result<T, Error>;
