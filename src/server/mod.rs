/// Server management module for Gameserver Runner.
///
/// This module holds the per-server building blocks the orchestrator
/// sequences: the persisted record of each server, the supervisor that owns
/// its OS process, and the cache answering "is it alive?".
/// All public components are instrumented with `tracing` spans.
///
/// # Components
///
/// * `record` - Server identity, configuration and launch arguments
/// * `store` - Durable JSON storage of server records
/// * `process` - Start, watch and force-stop server processes
/// * `status` - Cached, on-demand liveness probing
///
/// # Examples
///
/// Supervising a process:
///
/// ```no_run
/// use gameserver_runner::server::{LaunchCommand, ProcessSupervisor, ServerId};
/// use tokio::sync::mpsc;
///
/// # async fn run() -> gameserver_runner::Result<()> {
/// let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
/// let supervisor = ProcessSupervisor::new(exit_tx);
///
/// let handle = supervisor.start(ServerId::new(1), &LaunchCommand::new("sleep").with_args(["30"]))?;
/// println!("started pid {}", handle.pid);
///
/// supervisor.force_stop(ServerId::new(1)).await?;
/// let exit = exit_rx.recv().await.unwrap();
/// assert!(exit.forced || exit.exit_code.is_none());
/// # Ok(())
/// # }
/// ```
mod process;
mod record;
mod status;
mod store;

pub use process::{LaunchCommand, ProcessExit, ProcessHandle, ProcessSupervisor};
pub use record::{ServerId, ServerRecord, ServerStatus};
pub use status::{LivenessProbe, RemoteEndpointProbe, StatusCache, StatusSnapshot, SupervisorProbe};
pub use store::ServerStore;
