// src/server/process.rs
use crate::error::{Error, Result};
use crate::server::{ServerId, ServerRecord};
use async_process::{Child, Command, Stdio};
use futures_lite::io::{AsyncBufReadExt, AsyncRead, BufReader};
use futures_lite::StreamExt;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// How to launch a server executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Program to execute
    pub program: PathBuf,
    /// Command line arguments
    pub args: Vec<String>,
    /// Working directory, defaults to the runner's own
    pub working_dir: Option<PathBuf>,
}

impl LaunchCommand {
    /// Launch `program` with no arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Add arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build the launch command for a server record.
    ///
    /// `executable` is relative to the record's install path; the process
    /// runs from the directory containing it.
    pub fn for_record(record: &ServerRecord, executable: &Path) -> Self {
        let program = record.install_path.join(executable);
        let working_dir = program.parent().map(Path::to_path_buf);
        Self {
            program,
            args: record.launch_arguments(),
            working_dir,
        }
    }
}

/// Ownership of a live server process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Server the process belongs to
    pub server_id: ServerId,
    /// OS process id
    pub pid: u32,
    /// When the process was spawned
    pub started_at: Instant,
    /// True while the supervisor holds the handle
    pub running: bool,
    handle_id: Uuid,
}

/// Notification that a supervised process is gone.
///
/// Delivered exactly once per [`ProcessHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Server the process belonged to
    pub server_id: ServerId,
    /// Exit code, `None` when unknown (killed, signalled, or not observed)
    pub exit_code: Option<i32>,
    /// The handle was released by a force stop
    pub forced: bool,
    /// OS process id of the exited process
    pub pid: u32,
    handle_id: Uuid,
}

impl ProcessExit {
    /// Whether this exit belongs to `handle`
    pub fn belongs_to(&self, handle: &ProcessHandle) -> bool {
        self.server_id == handle.server_id && self.handle_id == handle.handle_id
    }
}

type KillReply = oneshot::Sender<io::Result<()>>;

struct ProcessEntry {
    handle: ProcessHandle,
    kill_tx: mpsc::Sender<KillReply>,
}

type ProcessTable = Arc<Mutex<HashMap<ServerId, ProcessEntry>>>;

/// Owner of the OS-level lifecycle of every server process.
///
/// Each started process is watched by a background task that reaps it and
/// reports its exit on the channel passed to [`ProcessSupervisor::new`].
/// Whoever removes a handle from the table sends the exit notification, which
/// keeps delivery exactly-once when a force stop races a natural exit.
pub struct ProcessSupervisor {
    /// Live processes by server id
    processes: ProcessTable,
    /// Exit notification channel
    exits: mpsc::UnboundedSender<ProcessExit>,
}

impl ProcessSupervisor {
    /// Create a supervisor that reports exits on `exits`
    pub fn new(exits: mpsc::UnboundedSender<ProcessExit>) -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            exits,
        }
    }

    /// Start a server process.
    ///
    /// Must be called from within a Tokio runtime; the exit watcher is a
    /// spawned task.
    ///
    /// # Errors
    ///
    /// * `AlreadyRunning` if a handle exists for `id`
    /// * `LaunchFailure` if the executable is missing or cannot be spawned
    #[tracing::instrument(skip(self, command), fields(server_id = %id, program = %command.program.display()))]
    pub fn start(&self, id: ServerId, command: &LaunchCommand) -> Result<ProcessHandle> {
        // Bare program names are resolved through PATH by the OS
        let is_path = command.program.components().count() > 1;
        if is_path && !command.program.is_file() {
            tracing::error!("Server executable not found");
            return Err(Error::LaunchFailure(format!(
                "Executable not found: {}",
                command.program.display()
            )));
        }

        let mut processes = self.lock()?;
        if processes.contains_key(&id) {
            tracing::warn!("Start requested for a server that is already running");
            return Err(Error::AlreadyRunning);
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            tracing::error!(error = %e, "Failed to spawn server process");
            Error::LaunchFailure(format!("Failed to start process: {}", e))
        })?;

        let handle = ProcessHandle {
            server_id: id,
            pid: child.id(),
            started_at: Instant::now(),
            running: true,
            handle_id: Uuid::new_v4(),
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_output(stdout, id, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_output(stderr, id, "stderr"));
        }

        let kill_rx = register(&mut processes, handle.clone());
        drop(processes);

        tokio::spawn(watch_process(
            child,
            kill_rx,
            Arc::clone(&self.processes),
            self.exits.clone(),
            handle.clone(),
        ));

        tracing::info!(pid = handle.pid, "Server process started");
        Ok(handle)
    }

    /// Terminate a server process without asking it first.
    ///
    /// The handle is always released and an exit notification sent, even
    /// when the kill signal could not be delivered after one retry.
    ///
    /// # Errors
    ///
    /// * `NotRunning` if no handle exists for `id` (no notification is sent)
    /// * `ForceStopFailed` if the signal could not be delivered
    #[tracing::instrument(skip(self), fields(server_id = %id))]
    pub async fn force_stop(&self, id: ServerId) -> Result<()> {
        let (handle, kill_tx) = {
            let processes = self.lock()?;
            let entry = processes.get(&id).ok_or(Error::NotRunning)?;
            (entry.handle.clone(), entry.kill_tx.clone())
        };

        tracing::info!("Force stopping server process");
        let (reply_tx, reply_rx) = oneshot::channel();
        let outcome = match kill_tx.send(reply_tx).await {
            // A dropped reply means the watcher saw the exit first
            Ok(()) => reply_rx.await.unwrap_or(Ok(())),
            Err(_) => Ok(()),
        };

        release(&self.processes, &self.exits, &handle, None, true);

        outcome.map_err(|e| {
            tracing::error!(error = %e, "Kill signal could not be delivered");
            Error::ForceStopFailed(format!("Failed to kill process: {}", e))
        })
    }

    /// Whether the supervisor holds a handle for `id`
    pub fn is_running(&self, id: ServerId) -> bool {
        self.lock()
            .map(|processes| processes.contains_key(&id))
            .unwrap_or(false)
    }

    /// The live handle for `id`, if any
    pub fn handle(&self, id: ServerId) -> Option<ProcessHandle> {
        self.lock()
            .ok()
            .and_then(|processes| processes.get(&id).map(|entry| entry.handle.clone()))
    }

    /// Every server with a live handle
    pub fn running_servers(&self) -> Vec<ServerId> {
        let mut ids: Vec<ServerId> = self
            .lock()
            .map(|processes| processes.keys().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ServerId, ProcessEntry>>> {
        self.processes
            .lock()
            .map_err(|_| Error::Other("Failed to lock process table".to_string()))
    }
}

async fn watch_process(
    mut child: Child,
    mut kill_rx: mpsc::Receiver<KillReply>,
    processes: ProcessTable,
    exits: mpsc::UnboundedSender<ProcessExit>,
    handle: ProcessHandle,
) {
    let server_id = handle.server_id;
    let mut kill_open = true;

    let exit_code = loop {
        tokio::select! {
            status = child.status() => {
                break match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        tracing::warn!(server_id = %server_id, error = %e, "Failed to observe process exit");
                        None
                    }
                };
            }
            request = kill_rx.recv(), if kill_open => {
                match request {
                    Some(reply) => {
                        let _ = reply.send(kill_with_retry(|| child.kill(), server_id));
                    }
                    None => kill_open = false,
                }
            }
        }
    };

    tracing::info!(server_id = %server_id, exit_code = ?exit_code, "Server process exited");
    release(&processes, &exits, &handle, exit_code, false);
}

// Inserts a handle and returns the receiving end of its kill channel
fn register(processes: &mut HashMap<ServerId, ProcessEntry>, handle: ProcessHandle) -> mpsc::Receiver<KillReply> {
    let (kill_tx, kill_rx) = mpsc::channel(1);
    processes.insert(handle.server_id, ProcessEntry { handle, kill_tx });
    kill_rx
}

async fn drain_output<R>(output: R, server_id: ServerId, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(output).lines();
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => tracing::debug!(server_id = %server_id, stream, line = %line, "Server output"),
            Err(e) => {
                tracing::debug!(server_id = %server_id, stream, error = %e, "Server output closed");
                break;
            }
        }
    }
}

fn kill_with_retry(mut kill: impl FnMut() -> io::Result<()>, server_id: ServerId) -> io::Result<()> {
    kill().or_else(|e| {
        tracing::warn!(server_id = %server_id, error = %e, "Kill failed, retrying once");
        kill()
    })
}

// Removes the handle if it is still the current one and reports the exit
fn release(
    processes: &Mutex<HashMap<ServerId, ProcessEntry>>,
    exits: &mpsc::UnboundedSender<ProcessExit>,
    handle: &ProcessHandle,
    exit_code: Option<i32>,
    forced: bool,
) -> bool {
    let server_id = handle.server_id;
    let handle_id = handle.handle_id;
    let removed = {
        let mut processes = processes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match processes.get(&server_id) {
            Some(entry) if entry.handle.handle_id == handle_id => {
                processes.remove(&server_id);
                true
            }
            _ => false,
        }
    };

    let exit = ProcessExit {
        server_id,
        exit_code,
        forced,
        pid: handle.pid,
        handle_id,
    };
    if removed && exits.send(exit).is_err() {
        tracing::debug!(server_id = %server_id, "No exit listener, notification dropped");
    }

    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn handle(id: u32) -> ProcessHandle {
        ProcessHandle {
            server_id: ServerId::new(id),
            pid: 4242,
            started_at: Instant::now(),
            running: true,
            handle_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_kill_is_retried_once() {
        let calls = Cell::new(0);
        let result = kill_with_retry(
            || {
                calls.set(calls.get() + 1);
                if calls.get() == 1 {
                    Err(io::Error::other("busy"))
                } else {
                    Ok(())
                }
            },
            ServerId::new(1),
        );

        assert!(result.is_ok());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_kill_gives_up_after_retry() {
        let calls = Cell::new(0);
        let result = kill_with_retry(
            || {
                calls.set(calls.get() + 1);
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            },
            ServerId::new(1),
        );

        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_failed_force_stop_still_releases_handle() {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(exit_tx);
        let held = handle(3);

        // A watcher whose kill attempts always fail
        let mut kill_rx = {
            let mut processes = supervisor.lock().unwrap();
            register(&mut processes, held.clone())
        };
        tokio::spawn(async move {
            while let Some(reply) = kill_rx.recv().await {
                let failing = || Err(io::Error::from(io::ErrorKind::PermissionDenied));
                let _ = reply.send(kill_with_retry(failing, ServerId::new(3)));
            }
        });

        let result = supervisor.force_stop(held.server_id).await;

        assert!(matches!(result, Err(Error::ForceStopFailed(_))));
        assert!(!supervisor.is_running(held.server_id));
        let exit = exit_rx.try_recv().unwrap();
        assert!(exit.forced);
        assert_eq!(exit.pid, 4242);
        assert!(exit.belongs_to(&held));
        assert!(matches!(supervisor.force_stop(held.server_id).await, Err(Error::NotRunning)));
    }

    #[test]
    fn test_release_ignores_stale_handle() {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let processes = Mutex::new(HashMap::new());
        let old = handle(5);
        let current = handle(5);
        let _kill_rx = register(&mut processes.lock().unwrap(), current.clone());

        assert!(!release(&processes, &exit_tx, &old, Some(0), false));
        assert!(exit_rx.try_recv().is_err());

        assert!(release(&processes, &exit_tx, &current, Some(0), false));
        let exit = exit_rx.try_recv().unwrap();
        assert!(exit.belongs_to(&current));
        assert!(!exit.belongs_to(&old));
    }
}
