//! Top-level coordination of server lifecycles.
//!
//! [`LifecycleOrchestrator`] sequences the store, install pipeline, process
//! supervisor, remote command client and status cache for each server id.
//! Lifecycle operations on one id are serialized by a per-id lock; distinct
//! ids proceed in parallel. Every outcome is published on the [`EventBus`]:
//! each failed operation produces exactly one `OperationFailed` event.

use crate::config::{RunnerConfig, validate_config};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind, LifecycleEvent, Operation};
use crate::install::{self, DistributionSource, InstallPipeline, PipelineRun, PipelineState, SteamCmdSource};
use crate::remote::{self, RconClient, RemoteCommand};
use crate::server::{
    LaunchCommand, LivenessProbe, ProcessExit, ProcessHandle, ProcessSupervisor, ServerId, ServerRecord,
    ServerStatus, ServerStore, StatusCache, StatusSnapshot, SupervisorProbe,
};
use futures::Stream;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;

/// Options for [`LifecycleOrchestrator::start_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// The operator confirmed starting a server that uses its on-disk config
    pub confirm_external_config: bool,
}

/// A lifecycle operation to run in the background with [`LifecycleOrchestrator::dispatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCommand {
    /// Install/update if enabled, then launch
    Start(ServerId, StartOptions),
    /// Graceful stop
    Stop(ServerId),
    /// Immediate termination
    ForceStop(ServerId),
    /// Standalone install/update
    Install(ServerId),
    /// Remove the server
    Delete(ServerId),
}

impl LifecycleCommand {
    /// Server the command targets
    pub fn server_id(&self) -> ServerId {
        match *self {
            LifecycleCommand::Start(id, _)
            | LifecycleCommand::Stop(id)
            | LifecycleCommand::ForceStop(id)
            | LifecycleCommand::Install(id)
            | LifecycleCommand::Delete(id) => id,
        }
    }
}

/// Builder for [`LifecycleOrchestrator`]
pub struct OrchestratorBuilder {
    store: ServerStore,
    source: Option<Arc<dyn DistributionSource>>,
    remote: Option<Arc<dyn RemoteCommand>>,
    probe: Option<Arc<dyn LivenessProbe>>,
    executable: PathBuf,
    freshness: Duration,
    event_capacity: usize,
    history_limit: usize,
}

impl OrchestratorBuilder {
    fn new(store: ServerStore) -> Self {
        let config = RunnerConfig::default();
        Self {
            store,
            source: None,
            remote: None,
            probe: None,
            executable: config.install.executable,
            freshness: config.status.freshness(),
            event_capacity: config.events.capacity,
            history_limit: config.events.history_limit,
        }
    }

    /// Where install/update files come from; defaults to `steamcmd`
    pub fn source(mut self, source: Arc<dyn DistributionSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Remote command client; defaults to RCON
    pub fn remote(mut self, remote: Arc<dyn RemoteCommand>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Liveness probe; defaults to asking the process supervisor
    pub fn probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Server executable, relative to each install path
    pub fn executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    /// How long a cached status stays fresh
    pub fn freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Event channel capacity and history length
    pub fn events(mut self, capacity: usize, history_limit: usize) -> Self {
        self.event_capacity = capacity;
        self.history_limit = history_limit;
        self
    }

    /// Build the orchestrator.
    ///
    /// Must be called from within a Tokio runtime; process exits are handled
    /// by a spawned listener task.
    pub fn build(self) -> LifecycleOrchestrator {
        let events = Arc::new(EventBus::new(self.event_capacity, self.history_limit));

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(ProcessSupervisor::new(exit_tx));

        let defaults = RunnerConfig::default();
        let source: Arc<dyn DistributionSource> = match self.source {
            Some(source) => source,
            None => Arc::new(SteamCmdSource::from_config(&defaults.install)),
        };
        let remote: Arc<dyn RemoteCommand> = match self.remote {
            Some(remote) => remote,
            None => Arc::new(RconClient::new(defaults.remote_command.timeout())),
        };
        let probe: Arc<dyn LivenessProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(SupervisorProbe::new(Arc::clone(&supervisor))),
        };

        let inner = Arc::new(Inner {
            store: Arc::new(self.store),
            pipeline: InstallPipeline::new(source, Arc::clone(&events)),
            supervisor,
            remote,
            cache: StatusCache::new(probe, self.freshness),
            events,
            executable: self.executable,
            locks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        });

        tokio::spawn(listen_for_exits(Arc::downgrade(&inner), exit_rx));

        LifecycleOrchestrator { inner }
    }
}

/// Coordinator of every managed server.
///
/// Cloning is cheap and every clone drives the same servers.
///
/// # Example
///
/// ```no_run
/// use gameserver_runner::config::RunnerConfig;
/// use gameserver_runner::orchestrator::LifecycleOrchestrator;
///
/// # async fn run() -> gameserver_runner::Result<()> {
/// let orchestrator = LifecycleOrchestrator::from_config(&RunnerConfig::from_file("runner.yaml")?)?;
///
/// let record = orchestrator.create_server(true)?;
/// orchestrator.start(record.id).await?;
/// println!("{:?}", orchestrator.status(record.id).await?);
/// orchestrator.stop(record.id).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<ServerStore>,
    pipeline: InstallPipeline,
    supervisor: Arc<ProcessSupervisor>,
    remote: Arc<dyn RemoteCommand>,
    cache: StatusCache,
    events: Arc<EventBus>,
    executable: PathBuf,
    /// Per-id serialization locks
    locks: Mutex<HashMap<ServerId, Arc<AsyncMutex<()>>>>,
    /// Operation holding each id's lock
    active: Mutex<HashMap<ServerId, Operation>>,
}

// Holds an id's serialization lock and marks its operation active
struct OperationGuard<'a> {
    active: &'a Mutex<HashMap<ServerId, Operation>>,
    id: ServerId,
    _lock: OwnedMutexGuard<()>,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.id);
    }
}

impl LifecycleOrchestrator {
    /// Start building an orchestrator over `store`
    pub fn builder(store: ServerStore) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store)
    }

    /// Build an orchestrator from the runner configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the servers
    /// directory cannot be opened.
    #[tracing::instrument(skip(config), fields(servers_dir = %config.servers_dir.display()))]
    pub fn from_config(config: &RunnerConfig) -> Result<Self> {
        validate_config(config)?;
        let store = ServerStore::open(&config.servers_dir)?;

        tracing::info!("Creating lifecycle orchestrator");
        Ok(Self::builder(store)
            .source(Arc::new(SteamCmdSource::from_config(&config.install)))
            .remote(Arc::new(RconClient::new(config.remote_command.timeout())))
            .executable(&config.install.executable)
            .freshness(config.status.freshness())
            .events(config.events.capacity, config.events.history_limit)
            .build())
    }

    /// Install/update (unless disabled for the server) and launch it.
    ///
    /// # Errors
    ///
    /// * `ConfirmationRequired` if the server uses its on-disk config
    /// * `InvalidPath` if no install path is set
    /// * `AlreadyRunning` if a process is held for the server
    /// * `PipelineFailed` / `PipelineCancelled` if the update did not complete;
    ///   the process is not started
    /// * `LaunchFailure` if the process could not be spawned
    pub async fn start(&self, id: ServerId) -> Result<()> {
        self.start_with(id, StartOptions::default()).await
    }

    /// [`start`](Self::start) with operator options
    #[tracing::instrument(skip(self), fields(server_id = %id))]
    pub async fn start_with(&self, id: ServerId, options: StartOptions) -> Result<()> {
        let _op = self.inner.begin_operation(id, Operation::Start).await;
        let result = self.inner.start(id, options).await;
        self.inner.report(id, Operation::Start, result)
    }

    /// Ask the server to save its world and exit.
    ///
    /// A failed save is reported and nothing else happens; the process keeps
    /// running until the operator retries or force-stops.
    #[tracing::instrument(skip(self), fields(server_id = %id))]
    pub async fn stop(&self, id: ServerId) -> Result<()> {
        let _op = self.inner.begin_operation(id, Operation::Stop).await;
        let result = self.inner.stop(id).await;
        self.inner.report(id, Operation::Stop, result)
    }

    /// Terminate the server process immediately
    #[tracing::instrument(skip(self), fields(server_id = %id))]
    pub async fn force_stop(&self, id: ServerId) -> Result<()> {
        let _op = self.inner.begin_operation(id, Operation::ForceStop).await;
        let result = self.inner.force_stop(id).await;
        self.inner.report(id, Operation::ForceStop, result)
    }

    /// Install or update the server without starting it.
    ///
    /// # Errors
    ///
    /// * `ServerRunning` while a process is held for the server
    #[tracing::instrument(skip(self), fields(server_id = %id))]
    pub async fn install(&self, id: ServerId) -> Result<PipelineRun> {
        let _op = self.inner.begin_operation(id, Operation::Install).await;
        let result = self.inner.install(id).await;
        self.inner.report(id, Operation::Install, result)
    }

    /// Cancel the active install/update run of a server.
    ///
    /// The run stops at its next cancellation check; the operation that
    /// started it then fails with `PipelineCancelled`.
    pub fn cancel_install(&self, id: ServerId) -> Result<()> {
        self.inner.pipeline.cancel(id)
    }

    /// Remove a server.
    ///
    /// An active install run is cancelled and awaited first.
    ///
    /// # Errors
    ///
    /// * `ServerRunning` if a process is held for the server
    #[tracing::instrument(skip(self), fields(server_id = %id))]
    pub async fn delete(&self, id: ServerId) -> Result<()> {
        // Cancel before queueing so an install holding the lock winds down
        if self.inner.pipeline.is_active(id) && self.inner.pipeline.cancel(id).is_ok() {
            tracing::info!("Cancelling active install before delete");
        }

        let _op = self.inner.begin_operation(id, Operation::Delete).await;
        let result = self.inner.delete(id).await;
        self.inner.report(id, Operation::Delete, result)
    }

    /// Run a lifecycle command in the background.
    ///
    /// The outcome is published on the event stream and returned by the handle.
    pub fn dispatch(&self, command: LifecycleCommand) -> JoinHandle<Result<()>> {
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.execute(command).await })
    }

    /// Run a lifecycle command to completion
    pub async fn execute(&self, command: LifecycleCommand) -> Result<()> {
        match command {
            LifecycleCommand::Start(id, options) => self.start_with(id, options).await,
            LifecycleCommand::Stop(id) => self.stop(id).await,
            LifecycleCommand::ForceStop(id) => self.force_stop(id).await,
            LifecycleCommand::Install(id) => self.install(id).await.map(|_| ()),
            LifecycleCommand::Delete(id) => self.delete(id).await,
        }
    }

    /// Create a server record with an id never used before.
    ///
    /// With `scaffold` set, an install directory is created inside the
    /// server's profile.
    pub fn create_server(&self, scaffold: bool) -> Result<ServerRecord> {
        let record = self.inner.store.create(scaffold)?;
        self.inner.events.publish_global(EventKind::ServersReloaded);
        Ok(record)
    }

    /// Persist an edited server record
    #[tracing::instrument(skip(self, record), fields(server_id = %record.id))]
    pub async fn save_server(&self, record: &ServerRecord) -> Result<()> {
        let _op = self.inner.begin_operation(record.id, Operation::Save).await;
        let edited = record.clone();
        let result = self.inner.on_disk(move |store| store.save(&edited)).await;
        if result.is_ok() {
            self.inner.events.publish(record.id, EventKind::ServerSaved);
        }
        self.inner.report(record.id, Operation::Save, result)
    }

    /// One server record, as last loaded or saved
    pub fn server(&self, id: ServerId) -> Result<ServerRecord> {
        self.inner.store.get(id)
    }

    /// Every server record, as last loaded or saved
    pub fn servers(&self) -> Result<Vec<ServerRecord>> {
        self.inner.store.all()
    }

    /// Re-read every server record from disk, picking up out-of-band edits
    pub fn reload_servers_from_disk(&self) -> Result<Vec<ServerRecord>> {
        let records = self.inner.store.reload_from_disk()?;
        self.inner.events.publish_global(EventKind::ServersReloaded);
        Ok(records)
    }

    /// Liveness of a server through the status cache
    pub async fn status(&self, id: ServerId) -> Result<StatusSnapshot> {
        let record = self.inner.store.get(id)?;
        Ok(self.inner.cache.query(&record).await)
    }

    /// Whether the server executable is present under the install path
    pub fn is_installed(&self, id: ServerId) -> Result<bool> {
        let record = self.inner.store.get(id)?;
        Ok(install::is_installed(&record.install_path, &self.inner.executable))
    }

    /// The operation currently holding a server's lock
    pub fn active_operation(&self, id: ServerId) -> Option<Operation> {
        self.inner
            .active
            .lock()
            .ok()
            .and_then(|active| active.get(&id).copied())
    }

    /// The live process handle of a server
    pub fn process(&self, id: ServerId) -> Option<ProcessHandle> {
        self.inner.supervisor.handle(id)
    }

    /// The latest install run of a server
    pub fn pipeline_run(&self, id: ServerId) -> Option<PipelineRun> {
        self.inner.pipeline.run(id)
    }

    /// Server executable, relative to each install path
    pub fn executable(&self) -> &Path {
        &self.inner.executable
    }

    /// The event bus
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Subscribe to every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe as a `Stream`
    pub fn event_stream(&self) -> impl Stream<Item = LifecycleEvent> + Send + 'static {
        self.inner.events.stream()
    }

    /// Recent events of one server, newest first
    pub fn recent_events(&self, id: ServerId, limit: Option<usize>) -> Vec<LifecycleEvent> {
        self.inner.events.recent_events(Some(id), limit)
    }
}

impl Inner {
    fn id_lock(&self, id: ServerId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(id).or_default())
    }

    async fn begin_operation(&self, id: ServerId, operation: Operation) -> OperationGuard<'_> {
        let lock = self.id_lock(id).lock_owned().await;
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        active.insert(id, operation);
        tracing::debug!(server_id = %id, operation = ?operation, "Operation started");

        OperationGuard {
            active: &self.active,
            id,
            _lock: lock,
        }
    }

    // Runs a store call that writes to disk on the blocking pool
    async fn on_disk<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ServerStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| Error::Other(format!("Store task failed: {}", e)))?
    }

    // Turns an error into exactly one failure event
    fn report<T>(&self, id: ServerId, operation: Operation, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::error!(server_id = %id, operation = ?operation, error = %e, "Operation failed");
            self.events.publish(
                id,
                EventKind::OperationFailed {
                    operation,
                    stage: e.stage().map(str::to_string),
                    command: e.command().map(str::to_string),
                    message: e.to_string(),
                },
            );
        }
        result
    }

    fn set_status(&self, id: ServerId, status: ServerStatus) {
        self.events.publish(id, EventKind::StatusChanged { status });
    }

    async fn start(&self, id: ServerId, options: StartOptions) -> Result<()> {
        let record = self.store.get(id)?;
        if record.uses_external_config && !options.confirm_external_config {
            return Err(Error::ConfirmationRequired(id));
        }
        if !record.has_install_path() {
            return Err(Error::InvalidPath(format!("Server {} has no install path", id)));
        }
        if self.supervisor.is_running(id) {
            return Err(Error::AlreadyRunning);
        }

        if !record.update_on_start_disabled {
            self.set_status(id, ServerStatus::Installing);
            if let Err(e) = self.run_install(&record).await {
                self.set_status(id, ServerStatus::Stopped);
                return Err(e);
            }
        }

        self.set_status(id, ServerStatus::Starting);
        let command = LaunchCommand::for_record(&record, &self.executable);
        if let Err(e) = self.supervisor.start(id, &command) {
            self.set_status(id, ServerStatus::Stopped);
            return Err(e);
        }

        self.cache.invalidate(id).await;
        self.set_status(id, ServerStatus::Running);
        tracing::info!(server_id = %id, "Server started");
        Ok(())
    }

    async fn stop(&self, id: ServerId) -> Result<()> {
        let record = self.store.get(id)?;
        remote::graceful_stop(self.remote.as_ref(), &record.remote_target()).await?;

        self.cache.invalidate(id).await;
        self.set_status(id, ServerStatus::Stopping);
        Ok(())
    }

    async fn force_stop(&self, id: ServerId) -> Result<()> {
        self.store.get(id)?;
        self.supervisor.force_stop(id).await
    }

    async fn install(&self, id: ServerId) -> Result<PipelineRun> {
        let record = self.store.get(id)?;
        if !record.has_install_path() {
            return Err(Error::InvalidPath(format!("Server {} has no install path", id)));
        }
        if self.supervisor.is_running(id) {
            return Err(Error::ServerRunning);
        }

        self.set_status(id, ServerStatus::Installing);
        let result = self.run_install(&record).await;
        self.set_status(id, ServerStatus::Stopped);
        result
    }

    async fn run_install(&self, record: &ServerRecord) -> Result<PipelineRun> {
        self.pipeline.begin(record.id, record.install_path.clone())?;
        let run = self.pipeline.wait(record.id).await?;

        match run.state {
            PipelineState::Completed => Ok(run),
            PipelineState::Cancelled => Err(Error::PipelineCancelled),
            _ => {
                let (stage, cause) = match &run.failure {
                    Some(failure) => (failure.stage.name().to_string(), failure.cause.clone()),
                    None => (run.stage_name.clone(), "unknown failure".to_string()),
                };
                Err(Error::PipelineFailed { stage, cause })
            }
        }
    }

    async fn delete(&self, id: ServerId) -> Result<()> {
        self.store.get(id)?;

        if self.pipeline.is_active(id) {
            if self.pipeline.cancel(id).is_ok() {
                tracing::info!(server_id = %id, "Cancelling active install before delete");
            }
            let run = self.pipeline.wait(id).await?;
            tracing::debug!(server_id = %id, state = ?run.state, "Install run finished");
        }

        if self.supervisor.is_running(id) {
            return Err(Error::ServerRunning);
        }

        self.on_disk(move |store| store.delete(id)).await?;
        if let Err(e) = self.pipeline.clear(id) {
            tracing::warn!(server_id = %id, error = %e, "Install run still registered after delete");
        }
        self.cache.remove(id);

        tracing::info!(server_id = %id, "Server deleted");
        self.events.publish_global(EventKind::ServersReloaded);
        Ok(())
    }

    async fn on_exit(&self, exit: ProcessExit) {
        let id = exit.server_id;
        self.cache.invalidate(id).await;

        // Ordered after the operation that caused the exit
        let lock = self.id_lock(id);
        let _guard = lock.lock().await;

        self.events.publish(
            id,
            EventKind::ServerExited {
                exit_code: exit.exit_code,
                forced: exit.forced,
                pid: exit.pid,
            },
        );

        // A restart may already have replaced the exited process
        match self.supervisor.handle(id) {
            Some(current) if !exit.belongs_to(&current) => {
                tracing::debug!(server_id = %id, pid = exit.pid, current_pid = current.pid, "Replaced process exited");
            }
            _ => self.set_status(id, ServerStatus::Stopped),
        }
    }
}

async fn listen_for_exits(orchestrator: Weak<Inner>, mut exit_rx: mpsc::UnboundedReceiver<ProcessExit>) {
    while let Some(exit) = exit_rx.recv().await {
        let Some(inner) = orchestrator.upgrade() else {
            break;
        };
        tracing::debug!(server_id = %exit.server_id, exit_code = ?exit.exit_code, "Handling process exit");
        tokio::spawn(async move { inner.on_exit(exit).await });
    }
    tracing::debug!("Exit listener stopped");
}
