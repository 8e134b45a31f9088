//! Install/update pipeline.
//!
//! A run brings one server's installed files up to the latest version by
//! executing the [`Stage`]s of a [`DistributionSource`] in order:
//! `verify`, `fetch-manifest`, `download-deltas`, `apply-deltas`, `finalize`.
//!
//! Runs are registered per server id: at most one may be active for a
//! server, and a finished run stays visible (including its failure) until it
//! is cleared or superseded by the next [`InstallPipeline::begin`].
//!
//! Progress is published on the [`EventBus`] as `StageChanged` and
//! `ProgressUpdated` events. Within a run the published percentage never
//! decreases, and 100 is published only right before the run completes,
//! followed by `AppInstalled`.
//!
//! Cancellation is cooperative. The pipeline checks the run's cancellation
//! flag before every stage and sources check it while they work. Files
//! written by an interrupted stage are left in place; the next run verifies
//! from scratch.
//!
//! # Example
//!
//! ```no_run
//! use gameserver_runner::events::EventBus;
//! use gameserver_runner::install::{InstallPipeline, PipelineState, SteamCmdSource};
//! use gameserver_runner::config::InstallConfig;
//! use gameserver_runner::server::ServerId;
//! use std::sync::Arc;
//!
//! # async fn run() -> gameserver_runner::Result<()> {
//! let events = Arc::new(EventBus::default());
//! let source = Arc::new(SteamCmdSource::from_config(&InstallConfig::default()));
//! let pipeline = InstallPipeline::new(source, Arc::clone(&events));
//!
//! pipeline.begin(ServerId::new(7), "/srv/7")?;
//! let run = pipeline.wait(ServerId::new(7)).await?;
//! assert_eq!(run.state, PipelineState::Completed);
//! # Ok(())
//! # }
//! ```
mod run;
mod source;
mod stage;
mod steamcmd;

pub use run::{PipelineFailure, PipelineRun, PipelineState};
pub use source::{DistributionSource, StageContext};
pub use stage::Stage;
pub use steamcmd::SteamCmdSource;

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::server::ServerId;
use run::RunShared;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Whether a server's executable is present under `install_path`
pub fn is_installed(install_path: &Path, executable: &Path) -> bool {
    !install_path.as_os_str().is_empty() && install_path.join(executable).is_file()
}

/// Registry and driver of install/update runs
pub struct InstallPipeline {
    /// Where files come from
    source: Arc<dyn DistributionSource>,
    /// Progress events go here
    events: Arc<EventBus>,
    /// Latest run per server
    runs: Mutex<HashMap<ServerId, Arc<RunShared>>>,
}

impl InstallPipeline {
    /// Create a pipeline over `source`, publishing progress on `events`
    pub fn new(source: Arc<dyn DistributionSource>, events: Arc<EventBus>) -> Self {
        Self {
            source,
            events,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a run for `id`.
    ///
    /// Returns the run in its `Pending` state; execution happens on a spawned
    /// task, so this must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// * `InvalidPath` if `install_path` is empty
    /// * `AlreadyRunning` if a run for `id` is still active
    #[tracing::instrument(skip(self, install_path), fields(server_id = %id))]
    pub fn begin(&self, id: ServerId, install_path: impl Into<PathBuf>) -> Result<PipelineRun> {
        let install_path = install_path.into();
        if install_path.as_os_str().is_empty() {
            return Err(Error::InvalidPath("install path is empty".to_string()));
        }

        let shared = {
            let mut runs = self.lock()?;
            if runs.get(&id).is_some_and(|run| run.state().is_active()) {
                tracing::warn!("Install requested while another run is active");
                return Err(Error::AlreadyRunning);
            }

            let shared = Arc::new(RunShared::new(id, install_path));
            runs.insert(id, Arc::clone(&shared));
            shared
        };

        let run = shared.snapshot();
        tracing::info!(run_id = %run.run_id, install_path = %run.install_path.display(), "Install run created");

        let source = Arc::clone(&self.source);
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            let task = tokio::spawn(execute(source, Arc::clone(&shared), events));
            // A panicking source must not leave the run active forever
            if let Err(e) = task.await {
                tracing::error!(server_id = %id, error = %e, "Install task aborted");
                if shared.state().is_active() {
                    let stage = stage_of(&shared.snapshot());
                    shared.fail(stage, format!("install task aborted: {}", e));
                }
            }
        });

        Ok(run)
    }

    /// Ask the active run for `id` to stop at its next cancellation check.
    ///
    /// # Errors
    ///
    /// * `NotRunning` if no run for `id` is active
    #[tracing::instrument(skip(self), fields(server_id = %id))]
    pub fn cancel(&self, id: ServerId) -> Result<()> {
        let shared = self.shared(id).ok_or(Error::NotRunning)?;
        if !shared.request_cancel() {
            return Err(Error::NotRunning);
        }

        tracing::info!("Install cancellation requested");
        Ok(())
    }

    /// Wait until the latest run for `id` reaches a terminal state.
    ///
    /// # Errors
    ///
    /// * `NotRunning` if `id` has no run at all
    pub async fn wait(&self, id: ServerId) -> Result<PipelineRun> {
        let shared = self.shared(id).ok_or(Error::NotRunning)?;
        let mut state_rx = shared.subscribe();
        state_rx
            .wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| Error::Other("Install run state channel closed".to_string()))?;

        Ok(shared.snapshot())
    }

    /// Snapshot of the latest run for `id`
    pub fn run(&self, id: ServerId) -> Option<PipelineRun> {
        self.shared(id).map(|shared| shared.snapshot())
    }

    /// Whether a run for `id` is pending or running
    pub fn is_active(&self, id: ServerId) -> bool {
        self.shared(id).is_some_and(|shared| shared.state().is_active())
    }

    /// Forget the finished run for `id`.
    ///
    /// # Errors
    ///
    /// * `AlreadyRunning` if the run is still active
    pub fn clear(&self, id: ServerId) -> Result<()> {
        let mut runs = self.lock()?;
        if runs.get(&id).is_some_and(|run| run.state().is_active()) {
            return Err(Error::AlreadyRunning);
        }
        runs.remove(&id);
        Ok(())
    }

    fn shared(&self, id: ServerId) -> Option<Arc<RunShared>> {
        self.lock().ok().and_then(|runs| runs.get(&id).cloned())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ServerId, Arc<RunShared>>>> {
        self.runs
            .lock()
            .map_err(|_| Error::Other("Failed to lock install runs".to_string()))
    }
}

async fn execute(source: Arc<dyn DistributionSource>, shared: Arc<RunShared>, events: Arc<EventBus>) {
    shared.mark_running();
    let server_id = shared.snapshot().server_id;

    for stage in Stage::ALL {
        if shared.cancel.is_cancelled() {
            tracing::info!(server_id = %server_id, stage = %stage, "Install cancelled before stage");
            shared.finish_cancelled();
            return;
        }

        shared.enter_stage(stage, &events);
        tracing::info!(server_id = %server_id, stage = %stage, "Install stage started");

        let ctx = StageContext::new(stage, Arc::clone(&shared), Arc::clone(&events));
        if let Err(e) = source.run_stage(stage, &ctx).await {
            if shared.cancel.is_cancelled() {
                tracing::info!(server_id = %server_id, stage = %stage, "Install cancelled during stage");
                shared.finish_cancelled();
            } else {
                tracing::error!(server_id = %server_id, stage = %stage, error = %e, "Install stage failed");
                shared.fail(stage, e.to_string());
            }
            return;
        }
    }

    match shared.complete(&events) {
        run::PipelineState::Completed => tracing::info!(server_id = %server_id, "Install completed"),
        state => tracing::info!(server_id = %server_id, state = ?state, "Install finished without completing"),
    }
}

fn stage_of(run: &PipelineRun) -> Stage {
    Stage::ALL
        .into_iter()
        .find(|stage| stage.name() == run.stage_name)
        .unwrap_or(Stage::VerifyLocalState)
}
