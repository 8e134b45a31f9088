use crate::events::{EventBus, EventKind};
use crate::install::Stage;
use crate::server::ServerId;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle state of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Created, not yet executing
    Pending,
    /// Executing stages
    Running,
    /// Every stage succeeded
    Completed,
    /// A stage failed
    Failed,
    /// Cancelled at a stage boundary
    Cancelled,
}

impl PipelineState {
    /// Whether the run can still change
    pub fn is_active(self) -> bool {
        matches!(self, PipelineState::Pending | PipelineState::Running)
    }

    /// Whether the run has ended
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Why a run failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFailure {
    /// Stage that failed
    pub stage: Stage,
    /// Error text
    pub cause: String,
}

/// Snapshot of one install/update attempt for one server
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    /// Unique id of this attempt
    pub run_id: Uuid,
    /// Server being installed
    pub server_id: ServerId,
    /// Install directory
    pub install_path: PathBuf,
    /// Current stage name; empty until the first stage begins
    pub stage_name: String,
    /// Overall progress, non-decreasing within a run
    pub progress_percent: f64,
    /// Lifecycle state
    pub state: PipelineState,
    /// Set when `state` is `Failed`
    pub failure: Option<PipelineFailure>,
    /// When the run was created
    pub created_at: Instant,
    /// When the run reached a terminal state
    pub finished_at: Option<Instant>,
}

// Shared between the pipeline registry and the task executing a run
pub(crate) struct RunShared {
    run: Mutex<PipelineRun>,
    pub(crate) cancel: CancellationToken,
    state_tx: watch::Sender<PipelineState>,
}

impl RunShared {
    pub(crate) fn new(server_id: ServerId, install_path: PathBuf) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Pending);
        Self {
            run: Mutex::new(PipelineRun {
                run_id: Uuid::new_v4(),
                server_id,
                install_path,
                stage_name: String::new(),
                progress_percent: 0.0,
                state: PipelineState::Pending,
                failure: None,
                created_at: Instant::now(),
                finished_at: None,
            }),
            cancel: CancellationToken::new(),
            state_tx,
        }
    }

    pub(crate) fn snapshot(&self) -> PipelineRun {
        self.lock().clone()
    }

    pub(crate) fn state(&self) -> PipelineState {
        self.lock().state
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }

    /// Request cancellation; only an active run can be cancelled
    pub(crate) fn request_cancel(&self) -> bool {
        let run = self.lock();
        if !run.state.is_active() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub(crate) fn mark_running(&self) {
        let mut run = self.lock();
        if run.state == PipelineState::Pending {
            self.transition(&mut run, PipelineState::Running);
        }
    }

    /// Publish the stage change and, except for finalize, its starting progress
    pub(crate) fn enter_stage(&self, stage: Stage, events: &EventBus) {
        let mut run = self.lock();
        run.stage_name = stage.name().to_string();
        events.publish(
            run.server_id,
            EventKind::StageChanged {
                stage: stage.name().to_string(),
            },
        );

        if stage != Stage::Finalize {
            let percent = run.progress_percent.max(stage.start_percent());
            publish_progress(&mut run, stage, percent, events);
        }
    }

    /// Report progress inside a stage; never moves backwards or reaches 100
    pub(crate) fn advance(&self, stage: Stage, percent: f64, events: &EventBus) {
        if stage == Stage::Finalize {
            return;
        }
        let mut run = self.lock();
        if !run.state.is_active() {
            return;
        }
        let percent = percent.min(stage.end_percent());
        if percent > run.progress_percent {
            publish_progress(&mut run, stage, percent, events);
        }
    }

    pub(crate) fn fail(&self, stage: Stage, cause: String) {
        let mut run = self.lock();
        run.failure = Some(PipelineFailure { stage, cause });
        self.transition(&mut run, PipelineState::Failed);
    }

    pub(crate) fn finish_cancelled(&self) {
        let mut run = self.lock();
        self.transition(&mut run, PipelineState::Cancelled);
    }

    /// Complete the run unless cancellation was requested first
    pub(crate) fn complete(&self, events: &EventBus) -> PipelineState {
        let mut run = self.lock();
        if self.cancel.is_cancelled() {
            self.transition(&mut run, PipelineState::Cancelled);
            return PipelineState::Cancelled;
        }

        publish_progress(&mut run, Stage::Finalize, 100.0, events);
        self.transition(&mut run, PipelineState::Completed);
        events.publish(run.server_id, EventKind::AppInstalled);
        PipelineState::Completed
    }

    fn transition(&self, run: &mut PipelineRun, state: PipelineState) {
        run.state = state;
        if state.is_terminal() {
            run.finished_at = Some(Instant::now());
        }
        self.state_tx.send_replace(state);
    }

    fn lock(&self) -> MutexGuard<'_, PipelineRun> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn publish_progress(run: &mut PipelineRun, stage: Stage, percent: f64, events: &EventBus) {
    run.progress_percent = percent;
    events.publish(
        run.server_id,
        EventKind::ProgressUpdated {
            stage: stage.name().to_string(),
            percent,
        },
    );
}
