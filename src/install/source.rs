use crate::error::Result;
use crate::events::EventBus;
use crate::install::Stage;
use crate::install::run::RunShared;
use crate::server::ServerId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::WaitForCancellationFuture;

/// Where server files come from.
///
/// The pipeline calls [`run_stage`](Self::run_stage) once per [`Stage`], in
/// order, and stops at the first error. Long running stages should check
/// [`StageContext::is_cancelled`] periodically (or race
/// [`StageContext::cancelled`]) so cancellation does not wait for the whole
/// stage.
#[async_trait]
pub trait DistributionSource: Send + Sync {
    /// Execute one stage for the server described by `ctx`
    async fn run_stage(&self, stage: Stage, ctx: &StageContext) -> Result<()>;
}

/// What a stage gets to work with
pub struct StageContext {
    stage: Stage,
    shared: Arc<RunShared>,
    events: Arc<EventBus>,
    server_id: ServerId,
    install_path: PathBuf,
}

impl StageContext {
    pub(crate) fn new(stage: Stage, shared: Arc<RunShared>, events: Arc<EventBus>) -> Self {
        let run = shared.snapshot();
        Self {
            stage,
            shared,
            events,
            server_id: run.server_id,
            install_path: run.install_path,
        }
    }

    /// Stage being executed
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Server being installed
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Install directory
    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    /// Whether the run was asked to stop
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves once the run is asked to stop
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.shared.cancel.cancelled()
    }

    /// Report how much of this stage's work is done, from 0.0 to 1.0.
    ///
    /// Reports that would move overall progress backwards are ignored.
    pub fn report_progress(&self, fraction: f64) {
        self.shared
            .advance(self.stage, self.stage.percent_at(fraction), &self.events);
    }
}
