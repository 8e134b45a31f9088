use async_trait::async_trait;
use gameserver_runner::error::{Error, Result};
use gameserver_runner::events::{EventKind, LifecycleEvent};
use gameserver_runner::install::{DistributionSource, Stage, StageContext};
use gameserver_runner::remote::{RemoteCommand, RemoteTarget};
use gameserver_runner::server::{ServerId, ServerRecord, ServerStore};
use gameserver_runner::LifecycleOrchestrator;
use mockall::mock;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::timeout;

pub const EXECUTABLE: &str = "server.sh";

mock! {
    pub Remote {}

    #[async_trait]
    impl RemoteCommand for Remote {
        async fn send(&self, command: &str, target: &RemoteTarget) -> Result<String>;
    }
}

/// Distribution source that can fail at, or block in, one stage
pub struct ScriptedSource {
    pub fail_at: Option<Stage>,
    pub block_at: Option<Stage>,
    pub gate: Arc<Semaphore>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self {
            fail_at: None,
            block_at: None,
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    pub fn failing_at(stage: Stage) -> Self {
        Self {
            fail_at: Some(stage),
            ..Self::new()
        }
    }

    pub fn blocking_at(stage: Stage) -> Self {
        Self {
            block_at: Some(stage),
            ..Self::new()
        }
    }
}

#[async_trait]
impl DistributionSource for ScriptedSource {
    async fn run_stage(&self, stage: Stage, ctx: &StageContext) -> Result<()> {
        if self.block_at == Some(stage) {
            tokio::select! {
                _ = ctx.cancelled() => return Err(Error::Other("interrupted".to_string())),
                permit = self.gate.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                }
            }
        }

        if self.fail_at == Some(stage) {
            return Err(Error::Other(format!("{} unavailable", stage)));
        }

        ctx.report_progress(1.0);
        Ok(())
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub orchestrator: LifecycleOrchestrator,
}

pub fn fixture(source: ScriptedSource, remote: MockRemote) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = ServerStore::open(dir.path().join("servers")).unwrap();

    let orchestrator = LifecycleOrchestrator::builder(store)
        .source(Arc::new(source))
        .remote(Arc::new(remote))
        .executable(EXECUTABLE)
        .freshness(Duration::from_secs(60))
        .build();

    Fixture { dir, orchestrator }
}

/// Create a server whose executable runs `script`
pub async fn scripted_server(orchestrator: &LifecycleOrchestrator, script: &str, update_on_start: bool) -> ServerRecord {
    let mut record = orchestrator.create_server(true).unwrap();
    record.update_on_start_disabled = !update_on_start;
    orchestrator.save_server(&record).await.unwrap();

    let path = record.install_path.join(EXECUTABLE);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    record
}

pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<LifecycleEvent>,
    predicate: impl Fn(&LifecycleEvent) -> bool,
) -> LifecycleEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never published")
}

pub async fn wait_for_stage(rx: &mut broadcast::Receiver<LifecycleEvent>, id: ServerId, name: &str) {
    wait_for_event(rx, |event| {
        event.server_id == Some(id) && matches!(&event.kind, EventKind::StageChanged { stage } if stage == name)
    })
    .await;
}

/// Kinds published for one server, oldest first
pub fn kinds_of(orchestrator: &LifecycleOrchestrator, id: ServerId) -> Vec<EventKind> {
    let mut events = orchestrator.recent_events(id, None);
    events.reverse();
    events.into_iter().map(|event| event.kind).collect()
}

pub fn failures_of(orchestrator: &LifecycleOrchestrator, id: ServerId) -> Vec<EventKind> {
    kinds_of(orchestrator, id)
        .into_iter()
        .filter(|kind| matches!(kind, EventKind::OperationFailed { .. }))
        .collect()
}

pub fn exits_of(orchestrator: &LifecycleOrchestrator, id: ServerId) -> usize {
    kinds_of(orchestrator, id)
        .iter()
        .filter(|kind| matches!(kind, EventKind::ServerExited { .. }))
        .count()
}
