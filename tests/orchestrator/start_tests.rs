use super::common::{
    MockRemote, ScriptedSource, exits_of, failures_of, fixture, kinds_of, scripted_server, wait_for_event,
};
use gameserver_runner::error::Error;
use gameserver_runner::events::{EventKind, Operation};
use gameserver_runner::install::Stage;
use gameserver_runner::{ServerStatus, StartOptions};
use std::time::Duration;

fn statuses(kinds: &[EventKind]) -> Vec<ServerStatus> {
    kinds
        .iter()
        .filter_map(|kind| match kind {
            EventKind::StatusChanged { status } => Some(*status),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_pipeline_failure_aborts_start() {
    let fx = fixture(ScriptedSource::failing_at(Stage::DownloadDeltas), MockRemote::new());
    let record = scripted_server(&fx.orchestrator, "exec sleep 30", true).await;

    let result = fx.orchestrator.start(record.id).await;

    match result {
        Err(Error::PipelineFailed { stage, .. }) => assert_eq!(stage, "download-deltas"),
        other => panic!("expected pipeline failure, got {:?}", other),
    }
    assert!(fx.orchestrator.process(record.id).is_none());

    let failures = failures_of(&fx.orchestrator, record.id);
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0],
        EventKind::OperationFailed { operation: Operation::Start, stage: Some(stage), .. } if stage == "download-deltas"
    ));

    let kinds = kinds_of(&fx.orchestrator, record.id);
    assert_eq!(statuses(&kinds), vec![ServerStatus::Installing, ServerStatus::Stopped]);
    assert!(!kinds.contains(&EventKind::AppInstalled));
}

#[tokio::test]
async fn test_start_updates_before_launch() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let record = scripted_server(&fx.orchestrator, "exec sleep 30", true).await;

    fx.orchestrator.start(record.id).await.unwrap();
    assert!(fx.orchestrator.process(record.id).is_some());

    let kinds = kinds_of(&fx.orchestrator, record.id);
    let installed = kinds.iter().position(|kind| *kind == EventKind::AppInstalled).unwrap();
    let starting = kinds
        .iter()
        .position(|kind| *kind == EventKind::StatusChanged { status: ServerStatus::Starting })
        .unwrap();
    assert!(installed < starting);
    assert_eq!(
        statuses(&kinds),
        vec![ServerStatus::Installing, ServerStatus::Starting, ServerStatus::Running]
    );

    fx.orchestrator.force_stop(record.id).await.unwrap();
}

#[tokio::test]
async fn test_external_exit_is_reported_once() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let record = scripted_server(&fx.orchestrator, "sleep 1", false).await;
    let mut rx = fx.orchestrator.subscribe();

    fx.orchestrator.start(record.id).await.unwrap();
    assert!(fx.orchestrator.status(record.id).await.unwrap().is_running);

    let exit = wait_for_event(&mut rx, |event| {
        event.server_id == Some(record.id) && matches!(event.kind, EventKind::ServerExited { .. })
    })
    .await;
    assert!(matches!(
        exit.kind,
        EventKind::ServerExited {
            exit_code: Some(0),
            forced: false,
            ..
        }
    ));

    // The cached answer was fresh for a minute but the exit invalidated it
    let status = fx.orchestrator.status(record.id).await.unwrap();
    assert!(!status.is_running);
    assert!(!status.probe_failed);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(exits_of(&fx.orchestrator, record.id), 1);
    assert_eq!(
        statuses(&kinds_of(&fx.orchestrator, record.id)),
        vec![ServerStatus::Starting, ServerStatus::Running, ServerStatus::Stopped]
    );
}

#[tokio::test]
async fn test_restart_after_force_stop_stays_running() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let record = scripted_server(&fx.orchestrator, "exec sleep 30", false).await;
    let mut rx = fx.orchestrator.subscribe();

    fx.orchestrator.start(record.id).await.unwrap();
    let first_pid = fx.orchestrator.process(record.id).unwrap().pid;
    fx.orchestrator.force_stop(record.id).await.unwrap();
    fx.orchestrator.start(record.id).await.unwrap();
    let second_pid = fx.orchestrator.process(record.id).unwrap().pid;

    let exit = wait_for_event(&mut rx, |event| {
        event.server_id == Some(record.id) && matches!(event.kind, EventKind::ServerExited { .. })
    })
    .await;
    assert!(matches!(exit.kind, EventKind::ServerExited { pid, forced: true, .. } if pid == first_pid));
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The old exit never overrides the newer start
    let statuses = statuses(&kinds_of(&fx.orchestrator, record.id));
    assert_eq!(statuses.last(), Some(&ServerStatus::Running));
    assert_eq!(fx.orchestrator.process(record.id).map(|handle| handle.pid), Some(second_pid));
    assert!(fx.orchestrator.status(record.id).await.unwrap().is_running);
    assert_eq!(exits_of(&fx.orchestrator, record.id), 1);

    fx.orchestrator.force_stop(record.id).await.unwrap();
}

#[tokio::test]
async fn test_external_config_needs_confirmation() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let mut record = scripted_server(&fx.orchestrator, "exec sleep 30", false).await;
    record.uses_external_config = true;
    fx.orchestrator.save_server(&record).await.unwrap();

    let result = fx.orchestrator.start(record.id).await;
    assert!(matches!(result, Err(Error::ConfirmationRequired(id)) if id == record.id));
    assert!(fx.orchestrator.process(record.id).is_none());

    let confirmed = StartOptions {
        confirm_external_config: true,
    };
    fx.orchestrator.start_with(record.id, confirmed).await.unwrap();
    assert!(fx.orchestrator.process(record.id).is_some());

    fx.orchestrator.force_stop(record.id).await.unwrap();
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let record = scripted_server(&fx.orchestrator, "exec sleep 30", false).await;

    fx.orchestrator.start(record.id).await.unwrap();
    let pid = fx.orchestrator.process(record.id).unwrap().pid;

    let again = fx.orchestrator.start(record.id).await;
    assert!(matches!(again, Err(Error::AlreadyRunning)));
    assert_eq!(fx.orchestrator.process(record.id).unwrap().pid, pid);
    assert_eq!(failures_of(&fx.orchestrator, record.id).len(), 1);

    fx.orchestrator.force_stop(record.id).await.unwrap();
}

#[tokio::test]
async fn test_start_without_install_path() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let record = fx.orchestrator.create_server(false).unwrap();

    let result = fx.orchestrator.start(record.id).await;

    assert!(matches!(result, Err(Error::InvalidPath(_))));
    assert_eq!(failures_of(&fx.orchestrator, record.id).len(), 1);
}

#[tokio::test]
async fn test_install_marks_server_installed() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let record = fx.orchestrator.create_server(true).unwrap();
    assert!(!fx.orchestrator.is_installed(record.id).unwrap());

    let run = fx.orchestrator.install(record.id).await.unwrap();
    assert_eq!(run.progress_percent, 100.0);

    // The scripted source downloads nothing
    assert!(!fx.orchestrator.is_installed(record.id).unwrap());
    std::fs::write(record.install_path.join(super::common::EXECUTABLE), "").unwrap();
    assert!(fx.orchestrator.is_installed(record.id).unwrap());
}
