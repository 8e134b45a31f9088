use super::common::{MockRemote, ScriptedSource, fixture, scripted_server, wait_for_stage};
use gameserver_runner::error::Error;
use gameserver_runner::events::{EventKind, Operation};
use gameserver_runner::install::Stage;
use gameserver_runner::{LifecycleCommand, ServerId};
use std::time::Duration;

#[tokio::test]
async fn test_delete_cancels_active_install() {
    let fx = fixture(ScriptedSource::blocking_at(Stage::DownloadDeltas), MockRemote::new());
    let record = fx.orchestrator.create_server(true).unwrap();
    let mut rx = fx.orchestrator.subscribe();

    let install = fx.orchestrator.dispatch(LifecycleCommand::Install(record.id));
    wait_for_stage(&mut rx, record.id, "download-deltas").await;

    fx.orchestrator.delete(record.id).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), install)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(Error::PipelineCancelled)));

    assert!(matches!(fx.orchestrator.server(record.id), Err(Error::ServerNotFound(_))));
    assert!(!record.install_path.exists());
    assert!(fx.orchestrator.pipeline_run(record.id).is_none());

    // The install wound down before the record went away
    let history = fx.orchestrator.events().recent_events(None, None);
    let cancelled = history
        .iter()
        .find(|event| {
            matches!(
                event.kind,
                EventKind::OperationFailed {
                    operation: Operation::Install,
                    ..
                }
            )
        })
        .map(|event| event.sequence)
        .unwrap();
    let removed = history
        .iter()
        .find(|event| event.server_id.is_none() && event.kind == EventKind::ServersReloaded)
        .map(|event| event.sequence)
        .unwrap();
    assert!(cancelled < removed);
    assert!(!history.iter().any(|event| event.kind == EventKind::AppInstalled));
}

#[tokio::test]
async fn test_delete_running_server_is_rejected() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let record = scripted_server(&fx.orchestrator, "exec sleep 30", false).await;
    fx.orchestrator.start(record.id).await.unwrap();

    let result = fx.orchestrator.delete(record.id).await;

    assert!(matches!(result, Err(Error::ServerRunning)));
    assert!(fx.orchestrator.server(record.id).is_ok());
    assert!(record.install_path.is_dir());

    fx.orchestrator.force_stop(record.id).await.unwrap();
}

#[tokio::test]
async fn test_delete_stopped_server() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let first = fx.orchestrator.create_server(true).unwrap();
    let second = fx.orchestrator.create_server(true).unwrap();

    fx.orchestrator.delete(first.id).await.unwrap();

    let ids: Vec<ServerId> = fx.orchestrator.servers().unwrap().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![second.id]);
    assert!(!fx.dir.path().join("servers").join(first.id.to_string()).exists());
}

#[tokio::test]
async fn test_delete_unknown_server() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());

    let result = fx.orchestrator.delete(ServerId::new(404)).await;

    assert!(matches!(result, Err(Error::ServerNotFound(_))));
    assert_eq!(fx.orchestrator.recent_events(ServerId::new(404), None).len(), 1);
}
