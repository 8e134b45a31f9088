use super::common::{MockRemote, ScriptedSource, fixture, wait_for_stage};
use gameserver_runner::error::Error;
use gameserver_runner::events::Operation;
use gameserver_runner::install::Stage;
use gameserver_runner::LifecycleCommand;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_operations_on_one_server_wait_their_turn() {
    let source = ScriptedSource::blocking_at(Stage::DownloadDeltas);
    let gate = Arc::clone(&source.gate);
    let fx = fixture(source, MockRemote::new());
    let record = fx.orchestrator.create_server(true).unwrap();
    let mut rx = fx.orchestrator.subscribe();

    let install = fx.orchestrator.dispatch(LifecycleCommand::Install(record.id));
    wait_for_stage(&mut rx, record.id, "download-deltas").await;
    assert_eq!(fx.orchestrator.active_operation(record.id), Some(Operation::Install));

    let force_stop = fx.orchestrator.dispatch(LifecycleCommand::ForceStop(record.id));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!force_stop.is_finished());
    assert_eq!(fx.orchestrator.active_operation(record.id), Some(Operation::Install));

    gate.add_permits(1);
    install.await.unwrap().unwrap();

    let result = force_stop.await.unwrap();
    assert!(matches!(result, Err(Error::NotRunning)));
    assert_eq!(fx.orchestrator.active_operation(record.id), None);
}

#[tokio::test]
async fn test_distinct_servers_run_in_parallel() {
    let source = ScriptedSource::blocking_at(Stage::DownloadDeltas);
    let gate = Arc::clone(&source.gate);
    let fx = fixture(source, MockRemote::new());
    let first = fx.orchestrator.create_server(true).unwrap();
    let second = fx.orchestrator.create_server(true).unwrap();
    let mut first_rx = fx.orchestrator.subscribe();
    let mut second_rx = fx.orchestrator.subscribe();

    let first_install = fx.orchestrator.dispatch(LifecycleCommand::Install(first.id));
    let second_install = fx.orchestrator.dispatch(LifecycleCommand::Install(second.id));

    // Both reach the blocking stage while the other is still in it
    wait_for_stage(&mut first_rx, first.id, "download-deltas").await;
    wait_for_stage(&mut second_rx, second.id, "download-deltas").await;
    assert_eq!(fx.orchestrator.active_operation(first.id), Some(Operation::Install));
    assert_eq!(fx.orchestrator.active_operation(second.id), Some(Operation::Install));

    gate.add_permits(2);
    first_install.await.unwrap().unwrap();
    second_install.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_install_fails_the_operation() {
    let source = ScriptedSource::blocking_at(Stage::FetchManifest);
    let fx = fixture(source, MockRemote::new());
    let record = fx.orchestrator.create_server(true).unwrap();
    let mut rx = fx.orchestrator.subscribe();

    let install = fx.orchestrator.dispatch(LifecycleCommand::Install(record.id));
    wait_for_stage(&mut rx, record.id, "fetch-manifest").await;

    fx.orchestrator.cancel_install(record.id).unwrap();

    let result = install.await.unwrap();
    assert!(matches!(result, Err(Error::PipelineCancelled)));
    assert!(matches!(fx.orchestrator.cancel_install(record.id), Err(Error::NotRunning)));

    // The record survives and can be installed again
    assert!(fx.orchestrator.server(record.id).is_ok());
}
