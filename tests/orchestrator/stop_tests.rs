use super::common::{
    MockRemote, ScriptedSource, exits_of, failures_of, fixture, kinds_of, scripted_server, wait_for_event,
};
use gameserver_runner::error::Error;
use gameserver_runner::events::{EventKind, Operation};
use gameserver_runner::remote::{EXIT_COMMAND, SAVE_WORLD_COMMAND};
use gameserver_runner::ServerStatus;
use mockall::Sequence;
use std::time::Duration;

#[tokio::test]
async fn test_refused_save_does_not_force_stop() {
    let mut remote = MockRemote::new();
    remote
        .expect_send()
        .withf(|command, _| command == SAVE_WORLD_COMMAND)
        .times(1)
        .returning(|_, target| Err(Error::ConnectionRefused(target.to_string())));

    let fx = fixture(ScriptedSource::new(), remote);
    let record = scripted_server(&fx.orchestrator, "exec sleep 30", false).await;
    fx.orchestrator.start(record.id).await.unwrap();
    let pid = fx.orchestrator.process(record.id).unwrap().pid;

    let result = fx.orchestrator.stop(record.id).await;

    let err = result.unwrap_err();
    assert_eq!(err.command(), Some(SAVE_WORLD_COMMAND));
    assert!(matches!(err, Error::CommandFailed { ref source, .. } if matches!(**source, Error::ConnectionRefused(_))));

    let failures = failures_of(&fx.orchestrator, record.id);
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0],
        EventKind::OperationFailed { operation: Operation::Stop, command: Some(command), .. } if command == SAVE_WORLD_COMMAND
    ));

    // The process keeps running until the operator decides
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fx.orchestrator.process(record.id).map(|handle| handle.pid), Some(pid));
    assert_eq!(exits_of(&fx.orchestrator, record.id), 0);

    fx.orchestrator.force_stop(record.id).await.unwrap();
}

#[tokio::test]
async fn test_graceful_stop_saves_then_exits() {
    let mut seq = Sequence::new();
    let mut remote = MockRemote::new();
    remote
        .expect_send()
        .withf(|command, target| command == SAVE_WORLD_COMMAND && target.secret == "pw")
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok("World Saved".to_string()));
    remote
        .expect_send()
        .withf(|command, _| command == EXIT_COMMAND)
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok("Exiting...".to_string()));

    let fx = fixture(ScriptedSource::new(), remote);
    let mut record = fx.orchestrator.create_server(true).unwrap();
    record.remote_command_secret = "pw".to_string();
    fx.orchestrator.save_server(&record).await.unwrap();

    fx.orchestrator.stop(record.id).await.unwrap();

    let kinds = kinds_of(&fx.orchestrator, record.id);
    assert!(kinds.contains(&EventKind::StatusChanged {
        status: ServerStatus::Stopping
    }));
    assert!(failures_of(&fx.orchestrator, record.id).is_empty());
}

#[tokio::test]
async fn test_force_stop_reports_exit() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let record = scripted_server(&fx.orchestrator, "exec sleep 30", false).await;
    let mut rx = fx.orchestrator.subscribe();

    fx.orchestrator.start(record.id).await.unwrap();
    fx.orchestrator.force_stop(record.id).await.unwrap();
    assert!(fx.orchestrator.process(record.id).is_none());

    let exit = wait_for_event(&mut rx, |event| {
        event.server_id == Some(record.id) && matches!(event.kind, EventKind::ServerExited { .. })
    })
    .await;
    assert!(matches!(exit.kind, EventKind::ServerExited { forced: true, .. }));

    wait_for_event(&mut rx, |event| {
        event.server_id == Some(record.id)
            && event.kind
                == EventKind::StatusChanged {
                    status: ServerStatus::Stopped,
                }
    })
    .await;
    assert!(!fx.orchestrator.status(record.id).await.unwrap().is_running);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(exits_of(&fx.orchestrator, record.id), 1);
}

#[tokio::test]
async fn test_force_stop_without_process() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let record = fx.orchestrator.create_server(true).unwrap();

    let result = fx.orchestrator.force_stop(record.id).await;

    assert!(matches!(result, Err(Error::NotRunning)));
    assert_eq!(failures_of(&fx.orchestrator, record.id).len(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(exits_of(&fx.orchestrator, record.id), 0);
}
