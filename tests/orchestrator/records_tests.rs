use super::common::{MockRemote, ScriptedSource, fixture};
use gameserver_runner::error::Error;
use gameserver_runner::events::{EventKind, Operation};
use gameserver_runner::{ServerId, ServerRecord};

#[tokio::test]
async fn test_save_server_publishes_saved() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let mut record = fx.orchestrator.create_server(false).unwrap();

    record.alias = "Ragnarok".to_string();
    record.map = "Ragnarok_WP".to_string();
    fx.orchestrator.save_server(&record).await.unwrap();

    assert_eq!(fx.orchestrator.server(record.id).unwrap().map, "Ragnarok_WP");
    let latest = fx.orchestrator.recent_events(record.id, Some(1));
    assert_eq!(latest[0].kind, EventKind::ServerSaved);
    assert_eq!(latest[0].kind.signal_name(), Some("serverSaved"));
}

#[tokio::test]
async fn test_save_unknown_server_is_reported() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let record = ServerRecord::new(ServerId::new(12));

    let result = fx.orchestrator.save_server(&record).await;

    assert!(matches!(result, Err(Error::ServerNotFound(_))));
    let events = fx.orchestrator.recent_events(record.id, None);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0].kind,
        EventKind::OperationFailed {
            operation: Operation::Save,
            ..
        }
    ));
}

#[tokio::test]
async fn test_reload_from_disk_differs_from_cache() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let record = fx.orchestrator.create_server(false).unwrap();

    let path = fx
        .dir
        .path()
        .join("servers")
        .join(record.id.to_string())
        .join("server.json");
    std::fs::write(&path, r#"{ "id": 1, "alias": "Edited", "maxPlayers": 10 }"#).unwrap();

    assert_eq!(fx.orchestrator.servers().unwrap()[0].max_players, 70);

    let records = fx.orchestrator.reload_servers_from_disk().unwrap();
    assert_eq!(records[0].alias, "Edited");
    assert_eq!(fx.orchestrator.server(record.id).unwrap().max_players, 10);

    let latest = fx.orchestrator.events().recent_events(None, Some(1));
    assert_eq!(latest[0].kind, EventKind::ServersReloaded);
    assert_eq!(latest[0].kind.signal_name(), Some("reloadServers"));
}

#[tokio::test]
async fn test_recreated_server_gets_fresh_id_and_history() {
    let fx = fixture(ScriptedSource::new(), MockRemote::new());
    let first = fx.orchestrator.create_server(true).unwrap();
    fx.orchestrator.save_server(&first).await.unwrap();
    fx.orchestrator.delete(first.id).await.unwrap();

    let second = fx.orchestrator.create_server(true).unwrap();

    assert_ne!(first.id, second.id);
    assert!(fx.orchestrator.recent_events(second.id, None).is_empty());
}
