//! Daemon served over a real Unix socket.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use loopd::LoopdError;
use loopd::daemon::{AgentFilter, Daemon, DaemonConfig, Health, SpecialKey, VERSION};
use loopd::domain::{LoopConfig, LoopState, OwnerKind};
use loopd::ipc::{Events, IpcClient};
use loopd::ownership::{IpcDaemonLink, OwnershipResolver, SpawnOwner};
use loopd::recovery::StaleConfig;
use loopd::runner::RunnerConfig;
use loopd::store::Store;
use tempfile::TempDir;
use tokio::sync::watch;

async fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("daemon socket never appeared at {}", path.display());
}

async fn wait_for_state(store: &Store, loop_id: &str, state: LoopState) {
    for _ in 0..500 {
        if store.loops().require(loop_id).unwrap().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("loop {} never reached {}", loop_id, state);
}

#[tokio::test]
async fn test_daemon_round_trip() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("loopd.sock");
    let store = Arc::new(Store::open_at(&temp.path().join("loopd.db")).unwrap());

    let config = DaemonConfig {
        socket_path: socket.clone(),
        runner: RunnerConfig {
            heartbeat_interval: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            output_tail_bytes: 1024,
        },
        stale: StaleConfig::default(),
        shutdown_grace: Duration::from_secs(2),
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = tokio::spawn(Daemon::new(Arc::clone(&store), config).run(shutdown_rx));
    wait_for_socket(&socket).await;

    let client = IpcClient::with_socket(&socket);
    client.connect().await.unwrap();
    assert_eq!(client.ping().await.unwrap().version, VERSION);

    let watcher = IpcClient::with_socket(&socket);
    watcher.connect().await.unwrap();
    watcher.subscribe().await.unwrap();

    // Hand a loop to the daemon through the resolver
    let mut loop_config = LoopConfig::shell("sleep 0.05");
    loop_config.working_dir = Some(temp.path().to_path_buf());
    let record = store.loops().create("served", loop_config).unwrap();
    let resolver = OwnershipResolver::new(
        Arc::clone(&store),
        Arc::new(IpcDaemonLink::new(&socket)),
        "local-cli",
        Duration::from_secs(2700),
    );
    let resolution = resolver.resolve(&record.id, Some(SpawnOwner::Auto)).await.unwrap();
    assert_eq!(resolution.owner, OwnerKind::Daemon);
    assert!(resolution.warning.is_none());
    wait_for_state(&store, &record.id, LoopState::Running).await;

    let event = tokio::time::timeout(Duration::from_secs(2), watcher.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert!(event.event == Events::LOOP_STATE || event.event == Events::LOOP_ITERATION);
    assert_eq!(event.data["id"], record.id.as_str());

    let status = client.status().await.unwrap();
    assert_eq!(status.health, Health::Ok);
    assert_eq!(status.owned_loop_count, 1);

    let agents = client.list_agents(&AgentFilter::default()).await.unwrap();
    assert_eq!(agents.len(), 1);
    let agent_id = agents[0].agent_id.clone();

    let ack = client
        .send_input(&agent_id, "hello", &[SpecialKey::Interrupt])
        .await
        .unwrap();
    assert_eq!(ack.keys_sent, 1);
    assert!(ack.queue_item_id.is_some());
    assert_eq!(client.get_agent(&agent_id).await.unwrap().transcript.len(), 2);

    let err = client.get_agent("agent-missing").await.unwrap_err();
    assert!(matches!(err, LoopdError::NotFound(_)));

    assert!(client.stop_loop_runner(&record.id).await.unwrap().stopping);
    wait_for_state(&store, &record.id, LoopState::Stopped).await;
    assert!(store.loops().require(&record.id).unwrap().owner_instance_id.is_none());

    // The runner task deregisters itself shortly after releasing the loop
    for _ in 0..500 {
        if client.status().await.unwrap().owned_loop_count == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Not owned any more: a no-op success
    assert!(!client.stop_loop_runner(&record.id).await.unwrap().stopping);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
