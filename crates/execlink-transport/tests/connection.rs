//! Connection manager behavior against a scripted in-process connector.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use execlink_core::ReconnectConfig;
use execlink_transport::{
    AUTH_REJECTED_CLOSE_CODE, ClientEvent, ConnectError, ConnectionManager, ConnectionState,
    Connector, EventKind, Incoming, Outgoing, ServerEvent, SocketHandle, SocketPeer,
};
use serde_json::Value;
use tokio::{sync::mpsc, time::Instant};

const URL: &str = "ws://engine.test/ws";

#[derive(Debug, Clone, Copy)]
enum Script {
    Accept,
    Unreachable,
    Construction,
}

struct ScriptedConnector {
    fallback: Script,
    queue: Mutex<VecDeque<Script>>,
    opens: Mutex<Vec<(String, Instant)>>,
    peers: mpsc::UnboundedSender<SocketPeer>,
}

impl ScriptedConnector {
    fn open_count(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, url: &str) -> Result<SocketHandle, ConnectError> {
        self.opens
            .lock()
            .unwrap()
            .push((url.to_string(), Instant::now()));
        let script = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        match script {
            Script::Accept => {
                let (handle, peer) = SocketHandle::pair();
                let _ = self.peers.send(peer);
                Ok(handle)
            }
            Script::Unreachable => Err(ConnectError::Unreachable("connection refused".into())),
            Script::Construction => Err(ConnectError::Construction("bad url".into())),
        }
    }
}

fn config(base_ms: u64, max_ms: u64, max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        base_delay: Duration::from_millis(base_ms),
        max_delay: Duration::from_millis(max_ms),
        max_attempts,
    }
}

fn setup(
    fallback: Script,
    script: Vec<Script>,
    reconnect: &ReconnectConfig,
) -> (
    Arc<ConnectionManager>,
    Arc<ScriptedConnector>,
    mpsc::UnboundedReceiver<SocketPeer>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = Arc::new(ScriptedConnector {
        fallback,
        queue: Mutex::new(script.into()),
        opens: Mutex::new(Vec::new()),
        peers: tx,
    });
    let manager = ConnectionManager::new(URL, reconnect, connector.clone());
    (manager, connector, rx)
}

fn record_events(manager: &ConnectionManager) -> Arc<Mutex<Vec<ServerEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _all = manager
        .bus()
        .on_any(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

async fn wait_state(manager: &ConnectionManager, want: ConnectionState) {
    let mut rx = manager.watch_state();
    rx.wait_for(|state| *state == want).await.unwrap();
}

async fn next_frame(peer: &mut SocketPeer) -> Value {
    match peer.received.recv().await {
        Some(Outgoing::Text(json)) => serde_json::from_str(&json).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_auth_is_first_frame_and_token_not_in_url() {
    let (manager, connector, mut peers) = setup(Script::Accept, vec![], &config(100, 1000, 3));

    manager.connect("secret-token");
    let mut peer = peers.recv().await.unwrap();
    wait_state(&manager, ConnectionState::Open).await;

    assert!(manager.send(&ClientEvent::SubscribeSession {
        session_id: "s1".into(),
    }));

    let auth = next_frame(&mut peer).await;
    assert_eq!(auth["event"], "auth");
    assert_eq!(auth["data"]["token"], "secret-token");
    assert!(auth["timestamp"].is_string());

    let subscribe = next_frame(&mut peer).await;
    assert_eq!(subscribe["event"], "subscribe_session");

    let url = connector.opens.lock().unwrap()[0].0.clone();
    assert_eq!(url, URL);
    assert!(!url.contains("secret-token"));
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let (manager, connector, mut peers) = setup(Script::Accept, vec![], &config(100, 1000, 3));

    manager.connect("tok");
    manager.connect("tok");
    assert_eq!(manager.state(), ConnectionState::Connecting);

    let _peer = peers.recv().await.unwrap();
    wait_state(&manager, ConnectionState::Open).await;
    manager.connect("tok");
    tokio::task::yield_now().await;

    assert_eq!(connector.open_count(), 1);
    assert_eq!(manager.epoch(), 1);
}

#[tokio::test]
async fn test_send_while_closed_is_dropped() {
    let (manager, connector, _peers) = setup(Script::Accept, vec![], &config(100, 1000, 3));

    let sent = manager.send(&ClientEvent::CancelExecution {
        session_id: "s1".into(),
    });

    assert!(!sent);
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(connector.open_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule_then_give_up() {
    let (manager, connector, _peers) = setup(Script::Unreachable, vec![], &config(100, 500, 4));

    manager.connect("tok");
    tokio::time::sleep(Duration::from_secs(3600)).await;

    // One explicit dial plus four retries.
    let times = connector.open_times();
    assert_eq!(times.len(), 5);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
            Duration::from_millis(500),
        ]
    );
    assert!(!manager.has_pending_reconnect());
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_auth_rejected_never_retries() {
    let (manager, connector, mut peers) = setup(Script::Accept, vec![], &config(100, 1000, 10));
    let events = record_events(&manager);

    manager.connect("expired");
    let peer = peers.recv().await.unwrap();
    wait_state(&manager, ConnectionState::Open).await;

    peer.inject
        .send(Incoming::Closed {
            code: AUTH_REJECTED_CLOSE_CODE,
            reason: "unauthorized".into(),
        })
        .unwrap();
    wait_state(&manager, ConnectionState::Closed).await;

    assert!(manager.is_auth_rejected());
    assert!(!manager.has_pending_reconnect());

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert_eq!(connector.open_count(), 1);
    assert!(events.lock().unwrap().contains(&ServerEvent::Disconnected {
        code: AUTH_REJECTED_CLOSE_CODE,
        reason: "unauthorized".into(),
    }));
}

#[tokio::test(start_paused = true)]
async fn test_transient_close_reconnects_and_resets_counter() {
    let (manager, connector, mut peers) = setup(
        Script::Accept,
        vec![Script::Accept, Script::Unreachable],
        &config(100, 1000, 5),
    );
    let events = record_events(&manager);

    manager.connect("tok");
    let first = peers.recv().await.unwrap();
    wait_state(&manager, ConnectionState::Open).await;

    first
        .inject
        .send(Incoming::Closed {
            code: 1001,
            reason: "going away".into(),
        })
        .unwrap();

    // Second dial fails, third succeeds.
    let mut second = peers.recv().await.unwrap();
    wait_state(&manager, ConnectionState::Open).await;

    assert_eq!(connector.open_count(), 3);
    assert_eq!(manager.epoch(), 2);
    assert_eq!(manager.retry_count(), 0);
    assert_eq!(next_frame(&mut second).await["event"], "auth");

    let events = events.lock().unwrap();
    assert!(events.contains(&ServerEvent::Connected { epoch: 1 }));
    assert!(events.contains(&ServerEvent::Connected { epoch: 2 }));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_suppresses_reconnect() {
    let (manager, connector, mut peers) = setup(Script::Accept, vec![], &config(100, 1000, 10));
    let events = record_events(&manager);

    manager.connect("tok");
    let mut peer = peers.recv().await.unwrap();
    wait_state(&manager, ConnectionState::Open).await;

    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(next_frame(&mut peer).await["event"], "auth");
    assert_eq!(peer.received.recv().await, Some(Outgoing::Close));

    // The socket reports its close afterwards; it must not trigger a retry.
    let _ = peer.inject.send(Incoming::Closed {
        code: 1000,
        reason: String::new(),
    });
    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert_eq!(connector.open_count(), 1);
    assert!(!manager.has_pending_reconnect());
    let disconnects = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.kind() == EventKind::Disconnected)
        .count();
    assert_eq!(disconnects, 1);

    // A later explicit connect starts over.
    manager.connect("tok");
    let _again = peers.recv().await.unwrap();
    wait_state(&manager, ConnectionState::Open).await;
    assert_eq!(connector.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_construction_failure_surfaces_error_without_retry() {
    let (manager, connector, _peers) = setup(Script::Construction, vec![], &config(100, 1000, 10));
    let events = record_events(&manager);

    manager.connect("tok");
    tokio::time::sleep(Duration::from_secs(3600)).await;

    assert_eq!(connector.open_count(), 1);
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert!(!manager.has_pending_reconnect());
    assert_eq!(
        *events.lock().unwrap(),
        vec![ServerEvent::TransportError {
            message: "bad url".into()
        }]
    );
}

#[tokio::test]
async fn test_inbound_frames_decoded_and_dispatched() {
    let (manager, _connector, mut peers) = setup(Script::Accept, vec![], &config(100, 1000, 3));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _logs = manager.on(EventKind::Log, move |event| {
        let _ = tx.send(event.clone());
    });

    manager.connect("tok");
    let peer = peers.recv().await.unwrap();
    wait_state(&manager, ConnectionState::Open).await;

    for frame in [
        "not json",
        r#"{"event":"heartbeat","data":{}}"#,
        r#"{"event":"execution_log","data":{"session_id":"s1","log":{"id":"l1","message":"hello"}}}"#,
    ] {
        peer.inject.send(Incoming::Text(frame.into())).unwrap();
    }

    let Some(ServerEvent::Log(log)) = rx.recv().await else {
        panic!("expected a log event");
    };
    assert_eq!(log.session_id, "s1");
    assert_eq!(log.log.id, "l1");
    assert_eq!(manager.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_frames_after_disconnect_are_not_dispatched() {
    let (manager, _connector, mut peers) = setup(Script::Accept, vec![], &config(100, 1000, 3));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _logs = manager.on(EventKind::Log, move |event| {
        let _ = tx.send(event.clone());
    });

    manager.connect("tok");
    let peer = peers.recv().await.unwrap();
    wait_state(&manager, ConnectionState::Open).await;

    manager.disconnect();
    let _ = peer.inject.send(Incoming::Text(
        r#"{"event":"execution_log","data":{"session_id":"s1","log":{"id":"late","message":"x"}}}"#
            .into(),
    ));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert!(rx.try_recv().is_err());
    assert_eq!(manager.state(), ConnectionState::Closed);
}
