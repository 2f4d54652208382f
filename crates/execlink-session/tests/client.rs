//! `SessionClient` end to end over an in-process socket and memory directory.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use execlink_core::{
    AgentParticipation, AgentStatus, ErrorKind, ExecutionDirectory, LogEntry, LogKind, LogLevel,
    ReconnectConfig, Session, SessionConfig, SessionSnapshot, SessionStatus,
};
use execlink_session::{
    ClientError, CommandOutcome, LocalCommand, SessionClient, remote::MemoryDirectory,
};
use execlink_transport::{
    AUTH_REJECTED_CLOSE_CODE, ConnectError, ConnectionManager, ConnectionState, Connector,
    Incoming, LogEvent, Outgoing, ServerEvent, SocketHandle, SocketPeer, StatusEvent,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Accepts every dial and hands the far end to the test.
struct PeerConnector {
    peers: mpsc::UnboundedSender<SocketPeer>,
}

#[async_trait]
impl Connector for PeerConnector {
    async fn open(&self, _url: &str) -> Result<SocketHandle, ConnectError> {
        let (handle, peer) = SocketHandle::pair();
        let _ = self.peers.send(peer);
        Ok(handle)
    }
}

struct Harness {
    client: SessionClient,
    remote: Arc<MemoryDirectory>,
    peers: mpsc::UnboundedReceiver<SocketPeer>,
}

fn harness() -> Harness {
    let (tx, peers) = mpsc::unbounded_channel();
    let reconnect = ReconnectConfig {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_attempts: 5,
    };
    let transport = ConnectionManager::new(
        "ws://engine.test/ws",
        &reconnect,
        Arc::new(PeerConnector { peers: tx }),
    );
    let remote = Arc::new(MemoryDirectory::new());
    let client = SessionClient::new(transport, remote.clone());
    Harness {
        client,
        remote,
        peers,
    }
}

fn seed(remote: &MemoryDirectory, id: &str, status: SessionStatus, history: &[&str]) {
    let session = Session {
        id: id.to_string(),
        prompt: "triage the bug queue".into(),
        status,
        agents: vec![AgentParticipation {
            agent_id: "triager".into(),
            name: "Triager".into(),
            order: 0,
            status: AgentStatus::Pending,
        }],
        config: SessionConfig::default(),
        result: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    };
    let logs = history
        .iter()
        .map(|m| LogEntry::new(LogLevel::Info, LogKind::Agent, *m))
        .collect();
    remote.insert(SessionSnapshot { session, logs }).unwrap();
}

async fn open(h: &mut Harness) -> SocketPeer {
    let peer = tokio::time::timeout(Duration::from_secs(5), h.peers.recv())
        .await
        .unwrap()
        .unwrap();
    h.client
        .transport()
        .watch_state()
        .wait_for(|s| *s == ConnectionState::Open)
        .await
        .unwrap();
    peer
}

/// Read frames until one named `event` arrives.
async fn frame(peer: &mut SocketPeer, event: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match peer.received.recv().await {
                Some(Outgoing::Text(json)) => {
                    let value: Value = serde_json::from_str(&json).unwrap();
                    if value["event"] == event {
                        return value;
                    }
                }
                Some(Outgoing::Close) => {}
                None => panic!("socket closed before {event}"),
            }
        }
    })
    .await
    .unwrap()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn log_event(session_id: &str, message: &str) -> ServerEvent {
    ServerEvent::Log(LogEvent {
        session_id: session_id.into(),
        log: LogEntry::new(LogLevel::Info, LogKind::Agent, message),
    })
}

#[tokio::test]
async fn test_reattaches_to_single_running_session() {
    let mut h = harness();
    seed(&h.remote, "done", SessionStatus::Completed, &[]);
    seed(&h.remote, "live", SessionStatus::Running, &["step 1", "step 2"]);

    let attached = h.client.init("tok").await.unwrap();
    assert_eq!(attached.as_deref(), Some("live"));
    assert!(h.client.is_executing());
    assert_eq!(h.client.timeline().unwrap().len(), 2);
    assert_eq!(
        h.client.subscriptions().active_session().as_deref(),
        Some("live")
    );

    // The subscription made before the socket opened is re-sent once it does.
    let mut peer = open(&mut h).await;
    assert_eq!(frame(&mut peer, "auth").await["data"]["token"], "tok");
    let subscribe = frame(&mut peer, "subscribe_session").await;
    assert_eq!(subscribe["data"]["session_id"], "live");
}

#[tokio::test]
async fn test_no_reattach_when_several_are_running() {
    let h = harness();
    seed(&h.remote, "a", SessionStatus::Running, &[]);
    seed(&h.remote, "b", SessionStatus::Running, &[]);

    assert_eq!(h.client.init("tok").await.unwrap(), None);
    assert!(h.client.current_session().is_none());
    assert!(!h.client.is_executing());
    assert_eq!(h.client.sessions().len(), 2);
}

#[tokio::test]
async fn test_start_log_pause_cancel() {
    let mut h = harness();
    h.client.init("tok").await.unwrap();
    let mut peer = open(&mut h).await;

    h.client.select_agents(vec!["planner".into()]);
    let session = h
        .client
        .create_session("plan a trip", SessionConfig::default())
        .await
        .unwrap();
    let id = session.id.clone();
    assert_eq!(frame(&mut peer, "subscribe_session").await["data"]["session_id"], id.as_str());

    h.client.start(&id).await.unwrap();
    assert!(h.client.is_executing());
    assert_eq!(frame(&mut peer, "start_execution").await["data"]["session_id"], id.as_str());

    h.client.transport().bus().publish(&log_event(&id, "l1"));

    h.client.pause(&id).await.unwrap();
    assert_eq!(h.client.current_session().unwrap().status, SessionStatus::Paused);
    assert!(h.client.is_executing());
    frame(&mut peer, "pause_execution").await;

    h.client.cancel(&id).await.unwrap();
    frame(&mut peer, "cancel_execution").await;

    let current = h.client.current_session().unwrap();
    assert_eq!(current.status, SessionStatus::Cancelled);
    assert!(current.completed_at.is_some());
    assert!(!h.client.is_executing());

    let messages: Vec<String> = h
        .client
        .timeline()
        .unwrap()
        .entries()
        .into_iter()
        .map(|e| e.message)
        .collect();
    assert_eq!(messages, vec!["l1".to_string()]);

    let stored = h.remote.list_sessions().await.unwrap();
    assert_eq!(stored[0].status, SessionStatus::Cancelled);
}

#[tokio::test]
async fn test_failed_command_keeps_optimistic_status_and_can_revert() {
    let h = harness();
    seed(&h.remote, "s1", SessionStatus::Running, &[]);
    h.client.load_session("s1").await.unwrap();

    h.remote.set_offline(true);
    let err = h.client.pause("s1").await.unwrap_err();
    assert!(matches!(err, ClientError::Directory(_)));

    let directory = h.client.directory();
    assert_eq!(directory.status("s1"), Some(SessionStatus::Paused));
    assert_eq!(directory.confirmed_status("s1"), Some(SessionStatus::Running));
    let pending = directory.pending_command("s1").unwrap();
    assert_eq!(pending.command, LocalCommand::Pause);
    assert!(matches!(pending.outcome, CommandOutcome::Failed(_)));
    assert_eq!(h.client.error().unwrap().kind, ErrorKind::Command);

    assert_eq!(
        h.client.revert_failed_command("s1"),
        Some(SessionStatus::Running)
    );
    assert_eq!(h.client.current_session().unwrap().status, SessionStatus::Running);
    assert!(directory.pending_command("s1").is_none());
}

#[tokio::test]
async fn test_revert_after_accepted_commands_restores_accepted_status() {
    let h = harness();
    seed(&h.remote, "s1", SessionStatus::Pending, &[]);
    h.client.load_session("s1").await.unwrap();

    h.client.start("s1").await.unwrap();
    h.client.pause("s1").await.unwrap();

    h.remote.set_offline(true);
    assert!(h.client.cancel("s1").await.is_err());

    assert_eq!(
        h.client.revert_failed_command("s1"),
        Some(SessionStatus::Paused)
    );
    assert_eq!(h.client.current_session().unwrap().status, SessionStatus::Paused);

    h.remote.set_offline(false);
    let server = h.remote.get_session("s1").await.unwrap().session.status;
    assert_eq!(server, SessionStatus::Paused);

    h.client.cancel("s1").await.unwrap();
    assert_eq!(
        h.remote.get_session("s1").await.unwrap().session.status,
        SessionStatus::Cancelled
    );
}

#[tokio::test]
async fn test_remote_status_reconciles_pending_command() {
    let h = harness();
    seed(&h.remote, "s1", SessionStatus::Running, &[]);
    h.client.load_session("s1").await.unwrap();

    h.client.pause("s1").await.unwrap();
    assert_eq!(
        h.client.directory().pending_command("s1").unwrap().outcome,
        CommandOutcome::Accepted
    );

    // The engine finished the run before honoring the pause.
    h.client
        .transport()
        .bus()
        .publish(&ServerEvent::Status(StatusEvent {
            session_id: "s1".into(),
            status: SessionStatus::Completed,
            agent_id: None,
            agent_status: None,
        }));

    let directory = h.client.directory();
    assert!(directory.pending_command("s1").is_none());
    assert_eq!(directory.status("s1"), Some(SessionStatus::Completed));
    assert!(!h.client.is_executing());
}

#[tokio::test]
async fn test_engine_error_marks_session_failed() {
    let h = harness();
    seed(&h.remote, "s1", SessionStatus::Running, &[]);
    h.client.load_session("s1").await.unwrap();

    h.client
        .transport()
        .bus()
        .publish(&ServerEvent::ExecutionError(
            execlink_transport::ExecutionErrorEvent {
                session_id: "s1".into(),
                error: "browser crashed".into(),
            },
        ));

    let current = h.client.current_session().unwrap();
    assert_eq!(current.status, SessionStatus::Failed);
    let error = h.client.error().unwrap();
    assert_eq!(error.kind, ErrorKind::Execution);
    assert_eq!(error.message, "browser crashed");

    h.client.clear_error();
    assert!(h.client.error().is_none());
}

#[tokio::test]
async fn test_invalid_transition_issues_no_request() {
    let h = harness();
    seed(&h.remote, "s1", SessionStatus::Pending, &[]);
    h.client.load_session("s1").await.unwrap();

    let err = h.client.pause("s1").await.unwrap_err();
    assert!(matches!(err, ClientError::Transition(_)));
    assert_eq!(h.client.error().unwrap().kind, ErrorKind::InvalidTransition);

    let stored = h.remote.get_session("s1").await.unwrap().session;
    assert_eq!(stored.status, SessionStatus::Pending);
    assert!(h.client.directory().pending_command("s1").is_none());
}

#[tokio::test]
async fn test_incompatible_agents_abort_start() {
    let h = harness();
    seed(&h.remote, "s1", SessionStatus::Pending, &[]);
    h.remote.mark_incompatible("triager", "needs a desktop host");
    h.client.load_session("s1").await.unwrap();

    let err = h.client.start("s1").await.unwrap_err();
    let ClientError::Incompatible(issues) = err else {
        panic!("expected incompatibility");
    };
    assert_eq!(issues, vec!["triager: needs a desktop host".to_string()]);

    assert_eq!(h.client.current_session().unwrap().status, SessionStatus::Pending);
    assert!(h.client.directory().pending_command("s1").is_none());
    assert_eq!(h.client.error().unwrap().kind, ErrorKind::Incompatible);
    assert_eq!(
        h.remote.get_session("s1").await.unwrap().session.status,
        SessionStatus::Pending
    );
}

#[tokio::test]
async fn test_switching_sessions_ignores_late_events() {
    let h = harness();
    seed(&h.remote, "a", SessionStatus::Running, &[]);
    seed(&h.remote, "b", SessionStatus::Running, &[]);

    h.client.load_session("a").await.unwrap();
    h.client.load_session("b").await.unwrap();

    let bus = h.client.transport().bus();
    bus.publish(&log_event("a", "late line for a"));
    bus.publish(&ServerEvent::Status(StatusEvent {
        session_id: "a".into(),
        status: SessionStatus::Failed,
        agent_id: None,
        agent_status: None,
    }));
    bus.publish(&log_event("b", "line for b"));

    assert_eq!(h.client.directory().status("a"), Some(SessionStatus::Running));
    let entries = h.client.timeline().unwrap().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "line for b");
}

#[tokio::test]
async fn test_reconnect_resyncs_timeline_from_snapshot() {
    let mut h = harness();
    seed(&h.remote, "s1", SessionStatus::Running, &["boot"]);
    h.client.init("tok").await.unwrap();
    let first = open(&mut h).await;

    h.client.transport().bus().publish(&log_event("s1", "live"));
    assert_eq!(h.client.timeline().unwrap().len(), 2);

    // The engine keeps logging while the client is away.
    for line in ["step 1", "step 2", "step 3"] {
        h.remote
            .push_log("s1", LogEntry::new(LogLevel::Info, LogKind::Agent, line))
            .unwrap();
    }
    first
        .inject
        .send(Incoming::Closed {
            code: 1001,
            reason: "going away".into(),
        })
        .unwrap();

    let mut second = open(&mut h).await;
    let client = h.client.clone();
    eventually(move || client.timeline().is_some_and(|t| t.epoch() == 2)).await;

    let messages: Vec<String> = h
        .client
        .timeline()
        .unwrap()
        .entries()
        .into_iter()
        .map(|e| e.message)
        .collect();
    assert_eq!(messages, vec!["boot", "step 1", "step 2", "step 3"]);
    assert_eq!(frame(&mut second, "subscribe_session").await["data"]["session_id"], "s1");
}

#[tokio::test]
async fn test_auth_rejection_surfaces_error() {
    let mut h = harness();
    h.client.init("expired").await.unwrap();
    let peer = open(&mut h).await;

    peer.inject
        .send(Incoming::Closed {
            code: AUTH_REJECTED_CLOSE_CODE,
            reason: "unauthorized".into(),
        })
        .unwrap();

    let client = h.client.clone();
    eventually(move || client.error().is_some()).await;
    assert_eq!(h.client.error().unwrap().kind, ErrorKind::AuthRejected);
    assert!(h.client.transport().is_auth_rejected());
}

#[tokio::test]
async fn test_user_input_sent_and_echoed() {
    let mut h = harness();
    seed(&h.remote, "s1", SessionStatus::Running, &[]);
    h.client.init("tok").await.unwrap();
    let mut peer = open(&mut h).await;

    assert!(h.client.send_user_input("s1", "use the staging account"));

    let sent = frame(&mut peer, "user_input").await;
    assert_eq!(
        sent["data"],
        json!({"session_id": "s1", "input": "use the staging account"})
    );
    let last = h.client.timeline().unwrap().entries().pop().unwrap();
    assert_eq!(last.kind, LogKind::User);
    assert_eq!(last.message, "use the staging account");
}

#[tokio::test]
async fn test_user_input_not_echoed_while_disconnected() {
    let h = harness();
    seed(&h.remote, "s1", SessionStatus::Running, &["earlier"]);
    h.client.load_session("s1").await.unwrap();

    assert!(!h.client.send_user_input("s1", "are you there?"));

    let entries = h.client.timeline().unwrap().entries();
    assert!(entries.iter().all(|e| e.kind != LogKind::User));
    assert_eq!(h.client.error().unwrap().kind, ErrorKind::Disconnected);
}

#[tokio::test]
async fn test_delete_and_shutdown() {
    let mut h = harness();
    seed(&h.remote, "old", SessionStatus::Completed, &[]);
    seed(&h.remote, "s1", SessionStatus::Running, &[]);
    h.client.init("tok").await.unwrap();
    let mut peer = open(&mut h).await;

    h.client.delete_session("old").await.unwrap();
    assert_eq!(h.client.sessions().len(), 1);
    assert_eq!(
        h.client.subscriptions().active_session().as_deref(),
        Some("s1")
    );

    h.client.shutdown();
    assert_eq!(frame(&mut peer, "unsubscribe_session").await["data"]["session_id"], "s1");
    assert_eq!(h.client.transport().state(), ConnectionState::Closed);
    assert!(h.client.sessions().is_empty());
    assert!(h.client.subscriptions().active_session().is_none());
    assert!(h.client.error().is_none());
}
