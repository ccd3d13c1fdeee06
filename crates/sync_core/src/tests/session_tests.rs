use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::channel::mpsc;
use serde_json::{json, Value};
use shared::{domain::RowId, error::ProtocolError, protocol::LanePayload};
use tokio::net::TcpListener;

use super::*;
use crate::channel::FrameStream;

#[derive(Default)]
struct FakeTransport {
    replies: StdMutex<LanePair<Option<LanePayload>>>,
    fetches: LanePair<AtomicUsize>,
    actions: StdMutex<Vec<ControlAction>>,
    fail_actions: AtomicBool,
    hold: tokio::sync::Mutex<()>,
}

impl FakeTransport {
    fn with_lanes(left: Value, right: Value) -> Arc<Self> {
        let transport = Self::default();
        transport.set_reply(Side::Left, Some(payload(left, Some(json!("B1")))));
        transport.set_reply(Side::Right, Some(payload(right, None)));
        Arc::new(transport)
    }

    fn set_reply(&self, side: Side, reply: Option<LanePayload>) {
        *self.replies.lock().expect("replies").get_mut(side) = reply;
    }

    fn fetches(&self, side: Side) -> usize {
        self.fetches.get(side).load(Ordering::SeqCst)
    }

    fn actions(&self) -> Vec<ControlAction> {
        self.actions.lock().expect("actions").clone()
    }
}

#[async_trait]
impl LaneTransport for FakeTransport {
    async fn fetch_lane(&self, side: Side) -> Result<LanePayload, SyncError> {
        self.fetches.get(side).fetch_add(1, Ordering::SeqCst);
        drop(self.hold.lock().await);
        let reply = self.replies.lock().expect("replies").get(side).clone();
        reply.ok_or(SyncError::Protocol(ProtocolError::NotOk))
    }

    async fn trigger_action(&self, action: ControlAction) -> Result<(), SyncError> {
        self.actions.lock().expect("actions").push(action);
        if self.fail_actions.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("backend unavailable".into()));
        }
        Ok(())
    }
}

struct FailingConnector;

#[async_trait]
impl PushConnector for FailingConnector {
    async fn connect(&self, _url: &Url) -> Result<FrameStream, SyncError> {
        Err(SyncError::Channel("connection refused".into()))
    }
}

struct PendingConnector;

#[async_trait]
impl PushConnector for PendingConnector {
    async fn connect(&self, _url: &Url) -> Result<FrameStream, SyncError> {
        futures::future::pending().await
    }
}

type FrameSender = mpsc::UnboundedSender<Result<ChannelFrame, SyncError>>;

/// Hands out one stream fed by the test; later connects never resolve.
struct ScriptedConnector {
    frames: StdMutex<Option<mpsc::UnboundedReceiver<Result<ChannelFrame, SyncError>>>>,
}

fn scripted() -> (Arc<ScriptedConnector>, FrameSender) {
    let (tx, rx) = mpsc::unbounded();
    let connector = ScriptedConnector {
        frames: StdMutex::new(Some(rx)),
    };
    (Arc::new(connector), tx)
}

#[async_trait]
impl PushConnector for ScriptedConnector {
    async fn connect(&self, _url: &Url) -> Result<FrameStream, SyncError> {
        let frames = self.frames.lock().expect("frames").take();
        match frames {
            Some(frames) => Ok(frames.boxed()),
            None => futures::future::pending().await,
        }
    }
}

fn payload(rows: Value, buffer: Option<Value>) -> LanePayload {
    LanePayload {
        rows: Some(rows),
        pending: None,
        buffer,
    }
}

fn settings() -> SyncSettings {
    SyncSettings {
        poll_interval_ms: 100,
        reconnect: false,
        ..SyncSettings::with_api_base("http://127.0.0.1:9")
    }
}

fn unreachable_channel_settings() -> SyncSettings {
    SyncSettings {
        channel_origin: Some("ftp://sequencer.invalid".into()),
        ..settings()
    }
}

fn session_with(
    settings: SyncSettings,
    transport: Arc<FakeTransport>,
    connector: Arc<dyn PushConnector>,
) -> Arc<SyncSession> {
    SyncSession::new_with_dependencies(settings, transport, connector).expect("session")
}

fn send_event(tx: &FrameSender, event: &str, payload: Option<Value>) {
    tx.unbounded_send(Ok(ChannelFrame::new(event, payload)))
        .expect("channel open");
}

fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn statuses(events: &[SyncEvent]) -> Vec<ConnectionStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::StatusChanged(status) => Some(*status),
            _ => None,
        })
        .collect()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_status(session: &SyncSession, expected: ConnectionStatus) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while session.status().await != expected {
        assert!(Instant::now() < deadline, "timed out waiting for {expected}");
        sleep(Duration::from_millis(10)).await;
    }
}

async fn lane_ids(session: &SyncSession, side: Side) -> Vec<RowId> {
    session
        .read(|store| {
            store
                .lane(side)
                .rows
                .iter()
                .map(|row| row.id.clone())
                .collect()
        })
        .await
}

#[test]
fn statuses_display_their_wire_names() {
    assert_eq!(ConnectionStatus::SocketDisconnected.to_string(), "socket:disconnected");
    assert_eq!(ConnectionStatus::Polling.to_string(), "polling");
}

#[tokio::test]
async fn start_refreshes_both_lanes_then_reports_ready() {
    let transport = FakeTransport::with_lanes(
        json!([{"id": 1, "time": 1000}, {"id": 2, "time": 2000}]),
        json!([]),
    );
    let session = session_with(settings(), transport.clone(), Arc::new(PendingConnector));
    let mut events = session.subscribe();

    let fetched = session.start().await;

    assert_eq!(fetched, LanePair { left: true, right: true });
    assert_eq!(session.status().await, ConnectionStatus::Ready);
    assert_eq!(lane_ids(&session, Side::Left).await, vec![RowId::from(2), RowId::from(1)]);
    assert_eq!(session.read(|store| store.buffer().cloned()).await, Some(json!("B1")));

    let events = drain(&mut events);
    assert_eq!(events.last(), Some(&SyncEvent::StatusChanged(ConnectionStatus::Ready)));
    let updated = events
        .iter()
        .filter(|event| matches!(event, SyncEvent::LaneUpdated { .. }))
        .count();
    assert_eq!(updated, 2);
    session.teardown().await;
}

#[tokio::test]
async fn channel_setup_failure_falls_back_to_polling() {
    let transport = FakeTransport::with_lanes(json!([]), json!([]));
    let session = session_with(
        unreachable_channel_settings(),
        transport.clone(),
        Arc::new(PendingConnector),
    );
    let mut events = session.subscribe();

    session.start().await;

    assert_eq!(session.status().await, ConnectionStatus::Polling);
    assert_eq!(
        statuses(&drain(&mut events)),
        vec![ConnectionStatus::SocketError, ConnectionStatus::Polling]
    );
    eventually("repeated poll ticks", || {
        transport.fetches(Side::Left) >= 3 && transport.fetches(Side::Right) >= 3
    })
    .await;
    session.teardown().await;
}

#[tokio::test]
async fn connect_failure_falls_back_to_polling() {
    let transport = FakeTransport::with_lanes(json!([]), json!([]));
    let session = session_with(settings(), transport.clone(), Arc::new(FailingConnector));
    let mut events = session.subscribe();

    session.start().await;
    wait_for_status(&session, ConnectionStatus::Polling).await;

    let seen = statuses(&drain(&mut events));
    let error_at = seen
        .iter()
        .position(|status| *status == ConnectionStatus::SocketError)
        .expect("socket:error reported");
    assert_eq!(seen.last(), Some(&ConnectionStatus::Polling));
    assert!(error_at < seen.len() - 1);

    eventually("a poll tick", || transport.fetches(Side::Left) >= 2).await;
    session.teardown().await;
}

#[tokio::test]
async fn update_event_with_side_refreshes_only_that_lane() {
    let transport = FakeTransport::with_lanes(
        json!([{"id": 1, "time": 1000}]),
        json!([{"id": 9, "time": 9000}]),
    );
    let (connector, tx) = scripted();
    let session = session_with(settings(), transport.clone(), connector);

    session.start().await;
    wait_for_status(&session, ConnectionStatus::SocketConnected).await;
    assert_eq!(transport.fetches(Side::Right), 1);

    transport.set_reply(
        Side::Left,
        Some(payload(json!([{"id": 3, "time": 3000}, {"id": 1, "time": 1000}]), None)),
    );
    send_event(&tx, "update", Some(json!({"side": "left"})));

    eventually("left refetch", || transport.fetches(Side::Left) == 2).await;
    eventually("left rows replaced", || {
        session
            .store
            .try_read()
            .map(|store| store.lane(Side::Left).rows.len() == 2)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(transport.fetches(Side::Right), 1);
    assert_eq!(lane_ids(&session, Side::Right).await, vec![RowId::from(9)]);
    assert_eq!(session.read(|store| store.buffer().cloned()).await, Some(json!("B1")));
    session.teardown().await;
}

#[tokio::test]
async fn ok_false_keeps_the_last_good_lane() {
    let transport = FakeTransport::with_lanes(json!([]), json!([{"id": "R-1", "time": 5}]));
    let session = session_with(settings(), transport.clone(), Arc::new(PendingConnector));
    session.fetch_all().await;
    let mut events = session.subscribe();

    transport.set_reply(Side::Right, None);
    let fetched = session.fetch_all().await;

    assert_eq!(fetched, LanePair { left: true, right: false });
    assert_eq!(lane_ids(&session, Side::Right).await, vec![RowId::from("R-1")]);
    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        SyncEvent::FetchFailed { side: Side::Right, .. }
    )));
}

#[tokio::test]
async fn channel_drop_reports_disconnect_and_starts_polling() {
    let transport = FakeTransport::with_lanes(json!([]), json!([]));
    let (connector, tx) = scripted();
    let session = session_with(settings(), transport.clone(), connector);
    let mut events = session.subscribe();

    session.start().await;
    wait_for_status(&session, ConnectionStatus::SocketConnected).await;
    drop(tx);
    wait_for_status(&session, ConnectionStatus::Polling).await;

    let seen = statuses(&drain(&mut events));
    let tail: Vec<_> = seen.iter().rev().take(2).rev().copied().collect();
    assert_eq!(
        tail,
        vec![ConnectionStatus::SocketDisconnected, ConnectionStatus::Polling]
    );
    session.teardown().await;
}

#[tokio::test]
async fn polling_survives_channel_recovery() {
    let transport = FakeTransport::with_lanes(json!([]), json!([]));
    let (connector, tx) = scripted();
    let session = session_with(settings(), transport.clone(), connector);

    session.ensure_polling().await;
    session.start().await;
    wait_for_status(&session, ConnectionStatus::SocketConnected).await;

    let before = transport.fetches(Side::Left);
    eventually("poll ticks while connected", || {
        transport.fetches(Side::Left) >= before + 2
    })
    .await;
    drop(tx);
    session.teardown().await;
}

#[tokio::test]
async fn teardown_stops_polling_and_is_idempotent() {
    let transport = FakeTransport::with_lanes(json!([]), json!([]));
    let session = session_with(
        unreachable_channel_settings(),
        transport.clone(),
        Arc::new(PendingConnector),
    );

    session.start().await;
    eventually("a poll tick", || transport.fetches(Side::Left) >= 2).await;

    session.teardown().await;
    session.teardown().await;
    session.ensure_polling().await;
    sleep(Duration::from_millis(50)).await;
    let settled = transport.fetches(Side::Left);

    sleep(Duration::from_millis(350)).await;
    assert_eq!(transport.fetches(Side::Left), settled);
}

#[tokio::test]
async fn responses_landing_after_teardown_are_dropped() {
    let transport = FakeTransport::with_lanes(json!([{"id": 1, "time": 1}]), json!([]));
    let session = session_with(settings(), transport.clone(), Arc::new(PendingConnector));
    let mut events = session.subscribe();

    let held = transport.hold.lock().await;
    let in_flight = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.fetch_all().await })
    };
    eventually("both fetches in flight", || {
        transport.fetches(Side::Left) == 1 && transport.fetches(Side::Right) == 1
    })
    .await;

    session.teardown().await;
    drop(held);
    let fetched = in_flight.await.expect("refresh task");

    assert_eq!(fetched, LanePair { left: false, right: false });
    assert!(lane_ids(&session, Side::Left).await.is_empty());
    assert!(!drain(&mut events)
        .iter()
        .any(|event| matches!(event, SyncEvent::LaneUpdated { .. })));
}

#[tokio::test]
async fn stalled_channel_connect_times_out_into_polling() {
    let transport = FakeTransport::with_lanes(json!([]), json!([]));
    let settings = SyncSettings {
        connect_timeout_ms: 200,
        ..settings()
    };
    let session = session_with(settings, transport.clone(), Arc::new(PendingConnector));
    let mut events = session.subscribe();

    session.start().await;
    assert_eq!(session.status().await, ConnectionStatus::Ready);
    wait_for_status(&session, ConnectionStatus::Polling).await;

    let seen = statuses(&drain(&mut events));
    assert_eq!(
        seen,
        vec![
            ConnectionStatus::Ready,
            ConnectionStatus::SocketError,
            ConnectionStatus::Polling
        ]
    );
    eventually("a poll tick", || transport.fetches(Side::Left) >= 2).await;
    session.teardown().await;
}

#[tokio::test]
async fn silent_socket_server_falls_back_to_polling() {
    let (base, state) = spawn_lane_backend().await;
    let silent = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let silent_addr = silent.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut accepted = Vec::new();
        while let Ok((socket, _)) = silent.accept().await {
            accepted.push(socket);
        }
    });

    let settings = SyncSettings {
        channel_origin: Some(format!("http://{silent_addr}")),
        poll_interval_ms: 100,
        connect_timeout_ms: 300,
        reconnect: false,
        ..SyncSettings::with_api_base(base)
    };
    let session = SyncSession::new(settings).expect("session");

    session.start().await;
    wait_for_status(&session, ConnectionStatus::Polling).await;
    eventually("polled refreshes", || {
        state.fetches.left.load(Ordering::SeqCst) >= 3
    })
    .await;
    session.teardown().await;
}

#[tokio::test]
async fn flush_triggers_action_then_full_refresh() {
    let transport = FakeTransport::with_lanes(json!([]), json!([]));
    let session = session_with(settings(), transport.clone(), Arc::new(PendingConnector));

    let fetched = session.flush(Side::Left).await.expect("flush");

    assert_eq!(fetched, LanePair { left: true, right: true });
    assert_eq!(transport.actions(), vec![ControlAction::Flush(Side::Left)]);
    assert_eq!(transport.fetches(Side::Left), 1);
    assert_eq!(transport.fetches(Side::Right), 1);
}

#[tokio::test]
async fn failed_action_still_refreshes() {
    let transport = FakeTransport::with_lanes(json!([]), json!([]));
    transport.fail_actions.store(true, Ordering::SeqCst);
    let session = session_with(settings(), transport.clone(), Arc::new(PendingConnector));
    let mut events = session.subscribe();

    let err = session.refresh().await.expect_err("action fails");

    assert!(matches!(err, SyncError::Transport(_)));
    assert_eq!(transport.actions(), vec![ControlAction::Refresh]);
    assert_eq!(transport.fetches(Side::Left), 1);
    assert_eq!(transport.fetches(Side::Right), 1);
    assert!(drain(&mut events).iter().any(|event| matches!(
        event,
        SyncEvent::ActionFailed {
            action: ControlAction::Refresh,
            ..
        }
    )));
}

#[tokio::test]
async fn channel_events_map_to_refreshes() {
    let transport = FakeTransport::with_lanes(json!([]), json!([]));
    let (connector, tx) = scripted();
    let session = session_with(settings(), transport.clone(), connector);

    session.start().await;
    wait_for_status(&session, ConnectionStatus::SocketConnected).await;

    send_event(&tx, "sequencing:change", None);
    eventually("full refresh", || {
        transport.fetches(Side::Left) == 2 && transport.fetches(Side::Right) == 2
    })
    .await;

    send_event(&tx, "chat:message", Some(json!({"side": "left"})));
    send_event(&tx, "sequence:right:changed", None);
    eventually("right refresh", || transport.fetches(Side::Right) == 3).await;
    assert_eq!(transport.fetches(Side::Left), 2);

    send_event(&tx, "container:changed", None);
    send_event(&tx, "flush", None);
    eventually("one refresh per trigger", || {
        transport.fetches(Side::Left) == 4 && transport.fetches(Side::Right) == 5
    })
    .await;
    session.teardown().await;
}

#[test]
fn invalid_settings_are_rejected_at_construction() {
    let settings = SyncSettings {
        left_lane_url: Some("not a url".into()),
        ..settings()
    };
    let result = SyncSession::new_with_dependencies(
        settings,
        Arc::new(FakeTransport::default()),
        Arc::new(PendingConnector),
    );
    let err = result.err().expect("invalid url");
    assert!(err.is_fatal());
}

#[derive(Clone, Default)]
struct BackendState {
    fetches: Arc<LanePair<AtomicUsize>>,
}

async fn lane_route(side: Side, state: &BackendState) -> Json<Value> {
    state.fetches.get(side).fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "ok": true,
        "rows": [{"id": 1, "wagon_no": format!("{side}-1"), "time": 1000}],
        "pendingContainers": [],
        "buffer": 3
    }))
}

async fn socket_route(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(socket_session)
}

async fn socket_session(mut socket: WebSocket) {
    let open = r#"0{"sid":"e2e","pingInterval":25000,"pingTimeout":20000}"#;
    if socket.send(WsMessage::Text(open.to_string())).await.is_err() {
        return;
    }
    let Some(Ok(WsMessage::Text(reply))) = socket.recv().await else {
        return;
    };
    if reply != "40" {
        return;
    }
    for packet in [r#"40{"sid":"ns"}"#, r#"42["sequence:left:changed"]"#] {
        if socket.send(WsMessage::Text(packet.to_string())).await.is_err() {
            return;
        }
    }
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn spawn_lane_backend() -> (String, BackendState) {
    let state = BackendState::default();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route(
            "/api/sequence/left",
            get(|State(state): State<BackendState>| async move {
                lane_route(Side::Left, &state).await
            }),
        )
        .route(
            "/api/sequence/right",
            get(|State(state): State<BackendState>| async move {
                lane_route(Side::Right, &state).await
            }),
        )
        .route("/socket.io/", get(socket_route))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

#[tokio::test]
async fn end_to_end_against_http_and_websocket_backend() {
    let (base, state) = spawn_lane_backend().await;
    let settings = SyncSettings {
        reconnect: false,
        ..SyncSettings::with_api_base(base)
    };
    let session = SyncSession::new(settings).expect("session");

    session.start().await;
    eventually("event-driven left refresh", || {
        state.fetches.left.load(Ordering::SeqCst) >= 2
    })
    .await;
    assert_eq!(state.fetches.right.load(Ordering::SeqCst), 1);
    assert_eq!(session.status().await, ConnectionStatus::SocketConnected);

    let view_rows = session
        .read(|store| {
            store
                .derive(Side::Right)
                .rows
                .iter()
                .filter_map(|row| row.wagon_no.clone())
                .collect::<Vec<_>>()
        })
        .await;
    assert_eq!(view_rows, vec!["right-1".to_string()]);
    assert_eq!(session.read(|store| store.buffer().cloned()).await, Some(json!(3)));
    session.teardown().await;
}
