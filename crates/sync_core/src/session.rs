//! Keeps the store in step with the backend over two delivery paths.
//!
//! A push channel triggers lane-scoped or full refreshes as events arrive.
//! Once the channel fails or drops, a polling timer takes over and keeps
//! running until teardown, even if the channel later reconnects.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::StreamExt;
use serde::Serialize;
use shared::{
    domain::{LanePair, Side},
    protocol::ChannelFrame,
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
    time::{interval_at, sleep, timeout, Instant},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    channel::{PushConnector, RefreshIntent, WsConnector},
    config::SyncSettings,
    error::SyncError,
    normalize::normalize,
    store::{CsvExport, ViewState, ViewStateStore},
    transport::{ControlAction, HttpTransport, LaneTransport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Connecting,
    Ready,
    SocketConnected,
    SocketError,
    SocketDisconnected,
    Polling,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::SocketConnected => "socket:connected",
            ConnectionStatus::SocketError => "socket:error",
            ConnectionStatus::SocketDisconnected => "socket:disconnected",
            ConnectionStatus::Polling => "polling",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged(ConnectionStatus),
    LaneUpdated {
        side: Side,
        rows: usize,
        pending: usize,
    },
    FetchFailed {
        side: Side,
        error: String,
    },
    ActionFailed {
        action: ControlAction,
        error: String,
    },
}

#[derive(Default)]
struct SessionTasks {
    channel: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

pub struct SyncSession {
    settings: SyncSettings,
    transport: Arc<dyn LaneTransport>,
    connector: Arc<dyn PushConnector>,
    store: RwLock<ViewStateStore>,
    status: Mutex<ConnectionStatus>,
    tasks: Mutex<SessionTasks>,
    closed: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncSession {
    pub fn new(settings: SyncSettings) -> Result<Arc<Self>, SyncError> {
        let transport = Arc::new(HttpTransport::new(&settings)?);
        Self::new_with_dependencies(settings, transport, Arc::new(WsConnector))
    }

    pub fn new_with_dependencies(
        settings: SyncSettings,
        transport: Arc<dyn LaneTransport>,
        connector: Arc<dyn PushConnector>,
    ) -> Result<Arc<Self>, SyncError> {
        settings.validate()?;
        let (events, _) = broadcast::channel(1024);
        let view = ViewState::with_page_size(settings.page_size);
        Ok(Arc::new(Self {
            settings,
            transport,
            connector,
            store: RwLock::new(ViewStateStore::new(view)),
            status: Mutex::new(ConnectionStatus::Connecting),
            tasks: Mutex::new(SessionTasks::default()),
            closed: AtomicBool::new(false),
            events,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub async fn status(&self) -> ConnectionStatus {
        *self.status.lock().await
    }

    /// Runs `f` against a consistent snapshot of the store.
    pub async fn read<R>(&self, f: impl FnOnce(&ViewStateStore) -> R) -> R {
        let store = self.store.read().await;
        f(&store)
    }

    /// Applies an operator intent (search, filter, paging, selection) in one step.
    pub async fn update_view<R>(&self, f: impl FnOnce(&mut ViewStateStore) -> R) -> R {
        let mut store = self.store.write().await;
        f(&mut store)
    }

    pub async fn export_csv(&self, side: Side) -> Result<Option<CsvExport>, SyncError> {
        self.read(|store| store.export_csv(side)).await
    }

    /// Opens the push channel in the background and performs the initial full refresh.
    pub async fn start(self: &Arc<Self>) -> LanePair<bool> {
        self.set_status(ConnectionStatus::Connecting).await;

        match self.settings.channel_url() {
            Ok(url) => {
                let mut tasks = self.tasks.lock().await;
                if !self.is_closed() && tasks.channel.is_none() {
                    let session = Arc::clone(self);
                    tasks.channel = Some(tokio::spawn(session.run_channel(url)));
                }
            }
            Err(err) => {
                warn!(error = %err, "session: push channel setup failed");
                self.set_status(ConnectionStatus::SocketError).await;
                self.ensure_polling().await;
            }
        }

        self.fetch_all().await
    }

    /// Fetches one lane and applies it unless a newer fetch already landed.
    /// Returns whether the backend produced usable data; after teardown nothing is applied.
    pub async fn fetch_lane(&self, side: Side) -> bool {
        let ticket = self.store.write().await.begin_fetch(side);
        let payload = match self.transport.fetch_lane(side).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%side, error = %err, "session: lane fetch failed, keeping previous rows");
                let _ = self.events.send(SyncEvent::FetchFailed {
                    side,
                    error: err.to_string(),
                });
                return false;
            }
        };

        let lane = normalize(&payload);
        let (rows, pending) = (lane.rows.len(), lane.pending.len());
        let mut store = self.store.write().await;
        if self.is_closed() {
            debug!(%side, "session: dropping lane response that landed after teardown");
            return false;
        }
        if store.apply_fetch(side, ticket, lane) {
            debug!(%side, rows, pending, "session: lane updated");
            let _ = self.events.send(SyncEvent::LaneUpdated {
                side,
                rows,
                pending,
            });
        }
        true
    }

    /// Fetches both lanes concurrently; one lane failing never holds up the other.
    pub async fn fetch_all(&self) -> LanePair<bool> {
        let (left, right) = tokio::join!(self.fetch_lane(Side::Left), self.fetch_lane(Side::Right));
        self.transition(ConnectionStatus::Connecting, ConnectionStatus::Ready)
            .await;
        LanePair { left, right }
    }

    pub async fn flush(&self, side: Side) -> Result<LanePair<bool>, SyncError> {
        self.run_action(ControlAction::Flush(side)).await
    }

    pub async fn refresh(&self) -> Result<LanePair<bool>, SyncError> {
        self.run_action(ControlAction::Refresh).await
    }

    /// The full refresh runs whether or not the action itself succeeded.
    async fn run_action(&self, action: ControlAction) -> Result<LanePair<bool>, SyncError> {
        let result = self.transport.trigger_action(action).await;
        if let Err(err) = &result {
            warn!(%action, error = %err, "session: control action failed");
            let _ = self.events.send(SyncEvent::ActionFailed {
                action,
                error: err.to_string(),
            });
        }
        let fetched = self.fetch_all().await;
        result.map(|()| fetched)
    }

    async fn run_refresh(&self, intent: RefreshIntent) {
        match intent {
            RefreshIntent::Left => {
                self.fetch_lane(Side::Left).await;
            }
            RefreshIntent::Right => {
                self.fetch_lane(Side::Right).await;
            }
            RefreshIntent::Full => {
                self.fetch_all().await;
            }
        }
    }

    fn dispatch(self: &Arc<Self>, frame: &ChannelFrame) {
        let Some(intent) = RefreshIntent::from_frame(frame) else {
            debug!(event = %frame.event, "session: ignoring channel event");
            return;
        };
        debug!(event = %frame.event, ?intent, "session: channel event");
        let session = Arc::clone(self);
        tokio::spawn(async move { session.run_refresh(intent).await });
    }

    /// Starts the polling timer once per session; later calls are no-ops.
    pub async fn ensure_polling(self: &Arc<Self>) {
        {
            let mut tasks = self.tasks.lock().await;
            if self.is_closed() || tasks.poller.is_some() {
                return;
            }
            let period = self.settings.poll_interval();
            let session = Arc::clone(self);
            tasks.poller = Some(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    debug!("session: poll tick");
                    let session = Arc::clone(&session);
                    tokio::spawn(async move {
                        session.fetch_all().await;
                    });
                }
            }));
            info!(interval_ms = period.as_millis() as u64, "session: polling started");
        }
        self.set_status(ConnectionStatus::Polling).await;
    }

    async fn run_channel(self: Arc<Self>, url: Url) {
        let (min_delay, max_delay) = self.settings.reconnect_delays();
        let mut delay = min_delay;
        let connect_timeout = self.settings.connect_timeout();
        loop {
            let attempt = timeout(connect_timeout, self.connector.connect(&url))
                .await
                .unwrap_or_else(|_| {
                    Err(SyncError::Channel(format!(
                        "no handshake from {url} within {}ms",
                        connect_timeout.as_millis()
                    )))
                });
            match attempt {
                Ok(mut frames) => {
                    info!(%url, "session: push channel connected");
                    self.set_status(ConnectionStatus::SocketConnected).await;
                    delay = min_delay;
                    while let Some(frame) = frames.next().await {
                        match frame {
                            Ok(frame) => self.dispatch(&frame),
                            Err(err) => {
                                warn!(error = %err, "session: push channel failed");
                                break;
                            }
                        }
                    }
                    self.set_status(ConnectionStatus::SocketDisconnected).await;
                }
                Err(err) => {
                    warn!(%url, error = %err, "session: push channel unavailable");
                    self.set_status(ConnectionStatus::SocketError).await;
                }
            }
            self.ensure_polling().await;

            if !self.settings.reconnect {
                return;
            }
            debug!(delay_ms = delay.as_millis() as u64, "session: reconnecting push channel");
            sleep(delay).await;
            delay = (delay * 2).min(max_delay);
        }
    }

    async fn set_status(&self, next: ConnectionStatus) {
        let mut status = self.status.lock().await;
        let previous = *status;
        if previous == next {
            return;
        }
        info!(from = %previous, to = %next, "session: status changed");
        *status = next;
        let _ = self.events.send(SyncEvent::StatusChanged(next));
    }

    async fn transition(&self, from: ConnectionStatus, to: ConnectionStatus) {
        let mut status = self.status.lock().await;
        if *status != from {
            return;
        }
        info!(from = %from, to = %to, "session: status changed");
        *status = to;
        let _ = self.events.send(SyncEvent::StatusChanged(to));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stops the channel and the poller. Refreshes still in flight finish
    /// without touching the store. Safe to call more than once.
    pub async fn teardown(&self) {
        {
            let mut tasks = self.tasks.lock().await;
            if !self.closed.swap(true, Ordering::SeqCst) {
                info!("session: tearing down");
            }
            if let Some(channel) = tasks.channel.take() {
                channel.abort();
            }
            if let Some(poller) = tasks.poller.take() {
                poller.abort();
            }
        }
        // Waits out an apply that started before the flag was set.
        drop(self.store.write().await);
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
