use std::{
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    future::{self, BoxFuture, Shared},
    FutureExt, Sink, SinkExt, Stream, StreamExt,
};
use shared::{
    domain::ChatId,
    protocol::{ChatEvent, ClientCommand, EventType},
};
use tokio::{
    sync::{mpsc, watch},
    task::{AbortHandle, JoinHandle},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::TransportError,
    listeners::{Listener, ListenerId, ListenerRegistry},
};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// HTTP(S) base url of the chat server; the socket lives at `/ws`.
    pub server_url: String,
    pub token: String,
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl TransportConfig {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: self.base_delay,
            max_attempts: self.max_attempts,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            token: String::new(),
            base_delay: DEFAULT_BASE_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Wait before reconnection attempt `attempt` (1-based):
    /// `base_delay * 2^(attempt - 1)`. `None` once the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1)?;
        self.base_delay.checked_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    ReconnectWait { attempt: u32, delay: Duration },
    Abandoned,
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open socket reduced to text frames in both directions.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &Url) -> Result<Connection, TransportError>;
}

pub struct WebSocketDialer;

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, url: &Url) -> Result<Connection, TransportError> {
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (sink, stream) = socket.split();

        let sink = sink
            .sink_map_err(|err| TransportError::Closed(err.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text))));
        let stream = stream.filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(_)) => Some(Err(TransportError::Closed(
                    "server closed the connection".into(),
                ))),
                Ok(_) => None,
                Err(err) => Some(Err(TransportError::Closed(err.to_string()))),
            })
        });

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Builds `ws(s)://host/<base path>/ws?token=...` from the HTTP base url.
pub fn websocket_url(server_url: &str, token: &str) -> Result<Url, TransportError> {
    let mut url =
        Url::parse(server_url).map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(format!("cannot use scheme '{scheme}'")))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

type ConnectFuture = Shared<BoxFuture<'static, Result<(), TransportError>>>;

#[derive(Default)]
struct Session {
    /// Failed attempts since the last successful open.
    attempt: u32,
    /// Bumped on every open and on disconnect; stale tasks compare and bail.
    epoch: u64,
    inflight: Option<ConnectFuture>,
    /// The task driving `inflight`, so an attempt finishes even when every
    /// caller stops waiting on it.
    dialing: Option<AbortHandle>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reconnect_timer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

struct Inner {
    config: TransportConfig,
    policy: ReconnectPolicy,
    dialer: Arc<dyn Dialer>,
    listeners: ListenerRegistry,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
}

/// One authenticated live connection with its own listeners and backoff
/// state. Several instances can coexist in a process.
pub struct RealtimeTransport {
    inner: Arc<Inner>,
}

impl RealtimeTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_dialer(config, Arc::new(WebSocketDialer))
    }

    pub fn with_dialer(config: TransportConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                policy: config.reconnect_policy(),
                config,
                dialer,
                listeners: ListenerRegistry::new(),
                state,
                session: Mutex::new(Session::default()),
            }),
        }
    }

    /// Opens the socket. Concurrent callers share one attempt. A failure is
    /// also delivered to listeners as an `error` event and schedules a
    /// reconnect while budget remains.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let attempt = {
            let mut session = self.inner.lock();
            if self.is_connected() {
                return Ok(());
            }
            if let Some(inflight) = session.inflight.clone() {
                inflight
            } else {
                if let Some(timer) = session.reconnect_timer.take() {
                    timer.abort();
                }
                self.inner.start_attempt(&mut session)
            }
        };
        attempt.await
    }

    /// Closes the socket, forgets every listener and spends the reconnect
    /// budget so nothing reconnects behind the caller's back.
    pub fn disconnect(&self) {
        {
            let mut session = self.inner.lock();
            session.epoch += 1;
            session.attempt = self.inner.policy.max_attempts;
            session.inflight = None;
            session.outbound = None;
            for task in [session.reconnect_timer.take(), session.reader.take()]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
            if let Some(dialing) = session.dialing.take() {
                dialing.abort();
            }
            // The writer drains and closes the sink once `outbound` is gone.
            session.writer = None;
            self.inner.state.send_replace(ConnectionState::Idle);
        }
        self.inner.listeners.clear();
        info!(server = %self.inner.config.server_url, "realtime connection closed by client");
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn on(&self, event_type: EventType, listener: Listener) -> ListenerId {
        self.inner.listeners.on(event_type, listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.listeners.off(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn join_chat(&self, chat_id: ChatId) -> bool {
        self.send_command(ClientCommand::JoinChat { chat_id })
    }

    pub fn leave_chat(&self, chat_id: ChatId) -> bool {
        self.send_command(ClientCommand::LeaveChat { chat_id })
    }

    pub fn send_typing(&self, chat_id: ChatId, is_typing: bool) -> bool {
        self.send_command(ClientCommand::Typing { chat_id, is_typing })
    }

    /// Fire and forget. Nothing is queued while the socket is down.
    fn send_command(&self, command: ClientCommand) -> bool {
        let session = self.inner.lock();
        let outbound = match session.outbound.as_ref() {
            Some(outbound) if self.is_connected() => outbound,
            _ => {
                warn!(?command, "realtime connection not open; dropping frame");
                return false;
            }
        };
        let frame = match serde_json::to_string(&command) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "failed to encode client command");
                return false;
            }
        };
        outbound.send(frame).is_ok()
    }
}

impl Drop for RealtimeTransport {
    fn drop(&mut self) {
        let mut session = self.inner.lock();
        session.epoch += 1;
        session.outbound = None;
        for task in [session.reconnect_timer.take(), session.reader.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        if let Some(dialing) = session.dialing.take() {
            dialing.abort();
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_attempt(self: &Arc<Self>, session: &mut Session) -> ConnectFuture {
        self.state.send_replace(ConnectionState::Connecting);
        let task = tokio::spawn(Arc::clone(self).establish(session.epoch));
        session.dialing = Some(task.abort_handle());
        let attempt = task
            .map(|joined| joined.unwrap_or(Err(TransportError::Disconnected)))
            .boxed()
            .shared();
        session.inflight = Some(attempt.clone());
        attempt
    }

    async fn establish(self: Arc<Self>, epoch: u64) -> Result<(), TransportError> {
        let dialed = match websocket_url(&self.config.server_url, &self.config.token) {
            Ok(url) => self.dialer.dial(&url).await,
            Err(err) => Err(err),
        };

        let error = {
            let mut session = self.lock();
            if session.epoch != epoch {
                return Err(TransportError::Disconnected);
            }
            session.inflight = None;
            session.dialing = None;
            match dialed {
                Ok(connection) => {
                    session.attempt = 0;
                    session.epoch += 1;
                    self.start_io(&mut session, connection);
                    self.state.send_replace(ConnectionState::Open);
                    info!(server = %self.config.server_url, "realtime connection open");
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        server = %self.config.server_url,
                        error = %err,
                        "realtime connect failed"
                    );
                    self.schedule_reconnect(&mut session);
                    err
                }
            }
        };

        self.listeners.dispatch(&ChatEvent::error(error.to_string()));
        Err(error)
    }

    fn start_io(self: &Arc<Self>, session: &mut Session, connection: Connection) {
        let Connection {
            mut sink,
            mut stream,
        } = connection;
        let epoch = session.epoch;

        let (outbound, mut frames) = mpsc::unbounded_channel::<String>();
        session.outbound = Some(outbound);
        session.writer = Some(tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if let Err(error) = sink.send(frame).await {
                    debug!(%error, "realtime send failed");
                    return;
                }
            }
            let _ = sink.close().await;
        }));

        let inner = Arc::clone(self);
        session.reader = Some(tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(text) => inner.handle_frame(&text),
                    Err(error) => {
                        debug!(%error, "realtime read ended");
                        break;
                    }
                }
            }
            inner.connection_lost(epoch);
        }));
    }

    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<ChatEvent>(text) {
            Ok(event) => self.listeners.dispatch(&event),
            Err(error) => {
                warn!(%error, "invalid server event");
                self.listeners
                    .dispatch(&ChatEvent::error(format!("invalid server event: {error}")));
            }
        }
    }

    fn connection_lost(self: &Arc<Self>, epoch: u64) {
        let mut session = self.lock();
        if session.epoch != epoch {
            return;
        }
        session.outbound = None;
        session.reader = None;
        session.writer = None;
        warn!(server = %self.config.server_url, "realtime connection lost");
        self.schedule_reconnect(&mut session);
    }

    fn schedule_reconnect(self: &Arc<Self>, session: &mut Session) {
        session.attempt = session.attempt.saturating_add(1);
        let attempt = session.attempt;
        let Some(delay) = self.policy.delay_for(attempt) else {
            self.state.send_replace(ConnectionState::Abandoned);
            warn!(
                server = %self.config.server_url,
                max_attempts = self.policy.max_attempts,
                "reconnect budget exhausted; realtime connection abandoned"
            );
            return;
        };

        self.state
            .send_replace(ConnectionState::ReconnectWait { attempt, delay });
        info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        let inner = Arc::clone(self);
        let epoch = session.epoch;
        session.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.reconnect(epoch);
        }));
    }

    /// The attempt runs on its own task; failures are logged and rescheduled
    /// by `establish`.
    fn reconnect(self: &Arc<Self>, epoch: u64) {
        let mut session = self.lock();
        if session.epoch != epoch || session.inflight.is_some() {
            return;
        }
        session.reconnect_timer = None;
        let _ = self.start_attempt(&mut session);
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
