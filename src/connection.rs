//! One relay's WebSocket lifecycle: connect, heartbeat, reconnect with backoff.
//!
//! A `Connection` owns at most one live session task. The session task reads
//! frames, writes queued outbound frames and runs the heartbeat; when it ends
//! because of a transport failure the connection drops to `Disconnected` and,
//! if enabled, arms a single reconnect timer. Every transition that starts a
//! new attempt cancels the previous timer first.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, Instant};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{
    client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::event::{Signer, UnsignedEvent};
use crate::message::{ClientMessage, RelayMessage};

const CHANNEL_CAPACITY: usize = 1024;
/// Floor for every timing knob; a zero heartbeat period would panic the session.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Tunables for a single relay connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// How long to wait for any inbound traffic after a ping.
    pub pong_timeout: Duration,
    /// Delay before the first reconnect attempt.
    pub reconnect_base: Duration,
    /// Upper bound on the reconnect delay.
    pub reconnect_cap: Duration,
    /// Automatic reconnects allowed before the connection gives up.
    pub max_reconnect_attempts: u32,
    /// Bound on TCP + WebSocket handshake time.
    pub connect_timeout: Duration,
    pub auto_reconnect: bool,
    /// Optional SOCKS5 proxy (host:port).
    pub tor_socks: Option<String>,
}

impl ConnectionConfig {
    /// Copy with every period and timeout raised to at least one millisecond.
    pub fn clamped(mut self) -> Self {
        self.heartbeat_interval = self.heartbeat_interval.max(MIN_PERIOD);
        self.pong_timeout = self.pong_timeout.max(MIN_PERIOD);
        self.reconnect_base = self.reconnect_base.max(MIN_PERIOD);
        self.reconnect_cap = self.reconnect_cap.max(self.reconnect_base);
        self.connect_timeout = self.connect_timeout.max(MIN_PERIOD);
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            connect_timeout: Duration::from_secs(10),
            auto_reconnect: true,
            tor_socks: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    /// Reconnect budget exhausted; only an explicit `reconnect()` leaves this state.
    Error,
}

impl ConnectionState {
    /// Whether frames can be sent.
    pub fn is_ready(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Authenticated)
    }
}

/// Failure notifications published on the error channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Connect failure, send failure, or stream closure.
    Transport(String),
    /// No inbound traffic within the pong timeout after a heartbeat.
    Stale,
    /// Automatic reconnects stopped after this many attempts.
    Exhausted { attempts: u32 },
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Transport(msg) => write!(f, "transport error: {msg}"),
            ConnectionError::Stale => write!(f, "heartbeat timed out"),
            ConnectionError::Exhausted { attempts } => {
                write!(f, "gave up after {attempts} reconnect attempts")
            }
        }
    }
}

/// Handle to a single relay connection. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Session {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

struct Inner {
    url: String,
    config: ConnectionConfig,
    signer: Option<Arc<dyn Signer>>,
    state: watch::Sender<ConnectionState>,
    messages: broadcast::Sender<RelayMessage>,
    errors: broadcast::Sender<ConnectionError>,
    session: Mutex<Option<Session>>,
    backoff: Mutex<Backoff>,
    reconnect_timer: Mutex<Option<JoinHandle<()>>>,
    pending_auth: Mutex<Option<String>>,
    exhaustion_reported: AtomicBool,
    disposed: AtomicBool,
    next_session_id: AtomicU64,
    /// Bumped by `disconnect`/`dispose`; an attempt started under an older
    /// generation never installs its socket.
    generation: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Connection {
    pub fn new(
        url: impl Into<String>,
        config: ConnectionConfig,
        signer: Option<Arc<dyn Signer>>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (messages, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (errors, _) = broadcast::channel(64);
        let config = config.clamped();
        let backoff = Backoff::new(
            config.reconnect_base,
            config.reconnect_cap,
            config.max_reconnect_attempts,
        );
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                config,
                signer,
                state,
                messages,
                errors,
                session: Mutex::new(None),
                backoff: Mutex::new(backoff),
                reconnect_timer: Mutex::new(None),
                pending_auth: Mutex::new(None),
                exhaustion_reported: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                next_session_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Reconnects scheduled since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.backoff).attempt()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Inbound frames in the order the transport delivered them.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<RelayMessage> {
        self.inner.messages.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<ConnectionError> {
        self.inner.errors.subscribe()
    }

    /// Open the socket. Succeeds immediately when already connected and fails
    /// when another attempt is in flight.
    pub async fn connect(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let mut outcome = None;
        let mut generation = 0;
        self.inner.state.send_if_modified(|s| match *s {
            ConnectionState::Connected | ConnectionState::Authenticated => {
                outcome = Some(Ok(()));
                false
            }
            ConnectionState::Connecting => {
                outcome = Some(Err(Error::AlreadyConnecting));
                false
            }
            ConnectionState::Disconnected | ConnectionState::Error => {
                generation = self.inner.generation.load(Ordering::SeqCst);
                *s = ConnectionState::Connecting;
                true
            }
        });
        if let Some(result) = outcome {
            return result;
        }
        self.inner.cancel_reconnect_timer();
        debug!(relay = %self.inner.url, "connecting");

        let attempt = tokio::time::timeout(
            self.inner.config.connect_timeout,
            open_socket(&self.inner.url, self.inner.config.tor_socks.as_deref()),
        )
        .await;
        let superseded = || self.inner.generation.load(Ordering::SeqCst) != generation;
        let ws = match attempt {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) if superseded() => return Err(e),
            Err(_) if superseded() => return Err(Error::NotConnected(self.inner.url.clone())),
            Ok(Err(e)) => {
                self.inner
                    .connect_failed(ConnectionError::Transport(e.to_string()));
                return Err(e);
            }
            Err(_) => {
                let msg = format!("connect to {} timed out", self.inner.url);
                self.inner
                    .connect_failed(ConnectionError::Transport(msg.clone()));
                return Err(Error::Timeout(msg));
            }
        };
        {
            let mut slot = lock(&self.inner.session);
            if self.is_disposed() {
                return Err(Error::Disposed);
            }
            if superseded() {
                debug!(relay = %self.inner.url, "disconnected during handshake, dropping socket");
                return Err(Error::NotConnected(self.inner.url.clone()));
            }
            lock(&self.inner.backoff).reset();
            self.inner.exhaustion_reported.store(false, Ordering::SeqCst);
            let id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(run_session(Arc::downgrade(&self.inner), id, ws, rx));
            *slot = Some(Session {
                id,
                outbound: tx,
                task,
            });
            self.inner.state.send_replace(ConnectionState::Connected);
        }
        info!(relay = %self.inner.url, "connected");
        Ok(())
    }

    /// Queue a frame. Returns `false` when not connected; a dead transport
    /// takes the disconnect path instead of surfacing an error.
    pub fn send(&self, msg: &ClientMessage) -> bool {
        self.send_frame(msg, false)
    }

    /// Like `send` but skips the readiness check, for frames that must go out
    /// while the state is still settling.
    pub fn send_forced(&self, msg: &ClientMessage) -> bool {
        self.send_frame(msg, true)
    }

    fn send_frame(&self, msg: &ClientMessage, force: bool) -> bool {
        if self.is_disposed() || (!force && !self.is_ready()) {
            return false;
        }
        let target = lock(&self.inner.session)
            .as_ref()
            .map(|s| (s.id, s.outbound.clone()));
        let Some((id, tx)) = target else {
            return false;
        };
        if tx.send(Message::Text(msg.as_text())).is_err() {
            Inner::session_ended(
                &self.inner,
                id,
                Some(ConnectionError::Transport("send failed".into())),
            );
            return false;
        }
        true
    }

    /// Close the socket without scheduling a reconnect.
    pub fn disconnect(&self) {
        self.inner.cancel_reconnect_timer();
        // Dropping the session's sender makes the task send a close frame and exit.
        let session = {
            let mut slot = lock(&self.inner.session);
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            self.inner.state.send_if_modified(|s| {
                if *s == ConnectionState::Disconnected {
                    false
                } else {
                    *s = ConnectionState::Disconnected;
                    true
                }
            });
            slot.take()
        };
        drop(session);
        *lock(&self.inner.pending_auth) = None;
    }

    /// Force a fresh attempt, resetting the reconnect budget.
    pub async fn reconnect(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        self.disconnect();
        lock(&self.inner.backoff).reset();
        self.inner.exhaustion_reported.store(false, Ordering::SeqCst);
        self.connect().await
    }

    /// Cancel timers, stop the session, and refuse further use. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel_reconnect_timer();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(session) = lock(&self.inner.session).take() {
            session.task.abort();
        }
        *lock(&self.inner.pending_auth) = None;
        self.inner.state.send_replace(ConnectionState::Disconnected);
        debug!(relay = %self.inner.url, "disposed");
    }
}

impl Inner {
    fn cancel_reconnect_timer(&self) {
        if let Some(timer) = lock(&self.reconnect_timer).take() {
            timer.abort();
        }
    }

    fn report(&self, err: ConnectionError) {
        let _ = self.errors.send(err);
    }

    fn connect_failed(self: &Arc<Self>, err: ConnectionError) {
        warn!(relay = %self.url, error = %err, "connect failed");
        self.state.send_replace(ConnectionState::Disconnected);
        self.report(err);
        self.schedule_reconnect();
    }

    /// Called when session `id` stops. Ignored if that session was already
    /// replaced or removed by `disconnect`/`dispose`.
    fn session_ended(self: &Arc<Self>, id: u64, reason: Option<ConnectionError>) {
        {
            let mut slot = lock(&self.session);
            if slot.as_ref().map(|s| s.id) != Some(id) {
                return;
            }
            slot.take();
        }
        *lock(&self.pending_auth) = None;
        self.state.send_replace(ConnectionState::Disconnected);
        if let Some(err) = reason {
            warn!(relay = %self.url, error = %err, "connection lost");
            self.report(err);
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.disposed.load(Ordering::SeqCst) || !self.config.auto_reconnect {
            return;
        }
        let next = {
            let mut backoff = lock(&self.backoff);
            backoff.next_delay().map(|d| (d, backoff.attempt()))
        };
        let Some((delay, attempt)) = next else {
            if !self.exhaustion_reported.swap(true, Ordering::SeqCst) {
                let attempts = self.config.max_reconnect_attempts;
                error!(relay = %self.url, attempts, "reconnect attempts exhausted");
                self.report(ConnectionError::Exhausted { attempts });
            }
            self.state.send_replace(ConnectionState::Error);
            return;
        };
        info!(relay = %self.url, attempt, ?delay, "scheduling reconnect");
        let weak = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let conn = Connection { inner };
                // Detached so cancelling this timer never interrupts the attempt.
                tokio::spawn(async move {
                    let _ = conn.connect().await;
                });
            }
        });
        if let Some(old) = lock(&self.reconnect_timer).replace(timer) {
            old.abort();
        }
    }

    /// Reply to an AUTH challenge when a signer is available.
    fn answer_auth(&self, challenge: &str) -> Option<Message> {
        let signer = self.signer.as_ref()?;
        match signer.sign(UnsignedEvent::auth(&self.url, challenge)) {
            Ok(ev) => {
                *lock(&self.pending_auth) = Some(ev.id.clone());
                debug!(relay = %self.url, "answering auth challenge");
                Some(Message::Text(ClientMessage::Auth(ev).as_text()))
            }
            Err(e) => {
                warn!(relay = %self.url, error = %e, "failed to sign auth event");
                None
            }
        }
    }

    fn auth_result(&self, event_id: &str, accepted: bool) {
        let mut pending = lock(&self.pending_auth);
        if pending.as_deref() != Some(event_id) {
            return;
        }
        pending.take();
        if accepted {
            self.state.send_if_modified(|s| {
                if *s == ConnectionState::Connected {
                    *s = ConnectionState::Authenticated;
                    true
                } else {
                    false
                }
            });
            info!(relay = %self.url, "authenticated");
        } else {
            warn!(relay = %self.url, "auth rejected");
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// Read/write loop for one socket. Ends with `None` on a local close and with
/// the failure otherwise.
async fn run_session(
    weak: Weak<Inner>,
    id: u64,
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let Some((url, heartbeat, pong_timeout, messages)) = weak.upgrade().map(|i| {
        (
            i.url.clone(),
            i.config.heartbeat_interval,
            i.config.pong_timeout,
            i.messages.clone(),
        )
    }) else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let mut ticker = interval(heartbeat);
    ticker.reset();
    let mut pong_deadline: Option<Instant> = None;

    let reason = loop {
        let deadline = pong_deadline;
        let stale = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(msg)) => {
                    pong_deadline = None;
                    match msg {
                        Message::Text(text) => {
                            let reply = handle_text(&weak, &url, &messages, &text);
                            if let Some(reply) = reply {
                                if let Err(e) = write.send(reply).await {
                                    break Some(ConnectionError::Transport(e.to_string()));
                                }
                            }
                        }
                        Message::Ping(data) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                break Some(ConnectionError::Transport(e.to_string()));
                            }
                        }
                        Message::Close(frame) => {
                            break Some(ConnectionError::Transport(format!(
                                "closed by relay: {frame:?}"
                            )));
                        }
                        _ => {}
                    }
                }
                Some(Err(e)) => break Some(ConnectionError::Transport(e.to_string())),
                None => break Some(ConnectionError::Transport("stream ended".into())),
            },
            out = outbound.recv() => match out {
                Some(msg) => {
                    if let Err(e) = write.send(msg).await {
                        break Some(ConnectionError::Transport(e.to_string()));
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break None;
                }
            },
            _ = ticker.tick() => {
                if pong_deadline.is_none() {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        break Some(ConnectionError::Transport(e.to_string()));
                    }
                    pong_deadline = Some(Instant::now() + pong_timeout);
                }
            },
            _ = stale => {
                warn!(relay = %url, "no traffic since heartbeat, dropping connection");
                break Some(ConnectionError::Stale);
            },
        }
    };

    if let Some(inner) = weak.upgrade() {
        Inner::session_ended(&inner, id, reason);
    }
}

fn handle_text(
    weak: &Weak<Inner>,
    url: &str,
    messages: &broadcast::Sender<RelayMessage>,
    text: &str,
) -> Option<Message> {
    let msg = match RelayMessage::parse(text) {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            debug!(relay = %url, "ignoring unrecognised frame");
            return None;
        }
        Err(e) => {
            debug!(relay = %url, error = %e, "ignoring malformed frame");
            return None;
        }
    };
    let reply = match &msg {
        RelayMessage::Auth { challenge } => weak.upgrade().and_then(|i| i.answer_auth(challenge)),
        RelayMessage::Ok {
            event_id, accepted, ..
        } => {
            if let Some(inner) = weak.upgrade() {
                inner.auth_result(event_id, *accepted);
            }
            None
        }
        RelayMessage::Notice { message } => {
            info!(relay = %url, notice = %message, "relay notice");
            None
        }
        _ => None,
    };
    let _ = messages.send(msg);
    reply
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn open_socket(relay: &str, tor_socks: Option<&str>) -> Result<WsStream> {
    let url = Url::parse(relay)?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidRelayUrl(relay.to_string()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::InvalidRelayUrl(relay.to_string()))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async_tls(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
