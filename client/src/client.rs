//! Client — the caller side of one long-lived connection.
//!
//! DESIGN
//! ======
//! `Client` is a cheap handle over shared state; one spawned run loop owns
//! the transport. The loop connects, performs the `hello` handshake, then
//! services a `select!` over inbound frames, an outbound writer queue, the
//! heartbeat-silence deadline, and the shutdown signal. Requests register a
//! completion handle keyed by id and are resolved by the matching
//! response, rejected by an error response, or rejected in bulk when the
//! connection tears down.
//!
//! RECONNECTION
//! ============
//! On unexpected loss (or a failed attempt) the loop waits
//! `min(delay, max_delay)` — doubling per failure — and tries again while
//! the retry budget lasts. Every failed attempt is reported on the event
//! stream; exhausting the budget rejects the in-flight connect call and
//! every pending request. `disconnect()` cancels all of it and is
//! idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as TMessage;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tracing::{debug, info, warn};
use wire::{Heartbeat, Message, Reassembler};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = HashMap<u64, oneshot::Sender<Result<Response, ClientError>>>;

/// Server heartbeats are answered at most once per this window, so
/// reconnect races cannot trip the server's ping gate.
const PING_REPLY_WINDOW: Duration = Duration::from_millis(1000);

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Bounded-retry, backoff-delayed reattachment after unexpected disconnect.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Delay before the first reconnect attempt; doubles per failure.
    pub delay: Duration,
    /// Ceiling on the backoff delay.
    pub max_delay: Duration,
    /// Attempts after the initial one; `None` retries without bound.
    pub retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            retries: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// WebSocket url of the listener, e.g. `ws://host:port/ws`.
    pub url: String,
    /// Deadline for the handshake and for each request.
    pub timeout: Duration,
    /// Ceiling in bytes on one inbound logical frame.
    pub max_payload: Option<usize>,
    /// Fragment size in bytes for outbound chunking; `None` disables it.
    pub max_chunk: Option<usize>,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(10),
            max_payload: None,
            max_chunk: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// =============================================================================
// PUBLIC TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("websocket connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("request timed out")]
    RequestTimeout,
    #[error("server error {status_code}: {message}")]
    Server { status_code: u16, message: String },
    #[error("server disconnected")]
    Disconnected,
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Client connection states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Disconnected,
}

/// Why the client left the connected state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Manual,
    /// The connection was lost or an attempt failed; a retry is scheduled.
    Reconnecting,
    /// The retry budget is exhausted (or reconnection is disabled).
    Final,
}

/// Lifecycle notifications delivered on the event stream.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Connected { socket: String },
    Disconnected { reason: DisconnectReason },
    /// A connect attempt failed; carries the attempt's error text.
    ConnectFailed { message: String },
    HeartbeatTimeout,
}

/// A call to issue against the server's dispatcher.
#[derive(Clone, Debug, Default)]
pub struct Request {
    pub method: String,
    pub path: String,
    /// Server-registered route identifier, used instead of method + path.
    pub route: Option<String>,
    pub headers: wire::Headers,
    pub payload: Option<Value>,
}

impl Request {
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self { method: "GET".to_owned(), path: path.into(), ..Self::default() }
    }

    #[must_use]
    pub fn post(path: impl Into<String>, payload: Value) -> Self {
        Self {
            method: "POST".to_owned(),
            path: path.into(),
            payload: Some(payload),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn route(id: impl Into<String>) -> Self {
        Self { route: Some(id.into()), ..Self::default() }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A resolved request.
#[derive(Clone, Debug)]
pub struct Response {
    pub status_code: u16,
    pub headers: wire::Headers,
    pub payload: Value,
}

// =============================================================================
// CLIENT
// =============================================================================

struct Shared {
    config: ClientConfig,
    state: Mutex<ClientState>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    /// Writer into the live connection, present while one exists. Each
    /// entry is the fragment list of one logical frame, so fragments stay
    /// back-to-back.
    writer: Mutex<Option<mpsc::UnboundedSender<Vec<Vec<u8>>>>>,
    events: mpsc::UnboundedSender<ClientEvent>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_writer(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Vec<Vec<u8>>>>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Enqueue one logical frame on the live connection's writer.
    fn send_message(&self, message: &Message) -> bool {
        let fragments = wire::split_frame(wire::encode(message), self.config.max_chunk);
        self.lock_writer()
            .as_ref()
            .is_some_and(|writer| writer.send(fragments).is_ok())
    }

    /// Reject every pending request with a disconnect error.
    fn reject_pending(&self) {
        let waiters: Vec<_> = self.lock_pending().drain().map(|(_, waiter)| waiter).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(ClientError::Disconnected));
        }
    }
}

/// Handle to one protocol client. Cloneless by design: the run loop owns
/// the transport, callers share this handle behind their own `Arc` if
/// needed.
pub struct Client {
    shared: Arc<Shared>,
    run: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Build a client and the stream of its lifecycle events.
    #[must_use]
    pub fn new(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(ClientState::Idle),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            writer: Mutex::new(None),
            events,
            shutdown,
        });
        (Self { shared, run: Mutex::new(None) }, events_rx)
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// Open the connection and complete the handshake. Resolves on the
    /// first successful handshake; with reconnection enabled, failed
    /// attempts retry under the policy before this rejects.
    ///
    /// # Errors
    ///
    /// Returns the final attempt's [`ClientError`] once the retry budget is
    /// exhausted, or [`ClientError::Disconnected`] when `disconnect()`
    /// cancels the attempt.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let waiter = {
            let mut run = self.lock_run();
            if run.is_some() {
                None
            } else {
                self.shared.shutdown.send_replace(false);
                let (waiter_tx, waiter_rx) = oneshot::channel();
                *run = Some(tokio::spawn(run_loop(Arc::clone(&self.shared), waiter_tx)));
                Some(waiter_rx)
            }
        };
        let Some(waiter) = waiter else {
            return match self.state() {
                ClientState::Active => Ok(()),
                _ => Err(ClientError::NotConnected),
            };
        };
        match waiter.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Disconnected),
        }
    }

    /// Issue one request and await its response.
    ///
    /// # Errors
    ///
    /// [`ClientError::NotConnected`] without an active connection,
    /// [`ClientError::RequestTimeout`] past the configured deadline,
    /// [`ClientError::Server`] for error responses, and
    /// [`ClientError::Disconnected`] when the connection tears down first.
    /// The completion handle leaves the pending table in every case.
    pub async fn request(&self, request: Request) -> Result<Response, ClientError> {
        if self.state() != ClientState::Active {
            return Err(ClientError::NotConnected);
        }

        let id = self.shared.next_id();
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.shared.lock_pending().insert(id, waiter_tx);

        let message = Message::Request {
            id,
            method: some_nonempty(request.method),
            path: some_nonempty(request.path),
            route: request.route,
            headers: request.headers,
            payload: request.payload,
        };
        if !self.shared.send_message(&message) {
            self.shared.lock_pending().remove(&id);
            return Err(ClientError::NotConnected);
        }

        match tokio::time::timeout(self.shared.config.timeout, waiter_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.shared.lock_pending().remove(&id);
                Err(ClientError::RequestTimeout)
            }
        }
    }

    /// Tear the connection down, cancel any scheduled reconnection, and
    /// reject pending work. Repeated calls are no-ops.
    pub async fn disconnect(&self) {
        let run = self.lock_run().take();
        self.shared.shutdown.send_replace(true);
        match run {
            Some(run) => {
                let _ = run.await;
            }
            None => self.shared.set_state(ClientState::Disconnected),
        }
    }

    fn lock_run(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn some_nonempty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

// =============================================================================
// RUN LOOP
// =============================================================================

enum LossCause {
    Manual,
    Remote,
    HeartbeatTimeout,
}

async fn run_loop(shared: Arc<Shared>, connect_waiter: oneshot::Sender<Result<(), ClientError>>) {
    let mut connect_waiter = Some(connect_waiter);
    let policy = shared.config.reconnect;
    let mut remaining = policy.retries;
    let mut delay = policy.delay;
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        if *shutdown.borrow_and_update() {
            finish(&shared, &mut connect_waiter, DisconnectReason::Manual);
            break;
        }

        shared.set_state(ClientState::Connecting);
        let attempted = tokio::select! {
            result = attempt(&shared) => result,
            _ = shutdown.changed() => {
                finish(&shared, &mut connect_waiter, DisconnectReason::Manual);
                break;
            }
        };

        match attempted {
            Ok((ws, socket_id, heartbeat)) => {
                remaining = policy.retries;
                delay = policy.delay;
                shared.set_state(ClientState::Active);
                info!(socket = %socket_id, "client: connected");
                if let Some(waiter) = connect_waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
                shared.emit(ClientEvent::Connected { socket: socket_id });

                let cause = run_connection(&shared, ws, heartbeat, &mut shutdown).await;
                // A torn-down connection rejects every pending request.
                shared.reject_pending();

                match cause {
                    LossCause::Manual => {
                        finish(&shared, &mut connect_waiter, DisconnectReason::Manual);
                        break;
                    }
                    LossCause::Remote | LossCause::HeartbeatTimeout => {
                        if !policy.enabled {
                            finish(&shared, &mut connect_waiter, DisconnectReason::Final);
                            break;
                        }
                        warn!("client: connection lost, reconnecting");
                        shared.emit(ClientEvent::Disconnected { reason: DisconnectReason::Reconnecting });
                    }
                }
            }
            Err(error) => {
                warn!(%error, "client: connect attempt failed");
                shared.emit(ClientEvent::ConnectFailed { message: error.to_string() });
                if !policy.enabled || remaining == Some(0) {
                    // Resolve the connect call last, so callers observing the
                    // rejection see final state and a complete event stream.
                    let waiter = connect_waiter.take();
                    finish(&shared, &mut connect_waiter, DisconnectReason::Final);
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Err(error));
                    }
                    break;
                }
                if let Some(left) = remaining.as_mut() {
                    *left -= 1;
                }
                shared.emit(ClientEvent::Disconnected { reason: DisconnectReason::Reconnecting });
            }
        }

        shared.set_state(ClientState::Reconnecting);
        let wait = delay.min(policy.max_delay);
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {}
        }
        delay = delay.saturating_mul(2).min(policy.max_delay);
    }
}

fn finish(
    shared: &Shared,
    connect_waiter: &mut Option<oneshot::Sender<Result<(), ClientError>>>,
    reason: DisconnectReason,
) {
    shared.set_state(ClientState::Disconnected);
    if let Some(waiter) = connect_waiter.take() {
        let _ = waiter.send(Err(ClientError::Disconnected));
    }
    shared.reject_pending();
    shared.emit(ClientEvent::Disconnected { reason });
}

/// Open the transport and complete the `hello` handshake.
async fn attempt(shared: &Arc<Shared>) -> Result<(WsStream, String, Option<Heartbeat>), ClientError> {
    let mut ws_config = WebSocketConfig::default();
    if let Some(max) = shared.config.max_payload {
        // One extra byte for the chunk marker on fragmented frames.
        ws_config = ws_config.max_message_size(Some(max.saturating_add(1)));
    }

    let (mut ws, _) = tokio::time::timeout(
        shared.config.timeout,
        connect_async_with_config(shared.config.url.as_str(), Some(ws_config), false),
    )
    .await
    .map_err(|_| ClientError::ConnectionTimeout)?
    .map_err(|error| ClientError::Connect(Box::new(error)))?;

    let hello_id = shared.next_id();
    let handshake = async {
        let hello = Message::Hello {
            id: hello_id,
            version: Some(wire::PROTOCOL_VERSION.to_owned()),
            socket: None,
            heartbeat: None,
        };
        ws.send(TMessage::Binary(wire::encode(&hello).into()))
            .await
            .map_err(|error| ClientError::Connect(Box::new(error)))?;

        let mut reassembler = Reassembler::new(shared.config.max_payload);
        loop {
            let Some(frame) = ws.next().await else {
                return Err(ClientError::Disconnected);
            };
            let frame = frame.map_err(|error| ClientError::Connect(Box::new(error)))?;
            let TMessage::Binary(bytes) = frame else { continue };
            let complete = match reassembler.push(&bytes) {
                Ok(Some(complete)) => complete,
                Ok(None) => continue,
                Err(error) => return Err(ClientError::Protocol(error.to_string())),
            };
            match wire::decode(&complete) {
                Ok(Message::Hello { id, socket: Some(socket), heartbeat, .. }) if id == hello_id => {
                    return Ok((socket, heartbeat));
                }
                Ok(Message::Response { status_code, payload, .. }) => {
                    return Err(ClientError::Server {
                        status_code,
                        message: payload
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("handshake rejected")
                            .to_owned(),
                    });
                }
                Ok(_) => {}
                Err(error) => return Err(ClientError::Protocol(error.to_string())),
            }
        }
    };

    let (socket, heartbeat) = tokio::time::timeout(shared.config.timeout, handshake)
        .await
        .map_err(|_| ClientError::ConnectionTimeout)??;
    Ok((ws, socket, heartbeat))
}

/// Service one established connection until it is lost, times out on
/// heartbeat silence, or is shut down.
async fn run_connection(
    shared: &Arc<Shared>,
    mut ws: WsStream,
    heartbeat: Option<Heartbeat>,
    shutdown: &mut watch::Receiver<bool>,
) -> LossCause {
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<Vec<u8>>>();
    *shared.lock_writer() = Some(writer_tx);

    let mut reassembler = Reassembler::new(shared.config.max_payload);
    let mut last_ping_reply: Option<Instant> = None;
    // Inbound silence longer than interval + timeout means the peer is dead.
    let window = heartbeat.map(|hb| Duration::from_millis(hb.interval.saturating_add(hb.timeout)));
    let mut deadline = window.map(|window| tokio::time::Instant::now() + window);

    let cause = loop {
        tokio::select! {
            inbound = ws.next() => {
                let Some(Ok(frame)) = inbound else { break LossCause::Remote };
                if let Some(window) = window {
                    deadline = Some(tokio::time::Instant::now() + window);
                }
                match frame {
                    TMessage::Binary(bytes) => {
                        handle_inbound(shared, &mut reassembler, &mut last_ping_reply, &bytes);
                    }
                    TMessage::Close(_) => break LossCause::Remote,
                    _ => {}
                }
            }
            outbound = writer_rx.recv() => {
                let Some(fragments) = outbound else { break LossCause::Remote };
                let mut send_failed = false;
                for fragment in fragments {
                    if let Err(error) = ws.send(TMessage::Binary(fragment.into())).await {
                        warn!(%error, "client: send failed");
                        send_failed = true;
                        break;
                    }
                }
                if send_failed {
                    break LossCause::Remote;
                }
            }
            () = sleep_until_deadline(deadline), if deadline.is_some() => {
                warn!("client: heartbeat timeout");
                shared.emit(ClientEvent::HeartbeatTimeout);
                let _ = ws.send(TMessage::Close(None)).await;
                break LossCause::HeartbeatTimeout;
            }
            _ = shutdown.changed() => {
                let _ = ws.send(TMessage::Close(None)).await;
                break LossCause::Manual;
            }
        }
    };

    shared.lock_writer().take();
    cause
}

fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) -> tokio::time::Sleep {
    tokio::time::sleep_until(deadline.unwrap_or_else(tokio::time::Instant::now))
}

/// Route one inbound transport frame. Malformed inbound traffic is logged
/// and dropped; the server owns fatal enforcement.
fn handle_inbound(
    shared: &Arc<Shared>,
    reassembler: &mut Reassembler,
    last_ping_reply: &mut Option<Instant>,
    bytes: &[u8],
) {
    let complete = match reassembler.push(bytes) {
        Ok(Some(complete)) => complete,
        Ok(None) => return,
        Err(error) => {
            warn!(%error, "client: dropping undecodable fragment");
            reassembler.reset();
            return;
        }
    };
    let message = match wire::decode(&complete) {
        Ok(message) => message,
        Err(error) => {
            warn!(%error, "client: dropping malformed frame");
            return;
        }
    };

    match message {
        Message::Ping { id } => {
            let now = Instant::now();
            let allowed = last_ping_reply
                .is_none_or(|last| now.duration_since(last) >= PING_REPLY_WINDOW);
            if allowed {
                *last_ping_reply = Some(now);
                shared.send_message(&Message::Ping { id });
            }
        }
        Message::Response { id: Some(id), status_code, headers, payload } => {
            let Some(waiter) = shared.lock_pending().remove(&id) else {
                debug!(id, "client: response for unknown request");
                return;
            };
            let result = if status_code >= 400 {
                Err(ClientError::Server {
                    status_code,
                    message: payload
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("request failed")
                        .to_owned(),
                })
            } else {
                Ok(Response { status_code, headers, payload })
            };
            let _ = waiter.send(result);
        }
        Message::Response { id: None, status_code, payload, .. } => {
            warn!(status_code, %payload, "client: unaddressed server error");
        }
        Message::Hello { .. } => {
            debug!("client: stray hello after handshake");
        }
        Message::Request { .. } => {
            warn!("client: server-initiated requests are not supported");
        }
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod tests;
