//! Per-connection server-side state machine.
//!
//! DESIGN
//! ======
//! Each admitted connection runs one task: a `select!` loop over the
//! transport and a per-socket outbound queue. Outbound frames drain one at
//! a time, so sends are strictly ordered and fragments of a chunked frame
//! are never interleaved with other frames. Request dispatch is spawned so
//! a slow host handler never blocks the transport; responses fan back into
//! the same queue in completion order.
//!
//! LIFECYCLE
//! =========
//! 1. Listener admits → socket registered, state `Connecting`
//! 2. First meaningful inbound frame must be `hello` → state `Active`,
//!    `on_connection` hook, `hello` reply with socket id + heartbeat
//! 3. Inbound frames route by type; outbound frames drain through the queue
//! 4. Protocol violation / send failure / heartbeat sweep / listener stop
//!    → `Terminated`

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatch::{ConnectionContext, DispatchError, Dispatcher, Hooks, Request};
use crate::error::ProtocolError;

/// Client pings are answered at most once per this window.
const PING_RATE_WINDOW: Duration = Duration::from_millis(1000);

/// Server-initiated ping ids live above this base so they can never collide
/// with client-assigned ids.
const HEARTBEAT_ID_BASE: u64 = 1 << 32;

// =============================================================================
// SOCKET
// =============================================================================

/// Connection lifecycle states. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Active,
    Disconnecting,
    Terminated,
}

impl SocketState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => SocketState::Connecting,
            1 => SocketState::Active,
            2 => SocketState::Disconnecting,
            _ => SocketState::Terminated,
        }
    }
}

pub(crate) enum Outbound {
    Message(wire::Message),
    /// Send a close frame and end the connection task.
    Terminate(&'static str),
}

/// Handle to one live connection, registered with its listener.
///
/// The connection task owns the transport; everything else reaches the
/// socket through this handle and its outbound queue.
pub struct Socket {
    id: String,
    context: ConnectionContext,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: AtomicU8,
    hello_done: AtomicBool,
    /// Peer answered a ping, or we delivered non-ping traffic, since the
    /// last heartbeat sweep.
    active: AtomicBool,
    /// A frame is being written right now.
    sending: AtomicBool,
    /// Requests currently executing in the host dispatcher.
    in_flight: AtomicUsize,
    /// Exempts the socket from the first heartbeat sweep after registration.
    fresh: AtomicBool,
    heartbeat_id: AtomicU64,
}

impl Socket {
    pub(crate) fn new(id: String, peer: SocketAddr, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        let context = ConnectionContext::new(id.clone(), peer);
        Self {
            id,
            context,
            outbound,
            state: AtomicU8::new(0),
            hello_done: AtomicBool::new(false),
            active: AtomicBool::new(false),
            sending: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            fresh: AtomicBool::new(true),
            heartbeat_id: AtomicU64::new(HEARTBEAT_ID_BASE),
        }
    }

    /// The listener-assigned socket id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The read-only view handed to dispatchers and hooks.
    #[must_use]
    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    #[must_use]
    pub fn state(&self) -> SocketState {
        SocketState::from_raw(self.state.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn handshake_complete(&self) -> bool {
        self.hello_done.load(Ordering::SeqCst)
    }

    /// Enqueue a message on the ordered send queue.
    pub(crate) fn send(&self, message: wire::Message) {
        let _ = self.outbound.send(Outbound::Message(message));
    }

    /// Close the connection after already-queued frames drain. Idempotent.
    pub(crate) fn terminate(&self, reason: &'static str) {
        if self.state.fetch_max(2, Ordering::SeqCst) >= 2 {
            return;
        }
        let _ = self.outbound.send(Outbound::Terminate(reason));
    }

    fn complete_handshake(&self) {
        self.hello_done.store(true, Ordering::SeqCst);
        self.state.fetch_max(1, Ordering::SeqCst);
    }

    pub(crate) fn set_terminated(&self) {
        self.state.fetch_max(3, Ordering::SeqCst);
    }

    /// A socket counts as active while it was pinged recently, is mid-send,
    /// or has requests executing in the host dispatcher.
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
            || self.sending.load(Ordering::SeqCst)
            || self.in_flight.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn mark_active(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub(crate) fn reset_activity(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// True exactly once, for the first heartbeat sweep that sees this socket.
    pub(crate) fn take_fresh(&self) -> bool {
        self.fresh.swap(false, Ordering::SeqCst)
    }

    fn begin_send(&self) {
        self.sending.store(true, Ordering::SeqCst);
    }

    fn end_send(&self) {
        self.sending.store(false, Ordering::SeqCst);
    }

    fn begin_request(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn end_request(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn next_heartbeat_ping(&self) -> wire::Message {
        let id = self.heartbeat_id.fetch_add(1, Ordering::SeqCst) + 1;
        wire::Message::Ping { id }
    }

    fn is_heartbeat_reply(&self, id: u64) -> bool {
        id > HEARTBEAT_ID_BASE && id <= self.heartbeat_id.load(Ordering::SeqCst)
    }
}

// =============================================================================
// PING GATE
// =============================================================================

/// Gate on client-initiated pings: at most one inside the rate window.
/// A rejected ping does not extend the window.
#[derive(Debug, Default)]
struct PingGate {
    last: Option<Instant>,
}

impl PingGate {
    fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        if self.last.is_some_and(|last| now.duration_since(last) < PING_RATE_WINDOW) {
            return false;
        }
        self.last = Some(now);
        true
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

pub(crate) async fn run(
    mut ws: WebSocket,
    socket: Arc<Socket>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    config: Arc<Config>,
    dispatcher: Arc<dyn Dispatcher>,
    hooks: Arc<dyn Hooks>,
) {
    let mut reassembler = wire::Reassembler::new(config.max_payload);
    let mut ping_gate = PingGate::default();

    loop {
        tokio::select! {
            inbound = ws.recv() => {
                let Some(Ok(frame)) = inbound else { break };
                match frame {
                    WsMessage::Binary(bytes) => {
                        if matches!(socket.state(), SocketState::Disconnecting | SocketState::Terminated) {
                            continue;
                        }
                        let handled = handle_frame(
                            &bytes,
                            &mut reassembler,
                            &mut ping_gate,
                            &socket,
                            &config,
                            &dispatcher,
                            &hooks,
                        )
                        .await;
                        if let Err(violation) = handled {
                            warn!(socket = %socket.id(), error = %violation, "socket: protocol violation");
                            let _ = ws.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                    WsMessage::Text(_) => {
                        let violation = ProtocolError::NonBinaryFrame;
                        warn!(socket = %socket.id(), error = %violation, "socket: protocol violation");
                        let _ = ws.send(WsMessage::Close(None)).await;
                        break;
                    }
                    WsMessage::Close(_) => break,
                    WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(outbound) = outbound else { break };
                match outbound {
                    Outbound::Message(message) => {
                        if let Err(error) = write_message(&mut ws, &socket, &config, &message).await {
                            warn!(socket = %socket.id(), %error, "socket: send failed");
                            break;
                        }
                    }
                    Outbound::Terminate(reason) => {
                        info!(socket = %socket.id(), reason, "socket: terminating");
                        let _ = ws.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    socket.set_terminated();
}

// =============================================================================
// INBOUND
// =============================================================================

/// Route one transport frame. `Err` means an unrecoverable violation: the
/// caller closes the transport without further ceremony.
async fn handle_frame(
    bytes: &[u8],
    reassembler: &mut wire::Reassembler,
    ping_gate: &mut PingGate,
    socket: &Arc<Socket>,
    config: &Arc<Config>,
    dispatcher: &Arc<dyn Dispatcher>,
    hooks: &Arc<dyn Hooks>,
) -> Result<(), ProtocolError> {
    let Some(frame) = reassembler.push(bytes)? else {
        return Ok(());
    };
    let message = match wire::decode(&frame) {
        Ok(message) => message,
        Err(wire::CodecError::UnknownType { id, kind }) => {
            socket.send(wire::Message::error(id, 400, format!("unknown message type {kind:?}")));
            socket.terminate("unknown message type");
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    };

    debug!(socket = %socket.id(), kind = message.kind(), "socket: recv");

    match message {
        wire::Message::Ping { id } => {
            handle_ping(id, ping_gate, socket);
            Ok(())
        }
        wire::Message::Hello { id, version, .. } => {
            handle_hello(id, version, socket, config, hooks).await;
            Ok(())
        }
        wire::Message::Request { .. } if !socket.handshake_complete() => {
            Err(ProtocolError::Handshake("request before hello"))
        }
        wire::Message::Request { id, method, path, route, headers, payload } => {
            handle_request(id, method, path, route, headers, payload, socket, config, dispatcher);
            Ok(())
        }
        wire::Message::Response { id, .. } => {
            // Endpoints only answer requests they issued; the server issues none.
            socket.send(wire::Message::error(id, 400, "unexpected response message"));
            socket.terminate("unexpected response");
            Ok(())
        }
    }
}

fn handle_ping(id: u64, ping_gate: &mut PingGate, socket: &Socket) {
    socket.mark_active();
    if socket.is_heartbeat_reply(id) {
        return;
    }
    if ping_gate.allow() {
        socket.send(wire::Message::Ping { id });
    } else {
        // Reported, not fatal: the connection stays open unless this send fails.
        socket.send(wire::Message::error(Some(id), 429, "exceeded maximum ping rate"));
    }
}

async fn handle_hello(
    id: u64,
    version: Option<String>,
    socket: &Arc<Socket>,
    config: &Config,
    hooks: &Arc<dyn Hooks>,
) {
    if socket.handshake_complete() {
        socket.send(wire::Message::error(Some(id), 400, "connection already initialized"));
        socket.terminate("repeated hello");
        return;
    }
    let version = version.unwrap_or_default();
    if version != wire::PROTOCOL_VERSION {
        socket.send(wire::Message::error(
            Some(id),
            400,
            format!("unsupported protocol version {version:?}"),
        ));
        socket.terminate("protocol version mismatch");
        return;
    }

    socket.complete_handshake();
    hooks.on_connection(socket.context()).await;
    socket.send(wire::Message::Hello {
        id,
        version: None,
        socket: Some(socket.id().to_owned()),
        heartbeat: config.heartbeat,
    });
    info!(socket = %socket.id(), "socket: handshake complete");
}

#[allow(clippy::too_many_arguments)]
fn handle_request(
    id: u64,
    method: Option<String>,
    path: Option<String>,
    route: Option<String>,
    headers: wire::Headers,
    payload: Option<Value>,
    socket: &Arc<Socket>,
    config: &Arc<Config>,
    dispatcher: &Arc<dyn Dispatcher>,
) {
    if headers.keys().any(|name| name.eq_ignore_ascii_case("authorization")) {
        socket.send(wire::Message::error(
            Some(id),
            400,
            "requests may not carry an authorization header",
        ));
        socket.terminate("disallowed authorization header");
        return;
    }

    let resolved = match (method, path, route) {
        (Some(method), Some(path), _) if !method.is_empty() && !path.is_empty() => Ok((method, path)),
        (_, _, Some(route_id)) => match config.routes.get(&route_id) {
            Some(route) => Ok((route.method.clone(), route.path.clone())),
            None => Err(format!("unknown route identifier {route_id:?}")),
        },
        _ => Err("request requires a method and path".to_owned()),
    };
    let (method, path) = match resolved {
        Ok(target) => target,
        Err(message) => {
            socket.send(wire::Message::error(Some(id), 400, message));
            return;
        }
    };

    socket.begin_request();
    let socket = Arc::clone(socket);
    let config = Arc::clone(config);
    let dispatcher = Arc::clone(dispatcher);
    tokio::spawn(async move {
        let request = Request { method, path, headers, payload };
        match dispatcher.execute(request, socket.context()).await {
            Ok(response) => {
                let headers = config.headers.apply(response.headers);
                socket.send(wire::Message::response(id, response.status_code, headers, response.payload));
            }
            Err(DispatchError::Graceful { status_code, message }) => {
                socket.send(wire::Message::error(Some(id), status_code, message));
            }
            Err(error @ DispatchError::Fatal(_)) => {
                warn!(socket = %socket.id(), %error, "socket: dispatch failed");
                socket.terminate("dispatch failed");
            }
        }
        socket.end_request();
    });
}

// =============================================================================
// OUTBOUND
// =============================================================================

async fn write_message(
    ws: &mut WebSocket,
    socket: &Socket,
    config: &Config,
    message: &wire::Message,
) -> Result<(), axum::Error> {
    socket.begin_send();
    debug!(socket = %socket.id(), kind = message.kind(), "socket: send");

    // Fragments of one frame go out back-to-back, before any other queued frame.
    let mut result = Ok(());
    for fragment in wire::split_frame(wire::encode(message), config.max_chunk) {
        result = ws.send(WsMessage::Binary(fragment.into())).await;
        if result.is_err() {
            break;
        }
    }
    socket.end_send();

    if result.is_ok() && !matches!(message, wire::Message::Ping { .. }) {
        socket.mark_active();
    }
    result
}

#[cfg(test)]
#[path = "socket_test.rs"]
mod tests;
