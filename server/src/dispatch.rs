//! Host dispatcher boundary.
//!
//! The protocol layer decodes requests and hands them to a [`Dispatcher`];
//! it never routes or implements application logic itself. Handlers receive
//! a [`ConnectionContext`] so they can read socket identity and attach
//! per-connection state, without getting a handle they could write frames
//! through.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

/// A decoded request handed to the host dispatcher. Route identifiers are
/// already resolved to an explicit method + path.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: wire::Headers,
    pub payload: Option<Value>,
}

/// What the host dispatcher returns. Status codes >= 400 reach the caller
/// as error responses, not as connection failures.
#[derive(Clone, Debug)]
pub struct Response {
    pub status_code: u16,
    pub headers: wire::Headers,
    pub payload: Value,
}

impl Response {
    /// A 200 response with no headers.
    #[must_use]
    pub fn ok(payload: Value) -> Self {
        Self { status_code: 200, headers: wire::Headers::new(), payload }
    }
}

/// Error raised by a dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Serialized back to the caller as an error response; the connection
    /// stays open.
    #[error("{message}")]
    Graceful { status_code: u16, message: String },
    /// Terminates the connection.
    #[error("dispatch failed: {0}")]
    Fatal(String),
}

impl DispatchError {
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        DispatchError::Graceful { status_code: 400, message: message.into() }
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        DispatchError::Graceful { status_code: 404, message: message.into() }
    }
}

/// Executes application logic for one decoded request.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn execute(
        &self,
        request: Request,
        ctx: &ConnectionContext,
    ) -> Result<Response, DispatchError>;
}

/// Connection lifecycle callbacks. `on_connection` fires once the handshake
/// completes; `on_disconnection` fires when the socket is deregistered.
#[async_trait]
pub trait Hooks: Send + Sync {
    async fn on_connection(&self, _ctx: &ConnectionContext) {}
    async fn on_disconnection(&self, _ctx: &ConnectionContext) {}
}

/// Default hooks that do nothing.
pub struct NoopHooks;

#[async_trait]
impl Hooks for NoopHooks {}

/// Read-only view of one socket handed to dispatchers and hooks.
///
/// The metadata bag is scoped to the connection and dropped with it; hosts
/// reach it only through these accessors.
#[derive(Clone)]
pub struct ConnectionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    socket_id: String,
    peer: SocketAddr,
    meta: Mutex<HashMap<String, Value>>,
}

impl ConnectionContext {
    pub(crate) fn new(socket_id: String, peer: SocketAddr) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                socket_id,
                peer,
                meta: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The listener-assigned socket id.
    #[must_use]
    pub fn socket_id(&self) -> &str {
        &self.inner.socket_id
    }

    /// Peer address and port of the underlying connection.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Read a metadata value attached earlier on this connection.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.meta().get(key).cloned()
    }

    /// Attach a metadata value to this connection.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.meta().insert(key.into(), value);
    }

    /// Remove a metadata value from this connection.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.meta().remove(key)
    }

    fn meta(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.inner.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_metadata_round_trips() {
        let ctx = ConnectionContext::new("1:2:00000".to_owned(), ([127, 0, 0, 1], 9000).into());

        assert!(ctx.get("user").is_none());
        ctx.insert("user", serde_json::json!({"id": 7}));
        assert_eq!(ctx.get("user"), Some(serde_json::json!({"id": 7})));
        assert_eq!(ctx.remove("user"), Some(serde_json::json!({"id": 7})));
        assert!(ctx.get("user").is_none());
    }

    #[test]
    fn context_clones_share_metadata() {
        let ctx = ConnectionContext::new("1:2:00000".to_owned(), ([127, 0, 0, 1], 9000).into());
        let view = ctx.clone();

        ctx.insert("seen", serde_json::json!(true));
        assert_eq!(view.get("seen"), Some(serde_json::json!(true)));
        assert_eq!(view.socket_id(), "1:2:00000");
    }
}
