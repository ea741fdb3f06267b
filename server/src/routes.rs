//! Plugin boundary — mounts a listener into a host axum server.
//!
//! The protocol layer owns exactly one route: the WebSocket upgrade.
//! Admission (stopped / ceiling / origin) is checked before upgrading, so
//! refused connections never consume a socket slot; the checks are applied
//! again under the registry lock when the upgraded connection attaches.
//!
//! Hosts must serve the router with
//! `into_make_service_with_connect_info::<SocketAddr>()` so sockets learn
//! their peer address.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing::warn;

use crate::error::AcceptError;
use crate::listener::Listener;

/// Build the router a host mounts (or merges) to expose the listener.
pub fn router(listener: Arc<Listener>) -> Router {
    Router::new()
        .route("/ws", get(handle_upgrade))
        .route("/healthz", get(healthz))
        .with_state(listener)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn handle_upgrade(
    State(listener): State<Arc<Listener>>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    if let Err(error) = listener.admit(origin.as_deref()).await {
        warn!(%error, origin = origin.as_deref().unwrap_or(""), "ws: connection refused");
        let status = match error {
            AcceptError::Stopped | AcceptError::AtCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            AcceptError::OriginNotAllowed(_) => StatusCode::FORBIDDEN,
        };
        return (status, error.to_string()).into_response();
    }

    let ws = match listener.config().max_payload {
        // One extra byte for the chunk marker on fragmented frames.
        Some(max) => ws.max_message_size(max.saturating_add(1)),
        None => ws,
    };
    ws.on_upgrade(move |socket| listener.attach(socket, peer))
}

#[cfg(test)]
#[path = "routes_test.rs"]
mod tests;
