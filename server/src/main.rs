use std::net::SocketAddr;
use std::sync::Arc;

use server::dispatch::{ConnectionContext, DispatchError, Dispatcher, Request, Response};
use server::{Config, Listener, routes};
use wire::Heartbeat;

/// Dispatcher used by the standalone daemon: echoes the decoded request
/// back to the caller. Hosts embedding the listener supply their own.
struct EchoDispatcher;

#[async_trait::async_trait]
impl Dispatcher for EchoDispatcher {
    async fn execute(
        &self,
        request: Request,
        ctx: &ConnectionContext,
    ) -> Result<Response, DispatchError> {
        Ok(Response::ok(serde_json::json!({
            "socket": ctx.socket_id(),
            "method": request.method,
            "path": request.path,
            "payload": request.payload,
        })))
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let port: u16 = env_parse("PORT", 3000);
    let config = Config {
        heartbeat: Some(Heartbeat {
            interval: env_parse("HEARTBEAT_INTERVAL_MS", 15_000),
            timeout: env_parse("HEARTBEAT_TIMEOUT_MS", 5_000),
        }),
        max_connections: std::env::var("MAX_CONNECTIONS").ok().and_then(|v| v.parse().ok()),
        max_payload: std::env::var("MAX_PAYLOAD").ok().and_then(|v| v.parse().ok()),
        max_chunk: std::env::var("MAX_CHUNK").ok().and_then(|v| v.parse().ok()),
        ..Config::default()
    };

    let listener = Listener::new(config, Arc::new(EchoDispatcher)).expect("invalid configuration");
    listener.start();

    let app = routes::router(listener);
    let tcp = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "tether listening");
    axum::serve(tcp, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .expect("server failed");
}
