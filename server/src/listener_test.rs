use super::*;
use crate::config::{Config, ConfigError};
use crate::dispatch::{ConnectionContext, DispatchError, Dispatcher, Request, Response};
use wire::Heartbeat;

struct NullDispatcher;

#[async_trait::async_trait]
impl Dispatcher for NullDispatcher {
    async fn execute(
        &self,
        _request: Request,
        _ctx: &ConnectionContext,
    ) -> Result<Response, DispatchError> {
        Ok(Response::ok(serde_json::json!({})))
    }
}

fn listener(config: Config) -> Arc<Listener> {
    Listener::new(config, Arc::new(NullDispatcher)).expect("config is valid")
}

#[test]
fn id_generator_counts_within_one_millisecond() {
    let mut ids = SocketIdGenerator::default();
    let pid = std::process::id();

    assert_eq!(ids.next(5), format!("5:{pid}:00000"));
    assert_eq!(ids.next(5), format!("5:{pid}:00001"));
    assert_eq!(ids.next(5), format!("5:{pid}:00002"));
}

#[test]
fn id_generator_resets_counter_each_millisecond() {
    let mut ids = SocketIdGenerator::default();
    let pid = std::process::id();

    ids.next(5);
    ids.next(5);
    assert_eq!(ids.next(6), format!("6:{pid}:00000"));
}

#[test]
fn id_generator_rolls_over_within_one_millisecond() {
    let mut ids = SocketIdGenerator { last_ms: 9, counter: ID_COUNTER_LIMIT - 2 };
    let pid = std::process::id();

    assert_eq!(ids.next(9), format!("9:{pid}:99999"));
    assert_eq!(ids.next(9), format!("9:{pid}:00000"));
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let config = Config { max_connections: Some(0), ..Config::default() };
    let result = Listener::new(config, Arc::new(NullDispatcher));
    assert!(matches!(result, Err(ConfigError::ZeroMaxConnections)));
}

#[tokio::test]
async fn admit_rejects_when_stopped() {
    let listener = listener(Config { heartbeat: None, ..Config::default() });

    listener.stop().await;
    assert!(matches!(listener.admit(None).await, Err(AcceptError::Stopped)));

    listener.start();
    listener.admit(None).await.expect("restarted listener admits again");
}

#[tokio::test]
async fn admit_enforces_connection_ceiling() {
    let listener = listener(Config {
        heartbeat: None,
        max_connections: Some(2),
        ..Config::default()
    });

    listener.register_for_test().await;
    listener.admit(None).await.expect("one slot left");

    listener.register_for_test().await;
    assert!(matches!(listener.admit(None).await, Err(AcceptError::AtCapacity(2))));
}

#[tokio::test]
async fn admit_checks_origin_against_allow_list() {
    let listener = listener(Config {
        heartbeat: None,
        origins: Some(vec!["https://app.example".to_owned()]),
        ..Config::default()
    });

    listener.admit(Some("https://app.example")).await.expect("allowed origin");
    listener.admit(None).await.expect("missing origin is always acceptable");
    listener.admit(Some("")).await.expect("empty origin is always acceptable");

    let err = listener.admit(Some("https://evil.example")).await.expect_err("denied");
    assert!(matches!(err, AcceptError::OriginNotAllowed(origin) if origin == "https://evil.example"));
}

#[tokio::test]
async fn admit_accepts_any_origin_without_allow_list() {
    let listener = listener(Config { heartbeat: None, ..Config::default() });
    listener.admit(Some("https://anywhere.example")).await.expect("no allow-list configured");
}

#[tokio::test]
async fn sweep_grace_period_spares_fresh_sockets() {
    let listener = listener(Config {
        heartbeat: Some(Heartbeat { interval: 50, timeout: 20 }),
        ..Config::default()
    });
    let socket = listener.register_for_test().await;

    // First sweep: the socket is fresh, so it is pinged but never watched.
    listener.sweep(Duration::from_millis(20)).await;
    assert_eq!(socket.state(), crate::socket::SocketState::Connecting);

    // Second sweep: no activity since the last ping terminates it.
    listener.sweep(Duration::from_millis(20)).await;
    assert_eq!(socket.state(), crate::socket::SocketState::Disconnecting);
}

#[tokio::test]
async fn sweep_spares_sockets_that_show_activity_inside_the_window() {
    let listener = listener(Config {
        heartbeat: Some(Heartbeat { interval: 50, timeout: 40 }),
        ..Config::default()
    });
    let socket = listener.register_for_test().await;
    listener.sweep(Duration::from_millis(40)).await;

    // The sweep resets the activity flag before its timeout window, so the
    // reply has to land inside the window.
    tokio::join!(listener.sweep(Duration::from_millis(40)), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        socket.mark_active();
    });

    assert_eq!(socket.state(), crate::socket::SocketState::Connecting, "active socket survives");
}
