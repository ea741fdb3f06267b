use super::*;
use std::time::Duration;

fn test_socket() -> (Arc<Socket>, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let socket = Arc::new(Socket::new(
        "1712000000000:42:00001".to_owned(),
        ([127, 0, 0, 1], 9000).into(),
        tx,
    ));
    (socket, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

#[test]
fn ping_gate_allows_one_per_window() {
    let mut gate = PingGate::default();
    let start = Instant::now();

    assert!(gate.allow_at(start));
    assert!(!gate.allow_at(start + Duration::from_millis(500)));
    assert!(gate.allow_at(start + Duration::from_millis(1100)));
}

#[test]
fn ping_gate_rejection_does_not_extend_window() {
    let mut gate = PingGate::default();
    let start = Instant::now();

    assert!(gate.allow_at(start));
    assert!(!gate.allow_at(start + Duration::from_millis(900)));
    // The window is measured from the last allowed ping, not the rejected one.
    assert!(gate.allow_at(start + Duration::from_millis(1050)));
}

#[test]
fn new_socket_starts_connecting_and_fresh() {
    let (socket, _rx) = test_socket();

    assert_eq!(socket.state(), SocketState::Connecting);
    assert!(!socket.handshake_complete());
    assert!(socket.take_fresh());
    assert!(!socket.take_fresh(), "fresh is consumed by the first sweep");
}

#[test]
fn complete_handshake_activates_socket() {
    let (socket, _rx) = test_socket();

    socket.complete_handshake();

    assert_eq!(socket.state(), SocketState::Active);
    assert!(socket.handshake_complete());
}

#[test]
fn terminate_enqueues_close_exactly_once() {
    let (socket, mut rx) = test_socket();

    socket.terminate("first");
    socket.terminate("second");

    let queued = drain(&mut rx);
    assert_eq!(queued.len(), 1);
    assert!(matches!(queued[0], Outbound::Terminate("first")));
    assert_eq!(socket.state(), SocketState::Disconnecting);
}

#[test]
fn state_never_regresses() {
    let (socket, _rx) = test_socket();

    socket.set_terminated();
    socket.complete_handshake();

    assert_eq!(socket.state(), SocketState::Terminated);
}

#[test]
fn activity_tracks_pings_sends_and_in_flight_requests() {
    let (socket, _rx) = test_socket();
    assert!(!socket.is_active());

    socket.mark_active();
    assert!(socket.is_active());
    socket.reset_activity();
    assert!(!socket.is_active());

    socket.begin_send();
    assert!(socket.is_active(), "mid-send sockets are active");
    socket.end_send();
    assert!(!socket.is_active());

    socket.begin_request();
    assert!(socket.is_active(), "sockets with in-flight requests are active");
    socket.end_request();
    assert!(!socket.is_active());
}

#[test]
fn heartbeat_replies_are_distinguished_from_client_pings() {
    let (socket, _rx) = test_socket();

    let wire::Message::Ping { id } = socket.next_heartbeat_ping() else {
        panic!("heartbeat is a ping");
    };
    assert!(socket.is_heartbeat_reply(id));
    assert!(!socket.is_heartbeat_reply(1), "small ids belong to the client");
    assert!(!socket.is_heartbeat_reply(id + 1), "ids we never sent are not replies");

    let wire::Message::Ping { id: second } = socket.next_heartbeat_ping() else {
        panic!("heartbeat is a ping");
    };
    assert!(socket.is_heartbeat_reply(id), "late replies to older pings still count");
    assert!(socket.is_heartbeat_reply(second));
}

#[test]
fn send_enqueues_messages_in_order() {
    let (socket, mut rx) = test_socket();

    socket.send(wire::Message::Ping { id: 1 });
    socket.send(wire::Message::Ping { id: 2 });

    let queued = drain(&mut rx);
    assert_eq!(queued.len(), 2);
    assert!(matches!(queued[0], Outbound::Message(wire::Message::Ping { id: 1 })));
    assert!(matches!(queued[1], Outbound::Message(wire::Message::Ping { id: 2 })));
}
