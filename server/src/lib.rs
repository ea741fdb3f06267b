//! Server endpoint for the tether protocol.
//!
//! A [`Listener`] owns the set of live connections for one server: it
//! admits new WebSocket upgrades, assigns socket ids, runs the heartbeat
//! sweep, and drives graceful shutdown. Each admitted connection runs a
//! [`socket`] state machine: handshake, inbound dispatch into the host
//! [`Dispatcher`], and an ordered outbound send queue with chunking.
//! [`routes::router`] mounts a listener into a host axum server.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod routes;
pub mod socket;

pub use config::{Config, HeaderFilter, Route};
pub use dispatch::{ConnectionContext, DispatchError, Dispatcher, Hooks, NoopHooks};
pub use error::AcceptError;
pub use listener::Listener;
pub use socket::{Socket, SocketState};
