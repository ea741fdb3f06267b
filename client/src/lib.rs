//! Caller-side endpoint for the tether protocol.
//!
//! A [`Client`] keeps one long-lived connection to a listener: it performs
//! the `hello` handshake, correlates requests with responses, answers
//! server heartbeats, watches for heartbeat silence, and reattaches after
//! unexpected disconnects with bounded, backoff-delayed retries.

pub mod client;

pub use client::{
    Client, ClientConfig, ClientError, ClientEvent, ClientState, DisconnectReason,
    ReconnectPolicy, Request, Response,
};
