//! Shared message model and codec for the tether wire protocol.
//!
//! This crate owns the wire representation used by both `server` and
//! `client`. Frames are UTF-8 JSON carried in binary WebSocket messages.
//! A frame that exceeds the sender's configured chunk size is split into
//! ordered fragments tagged with single-byte markers; fragment boundaries
//! are invisible to the logical message layer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version exchanged during the `hello` handshake.
pub const PROTOCOL_VERSION: &str = "1";

/// Marker byte on every fragment of a chunked frame except the last.
pub const CHUNK_MORE: u8 = b'+';

/// Marker byte on the final fragment of a chunked frame.
pub const CHUNK_FINAL: u8 = b'$';

/// Frames shorter than this cannot be a conforming encoding.
const MIN_FRAME_LEN: usize = 2;

/// Header map carried on requests and responses. The server filters
/// response headers against its allow-list before sending.
pub type Headers = HashMap<String, String>;

/// Error returned by [`decode`] and [`Reassembler::push`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame is shorter than any conforming encoding.
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    /// The frame is not valid UTF-8 text.
    #[error("frame is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),
    /// The frame cannot be structurally parsed.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The frame parsed but carries no `type` field.
    #[error("message has no type field")]
    MissingType,
    /// The `type` field names no known message kind. Carries the message id
    /// (when present) so the receiver can address its rejection.
    #[error("unknown message type: {kind}")]
    UnknownType { id: Option<u64>, kind: String },
    /// A logical frame exceeds the receiver's payload ceiling.
    #[error("frame of {size} bytes exceeds maximum payload of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    /// A complete frame arrived while fragments were still buffered.
    /// Fragments of one logical frame are sent back-to-back by contract.
    #[error("complete frame received mid-reassembly")]
    InterruptedChunk,
}

/// Heartbeat parameters advertised by the server in its `hello` response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Milliseconds between heartbeat sweeps.
    pub interval: u64,
    /// Milliseconds past the interval before a silent peer is considered dead.
    pub timeout: u64,
}

/// A single logical message on the wire, tagged by `type`.
///
/// Every `request` must eventually be answered by exactly one `response`
/// carrying the same id, or the connection is terminated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Liveness probe; answered with a `ping` echoing the same id.
    Ping { id: u64 },
    /// Handshake. The client sends `version`; the server answers with the
    /// assigned `socket` id and its heartbeat parameters.
    Hello {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        socket: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heartbeat: Option<Heartbeat>,
    },
    /// A correlated call into the host dispatcher. Carries either an
    /// explicit `method` + `path` or a server-registered `route` identifier.
    Request {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        route: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: Headers,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Terminal answer to a `request`, or an addressless protocol error
    /// when `id` is absent. `statusCode >= 400` marks an error response.
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(rename = "statusCode")]
        status_code: u16,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: Headers,
        payload: Value,
    },
}

impl Message {
    /// The message id, when the variant carries one.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        match self {
            Message::Ping { id } | Message::Hello { id, .. } | Message::Request { id, .. } => {
                Some(*id)
            }
            Message::Response { id, .. } => *id,
        }
    }

    /// The wire tag of this message, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping { .. } => "ping",
            Message::Hello { .. } => "hello",
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
        }
    }

    /// Build a successful response to the request with the given id.
    #[must_use]
    pub fn response(id: u64, status_code: u16, headers: Headers, payload: Value) -> Self {
        Message::Response { id: Some(id), status_code, headers, payload }
    }

    /// Build an error response with a `message` payload.
    #[must_use]
    pub fn error(id: Option<u64>, status_code: u16, message: impl Into<String>) -> Self {
        Message::Response {
            id,
            status_code,
            headers: Headers::new(),
            payload: serde_json::json!({ "message": message.into() }),
        }
    }
}

/// Encode a message into the bytes of one (unchunked) wire frame.
///
/// Serializing this enum cannot fail: payloads are `serde_json::Value` and
/// every map key is a string.
#[must_use]
pub fn encode(message: &Message) -> Vec<u8> {
    serde_json::to_vec(message).unwrap_or_default()
}

/// Decode the bytes of one logical frame into a message.
///
/// # Errors
///
/// Returns [`CodecError::TooShort`] / [`CodecError::NotUtf8`] /
/// [`CodecError::Malformed`] / [`CodecError::MissingType`] for frames that
/// are not a conforming encoding, and [`CodecError::UnknownType`] when the
/// frame is well-formed but names no known message kind.
pub fn decode(frame: &[u8]) -> Result<Message, CodecError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(CodecError::TooShort(frame.len()));
    }
    let text = std::str::from_utf8(frame)?;
    let value: Value = serde_json::from_str(text)?;

    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(CodecError::MissingType),
    };
    match kind.as_str() {
        "ping" | "hello" | "request" | "response" => Ok(serde_json::from_value(value)?),
        _ => Err(CodecError::UnknownType {
            id: value.get("id").and_then(Value::as_u64),
            kind,
        }),
    }
}

/// Split one encoded frame into the transport frames to send.
///
/// Returns the frame untouched when chunking is disabled (`max_chunk` is
/// `None`) or the frame fits. Otherwise each fragment carries up to
/// `max_chunk` bytes of the frame behind a [`CHUNK_MORE`] marker, except
/// the last, which is marked [`CHUNK_FINAL`]. Fragments of one frame must
/// be sent back-to-back, before any other queued frame.
#[must_use]
pub fn split_frame(frame: Vec<u8>, max_chunk: Option<usize>) -> Vec<Vec<u8>> {
    let Some(max) = max_chunk else {
        return vec![frame];
    };
    if max == 0 || frame.len() <= max {
        return vec![frame];
    }

    let mut fragments = Vec::with_capacity(frame.len().div_ceil(max));
    let mut chunks = frame.chunks(max).peekable();
    while let Some(chunk) = chunks.next() {
        let marker = if chunks.peek().is_some() { CHUNK_MORE } else { CHUNK_FINAL };
        let mut fragment = Vec::with_capacity(chunk.len() + 1);
        fragment.push(marker);
        fragment.extend_from_slice(chunk);
        fragments.push(fragment);
    }
    fragments
}

/// Connection-scoped reassembly buffer for chunked frames.
///
/// Owned by exactly one connection and reset when that connection closes;
/// fragment state never crosses connections.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    max_payload: Option<usize>,
}

impl Reassembler {
    /// Create a buffer that rejects logical frames larger than `max_payload`.
    #[must_use]
    pub fn new(max_payload: Option<usize>) -> Self {
        Self { buffer: Vec::new(), max_payload }
    }

    /// Feed one transport frame, returning the bytes of a logical frame
    /// once one is complete.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::PayloadTooLarge`] when the buffered frame
    /// exceeds the ceiling and [`CodecError::InterruptedChunk`] when a
    /// complete frame arrives mid-reassembly. Both discard the partial
    /// buffer.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        match frame.first() {
            Some(&CHUNK_MORE) => {
                self.extend_checked(&frame[1..])?;
                Ok(None)
            }
            Some(&CHUNK_FINAL) => {
                self.extend_checked(&frame[1..])?;
                Ok(Some(std::mem::take(&mut self.buffer)))
            }
            _ => {
                if !self.buffer.is_empty() {
                    self.buffer.clear();
                    return Err(CodecError::InterruptedChunk);
                }
                self.check_len(frame.len())?;
                Ok(Some(frame.to_vec()))
            }
        }
    }

    /// Discard any partially buffered fragments.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    fn extend_checked(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        if let Err(err) = self.check_len(self.buffer.len() + bytes.len()) {
            self.buffer.clear();
            return Err(err);
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn check_len(&self, size: usize) -> Result<(), CodecError> {
        if let Some(max) = self.max_payload {
            if size > max {
                return Err(CodecError::PayloadTooLarge { size, max });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
