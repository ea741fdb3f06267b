//! Server configuration contract.
//!
//! DESIGN
//! ======
//! Plain deserializable structs with defaults, plus an explicit
//! `validate()` pass run once when a listener is built. Hosts construct a
//! [`Config`] directly or deserialize one from their own settings file.

use std::collections::HashMap;

use serde::Deserialize;
use wire::Heartbeat;

/// Default milliseconds between heartbeat sweeps.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

/// Default milliseconds a pinged socket has to show activity.
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 5_000;

/// Error returned by [`Config::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("heartbeat interval must be greater than zero")]
    ZeroHeartbeatInterval,
    #[error("heartbeat timeout must be greater than zero")]
    ZeroHeartbeatTimeout,
    #[error("max_connections must be greater than zero")]
    ZeroMaxConnections,
    #[error("max_chunk must be greater than zero")]
    ZeroMaxChunk,
    #[error("max_chunk of {chunk} exceeds max_payload of {payload}")]
    ChunkExceedsPayload { chunk: usize, payload: usize },
    #[error("route {id:?} has an empty method or path")]
    EmptyRoute { id: String },
}

/// Which response header names pass through to the caller.
///
/// With no `headers` setting the server passes no response headers at all;
/// `"all"` passes everything, a list passes only the named headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum HeaderFilter {
    #[default]
    None,
    All,
    Allow(Vec<String>),
}

impl HeaderFilter {
    /// Drop every header the filter does not pass. Names compare
    /// case-insensitively.
    #[must_use]
    pub fn apply(&self, headers: wire::Headers) -> wire::Headers {
        match self {
            HeaderFilter::None => wire::Headers::new(),
            HeaderFilter::All => headers,
            HeaderFilter::Allow(names) => headers
                .into_iter()
                .filter(|(name, _)| names.iter().any(|allowed| allowed.eq_ignore_ascii_case(name)))
                .collect(),
        }
    }
}

impl<'de> Deserialize<'de> for HeaderFilter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Word(String),
            List(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Word(word) if word == "all" => Ok(HeaderFilter::All),
            Raw::Word(word) => Err(serde::de::Error::custom(format!(
                "expected \"all\" or a list of header names, got {word:?}"
            ))),
            Raw::List(names) => Ok(HeaderFilter::Allow(names)),
        }
    }
}

/// A named route identifier requests may use instead of method + path.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Route {
    pub method: String,
    pub path: String,
}

/// Listener configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Response header pass-through filter.
    pub headers: HeaderFilter,
    /// Heartbeat sweep parameters; `null` disables liveness checks.
    pub heartbeat: Option<Heartbeat>,
    /// Ceiling on concurrently registered sockets; `null` means unlimited.
    pub max_connections: Option<usize>,
    /// Ceiling in bytes on one inbound logical frame.
    pub max_payload: Option<usize>,
    /// Fragment size in bytes for outbound chunking; `null` disables chunking.
    pub max_chunk: Option<usize>,
    /// Origins accepted at upgrade; `null` accepts any origin. Connections
    /// that declare no origin are always accepted.
    pub origins: Option<Vec<String>>,
    /// Registered route identifiers, resolved before dispatch.
    pub routes: HashMap<String, Route>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            headers: HeaderFilter::None,
            heartbeat: Some(Heartbeat {
                interval: DEFAULT_HEARTBEAT_INTERVAL_MS,
                timeout: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            }),
            max_connections: None,
            max_payload: None,
            max_chunk: None,
            origins: None,
            routes: HashMap::new(),
        }
    }
}

impl Config {
    /// Check the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(heartbeat) = self.heartbeat {
            if heartbeat.interval == 0 {
                return Err(ConfigError::ZeroHeartbeatInterval);
            }
            if heartbeat.timeout == 0 {
                return Err(ConfigError::ZeroHeartbeatTimeout);
            }
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::ZeroMaxConnections);
        }
        if self.max_chunk == Some(0) {
            return Err(ConfigError::ZeroMaxChunk);
        }
        if let (Some(chunk), Some(payload)) = (self.max_chunk, self.max_payload) {
            if chunk > payload {
                return Err(ConfigError::ChunkExceedsPayload { chunk, payload });
            }
        }
        for (id, route) in &self.routes {
            if route.method.is_empty() || route.path.is_empty() {
                return Err(ConfigError::EmptyRoute { id: id.clone() });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
