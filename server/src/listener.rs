//! Listener — owns the set of live sockets for one server.
//!
//! DESIGN
//! ======
//! One registry map behind a single `RwLock`; admission, the heartbeat
//! sweep, and socket deregistration are its only writers. A single global
//! ticker drives the sweep: each tick pings every registered socket, waits
//! the configured timeout, then terminates the sockets that stayed
//! inactive. A socket seen by a sweep for the first time is only pinged,
//! never terminated, so a connection still finishing its handshake is not
//! penalized for transport latency.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::WebSocket;
use tokio::sync::{Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::dispatch::{Dispatcher, Hooks, NoopHooks};
use crate::error::AcceptError;
use crate::socket::{self, Socket};

// =============================================================================
// SOCKET IDS
// =============================================================================

/// The per-millisecond counter wraps at five decimal digits.
const ID_COUNTER_LIMIT: u32 = 100_000;

/// Allocates socket ids of the form `timestamp:pid:counter`. The counter
/// resets at the start of each millisecond and wraps at
/// [`ID_COUNTER_LIMIT`], keeping ids locally unique without a shared id
/// service.
#[derive(Debug, Default)]
struct SocketIdGenerator {
    last_ms: u64,
    counter: u32,
}

impl SocketIdGenerator {
    fn next(&mut self, now_ms: u64) -> String {
        if now_ms == self.last_ms {
            self.counter = (self.counter + 1) % ID_COUNTER_LIMIT;
        } else {
            self.last_ms = now_ms;
            self.counter = 0;
        }
        format!("{}:{}:{:05}", now_ms, std::process::id(), self.counter)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |dur| u64::try_from(dur.as_millis()).unwrap_or(0))
}

// =============================================================================
// LISTENER
// =============================================================================

/// The server-side connection registry: admits transport connections,
/// assigns socket ids, runs the heartbeat sweep, and drives shutdown.
pub struct Listener {
    config: Arc<Config>,
    dispatcher: Arc<dyn Dispatcher>,
    hooks: Arc<dyn Hooks>,
    sockets: RwLock<HashMap<String, Arc<Socket>>>,
    ids: Mutex<SocketIdGenerator>,
    stopped: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    drained: Notify,
}

impl Listener {
    /// Build a listener over a validated configuration, with no-op hooks.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration cannot work.
    pub fn new(config: Config, dispatcher: Arc<dyn Dispatcher>) -> Result<Arc<Self>, ConfigError> {
        Self::with_hooks(config, dispatcher, Arc::new(NoopHooks))
    }

    /// Build a listener with host lifecycle hooks.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration cannot work.
    pub fn with_hooks(
        config: Config,
        dispatcher: Arc<dyn Dispatcher>,
        hooks: Arc<dyn Hooks>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Arc::new(Self {
            config: Arc::new(config),
            dispatcher,
            hooks,
            sockets: RwLock::new(HashMap::new()),
            ids: Mutex::new(SocketIdGenerator::default()),
            stopped: AtomicBool::new(false),
            sweeper: Mutex::new(None),
            drained: Notify::new(),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of live registered sockets.
    pub async fn socket_count(&self) -> usize {
        self.sockets.read().await.len()
    }

    /// Start accepting connections and spawn the heartbeat sweep.
    pub fn start(self: &Arc<Self>) {
        self.stopped.store(false, Ordering::SeqCst);

        let Some(heartbeat) = self.config.heartbeat else {
            return;
        };
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return;
        }
        let listener = Arc::clone(self);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(heartbeat.interval));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                listener.sweep(Duration::from_millis(heartbeat.timeout)).await;
            }
        }));
    }

    /// Stop accepting, close every registered socket, and resolve once the
    /// closures complete. `start` clears the stopped flag again on restart.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(sweeper) = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take() {
            sweeper.abort();
        }

        let sockets: Vec<Arc<Socket>> = self.sockets.read().await.values().cloned().collect();
        info!(count = sockets.len(), "listener: stopping");
        for socket in &sockets {
            socket.terminate("listener stopped");
        }

        loop {
            let drained = self.drained.notified();
            if self.sockets.read().await.is_empty() {
                break;
            }
            drained.await;
        }
    }

    /// Admission check for a new transport connection. A connection that
    /// declares no origin is always acceptable origin-wise.
    ///
    /// # Errors
    ///
    /// Returns the [`AcceptError`] explaining the refusal.
    pub async fn admit(&self, origin: Option<&str>) -> Result<(), AcceptError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AcceptError::Stopped);
        }
        if let Some(max) = self.config.max_connections {
            if self.sockets.read().await.len() >= max {
                return Err(AcceptError::AtCapacity(max));
            }
        }
        if let (Some(origin), Some(allowed)) = (origin, &self.config.origins) {
            if !origin.is_empty() && !allowed.iter().any(|entry| entry == origin) {
                return Err(AcceptError::OriginNotAllowed(origin.to_owned()));
            }
        }
        Ok(())
    }

    /// Register an upgraded connection and run its socket until it closes.
    pub async fn attach(self: Arc<Self>, ws: WebSocket, peer: SocketAddr) {
        let (socket, outbound_rx) = {
            let mut sockets = self.sockets.write().await;
            // Admission is re-checked under the registry lock: the listener
            // may have stopped or filled while the upgrade completed.
            if self.stopped.load(Ordering::SeqCst)
                || self.config.max_connections.is_some_and(|max| sockets.len() >= max)
            {
                return;
            }
            let id = self
                .ids
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .next(now_ms());
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let socket = Arc::new(Socket::new(id.clone(), peer, outbound_tx));
            sockets.insert(id, Arc::clone(&socket));
            (socket, outbound_rx)
        };
        info!(socket = %socket.id(), %peer, "listener: connection accepted");

        socket::run(
            ws,
            Arc::clone(&socket),
            outbound_rx,
            Arc::clone(&self.config),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.hooks),
        )
        .await;

        self.sockets.write().await.remove(socket.id());
        if socket.handshake_complete() {
            self.hooks.on_disconnection(socket.context()).await;
        }
        self.drained.notify_waiters();
        info!(socket = %socket.id(), "listener: connection closed");
    }

    /// One heartbeat pass: ping everyone, wait out the timeout, terminate
    /// the sockets that stayed inactive.
    async fn sweep(&self, timeout: Duration) {
        let sockets: Vec<Arc<Socket>> = self.sockets.read().await.values().cloned().collect();
        if sockets.is_empty() {
            return;
        }

        let mut watched = Vec::with_capacity(sockets.len());
        for socket in sockets {
            let fresh = socket.take_fresh();
            socket.reset_activity();
            socket.send(socket.next_heartbeat_ping());
            if !fresh {
                watched.push(socket);
            }
        }

        tokio::time::sleep(timeout).await;

        for socket in watched {
            if !socket.is_active() {
                warn!(socket = %socket.id(), "listener: heartbeat timeout");
                socket.terminate("heartbeat timeout");
            }
        }
    }
}

#[cfg(test)]
impl Listener {
    /// Insert a detached socket so admission checks see an occupied slot.
    pub(crate) async fn register_for_test(&self) -> Arc<Socket> {
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let id = self
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next(now_ms());
        let socket = Arc::new(Socket::new(id.clone(), ([127, 0, 0, 1], 0).into(), outbound_tx));
        self.sockets.write().await.insert(id, Arc::clone(&socket));
        socket
    }
}

#[cfg(test)]
#[path = "listener_test.rs"]
mod tests;
