//! # Connection Manager
//!
//! Owns the single duplex socket to the host. A successful connect spawns two
//! tasks sharing one [`CancellationToken`]:
//!
//! - a writer that drains the correlator's outbound queue into the socket;
//! - a receive loop that hands every text frame to the [`Demultiplexer`].
//!
//! Whatever ends the connection (remote close, read/write error, or an explicit
//! [`ConnectionManager::disconnect`]), teardown runs once: the correlator is
//! detached, every pending command fails with `ConnectionLost`, the state drops
//! to `Disconnected` and state subscribers receive `false`.
//!
//! Each connection is stamped with a generation number. Teardown requests from
//! a loop belonging to an older generation are ignored, so a slow-dying socket
//! can never take down its replacement.
//!
//! Reconnection is always requested by the caller; nothing in here retries on
//! its own.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::collaborators::TargetSupplier;
use crate::core::correlator::Correlator;
use crate::core::demux::Demultiplexer;
use crate::error::{BridgeError, BridgeResult};

/// Lifecycle of the host connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// First handshake in progress.
    Connecting,
    /// Socket open; commands flow.
    Connected,
    /// Caller-requested retry in progress.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Connection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Upper bound for the WebSocket handshake.
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// The live connection's bookkeeping.
struct Session {
    generation: u64,
    target: String,
    cancel: CancellationToken,
}

/// # Connection Manager
pub struct ConnectionManager {
    config: ConnectionConfig,
    correlator: Arc<Correlator>,
    demux: Arc<Demultiplexer>,
    state: RwLock<ConnectionState>,
    generation: AtomicU64,
    session: Mutex<Option<Session>>,
    state_tx: broadcast::Sender<bool>,
}

impl ConnectionManager {
    /// Creates a disconnected manager. Replies are delivered to `correlator`
    /// through `demux`, which must have been built around the same correlator.
    pub fn new(config: ConnectionConfig, correlator: Arc<Correlator>, demux: Arc<Demultiplexer>) -> Arc<Self> {
        let (state_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            config,
            correlator,
            demux,
            state: RwLock::new(ConnectionState::Disconnected),
            generation: AtomicU64::new(0),
            session: Mutex::new(None),
            state_tx,
        })
    }

    /// The correlator commands go through.
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// The demultiplexer fed by the receive loop.
    pub fn demux(&self) -> &Arc<Demultiplexer> {
        &self.demux
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while the socket is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Target of the live connection, if any.
    pub fn current_target(&self) -> Option<String> {
        self.lock_session().as_ref().map(|s| s.target.clone())
    }

    /// Receives `true` on every successful connect and `false` on every loss.
    pub fn subscribe_state(&self) -> broadcast::Receiver<bool> {
        self.state_tx.subscribe()
    }

    /// # Connect
    ///
    /// Opens a connection to `target` (a `ws://` or `wss://` URL). An existing
    /// connection is torn down first.
    pub async fn connect(self: &Arc<Self>, target: &str) -> BridgeResult<()> {
        self.close_current("superseded by a new connect");
        self.open(target, ConnectionState::Connecting).await
    }

    /// Connects to whatever `supplier` currently names.
    pub async fn connect_with<S: TargetSupplier + ?Sized>(self: &Arc<Self>, supplier: &S) -> BridgeResult<()> {
        let target = supplier.target()?;
        self.connect(&target).await
    }

    /// # Reconnect
    ///
    /// Caller-initiated retry: drops whatever is left of the old connection and
    /// opens a fresh one, passing through `Reconnecting`.
    pub async fn reconnect(self: &Arc<Self>, target: &str) -> BridgeResult<()> {
        self.close_current("reconnect requested");
        self.open(target, ConnectionState::Reconnecting).await
    }

    /// Closes the connection. Pending commands fail with `ConnectionLost`.
    pub fn disconnect(&self) {
        self.close_current("disconnect requested");
    }

    async fn open(self: &Arc<Self>, target: &str, transitional: ConnectionState) -> BridgeResult<()> {
        self.set_state(transitional);

        let url = match parse_target(target) {
            Ok(url) => url,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        log::info!("Connecting to host at {}", url);
        let handshake = tokio::time::timeout(self.config.handshake_timeout, connect_async(url.as_str())).await;
        let ws_stream = match handshake {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                log::error!("Handshake with {} failed: {}", url, e);
                self.set_state(ConnectionState::Disconnected);
                return Err(BridgeError::Transport(e.to_string()));
            }
            Err(_) => {
                log::error!("Handshake with {} timed out after {:?}", url, self.config.handshake_timeout);
                self.set_state(ConnectionState::Disconnected);
                return Err(BridgeError::Transport(format!(
                    "handshake timed out after {:?}",
                    self.config.handshake_timeout
                )));
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();

        *self.lock_session() = Some(Session {
            generation,
            target: target.to_string(),
            cancel: cancel.clone(),
        });
        self.correlator.attach(outbound_tx);
        self.set_state(ConnectionState::Connected);
        let _ = self.state_tx.send(true);
        log::info!("Connected to host (generation {})", generation);

        // Writer: outbound queue -> socket.
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    next = outbound_rx.recv() => {
                        let Some(text) = next else { break };
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            log::error!("Socket write failed: {}", e);
                            writer_cancel.cancel();
                            break;
                        }
                    }
                }
            }
            log::debug!("Writer for generation {} stopped", generation);
        });

        // Receive loop: socket -> demultiplexer.
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break "cancelled",
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            manager.demux.route(text.as_str());
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::warn!("Host closed the connection.");
                            break "closed by host";
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("Socket read error: {}", e);
                            break "read error";
                        }
                    }
                }
            };
            manager.teardown(generation, reason);
        });

        Ok(())
    }

    fn close_current(&self, reason: &str) {
        let current = self.lock_session().as_ref().map(|s| s.generation);
        if let Some(generation) = current {
            self.teardown(generation, reason);
        }
    }

    /// Runs once per generation; later calls and calls for older generations
    /// are no-ops.
    fn teardown(&self, generation: u64, reason: &str) {
        let session = {
            let mut slot = self.lock_session();
            match slot.as_ref() {
                Some(s) if s.generation == generation => slot.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            log::debug!("Ignoring teardown of stale generation {} ({})", generation, reason);
            return;
        };

        session.cancel.cancel();
        self.correlator.detach();
        let failed = self.correlator.fail_all(BridgeError::ConnectionLost);
        self.set_state(ConnectionState::Disconnected);
        let _ = self.state_tx.send(false);
        log::warn!(
            "Connection to {} ended ({}); {} pending command(s) failed",
            session.target,
            reason,
            failed
        );
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            log::debug!("Connection state {} -> {}", *state, next);
            *state = next;
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Accepts only `ws://` and `wss://` targets.
fn parse_target(target: &str) -> BridgeResult<Url> {
    let url = Url::parse(target).map_err(|e| BridgeError::InvalidRequest(format!("bad target '{target}': {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(BridgeError::InvalidRequest(format!(
            "unsupported scheme '{other}' in target '{target}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::correlator::CorrelatorConfig;
    use crate::core::demux::DemuxConfig;

    fn manager() -> Arc<ConnectionManager> {
        let correlator = Arc::new(Correlator::new(CorrelatorConfig::default()));
        let demux = Arc::new(Demultiplexer::new(DemuxConfig::default(), Arc::clone(&correlator)));
        ConnectionManager::new(
            ConnectionConfig {
                handshake_timeout: Duration::from_secs(2),
            },
            correlator,
            demux,
        )
    }

    #[test]
    fn only_websocket_targets_are_accepted() {
        assert!(parse_target("ws://127.0.0.1:9222/devtools/page/1").is_ok());
        assert!(parse_target("wss://host/x").is_ok());
        assert!(matches!(parse_target("http://host/x"), Err(BridgeError::InvalidRequest(_))));
        assert!(matches!(parse_target("not a url"), Err(BridgeError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn bad_target_leaves_manager_disconnected() {
        let manager = manager();
        let err = manager.connect("http://127.0.0.1:1/").await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRequest(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.correlator().is_attached());
    }

    #[tokio::test]
    async fn refused_handshake_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let manager = manager();
        let err = manager.connect(&format!("ws://{addr}/")).await.unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert!(!manager.is_connected());
    }

    #[test]
    fn stale_teardown_is_ignored() {
        let manager = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.correlator().attach(tx);
        *manager.lock_session() = Some(Session {
            generation: 2,
            target: "ws://x/".to_string(),
            cancel: CancellationToken::new(),
        });
        manager.set_state(ConnectionState::Connected);

        manager.teardown(1, "old loop");
        assert!(manager.is_connected());
        assert!(manager.correlator().is_attached());

        let mut states = manager.subscribe_state();
        manager.teardown(2, "current loop");
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.correlator().is_attached());
        assert_eq!(states.try_recv().unwrap(), false);
        assert!(manager.current_target().is_none());
    }
}
