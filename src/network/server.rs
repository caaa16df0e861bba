//! VNOC Server
//!
//! The server owns the listening socket, runs the accept loop and keeps
//! track of every live connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use super::connection::Connection;
use super::NetworkConfig;
use crate::dispatch::Dispatcher;
use crate::protocol::FrameCodec;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server started
    Started { bind_addr: SocketAddr },
    /// A socket was accepted and its connection is running
    ConnectionOpened { id: u64, addr: SocketAddr },
    /// A connection reached `Closed`; `reason` is set when it failed
    ConnectionClosed {
        id: u64,
        addr: SocketAddr,
        reason: Option<String>,
    },
    /// Error occurred
    Error { message: String },
    /// Server stopped and every connection has been torn down
    Stopped,
}

/// Information about a live connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: u64,
    pub addr: SocketAddr,
    pub connected_at: Instant,
}

type ConnectionMap = Arc<RwLock<HashMap<u64, ConnectionInfo>>>;

/// How the accept loop reacts to a failed accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptFailure {
    /// The pending socket went away; keep accepting
    Transient,
    /// Out of file descriptors; pause, then accept again
    Backoff,
    /// The listener itself is unusable; stop accepting
    Fatal,
}

/// Pause after running out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Classify an accept error
pub fn classify_accept_error(error: &io::Error) -> AcceptFailure {
    use io::ErrorKind::*;
    if is_descriptor_exhaustion(error) {
        return AcceptFailure::Backoff;
    }
    match error.kind() {
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock
        | TimedOut => AcceptFailure::Transient,
        _ => AcceptFailure::Fatal,
    }
}

/// EMFILE / ENFILE, which std reports as an uncategorized kind
fn is_descriptor_exhaustion(error: &io::Error) -> bool {
    #[cfg(unix)]
    const CODES: &[i32] = &[23, 24];
    #[cfg(windows)]
    const CODES: &[i32] = &[10024];
    #[cfg(not(any(unix, windows)))]
    const CODES: &[i32] = &[];

    error.raw_os_error().is_some_and(|code| CODES.contains(&code))
}

/// VNOC Server
pub struct Server {
    /// Server configuration
    config: NetworkConfig,
    /// Handler table shared read-only by all connections
    dispatcher: Arc<Dispatcher>,
    /// Live connections
    connections: ConnectionMap,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal, observed by the accept loop and every connection
    shutdown_tx: Option<watch::Sender<bool>>,
    /// The accept loop task
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a new server. The dispatcher is frozen from here on.
    pub fn new(config: NetworkConfig, dispatcher: Dispatcher) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            connections: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Bind the listening socket and start accepting connections
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }

        let bind_addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        emit(&self.event_tx, ServerEvent::Started { bind_addr: local_addr });

        let acceptor = Acceptor {
            listener,
            dispatcher: self.dispatcher.clone(),
            codec: self.config.codec(),
            max_connections: self.config.max_connections,
            max_pending_replies: self.config.max_pending_replies,
            connections: self.connections.clone(),
            event_tx: self.event_tx.clone(),
            shutdown: shutdown_rx,
        };

        // Spawn the accept loop
        self.accept_task = Some(tokio::spawn(acceptor.run()));

        Ok(local_addr)
    }

    /// Stop the server, closing every connection before returning
    pub async fn stop(&mut self) -> ServerResult<()> {
        let Some(task) = self.accept_task.take() else {
            return Err(ServerError::NotRunning);
        };

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        if let Err(e) = task.await {
            tracing::error!("Accept loop terminated abnormally: {}", e);
        }

        // Entries of panicked connection tasks are never reaped
        self.connections.write().await.clear();
        self.local_addr = None;
        Ok(())
    }

    /// Get a list of live connections
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let connections = self.connections.read().await;
        let mut list: Vec<_> = connections.values().cloned().collect();
        list.sort_by_key(|info| info.id);
        list
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Check if the server is running
    pub fn is_running(&self) -> bool {
        self.accept_task.is_some()
    }
}

/// Non-blocking event delivery; a consumer that falls behind loses events
fn emit(event_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    if let Err(e) = event_tx.try_send(event) {
        tracing::trace!("Server event dropped: {}", e);
    }
}

type ConnectionOutcome = (u64, SocketAddr, Option<String>);

/// State owned by the accept loop task
struct Acceptor {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    codec: FrameCodec,
    max_connections: usize,
    max_pending_replies: usize,
    connections: ConnectionMap,
    event_tx: mpsc::Sender<ServerEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Acceptor {
    async fn run(mut self) {
        let mut tasks: JoinSet<ConnectionOutcome> = JoinSet::new();
        let mut next_id: u64 = 1;
        let mut accepting = true;
        let mut retry_at: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                result = self.listener.accept(), if accepting && retry_at.is_none() => {
                    match result {
                        Ok((stream, addr)) => {
                            if tasks.len() >= self.max_connections {
                                tracing::warn!(
                                    "Rejecting {}: connection limit ({}) reached",
                                    addr,
                                    self.max_connections
                                );
                                continue;
                            }
                            let id = next_id;
                            next_id += 1;
                            self.open(&mut tasks, id, stream, addr).await;
                        }
                        Err(e) => match classify_accept_error(&e) {
                            AcceptFailure::Transient => {
                                tracing::warn!("Accept error (continuing): {}", e);
                            }
                            AcceptFailure::Backoff => {
                                tracing::warn!("Accept error, retrying in {:?}: {}", ACCEPT_BACKOFF, e);
                                retry_at = Some(tokio::time::Instant::now() + ACCEPT_BACKOFF);
                            }
                            AcceptFailure::Fatal => {
                                tracing::error!("Accept error, no longer accepting: {}", e);
                                emit(&self.event_tx, ServerEvent::Error { message: e.to_string() });
                                accepting = false;
                            }
                        },
                    }
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(tokio::time::Instant::now)),
                    if retry_at.is_some() => {
                    retry_at = None;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    reap(&self.connections, &self.event_tx, joined).await;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }
        }

        // Connections observe the same shutdown signal; wait for all of them
        let Acceptor {
            listener,
            connections,
            event_tx,
            ..
        } = self;
        drop(listener);
        while let Some(joined) = tasks.join_next().await {
            reap(&connections, &event_tx, joined).await;
        }

        emit(&event_tx, ServerEvent::Stopped);
        tracing::info!("Server stopped");
    }

    async fn open(
        &self,
        tasks: &mut JoinSet<ConnectionOutcome>,
        id: u64,
        stream: TcpStream,
        addr: SocketAddr,
    ) {
        tracing::info!("New connection {} from {}", id, addr);
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        self.connections.write().await.insert(
            id,
            ConnectionInfo {
                id,
                addr,
                connected_at: Instant::now(),
            },
        );
        emit(&self.event_tx, ServerEvent::ConnectionOpened { id, addr });

        let mut conn = Connection::new(id, stream, addr, self.dispatcher.clone(), self.codec)
            .with_max_pending_replies(self.max_pending_replies);
        let shutdown = self.shutdown.clone();
        tasks.spawn(async move {
            let reason = conn.run(shutdown).await.err().map(|e| e.to_string());
            (id, addr, reason)
        });
    }
}

/// Drop a finished connection from the tracked set
async fn reap(
    connections: &ConnectionMap,
    event_tx: &mpsc::Sender<ServerEvent>,
    joined: Result<ConnectionOutcome, tokio::task::JoinError>,
) {
    match joined {
        Ok((id, addr, reason)) => {
            connections.write().await.remove(&id);
            emit(event_tx, ServerEvent::ConnectionClosed { id, addr, reason });
        }
        Err(e) => {
            tracing::error!("Connection task failed: {}", e);
        }
    }
}
