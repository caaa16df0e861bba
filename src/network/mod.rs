//! Network module - Handles TCP communication between peers
//!
//! Provides:
//! - Server for accepting incoming connections
//! - Client for connecting to servers
//! - Connection management and message routing

mod client;
mod connection;
mod server;

pub use client::*;
pub use connection::*;
pub use server::*;

use std::net::{IpAddr, SocketAddr};

use crate::protocol::{FrameCodec, DEFAULT_MAX_FRAME_SIZE};

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    pub port: u16,
    /// Interface to bind to
    pub bind_address: String,
    /// Ceiling on a frame's declared body length
    pub max_frame_size: usize,
    /// Accepted sockets beyond this count are dropped
    pub max_connections: usize,
    /// Queued replies at which a connection stops reading
    pub max_pending_replies: usize,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How long a client waits for a reply, in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::DEFAULT_PORT,
            bind_address: "0.0.0.0".to_string(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_connections: 1024,
            max_pending_replies: DEFAULT_MAX_PENDING_REPLIES,
            connect_timeout_ms: 5000,
            request_timeout_ms: 5000,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_max_pending_replies(mut self, max_pending_replies: usize) -> Self {
        self.max_pending_replies = max_pending_replies;
        self
    }

    /// Codec configured with this frame size ceiling
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::with_max_frame_size(self.max_frame_size)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    // A bare IPv6 literal also contains ':'
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let addr_string = if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    };
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
