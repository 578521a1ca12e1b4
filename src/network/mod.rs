//! Network module - Connection lifecycle and the client/server endpoints
//!
//! Provides:
//! - `Transport`: one established connection with its send queue, owner set,
//!   liveness tracking and type cache
//! - Connection validation handshake
//! - Watchdog that probes idle connections and flags unresponsive ones
//! - `Server` accepting connections and hosting channels
//! - `ClientContext` opening channels and put-get operations on a server

mod client;
mod handshake;
mod server;
mod transport;
mod watchdog;

pub use client::*;
pub use handshake::*;
pub use server::*;
pub use transport::*;
pub use watchdog::*;

#[cfg(test)]
pub(crate) use transport::tests as test_support;

use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::protocol::{DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_PORT};
use crate::pvdata::DEFAULT_REGISTRY_MAX_SIZE;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address the server binds to
    pub bind_address: String,
    /// Port to listen on or connect to
    pub port: u16,
    /// TCP connect plus handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Liveness interval `T` in milliseconds; echo after `T`, unresponsive after `2T`
    pub connection_timeout_ms: u64,
    /// When queued messages reach the socket
    pub flush_strategy: FlushStrategy,
    /// Client priority; connections are shared per (address, priority)
    pub priority: i16,
    /// Receive buffer size advertised during the handshake
    pub receive_buffer_size: u32,
    /// Maximum payload size accepted from the peer
    pub max_message_size: usize,
    /// Maximum number of cached outgoing type descriptors
    pub registry_max_size: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_ms: 5000,
            connection_timeout_ms: 30_000,
            flush_strategy: FlushStrategy::Immediate,
            priority: 0,
            receive_buffer_size: 16 * 1024,
            max_message_size: DEFAULT_MAX_PAYLOAD_SIZE,
            registry_max_size: DEFAULT_REGISTRY_MAX_SIZE,
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

    pub fn with_flush_strategy(mut self, flush_strategy: FlushStrategy) -> Self {
        self.flush_strategy = flush_strategy;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Per-connection settings derived from this configuration
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            connection_timeout: self.connection_timeout(),
            flush_strategy: self.flush_strategy,
            max_payload_size: self.max_message_size,
            registry_max_size: self.registry_max_size,
        }
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
