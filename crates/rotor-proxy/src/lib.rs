//! Local forward proxy that routes every connection through the active
//! circuit of a [`rotor_pool::PoolManager`].
//!
//! Clients point their HTTP proxy setting at one fixed address. Each
//! accepted connection is classified, and HTTP requests are tunnelled
//! through the active backend's SOCKS5 port. A reserved path switches the
//! active circuit instead of being proxied.
//!
//! # Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! rotor-proxy (127.0.0.1:8080)
//!   |
//!   +-- GET /rotate --> PoolManager::rotate, plaintext answer
//!   |
//!   +-- CONNECT / GET http://... --> SOCKS5 CONNECT on 127.0.0.1:<active port>
//!                                        |
//!                                        v
//!                                   backend circuit --> internet
//! ```
//!
//! # Components
//!
//! - [`ProxyServer`]: binds the listener and runs the accept loop
//! - [`ConnectionHandler`]: sniffs, parses and serves one connection
//! - [`BackendDialer`]: SOCKS5 client handshake against a backend
//! - [`relay()`]: full-duplex pump with shutdown propagation
//!
//! # Usage
//!
//! ```ignore
//! use rotor_proxy::{ProxyConfig, ProxyServer};
//!
//! let handle = ProxyServer::new(ProxyConfig::default(), pool)?.start().await?;
//! // ... later ...
//! handle.shutdown().await?;
//! ```

pub mod dialer;
pub mod handler;
mod relay;
mod server;

pub use dialer::{BackendDialer, DialError};
pub use handler::{classify, ConnectionHandler, Outcome, Protocol};
pub use relay::{relay, RelayConfig, RelayStats};
pub use server::{ProxyConfig, ProxyHandle, ProxyServer};

use std::net::SocketAddr;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur in proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to bind to address.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Invalid proxy configuration.
    #[error("Invalid proxy config: {0}")]
    Config(String),

    /// The client sent nothing for too long.
    #[error("Client idle for {0:?}")]
    IdleTimeout(std::time::Duration),

    /// Client socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
