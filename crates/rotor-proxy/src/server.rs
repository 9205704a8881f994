//! Listener lifecycle and accept loop.
//!
//! # Lifecycle
//!
//! ```text
//! ProxyServer::new(config, pool)
//!       |
//!       v
//! ProxyServer::start() --> ProxyHandle
//!       |                       |
//!       v                       |
//! accept loop, one task         |
//! per connection                |
//!       |                       v
//!       |               ProxyHandle::shutdown()
//!       |                       |
//!       v                       v
//! stop accepting, cancel <------+
//! in-flight relays
//! ```

use crate::dialer::BackendDialer;
use crate::handler::{ConnectionHandler, Outcome};
use crate::relay::RelayConfig;
use crate::{ProxyError, Result};
use rotor_pool::PoolManager;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the proxy listener.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Listening address.
    /// Default: `127.0.0.1:8080`
    pub bind_addr: SocketAddr,

    /// Client idle timeout, also used for each relay read/write.
    /// Default: 30 seconds
    pub idle_timeout: Duration,

    /// Bound on the backend TCP connect and on the SOCKS5 handshake.
    /// Default: 5 seconds
    pub dial_timeout: Duration,

    /// How long a finished connection waits for each relay direction.
    /// Default: 30 seconds
    pub relay_join_timeout: Duration,

    /// Origin-form path that triggers a rotation instead of being proxied.
    /// Default: `/rotate`
    pub control_path: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".parse().expect("hardcoded loopback address"),
            idle_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(5),
            relay_join_timeout: Duration::from_secs(30),
            control_path: "/rotate".to_string(),
        }
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<tokio::task::JoinHandle<Result<()>>>,
    relays: CancellationToken,
    bind_addr: SocketAddr,
}

impl ProxyHandle {
    /// Check if the server is still running.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop accepting and cancel every in-flight relay.
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`. If the accept task does
    /// not respond within 2 seconds it is left to finish on its own.
    pub async fn shutdown(mut self) -> Result<()> {
        self.relays.cancel();

        let signal_sent = if let Some(tx) = self.shutdown_tx.take() {
            tx.send(()).is_ok()
        } else {
            false
        };

        if let Some(handle) = self.join_handle.take() {
            if signal_sent {
                match tokio::time::timeout(Duration::from_secs(2), handle).await {
                    Ok(Ok(Err(e))) => warn!(error = %e, "proxy task ended with error"),
                    Ok(_) => {}
                    Err(_) => debug!("proxy task did not stop within 2s"),
                }
            } else {
                handle.abort();
            }
        }

        Ok(())
    }

    /// The address actually bound (resolves port 0).
    pub fn proxy_addr(&self) -> SocketAddr {
        self.bind_addr
    }
}

/// The local forward proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    pool: Arc<PoolManager>,
}

impl ProxyServer {
    /// Create a new proxy server over `pool`.
    ///
    /// # Errors
    /// * `ProxyError::Config` - the control path is not an origin-form path
    pub fn new(config: ProxyConfig, pool: Arc<PoolManager>) -> Result<Self> {
        if !config.control_path.starts_with('/') {
            return Err(ProxyError::Config(format!(
                "control path must start with '/': {:?}",
                config.control_path
            )));
        }
        Ok(Self { config, pool })
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// # Errors
    /// * `ProxyError::Bind` - the listening address is unavailable
    pub async fn start(self) -> Result<ProxyHandle> {
        // Pre-bind so the actual OS-assigned port is known immediately.
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: self.config.bind_addr,
                source: e,
            })?;
        let bind_addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: self.config.bind_addr,
            source: e,
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let relays = CancellationToken::new();
        let handler = Arc::new(self.handler(relays.clone()));

        let join_handle = tokio::spawn(async move {
            tokio::select! {
                result = accept_loop(listener, handler) => result,
                _ = shutdown_rx => Ok(()),
            }
        });
        info!(addr = %bind_addr, "proxy listening");

        Ok(ProxyHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
            relays,
            bind_addr,
        })
    }

    fn handler(&self, relays: CancellationToken) -> ConnectionHandler {
        ConnectionHandler::new(
            Arc::clone(&self.pool),
            BackendDialer::new(self.config.dial_timeout),
            RelayConfig {
                idle_timeout: self.config.idle_timeout,
                join_timeout: self.config.relay_join_timeout,
            },
            self.config.control_path.clone(),
            relays,
        )
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<ConnectionHandler>) -> Result<()> {
    loop {
        let (client, client_addr) = match listener.accept().await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "TCP accept error");
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            match handler.handle(client).await {
                Ok(Outcome::Relayed(stats)) => debug!(
                    client = %client_addr,
                    up = stats.client_to_backend,
                    down = stats.backend_to_client,
                    "connection closed"
                ),
                Ok(Outcome::Rotated) => info!(client = %client_addr, "rotation requested"),
                Ok(outcome) => debug!(client = %client_addr, ?outcome, "connection closed"),
                Err(e) => debug!(client = %client_addr, error = %e, "connection error"),
            }
        });
    }
}
