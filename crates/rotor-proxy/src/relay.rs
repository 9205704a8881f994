//! Full-duplex byte pump between a client and its backend tunnel.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Chunk size of each directional copy.
pub const BUFFER_SIZE: usize = 8 * 1024;

/// Relay timing.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// A pump stops if a single read or write makes no progress for this long.
    pub idle_timeout: Duration,
    /// How long [`relay`] waits for each pump before returning.
    pub join_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(30),
        }
    }
}

/// Bytes moved in each direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Pump bytes both ways until either side closes, errors, idles out, or
/// `shutdown` fires.
///
/// Whichever pump stops first shuts down the write half it owned and tears
/// down the opposite pump, so the other direction never waits on a dead
/// peer. Each pump is awaited for at most `join_timeout`; a pump still
/// running after that keeps going detached until its own timeout fires.
pub async fn relay(
    client: TcpStream,
    backend: TcpStream,
    config: RelayConfig,
    shutdown: &CancellationToken,
) -> RelayStats {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();
    let teardown = shutdown.child_token();

    let upstream = tokio::spawn(pump(
        client_read,
        backend_write,
        config.idle_timeout,
        teardown.clone(),
        "client->backend",
    ));
    let downstream = tokio::spawn(pump(
        backend_read,
        client_write,
        config.idle_timeout,
        teardown,
        "backend->client",
    ));

    let mut stats = RelayStats::default();
    match tokio::time::timeout(config.join_timeout, upstream).await {
        Ok(Ok(n)) => stats.client_to_backend = n,
        Ok(Err(e)) => debug!(error = %e, "upstream pump panicked"),
        Err(_) => debug!("upstream pump still running after join bound"),
    }
    match tokio::time::timeout(config.join_timeout, downstream).await {
        Ok(Ok(n)) => stats.backend_to_client = n,
        Ok(Err(e)) => debug!(error = %e, "downstream pump panicked"),
        Err(_) => debug!("downstream pump still running after join bound"),
    }
    stats
}

async fn pump(
    mut source: OwnedReadHalf,
    mut destination: OwnedWriteHalf,
    idle_timeout: Duration,
    teardown: CancellationToken,
    direction: &'static str,
) -> u64 {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = tokio::select! {
            _ = teardown.cancelled() => break,
            read = tokio::time::timeout(idle_timeout, source.read(&mut buf)) => match read {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    trace!(direction, error = %e, "read failed");
                    break;
                }
                Err(_) => {
                    trace!(direction, "idle timeout");
                    break;
                }
            },
        };
        tokio::select! {
            _ = teardown.cancelled() => break,
            written = tokio::time::timeout(idle_timeout, destination.write_all(&buf[..n])) => match written {
                Ok(Ok(())) => total += n as u64,
                Ok(Err(e)) => {
                    trace!(direction, error = %e, "write failed");
                    break;
                }
                Err(_) => {
                    trace!(direction, "write stalled");
                    break;
                }
            },
        }
    }
    // Best-effort: the peer may already be gone.
    let _ = destination.shutdown().await;
    teardown.cancel();
    total
}
