//! SOCKS5 client handshake against a local backend circuit.
//!
//! Only the subset the backends need: no-auth negotiation and a
//! domain-addressed CONNECT. Hostnames are always sent as ATYP 3 so the
//! circuit, not this host, resolves them.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// SOCKS5 protocol bytes (RFC 1928).
#[allow(dead_code)]
pub mod socks5 {
    pub const VERSION: u8 = 0x05;
    pub const METHOD_NO_AUTH: u8 = 0x00;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;

    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const CONNECTION_NOT_ALLOWED: u8 = 0x02;
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const TTL_EXPIRED: u8 = 0x06;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// Why a backend dial failed.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("backend SOCKS port {port} unreachable: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("backend on port {port} did not answer within {timeout:?}")]
    Timeout { port: u16, timeout: Duration },

    #[error("backend refused no-auth negotiation (method {0:#04x})")]
    Negotiation(u8),

    #[error("backend rejected CONNECT with reply {0:#04x}")]
    Rejected(u8),

    #[error("malformed SOCKS5 reply: {0}")]
    Malformed(String),

    #[error("hostname {0:?} cannot be sent as a SOCKS5 domain")]
    InvalidHost(String),

    #[error("SOCKS5 handshake I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dials targets through a backend's SOCKS5 port on loopback.
#[derive(Debug, Clone, Copy)]
pub struct BackendDialer {
    /// Bound on the TCP connect and, separately, on the handshake.
    pub timeout: Duration,
}

impl Default for BackendDialer {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl BackendDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Open a tunnel to `host:port` through the backend listening on
    /// `127.0.0.1:backend_port`.
    ///
    /// On failure the socket is dropped (closed) before returning.
    pub async fn dial(
        &self,
        host: &str,
        port: u16,
        backend_port: u16,
    ) -> Result<TcpStream, DialError> {
        let request = connect_request(host, port)?;

        let mut stream =
            tokio::time::timeout(self.timeout, TcpStream::connect(("127.0.0.1", backend_port)))
                .await
                .map_err(|_| DialError::Timeout {
                    port: backend_port,
                    timeout: self.timeout,
                })?
                .map_err(|source| DialError::Connect {
                    port: backend_port,
                    source,
                })?;
        stream.set_nodelay(true).ok();

        tokio::time::timeout(self.timeout, handshake(&mut stream, &request))
            .await
            .map_err(|_| DialError::Timeout {
                port: backend_port,
                timeout: self.timeout,
            })??;
        Ok(stream)
    }
}

/// Encode a CONNECT request for a domain target.
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 5  |  1  |   0   |  3   | len+host |  2 (BE)  |
/// +----+-----+-------+------+----------+----------+
/// ```
pub fn connect_request(host: &str, port: u16) -> Result<Vec<u8>, DialError> {
    let len = u8::try_from(host.len()).map_err(|_| DialError::InvalidHost(host.to_string()))?;
    if len == 0 || !host.is_ascii() {
        return Err(DialError::InvalidHost(host.to_string()));
    }
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[
        socks5::VERSION,
        socks5::CMD_CONNECT,
        0x00,
        socks5::ATYP_DOMAIN,
        len,
    ]);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

async fn handshake(stream: &mut TcpStream, request: &[u8]) -> Result<(), DialError> {
    stream
        .write_all(&[socks5::VERSION, 1, socks5::METHOD_NO_AUTH])
        .await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != socks5::VERSION {
        return Err(DialError::Malformed(format!("greeting version {:#04x}", choice[0])));
    }
    if choice[1] != socks5::METHOD_NO_AUTH {
        return Err(DialError::Negotiation(choice[1]));
    }

    stream.write_all(request).await?;
    read_reply(stream).await
}

/// Consume a complete CONNECT reply, whatever the bound address type.
async fn read_reply(stream: &mut TcpStream) -> Result<(), DialError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != socks5::VERSION {
        return Err(DialError::Malformed(format!("reply version {:#04x}", header[0])));
    }
    if header[1] != socks5::SUCCEEDED {
        return Err(DialError::Rejected(header[1]));
    }
    let remaining = match header[3] {
        socks5::ATYP_IPV4 => 4 + 2,
        socks5::ATYP_IPV6 => 16 + 2,
        socks5::ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        other => {
            return Err(DialError::Malformed(format!("bound address type {other:#04x}")));
        }
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;
    Ok(())
}
