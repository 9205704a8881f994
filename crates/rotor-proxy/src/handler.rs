//! Per-connection logic: sniff, parse, intercept, dial, relay.
//!
//! ```text
//! peek first bytes
//!       |
//!       +-- 0x04 / 0x05 / other --> close (classified, not served)
//!       |
//!       +-- HTTP verb letter --> read request head
//!                |
//!                +-- GET <control_path> --> rotate pool, answer in place
//!                +-- CONNECT host:port  --> dial, 200, relay
//!                +-- other verbs        --> dial, forward request bytes, relay
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use rotor_pool::identity::display_identity;
use rotor_pool::{PoolManager, RotationKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::dialer::BackendDialer;
use crate::relay::{relay, RelayConfig, RelayStats};
use crate::{ProxyError, Result};

/// Bytes inspected before anything is consumed.
pub const PEEK_SIZE: usize = 4096;

/// Upper bound on a buffered request head.
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Protocol guessed from the first byte a client sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Socks4,
    Socks5,
    Http,
    Unknown,
}

/// Classify a connection by its leading byte.
///
/// HTTP is recognised by the first letter of `GET`, `HEAD`, `POST`,
/// `CONNECT` and `OPTIONS`.
pub fn classify(first_byte: u8) -> Protocol {
    match first_byte {
        0x04 => Protocol::Socks4,
        0x05 => Protocol::Socks5,
        b'G' | b'H' | b'P' | b'C' | b'O' => Protocol::Http,
        _ => Protocol::Unknown,
    }
}

/// How a connection ended, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The client sent nothing.
    Empty,
    /// Classified as a protocol this proxy does not serve.
    Unsupported(Protocol),
    /// Request could not be parsed or named no host; closed without reply.
    Dropped,
    /// The control path was served.
    Rotated,
    /// No backend tunnel could be opened; 502 sent.
    BadGateway,
    /// Bytes were relayed through a backend.
    Relayed(RelayStats),
}

/// Shared, read-only state of every connection.
pub struct ConnectionHandler {
    pool: Arc<PoolManager>,
    dialer: BackendDialer,
    relay: RelayConfig,
    control_path: String,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        pool: Arc<PoolManager>,
        dialer: BackendDialer,
        relay: RelayConfig,
        control_path: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            dialer,
            idle_timeout: relay.idle_timeout,
            relay,
            control_path: control_path.into(),
            shutdown,
        }
    }

    /// Serve one accepted client until the exchange is over.
    ///
    /// # Errors
    /// * `ProxyError::IdleTimeout` - the client went quiet before a request was read
    /// * `ProxyError::Io` - a socket operation failed
    pub async fn handle(&self, mut client: TcpStream) -> Result<Outcome> {
        let mut peeked = [0u8; PEEK_SIZE];
        let n = self.with_idle(client.peek(&mut peeked)).await?;
        if n == 0 {
            return Ok(Outcome::Empty);
        }
        let protocol = classify(peeked[0]);
        if protocol != Protocol::Http {
            return Ok(Outcome::Unsupported(protocol));
        }

        let request = self.read_request(&mut client).await?;
        let Some((method, target)) = parse_request_line(&request) else {
            return Ok(Outcome::Dropped);
        };

        if is_control_request(&method, &target, &self.control_path) {
            let response = rotate_response(&self.pool).await;
            client.write_all(&response).await?;
            return Ok(Outcome::Rotated);
        }

        if method == "CONNECT" {
            let Some((host, port)) = connect_target(&target) else {
                return Ok(Outcome::Dropped);
            };
            let Some(mut backend) = self.dial_or_502(&mut client, &host, port).await? else {
                return Ok(Outcome::BadGateway);
            };
            client.write_all(CONNECT_ESTABLISHED).await?;
            // Anything pipelined after the CONNECT head belongs to the tunnel.
            if let Some(end) = header_end(&request) {
                if end < request.len() {
                    backend.write_all(&request[end..]).await?;
                }
            }
            let stats = relay(client, backend, self.relay, &self.shutdown).await;
            return Ok(Outcome::Relayed(stats));
        }

        let Some((host, port)) = http_target(&target, &request) else {
            return Ok(Outcome::Dropped);
        };
        let Some(mut backend) = self.dial_or_502(&mut client, &host, port).await? else {
            return Ok(Outcome::BadGateway);
        };
        backend.write_all(&request).await?;
        let stats = relay(client, backend, self.relay, &self.shutdown).await;
        Ok(Outcome::Relayed(stats))
    }

    async fn with_idle<T>(
        &self,
        io: impl std::future::Future<Output = std::io::Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.idle_timeout, io)
            .await
            .map_err(|_| ProxyError::IdleTimeout(self.idle_timeout))?
            .map_err(ProxyError::Io)
    }

    /// Consume the request head: until the blank line, EOF, or
    /// [`MAX_REQUEST_SIZE`] bytes.
    async fn read_request(&self, client: &mut TcpStream) -> Result<Vec<u8>> {
        let mut request = Vec::with_capacity(PEEK_SIZE);
        let mut chunk = [0u8; PEEK_SIZE];
        while request.len() < MAX_REQUEST_SIZE {
            let want = chunk.len().min(MAX_REQUEST_SIZE - request.len());
            let n = self.with_idle(client.read(&mut chunk[..want])).await?;
            if n == 0 {
                break;
            }
            request.extend_from_slice(&chunk[..n]);
            if header_end(&request).is_some() {
                break;
            }
        }
        Ok(request)
    }

    /// Dial through the active backend, answering 502 on failure.
    async fn dial_or_502(
        &self,
        client: &mut TcpStream,
        host: &str,
        port: u16,
    ) -> Result<Option<TcpStream>> {
        let backend_port = self.pool.active_port();
        if backend_port == 0 {
            tracing::debug!(host, port, "no active circuit");
            client.write_all(BAD_GATEWAY).await?;
            return Ok(None);
        }
        match self.dialer.dial(host, port, backend_port).await {
            Ok(stream) => Ok(Some(stream)),
            Err(e) => {
                tracing::debug!(host, port, backend_port, error = %e, "backend dial failed");
                client.write_all(BAD_GATEWAY).await?;
                Ok(None)
            }
        }
    }
}

/// Offset just past the `\r\n\r\n` that ends a request head.
fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Split the request line into method and target.
pub fn parse_request_line(request: &[u8]) -> Option<(String, String)> {
    let line_end = request
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(request.len());
    let line = String::from_utf8_lossy(&request[..line_end]);
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    Some((method, target))
}

/// Whether this request is for the in-band control endpoint.
pub fn is_control_request(method: &str, target: &str, control_path: &str) -> bool {
    if method != "GET" || !target.starts_with('/') {
        return false;
    }
    let path = target.split(['?', '#']).next().unwrap_or(target);
    path == control_path
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
fn split_authority(authority: &str) -> Option<(String, Option<u16>)> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after {
            "" => None,
            p => Some(p.strip_prefix(':')?),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => {
                if host.contains(':') {
                    return None;
                }
                (host, Some(port))
            }
            None => (authority, None),
        }
    };
    if host.is_empty() {
        return None;
    }
    let port = match port {
        Some(p) => match p.parse::<u16>() {
            Ok(0) | Err(_) => return None,
            Ok(p) => Some(p),
        },
        None => None,
    };
    Some((host.to_string(), port))
}

/// Target of a `CONNECT`; the port is mandatory.
pub fn connect_target(target: &str) -> Option<(String, u16)> {
    let (host, port) = split_authority(target)?;
    Some((host, port?))
}

/// Target of a plain proxied request: absolute `http://` URI first, then
/// the `Host` header. Port defaults to 80.
pub fn http_target(target: &str, request: &[u8]) -> Option<(String, u16)> {
    if let Some(authority) = absolute_uri_authority(target) {
        if let Some((host, port)) = split_authority(authority) {
            return Some((host, port.unwrap_or(80)));
        }
    }
    let host = host_header(request)?;
    let (host, port) = split_authority(&host)?;
    Some((host, port.unwrap_or(80)))
}

fn absolute_uri_authority(target: &str) -> Option<&str> {
    const SCHEME: &[u8] = b"http://";
    let has_scheme = target
        .as_bytes()
        .get(..SCHEME.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(SCHEME));
    if !has_scheme {
        return None;
    }
    let rest = target.get(SCHEME.len()..)?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    // Drop any userinfo.
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
    (!authority.is_empty()).then_some(authority)
}

fn host_header(request: &[u8]) -> Option<String> {
    let head = String::from_utf8_lossy(request);
    head.split('\n')
        .skip(1)
        .map(|line| line.trim_end_matches('\r'))
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("host")
                .then(|| value.trim().to_string())
        })
        .filter(|value| !value.is_empty())
}

/// Rotate the pool and render the plaintext HTTP answer.
pub async fn rotate_response(pool: &PoolManager) -> Vec<u8> {
    let started = Instant::now();
    let Some(active) = pool.active_instance() else {
        return error_response("No active instance");
    };
    let old_ip = active.get_identity(1, Duration::ZERO).await;
    let Some(rotation) = pool.rotate() else {
        return error_response("No active instance");
    };
    let new_ip = rotation.current.get_identity(1, Duration::ZERO).await;
    let elapsed = started.elapsed().as_secs_f64();

    let body = match rotation.kind {
        RotationKind::Renewed => format!(
            "IP Renewal Started\nOld IP: {}\nPort: {}\nNew IP: {}\nTime: {elapsed:.1}s",
            display_identity(old_ip),
            rotation.current.socks_port(),
            display_identity(new_ip),
        ),
        RotationKind::Switched => format!(
            "IP Rotation Started\nOld IP: {}\nOld Port: {}\nNew Port: {}\nNew IP: {}\nTime: {elapsed:.1}s",
            display_identity(old_ip),
            rotation.previous.socks_port(),
            rotation.current.socks_port(),
            display_identity(new_ip),
        ),
    };
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

fn error_response(message: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{message}",
        message.len()
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rotor_pool::{plan_ports, CircuitConfig, CircuitInstance, PoolConfig};
    use tokio::net::TcpListener;

    async fn tcp_listener_or_skip() -> Option<TcpListener> {
        match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => Some(listener),
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => None,
            Err(err) => panic!("Failed to bind TCP listener for test: {err}"),
        }
    }

    /// A pool whose instances point at the given SOCKS ports. Nothing is spawned.
    fn pool_with_ports(dir: &std::path::Path, socks_ports: &[u16]) -> Arc<PoolManager> {
        let config = PoolConfig {
            size: socks_ports.len(),
            kill_strays: false,
            warmup_attempts: 0,
            warmup_identity_retries: 0,
            circuit: CircuitConfig {
                project_root: dir.to_path_buf(),
                data_root: dir.join("data"),
                identity_url: "http://echo.test/".to_string(),
                lookup_timeout: Duration::from_millis(300),
                control_timeout: Duration::from_millis(200),
                ..CircuitConfig::default()
            },
            ..PoolConfig::default()
        };
        let circuit = Arc::new(config.circuit.clone());
        let control_ports = plan_ports(socks_ports.len(), 45001, 45002).unwrap();
        let instances = socks_ports
            .iter()
            .zip(control_ports)
            .map(|(&socks, ports)| {
                Arc::new(CircuitInstance::new(socks, ports.control, Arc::clone(&circuit)).unwrap())
            })
            .collect();
        Arc::new(PoolManager::with_instances(config, instances))
    }

    /// SOCKS5 backend that accepts every CONNECT, records the first bytes
    /// tunnelled through it, and echoes them back prefixed with `echo:`.
    async fn echo_backend() -> Option<(u16, tokio::task::JoinHandle<(Vec<u8>, Vec<u8>)>)> {
        let listener = tcp_listener_or_skip().await?;
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            socket.write_all(&[0x05, 0x00]).await.unwrap();
            let mut head = [0u8; 5];
            socket.read_exact(&mut head).await.unwrap();
            let mut rest = vec![0u8; head[4] as usize + 2];
            socket.read_exact(&mut rest).await.unwrap();
            socket
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
                .await
                .unwrap();

            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(&buf[..n]);
            socket.write_all(&reply).await.unwrap();
            (rest, buf[..n].to_vec())
        });
        Some((port, handle))
    }

    async fn serve_one(handler: Arc<ConnectionHandler>) -> Option<(std::net::SocketAddr, tokio::task::JoinHandle<Result<Outcome>>)> {
        let listener = tcp_listener_or_skip().await?;
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (client, _) = listener.accept().await.unwrap();
            handler.handle(client).await
        });
        Some((addr, task))
    }

    fn handler_for(pool: Arc<PoolManager>) -> Arc<ConnectionHandler> {
        Arc::new(ConnectionHandler::new(
            pool,
            BackendDialer::new(Duration::from_secs(2)),
            RelayConfig {
                idle_timeout: Duration::from_secs(2),
                join_timeout: Duration::from_secs(5),
            },
            "/rotate",
            CancellationToken::new(),
        ))
    }

    async fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out)).await;
        out
    }

    // ========================================================================
    // Classification
    // ========================================================================

    #[test]
    fn test_classify_leading_bytes() {
        assert_eq!(classify(0x04), Protocol::Socks4);
        assert_eq!(classify(0x05), Protocol::Socks5);
        for b in [b'G', b'H', b'P', b'C', b'O'] {
            assert_eq!(classify(b), Protocol::Http);
        }
        for b in [0x00u8, 0x16, b'g', b'D', b'X', 0xff] {
            assert_eq!(classify(b), Protocol::Unknown);
        }
    }

    // ========================================================================
    // Request parsing
    // ========================================================================

    #[test]
    fn test_parse_request_line() {
        let parsed = parse_request_line(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n");
        assert_eq!(parsed, Some(("CONNECT".to_string(), "example.com:443".to_string())));
        assert_eq!(parse_request_line(b"GET\r\n\r\n"), None);
        assert_eq!(parse_request_line(b""), None);
    }

    #[test]
    fn test_connect_target() {
        assert_eq!(connect_target("example.com:443"), Some(("example.com".to_string(), 443)));
        assert_eq!(connect_target("[2001:db8::1]:443"), Some(("2001:db8::1".to_string(), 443)));
        assert_eq!(connect_target("example.com"), None);
        assert_eq!(connect_target("example.com:https"), None);
        assert_eq!(connect_target("example.com:70000"), None);
        assert_eq!(connect_target(":443"), None);
        assert_eq!(connect_target("a:b:443"), None);
    }

    #[test]
    fn test_http_target_absolute_uri() {
        let req = b"GET http://example.com/ HTTP/1.1\r\nHost: other.org\r\n\r\n";
        assert_eq!(http_target("http://example.com/", req), Some(("example.com".to_string(), 80)));
        assert_eq!(
            http_target("http://user:pw@example.com:8080/x?y", req),
            Some(("example.com".to_string(), 8080))
        );
        assert_eq!(http_target("HTTP://Example.com", req), Some(("Example.com".to_string(), 80)));
    }

    #[test]
    fn test_http_target_host_header() {
        let req = b"GET / HTTP/1.1\r\nUser-Agent: t\r\nhOsT:  example.com:8081 \r\n\r\n";
        assert_eq!(http_target("/", req), Some(("example.com".to_string(), 8081)));
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(http_target("/", req), Some(("example.com".to_string(), 80)));
    }

    #[test]
    fn test_http_target_missing_host() {
        assert_eq!(http_target("/", b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n"), None);
        assert_eq!(http_target("/", b"GET / HTTP/1.1\r\nHost: \r\n\r\n"), None);
        // Headers after the blank line are body, not headers.
        assert_eq!(http_target("/", b"POST / HTTP/1.1\r\n\r\nHost: x\r\n"), None);
    }

    #[test]
    fn test_http_target_non_ascii_scheme() {
        let req = "GET http:/\u{e9} HTTP/1.1\r\nHost: example.com\r\n\r\n".as_bytes();
        assert_eq!(http_target("http:/\u{e9}", req), Some(("example.com".to_string(), 80)));
        assert_eq!(http_target("\u{e9}\u{e9}\u{e9}\u{e9}", b"GET / HTTP/1.1\r\n\r\n"), None);
        assert_eq!(absolute_uri_authority("http://\u{e9}x/"), Some("\u{e9}x"));
    }

    #[test]
    fn test_is_control_request() {
        assert!(is_control_request("GET", "/rotate", "/rotate"));
        assert!(is_control_request("GET", "/rotate?now=1", "/rotate"));
        assert!(!is_control_request("POST", "/rotate", "/rotate"));
        assert!(!is_control_request("GET", "/rotate/extra", "/rotate"));
        assert!(!is_control_request("GET", "http://example.com/rotate", "/rotate"));
        assert!(is_control_request("GET", "/switch", "/switch"));
    }

    #[test]
    fn test_header_end() {
        assert_eq!(header_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(header_end(b"GET / HTTP/1.1\r\n"), None);
    }

    // ========================================================================
    // Connection scenarios
    // ========================================================================

    #[tokio::test]
    async fn test_connect_tunnel_established_and_relayed() {
        let dir = tempfile::tempdir().unwrap();
        let Some((backend_port, backend)) = echo_backend().await else {
            return;
        };
        let handler = handler_for(pool_with_ports(dir.path(), &[backend_port]));
        let Some((addr, task)) = serve_one(handler).await else {
            return;
        };

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut established = vec![0u8; CONNECT_ESTABLISHED.len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(established, CONNECT_ESTABLISHED);

        client.write_all(b"hello").await.unwrap();
        let reply = read_to_end(&mut client).await;
        assert_eq!(reply, b"echo:hello");

        let (target, tunnelled) = backend.await.unwrap();
        let mut expected_target = b"example.com".to_vec();
        expected_target.extend_from_slice(&443u16.to_be_bytes());
        assert_eq!(target, expected_target);
        assert_eq!(tunnelled, b"hello");
        assert!(matches!(task.await.unwrap().unwrap(), Outcome::Relayed(_)));
    }

    #[tokio::test]
    async fn test_get_absolute_forwards_original_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let Some((backend_port, backend)) = echo_backend().await else {
            return;
        };
        let handler = handler_for(pool_with_ports(dir.path(), &[backend_port]));
        let Some((addr, task)) = serve_one(handler).await else {
            return;
        };

        let request: &[u8] = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nX-Keep: As-Is\r\n\r\n";
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request).await.unwrap();
        let reply = read_to_end(&mut client).await;

        let (target, forwarded) = backend.await.unwrap();
        let mut expected_target = b"example.com".to_vec();
        expected_target.extend_from_slice(&80u16.to_be_bytes());
        assert_eq!(target, expected_target);
        assert_eq!(forwarded, request);
        let mut expected_reply = b"echo:".to_vec();
        expected_reply.extend_from_slice(request);
        assert_eq!(reply, expected_reply);
        assert!(matches!(task.await.unwrap().unwrap(), Outcome::Relayed(_)));
    }

    #[tokio::test]
    async fn test_connect_backend_down_is_502() {
        let dir = tempfile::tempdir().unwrap();
        let dead_port = {
            let Some(listener) = tcp_listener_or_skip().await else {
                return;
            };
            listener.local_addr().unwrap().port()
        };
        let handler = handler_for(pool_with_ports(dir.path(), &[dead_port]));
        let Some((addr, task)) = serve_one(handler).await else {
            return;
        };

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(read_to_end(&mut client).await, BAD_GATEWAY);
        assert_eq!(task.await.unwrap().unwrap(), Outcome::BadGateway);
    }

    #[tokio::test]
    async fn test_empty_pool_is_502() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_for(pool_with_ports(dir.path(), &[]));
        let Some((addr, task)) = serve_one(handler).await else {
            return;
        };
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(read_to_end(&mut client).await, BAD_GATEWAY);
        assert_eq!(task.await.unwrap().unwrap(), Outcome::BadGateway);
    }

    #[tokio::test]
    async fn test_malformed_connect_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_for(pool_with_ports(dir.path(), &[9]));
        let Some((addr, task)) = serve_one(handler).await else {
            return;
        };
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"CONNECT example.com HTTP/1.1\r\n\r\n").await.unwrap();
        assert!(read_to_end(&mut client).await.is_empty());
        assert_eq!(task.await.unwrap().unwrap(), Outcome::Dropped);
    }

    #[tokio::test]
    async fn test_no_host_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_for(pool_with_ports(dir.path(), &[9]));
        let Some((addr, task)) = serve_one(handler).await else {
            return;
        };
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n").await.unwrap();
        assert!(read_to_end(&mut client).await.is_empty());
        assert_eq!(task.await.unwrap().unwrap(), Outcome::Dropped);
    }

    #[tokio::test]
    async fn test_non_ascii_target_without_host_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_for(pool_with_ports(dir.path(), &[9]));
        let Some((addr, task)) = serve_one(handler).await else {
            return;
        };
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all("GET http:/\u{e9} HTTP/1.1\r\nAccept: */*\r\n\r\n".as_bytes())
            .await
            .unwrap();
        assert!(read_to_end(&mut client).await.is_empty());
        assert_eq!(task.await.unwrap().unwrap(), Outcome::Dropped);
    }

    #[tokio::test]
    async fn test_socks_clients_closed() {
        let dir = tempfile::tempdir().unwrap();
        for (byte, protocol) in [(0x05u8, Protocol::Socks5), (0x04, Protocol::Socks4), (0x16, Protocol::Unknown)] {
            let handler = handler_for(pool_with_ports(dir.path(), &[9]));
            let Some((addr, task)) = serve_one(handler).await else {
                return;
            };
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&[byte, 0x01, 0x00]).await.unwrap();
            assert_eq!(task.await.unwrap().unwrap(), Outcome::Unsupported(protocol));
            assert!(read_to_end(&mut client).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_empty_connection() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_for(pool_with_ports(dir.path(), &[9]));
        let Some((addr, task)) = serve_one(handler).await else {
            return;
        };
        let client = TcpStream::connect(addr).await.unwrap();
        drop(client);
        assert_eq!(task.await.unwrap().unwrap(), Outcome::Empty);
    }

    #[tokio::test]
    async fn test_idle_client_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(ConnectionHandler::new(
            pool_with_ports(dir.path(), &[9]),
            BackendDialer::default(),
            RelayConfig {
                idle_timeout: Duration::from_millis(200),
                join_timeout: Duration::from_secs(1),
            },
            "/rotate",
            CancellationToken::new(),
        ));
        let Some((addr, task)) = serve_one(handler).await else {
            return;
        };
        let _client = TcpStream::connect(addr).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(ProxyError::IdleTimeout(_))));
    }

    // ========================================================================
    // Control endpoint
    // ========================================================================

    #[tokio::test]
    async fn test_rotate_two_instances_advances_index() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with_ports(dir.path(), &[46050, 46052]);
        let handler = handler_for(Arc::clone(&pool));
        let Some((addr, task)) = serve_one(handler).await else {
            return;
        };

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET /rotate HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let response = String::from_utf8(read_to_end(&mut client).await).unwrap();

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/plain\r\n"));
        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
        assert!(body.starts_with("IP Rotation Started\n"));
        assert!(body.contains("Old IP: pending\n"));
        assert!(body.contains("Old Port: 46050\n"));
        assert!(body.contains("New Port: 46052\n"));
        assert!(body.contains("New IP: pending\n"));
        assert!(body.contains("Time: "));
        assert_eq!(pool.active_index(), Some(1));
        assert_eq!(task.await.unwrap().unwrap(), Outcome::Rotated);
    }

    #[tokio::test]
    async fn test_rotate_reports_port_it_rotated_away_from() {
        let dir = tempfile::tempdir().unwrap();
        // Accepts but never answers, so the old-identity lookup runs its full timeout.
        let Some(silent) = tcp_listener_or_skip().await else {
            return;
        };
        let silent_port = silent.local_addr().unwrap().port();
        let pool = pool_with_ports(dir.path(), &[silent_port, 46070, 46072]);

        let response = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { rotate_response(&pool).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let concurrent = pool.rotate().unwrap();
        assert_eq!(concurrent.current.socks_port(), 46070);

        let body = String::from_utf8(response.await.unwrap()).unwrap();
        assert!(body.contains("Old Port: 46070\n"));
        assert!(body.contains("New Port: 46072\n"));
        assert_eq!(pool.active_index(), Some(2));
    }

    #[tokio::test]
    async fn test_rotate_single_instance_renews() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with_ports(dir.path(), &[46060]);
        let body = String::from_utf8(rotate_response(&pool).await).unwrap();
        assert!(body.contains("IP Renewal Started\n"));
        assert!(body.contains("\nPort: 46060\n"));
        assert_eq!(pool.active_index(), Some(0));
    }

    #[tokio::test]
    async fn test_rotate_empty_pool_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool_with_ports(dir.path(), &[]);
        let response = String::from_utf8(rotate_response(&pool).await).unwrap();
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(response.ends_with("\r\n\r\nNo active instance"));
    }
}
