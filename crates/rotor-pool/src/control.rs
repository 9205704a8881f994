//! Authenticated control channel to a backend circuit.
//!
//! The control port speaks a line-oriented protocol: every command is a
//! single CRLF-terminated line, every reply is one or more lines carrying a
//! three-digit status code. Only two operations are needed here:
//!
//! ```text
//! AUTHENTICATE "<secret>"                  -> 250 OK
//! SIGNAL NEWNYM                            -> 250 OK
//! GETINFO status/circuit-established       -> 250-status/circuit-established=1
//!                                             250 OK
//! ```
//!
//! Reply line shapes: `250-...` (more lines follow), `250+...` (a data block
//! terminated by a lone `.` follows), `250 ...` (final line).

use rand::RngCore;
use sha1::{Digest, Sha1};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Longest reply line accepted before the peer is considered broken.
const MAX_LINE: usize = 4096;

/// S2K count indicator used for hashed control secrets (65536 bytes hashed).
const S2K_INDICATOR: u8 = 0x60;
const S2K_EXPBIAS: u32 = 6;

/// Errors from control-channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Could not reach the control port.
    #[error("control port {port} unreachable: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure mid-conversation.
    #[error("control channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend answered with a non-250 status.
    #[error("control command rejected: {code} {message}")]
    Rejected { code: String, message: String },

    /// The reply did not follow the line protocol.
    #[error("malformed control reply: {0}")]
    Malformed(String),

    /// The operation did not complete in time.
    #[error("control operation timed out")]
    Timeout,
}

/// A connected control-channel session.
pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    /// Connect to the control port on loopback.
    ///
    /// # Errors
    /// * `ControlError::Connect` - nothing accepted the connection
    /// * `ControlError::Timeout` - the connect did not finish within `timeout`
    pub async fn connect(port: u16, timeout: Duration) -> Result<Self, ControlError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port)))
            .await
            .map_err(|_| ControlError::Timeout)?
            .map_err(|source| ControlError::Connect { port, source })?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    /// Authenticate with the plaintext secret whose hash the backend was launched with.
    pub async fn authenticate(&mut self, secret: &str) -> Result<(), ControlError> {
        let command = format!("AUTHENTICATE \"{}\"", quote(secret));
        self.command(&command).await.map(|_| ())
    }

    /// Ask the backend to switch to fresh circuits (a new exit identity).
    pub async fn signal_new_identity(&mut self) -> Result<(), ControlError> {
        self.command("SIGNAL NEWNYM").await.map(|_| ())
    }

    /// Query whether the backend reports an established circuit.
    pub async fn circuit_established(&mut self) -> Result<bool, ControlError> {
        let lines = self.command("GETINFO status/circuit-established").await?;
        let value = lines
            .iter()
            .find_map(|line| line.strip_prefix("status/circuit-established="))
            .ok_or_else(|| {
                ControlError::Malformed("missing status/circuit-established".to_string())
            })?;
        Ok(value.trim() == "1")
    }

    /// Send one command and collect the payload of every `250` reply line.
    async fn command(&mut self, command: &str) -> Result<Vec<String>, ControlError> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;

        let mut payload = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.len() < 4 || !line.as_bytes()[..4].is_ascii() {
                return Err(ControlError::Malformed(line));
            }
            let (code, rest) = line.split_at(3);
            let separator = rest.as_bytes()[0];
            let body = rest[1..].to_string();

            if code != "250" {
                return Err(ControlError::Rejected {
                    code: code.to_string(),
                    message: body,
                });
            }

            match separator {
                b' ' => {
                    payload.push(body);
                    return Ok(payload);
                }
                b'-' => payload.push(body),
                b'+' => {
                    payload.push(body);
                    // Data block: consume until the lone "." terminator.
                    loop {
                        let data = self.read_line().await?;
                        if data == "." {
                            break;
                        }
                        payload.push(data);
                    }
                }
                _ => return Err(ControlError::Malformed(line)),
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, ControlError> {
        let mut line = String::new();
        let n = (&mut self.reader)
            .take(MAX_LINE as u64)
            .read_line(&mut line)
            .await?;
        if n == 0 {
            return Err(ControlError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "control channel closed",
            )));
        }
        if !line.ends_with('\n') {
            return Err(ControlError::Malformed("reply line too long".to_string()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

fn quote(secret: &str) -> String {
    secret.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Generate a fresh random control secret (32 hex characters).
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a control secret into the form the backend's
/// `HashedControlPassword` option expects, using a random salt.
pub fn hash_secret(secret: &str) -> String {
    let mut salt = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut salt);
    hash_secret_with_salt(secret, salt)
}

/// Salted, iterated SHA-1 (OpenPGP S2K) rendered as `16:<salt><indicator><digest>`.
pub fn hash_secret_with_salt(secret: &str, salt: [u8; 8]) -> String {
    let count = (16usize + usize::from(S2K_INDICATOR & 15))
        << (u32::from(S2K_INDICATOR >> 4) + S2K_EXPBIAS);

    let mut input = salt.to_vec();
    input.extend_from_slice(secret.as_bytes());

    let mut hasher = Sha1::new();
    let mut remaining = count;
    while remaining > 0 {
        let n = remaining.min(input.len());
        hasher.update(&input[..n]);
        remaining -= n;
    }
    let digest = hasher.finalize();

    format!(
        "16:{}{}{}",
        hex::encode_upper(salt),
        hex::encode_upper([S2K_INDICATOR]),
        hex::encode_upper(digest)
    )
}
