use crate::error::{Error, Result};
use crate::remote::{RemoteCommand, RemoteTarget};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Token a server answers a rejected login with
pub const AUTH_FAILED_ID: i32 = -1;

/// Packet type of a command response
pub const SERVERDATA_RESPONSE_VALUE: i32 = 0;
/// Packet type of a command request
pub const SERVERDATA_EXECCOMMAND: i32 = 2;
/// Packet type of a login answer (shares its value with `SERVERDATA_EXECCOMMAND`)
pub const SERVERDATA_AUTH_RESPONSE: i32 = 2;
/// Packet type of a login request
pub const SERVERDATA_AUTH: i32 = 3;

// id + type + two terminating nulls
const MIN_PACKET_SIZE: i32 = 10;
const MAX_PACKET_SIZE: i32 = 8192;

const AUTH_REQUEST_ID: i32 = 1;
const COMMAND_REQUEST_ID: i32 = 2;

/// One Source RCON packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconPacket {
    /// Client chosen request id, echoed in responses
    pub id: i32,
    /// Packet type
    pub kind: i32,
    /// ASCII payload
    pub body: String,
}

impl RconPacket {
    /// Create a packet
    pub fn new(id: i32, kind: i32, body: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            body: body.into(),
        }
    }

    /// Encode as `size, id, type, body\0, \0` with little-endian integers
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let size = (body.len() + MIN_PACKET_SIZE as usize) as i32;

        let mut buf = Vec::with_capacity(size as usize + 4);
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    /// Read one packet from `reader`
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let size = reader
            .read_i32_le()
            .await
            .map_err(|e| Error::Communication(format!("Failed to read packet size: {}", e)))?;

        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
            return Err(Error::Communication(format!("Invalid packet size: {}", size)));
        }

        let mut payload = vec![0u8; size as usize];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| Error::Communication(format!("Failed to read packet: {}", e)))?;

        Self::decode_payload(&payload)
    }

    fn decode_payload(payload: &[u8]) -> Result<Self> {
        let id = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let kind = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);

        // Body runs up to the first null; some servers omit the second one
        let body = &payload[8..];
        let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
        let body = String::from_utf8_lossy(&body[..end]).into_owned();

        Ok(Self { id, kind, body })
    }

    async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer
            .write_all(&self.encode())
            .await
            .map_err(|e| Error::Communication(format!("Failed to write packet: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Communication(format!("Failed to flush packet: {}", e)))
    }
}

/// Source RCON client.
///
/// Every [`send`](RemoteCommand::send) opens a fresh connection, logs in,
/// runs one command and closes. The whole exchange is bounded by the
/// configured timeout; there are no retries.
///
/// # Example
///
/// ```no_run
/// use gameserver_runner::remote::{RconClient, RemoteCommand, RemoteTarget};
/// use std::time::Duration;
///
/// # async fn run() -> gameserver_runner::Result<()> {
/// let client = RconClient::new(Duration::from_secs(5));
/// let target = RemoteTarget::new("127.0.0.1", 27020, "admin-password");
/// let response = client.send("listplayers", &target).await?;
/// println!("{}", response);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RconClient {
    timeout: Duration,
}

impl RconClient {
    /// Create a client with the given round trip bound
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Round trip bound
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn exchange(&self, command: &str, target: &RemoteTarget) -> Result<String> {
        let mut stream = TcpStream::connect((target.address.as_str(), target.port))
            .await
            .map_err(|e| Error::ConnectionRefused(format!("{}: {}", target, e)))?;

        RconPacket::new(AUTH_REQUEST_ID, SERVERDATA_AUTH, target.secret.as_str())
            .write_to(&mut stream)
            .await?;

        // An empty response value may precede the auth response
        loop {
            let packet = RconPacket::read_from(&mut stream).await?;
            if packet.kind != SERVERDATA_AUTH_RESPONSE {
                continue;
            }
            if packet.id == AUTH_FAILED_ID {
                tracing::warn!(target = %target, "RCON login rejected");
                return Err(Error::AuthFailed);
            }
            break;
        }

        RconPacket::new(COMMAND_REQUEST_ID, SERVERDATA_EXECCOMMAND, command)
            .write_to(&mut stream)
            .await?;

        let response = loop {
            let packet = RconPacket::read_from(&mut stream).await?;
            if packet.id == COMMAND_REQUEST_ID && packet.kind == SERVERDATA_RESPONSE_VALUE {
                break packet.body;
            }
        };

        let _ = stream.shutdown().await;
        Ok(response)
    }
}

#[async_trait]
impl RemoteCommand for RconClient {
    #[tracing::instrument(skip(self, target), fields(target = %target))]
    async fn send(&self, command: &str, target: &RemoteTarget) -> Result<String> {
        tracing::debug!("Sending remote command");
        let response = tokio::time::timeout(self.timeout, self.exchange(command, target))
            .await
            .map_err(|_| {
                tracing::warn!(timeout = ?self.timeout, "Remote command timed out");
                Error::Timeout(format!("'{}' to {} after {:?}", command, target, self.timeout))
            })??;

        tracing::debug!(response_len = response.len(), "Remote command answered");
        Ok(response)
    }
}
