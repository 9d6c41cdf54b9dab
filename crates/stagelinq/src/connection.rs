//! TCP directory + framed channel connections.

use crate::codec::{DirectoryMessage, Token, MESSAGE_HARD_CAP};
use crate::discovery::Device;
use crate::error::{Error, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A service announced by a device during the directory handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub name: String,
    pub port: u16,
}

/// Default bound on the services-request handshake.
pub const SERVICES_TIMEOUT: Duration = Duration::from_secs(5);
/// Keep-alive cadence on an open directory connection.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(250);

/// An open TCP directory connection to a device.
pub struct Connection {
    stream: TcpStream,
    local_token: Token,
    peer_token: Token,
}

impl Connection {
    /// Phase 1: opens the TCP connection to the device's directory port.
    pub async fn connect(device: &Device, local_token: Token) -> Result<Self> {
        let stream = TcpStream::connect((device.ip, device.port)).await?;
        debug!(ip = %device.ip, port = device.port, "connected to device directory port");
        Ok(Connection {
            stream,
            local_token,
            peer_token: device.token,
        })
    }

    /// Phase 2: requests and collects the announced services, bounded by
    /// `timeout`. A timeout returns whatever was collected so far rather
    /// than an error.
    pub async fn discover_services(&mut self, bound: Duration) -> Vec<Service> {
        let request = DirectoryMessage::ServicesRequest {
            token: self.local_token,
        };
        if let Err(e) = self.write_directory_message(&request).await {
            warn!(error = %e, "services-request send failed");
            return Vec::new();
        }

        let mut services = Vec::new();
        let deadline = timeout(bound, async {
            loop {
                match self.read_directory_message().await {
                    Ok(DirectoryMessage::ServiceAnnounce { service, port, .. }) => {
                        services.push(Service { name: service, port });
                    }
                    Ok(DirectoryMessage::Reference { .. }) => break,
                    Ok(DirectoryMessage::ServicesRequest { .. }) => continue,
                    Err(e) => {
                        warn!(error = %e, "directory read failed during services discovery");
                        break;
                    }
                }
            }
        })
        .await;
        if deadline.is_err() {
            debug!("services discovery timed out; returning partial set");
        }
        services
    }

    /// Phase 3: runs the keep-alive loop until the socket errors. Intended
    /// to be spawned as its own task by the caller.
    pub async fn run_keepalive(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        loop {
            ticker.tick().await;
            let reference = DirectoryMessage::Reference {
                token_self: self.local_token,
                token_peer: self.peer_token,
                reference: 0,
            };
            self.write_directory_message(&reference).await?;
        }
    }

    async fn write_directory_message(&mut self, msg: &DirectoryMessage) -> Result<()> {
        self.stream.write_all(&msg.encode()).await?;
        Ok(())
    }

    async fn read_directory_message(&mut self) -> Result<DirectoryMessage> {
        // Directory messages have no outer length prefix; the leading u32
        // discriminant plus fixed-size fields tell us exactly how much to
        // read for each kind.
        let mut kind_buf = [0u8; 4];
        self.stream.read_exact(&mut kind_buf).await?;
        let kind = u32::from_be_bytes(kind_buf);
        match kind {
            0 => {
                let mut token = [0u8; 16];
                self.stream.read_exact(&mut token).await?;
                let service = self.read_wire_string().await?;
                let mut port_buf = [0u8; 2];
                self.stream.read_exact(&mut port_buf).await?;
                Ok(DirectoryMessage::ServiceAnnounce {
                    token: Token(token),
                    service,
                    port: u16::from_be_bytes(port_buf),
                })
            }
            1 => {
                let mut token_self = [0u8; 16];
                self.stream.read_exact(&mut token_self).await?;
                let mut token_peer = [0u8; 16];
                self.stream.read_exact(&mut token_peer).await?;
                let mut reference_buf = [0u8; 8];
                self.stream.read_exact(&mut reference_buf).await?;
                Ok(DirectoryMessage::Reference {
                    token_self: Token(token_self),
                    token_peer: Token(token_peer),
                    reference: i64::from_be_bytes(reference_buf),
                })
            }
            2 => {
                let mut token = [0u8; 16];
                self.stream.read_exact(&mut token).await?;
                Ok(DirectoryMessage::ServicesRequest {
                    token: Token(token),
                })
            }
            other => Err(Error::Protocol(format!(
                "unknown directory message kind 0x{other:02x} while reading"
            ))),
        }
    }

    async fn read_wire_string(&mut self) -> Result<String> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > crate::codec::STRING_SOFT_CAP {
            return Err(Error::Protocol(format!(
                "directory string length {len} exceeds cap"
            )));
        }
        let mut bytes = vec![0u8; len];
        self.stream.read_exact(&mut bytes).await?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units).map_err(|e| Error::Protocol(format!("invalid UTF-16BE: {e}")))
    }
}

/// A generic length-prefixed message reader/writer for non-directory
/// channels (StateMap, BeatInfo, FileTransfer). Enforces the 10 MiB cap and
/// surfaces truncated reads rather than dropping partial bytes.
pub struct FramedChannel {
    stream: TcpStream,
}

impl FramedChannel {
    /// Opens a new TCP connection to an announced service port and sends the
    /// mandatory initial service-announce identifying our ephemeral port.
    pub async fn open(
        ip: std::net::IpAddr,
        port: u16,
        local_token: Token,
        service_name: &str,
        local_port: u16,
    ) -> Result<Self> {
        let mut stream = TcpStream::connect((ip, port)).await?;
        let announce = DirectoryMessage::ServiceAnnounce {
            token: local_token,
            service: service_name.to_string(),
            port: local_port,
        };
        stream.write_all(&announce.encode()).await?;
        Ok(FramedChannel { stream })
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        FramedChannel { stream }
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MESSAGE_HARD_CAP {
            return Err(Error::Protocol(format!(
                "outgoing message of {} bytes exceeds {} byte cap",
                payload.len(),
                MESSAGE_HARD_CAP
            )));
        }
        self.stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        self.stream.write_all(payload).await?;
        Ok(())
    }

    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MESSAGE_HARD_CAP {
            return Err(Error::Protocol(format!(
                "incoming message of {len} bytes exceeds {MESSAGE_HARD_CAP} byte cap"
            )));
        }
        let mut buf = vec![0u8; len];
        match self.stream.read_exact(&mut buf).await {
            Ok(_) => Ok(buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Truncated {
                expected: len,
                actual: 0,
            }),
            Err(e) => Err(Error::from(e)),
        }
    }
}

/// Reconnection supplement: retries discovery-then-connect with a
/// fixed delay, waiting after discovery so the device trusts our token
/// before the first connect attempt. This governs only the outer loop; it
/// does not alter any wire-level invariant of `Connection` itself.
pub mod reconnect {
    use super::*;
    use std::future::Future;

    pub const RETRY_DELAY: Duration = Duration::from_secs(10);
    pub const POST_DISCOVERY_SETTLE: Duration = Duration::from_secs(3);

    /// Drives `connect_fn` in a loop: on failure, sleeps `RETRY_DELAY` and
    /// retries; on first success after a discovery event, waits
    /// `POST_DISCOVERY_SETTLE` before the very first attempt.
    pub async fn run<F, Fut>(mut connect_fn: F) -> Connection
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Connection>>,
    {
        tokio::time::sleep(POST_DISCOVERY_SETTLE).await;
        loop {
            match connect_fn().await {
                Ok(conn) => return conn,
                Err(e) => {
                    warn!(error = %e, "connect failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn framed_channel_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut channel = FramedChannel::from_stream(stream);
            let frame = channel.read_frame().await.unwrap();
            channel.write_frame(&frame).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = FramedChannel::from_stream(stream);
        client.write_frame(b"hello world").await.unwrap();
        let echoed = client.read_frame().await.unwrap();
        assert_eq!(echoed, b"hello world");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn framed_channel_rejects_oversize_outgoing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = FramedChannel::from_stream(stream);
        let oversized = vec![0u8; MESSAGE_HARD_CAP + 1];
        let err = client.write_frame(&oversized).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn framed_channel_surfaces_truncated_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Declare 10 bytes but only send 3, then close.
            stream.write_all(&10u32.to_be_bytes()).await.unwrap();
            stream.write_all(b"abc").await.unwrap();
        });
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = FramedChannel::from_stream(stream);
        let err = client.read_frame().await.unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
        server.await.unwrap();
    }
}
