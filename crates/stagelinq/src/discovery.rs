//! UDP broadcast discovery of StagelinQ devices.

use crate::codec::{DiscoveryMessage, Token, ACTION_EXIT, ACTION_HOWDY, DISCOVERY_PORT};
use crate::error::Result;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tracing::{debug, trace, warn};

/// A cooperative shutdown flag shared between the announce and receive loops.
#[derive(Clone)]
struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    fn new() -> Self {
        Shutdown(Arc::new(AtomicBool::new(false)))
    }

    fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_signaled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lifecycle state of a discovered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Present,
    Leaving,
}

/// A peer observed on the StagelinQ network.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub ip: IpAddr,
    pub port: u16,
    pub name: String,
    pub software_name: String,
    pub software_version: String,
    pub token: Token,
    pub state: DeviceState,
}

/// A registry mutation delivered to discovery consumers.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Seen(Device),
    Left(Token),
}

/// Static parameters for a discovery session.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub port: u16,
    pub announce_interval: Duration,
    pub device_name: String,
    pub software_name: String,
    pub software_version: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            port: DISCOVERY_PORT,
            announce_interval: Duration::from_secs(1),
            device_name: "nowplaying".to_string(),
            software_name: "nowplaying".to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A running discovery context: owns the UDP socket and the device registry.
pub struct Discovery {
    socket: Arc<UdpSocket>,
    config: DiscoveryConfig,
    local_token: Token,
    registry: Arc<Mutex<HashMap<[u8; 16], Device>>>,
    shutdown: Shutdown,
}

impl Discovery {
    /// Binds the discovery socket and generates a fresh local token.
    pub async fn bind(config: DiscoveryConfig) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", config.port)).await?;
        socket.set_broadcast(true)?;
        debug!(port = config.port, "discovery socket bound");
        Ok(Discovery {
            socket: Arc::new(socket),
            config,
            local_token: Token::generate(),
            registry: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Shutdown::new(),
        })
    }

    pub fn local_token(&self) -> Token {
        self.local_token
    }

    /// Starts the announce loop and the receive loop, returning a channel of
    /// registry events. The stream is lazy and non-restartable: it ends when
    /// `stop()` is called or the Discovery value is dropped.
    pub fn start(&self) -> mpsc::Receiver<DeviceEvent> {
        let (tx, rx) = mpsc::channel(256);

        let announce_socket = self.socket.clone();
        let announce_config = self.config.clone();
        let announce_token = self.local_token;
        let announce_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            announce_loop(announce_socket, announce_config, announce_token, announce_shutdown)
                .await;
        });

        let recv_socket = self.socket.clone();
        let recv_registry = self.registry.clone();
        let recv_token = self.local_token;
        let recv_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            recv_loop(recv_socket, recv_registry, recv_token, recv_shutdown, tx).await;
        });

        rx
    }

    /// Sends a single EXIT datagram and signals both loops to stop.
    pub async fn stop(&self) -> Result<()> {
        send_to_all_broadcasts(
            &self.socket,
            &DiscoveryMessage {
                token: self.local_token,
                source: self.config.device_name.clone(),
                action: ACTION_EXIT.to_string(),
                software_name: self.config.software_name.clone(),
                software_version: self.config.software_version.clone(),
                port: 0,
            },
            self.config.port,
        )
        .await;
        self.shutdown.signal();
        Ok(())
    }

    pub async fn snapshot(&self) -> Vec<Device> {
        self.registry.lock().await.values().cloned().collect()
    }
}

async fn announce_loop(
    socket: Arc<UdpSocket>,
    config: DiscoveryConfig,
    token: Token,
    shutdown: Shutdown,
) {
    let mut ticker = interval(config.announce_interval);
    loop {
        ticker.tick().await;
        if shutdown.is_signaled() {
            return;
        }
        let msg = DiscoveryMessage {
            token,
            source: config.device_name.clone(),
            action: ACTION_HOWDY.to_string(),
            software_name: config.software_name.clone(),
            software_version: config.software_version.clone(),
            port: config.port,
        };
        send_to_all_broadcasts(&socket, &msg, config.port).await;
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    registry: Arc<Mutex<HashMap<[u8; 16], Device>>>,
    local_token: Token,
    shutdown: Shutdown,
    tx: mpsc::Sender<DeviceEvent>,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        if shutdown.is_signaled() {
            return;
        }
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "discovery recv failed");
                continue;
            }
        };
        let parsed = match DiscoveryMessage::decode(&buf[..len]) {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(e) => {
                debug!(error = %e, "malformed discovery datagram dropped");
                continue;
            }
        };
        if parsed.token == local_token {
            continue;
        }
        trace!(action = %parsed.action, source = %parsed.source, "discovery datagram");

        if parsed.action == ACTION_EXIT {
            registry.lock().await.remove(parsed.token.as_bytes());
            let _ = tx.send(DeviceEvent::Left(parsed.token)).await;
            continue;
        }

        let device = Device {
            ip: addr.ip(),
            port: parsed.port,
            name: parsed.source,
            software_name: parsed.software_name,
            software_version: parsed.software_version,
            token: parsed.token,
            state: DeviceState::Present,
        };
        registry
            .lock()
            .await
            .insert(*device.token.as_bytes(), device.clone());
        let _ = tx.send(DeviceEvent::Seen(device)).await;
    }
}

/// Enumerates the broadcast address of every non-loopback interface and
/// sends `msg` to each on `port`. A send failure on one interface does not
/// abort sends to the others.
async fn send_to_all_broadcasts(socket: &UdpSocket, msg: &DiscoveryMessage, port: u16) {
    let encoded = msg.encode();
    let broadcasts = broadcast_addresses();
    if broadcasts.is_empty() {
        debug!("no broadcast-capable interfaces found; falling back to limited broadcast");
        let dest = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)), port);
        if let Err(e) = socket.send_to(&encoded, dest).await {
            warn!(error = %e, %dest, "discovery send failed");
        }
        return;
    }
    for addr in broadcasts {
        let dest = SocketAddr::new(addr, port);
        if let Err(e) = socket.send_to(&encoded, dest).await {
            warn!(error = %e, %dest, "discovery send failed");
        }
    }
}

fn broadcast_addresses() -> Vec<IpAddr> {
    let Ok(ifaces) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };
    ifaces
        .into_iter()
        .filter(|i| !i.is_loopback())
        .filter_map(|i| match i.addr {
            if_addrs::IfAddr::V4(v4) => v4.broadcast.map(IpAddr::V4),
            if_addrs::IfAddr::V6(_) => None,
        })
        .collect()
}

/// Resolves a device's advertised name into a Service-less identity for
/// logging; extracted since name collisions are common in fleets sharing a
/// model.
pub fn describe(device: &Device) -> String {
    format!("{}@{} ({})", device.name, device.ip, hex_token(&device.token))
}

fn hex_token(token: &Token) -> String {
    token.as_bytes().iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discovery_registers_and_removes_device() {
        let announcer = Discovery::bind(DiscoveryConfig {
            port: 0,
            ..DiscoveryConfig::default()
        })
        .await
        .unwrap();
        let listener = Discovery::bind(DiscoveryConfig {
            port: 0,
            ..DiscoveryConfig::default()
        })
        .await
        .unwrap();

        let listener_addr = listener.socket.local_addr().unwrap();
        let mut rx = listener.start();

        let howdy = DiscoveryMessage {
            token: Token([0x01; 16]),
            source: "Test".into(),
            action: ACTION_HOWDY.into(),
            software_name: "tsw".into(),
            software_version: "1.0".into(),
            port: 51338,
        };
        announcer
            .socket
            .send_to(&howdy.encode(), listener_addr)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            DeviceEvent::Seen(device) => {
                assert_eq!(device.token, Token([0x01; 16]));
                assert_eq!(device.name, "Test");
                assert_eq!(device.port, 51338);
            }
            _ => panic!("expected Seen"),
        }

        let exit = DiscoveryMessage {
            action: ACTION_EXIT.into(),
            ..howdy
        };
        announcer
            .socket
            .send_to(&exit.encode(), listener_addr)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, DeviceEvent::Left(t) if t == Token([0x01; 16])));
        assert!(listener.snapshot().await.is_empty());
    }
}
