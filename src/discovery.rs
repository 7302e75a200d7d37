//! UDP discovery listener.
//! Tuya devices announce themselves on UDP 6666 (plaintext, older firmware) and
//! 6667 (encrypted with the universal key). The listener decodes those
//! broadcasts with the frame codec and reports what it hears.

use crate::codec::FrameCodec;
use crate::crypto::{KEY_LEN, md5};
use crate::error::{Result, TuyaError};
use crate::protocol::Version;
use futures_core::stream::Stream;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

pub const PLAIN_PORT: u16 = 6666;
pub const ENCRYPTED_PORT: u16 = 6667;

/// Public passphrase the universal discovery key is derived from.
const UDP_PASSPHRASE: &[u8] = b"yGAdlopoPVldABfn";
const EVENT_CAPACITY: usize = 64;
const RECV_BUFFER_SIZE: usize = 4096;

static UNIVERSAL_KEY: OnceLock<[u8; KEY_LEN]> = OnceLock::new();

/// Key shared by every device for discovery broadcasts.
pub fn universal_key() -> &'static [u8; KEY_LEN] {
    UNIVERSAL_KEY.get_or_init(|| md5(UDP_PASSPHRASE))
}

/// A device announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMessage {
    pub ip: String,
    pub gw_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<i64>,
    /// Spelled this way on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ablilty: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt: Option<bool>,
    #[serde(default)]
    pub product_key: String,
    pub version: String,
}

impl DiscoveryMessage {
    /// Announced version, if this crate speaks it.
    pub fn protocol_version(&self) -> Option<Version> {
        self.version.parse().ok()
    }
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Broadcast(DiscoveryMessage),
    /// Datagram received on the plaintext port, before decoding
    RawPlain(Vec<u8>),
    /// Datagram received on the encrypted port, before decoding
    RawEncrypted(Vec<u8>),
    Error(TuyaError),
}

/// Decode one broadcast datagram.
pub fn parse_broadcast(codec: &FrameCodec, data: &[u8]) -> Result<DiscoveryMessage> {
    let msg = codec.decode(data)?;
    Ok(serde_json::from_slice(&msg.payload)?)
}

/// Listener for device broadcasts on the plaintext and encrypted ports.
pub struct Discovery {
    plain_codec: FrameCodec,
    encrypted_codec: FrameCodec,
    plain_port: u16,
    encrypted_port: u16,
    bind_ip: IpAddr,
    events: broadcast::Sender<DiscoveryEvent>,
    running: Mutex<Option<(CancellationToken, Vec<SocketAddr>)>>,
}

impl Discovery {
    /// Listener that decrypts with the universal key.
    pub fn new() -> Result<Self> {
        Self::build(FrameCodec::new(Version::V3_3, universal_key())?)
    }

    /// Listener that tries a per-account key first and falls back to the
    /// universal key.
    pub fn with_key(account_key: &[u8]) -> Result<Self> {
        Self::build(FrameCodec::new(Version::V3_3, account_key)?.with_fallback_key(universal_key())?)
    }

    fn build(encrypted_codec: FrameCodec) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            plain_codec: FrameCodec::new(Version::V3_1, universal_key())?,
            encrypted_codec,
            plain_port: PLAIN_PORT,
            encrypted_port: ENCRYPTED_PORT,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            events,
            running: Mutex::new(None),
        })
    }

    /// Set the ports to listen on. 0 picks a free port.
    pub fn with_ports(mut self, plain: u16, encrypted: u16) -> Self {
        self.plain_port = plain;
        self.encrypted_port = encrypted;
        self
    }

    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Bind both ports and start receiving. A port that cannot be bound is
    /// logged and skipped; failing to bind either is an error.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("Discovery listener already running");
            return Ok(());
        }
        tokio::runtime::Handle::try_current()
            .map_err(|e| TuyaError::Io(format!("no tokio runtime: {}", e)))?;

        let token = CancellationToken::new();
        let mut bound = Vec::new();
        let listeners = [
            (self.plain_port, self.plain_codec.clone(), false),
            (self.encrypted_port, self.encrypted_codec.clone(), true),
        ];

        for (port, codec, encrypted) in listeners {
            let socket = match create_socket(self.bind_ip, port) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Discovery could not bind UDP port {}: {}", port, e);
                    continue;
                }
            };
            if let Ok(addr) = socket.local_addr() {
                info!("Discovery listening on {}", addr);
                bound.push(addr);
            }
            tokio::spawn(listen(
                socket,
                codec,
                encrypted,
                self.events.clone(),
                token.clone(),
            ));
        }

        if bound.is_empty() {
            token.cancel();
            return Err(TuyaError::Io("discovery could not bind any port".into()));
        }
        *running = Some((token, bound));
        Ok(())
    }

    /// Stop receiving and release the ports.
    pub fn stop(&self) {
        if let Some((token, _)) = self.running.lock().take() {
            debug!("Stopping discovery listener");
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Addresses actually bound, plaintext port first.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.running
            .lock()
            .as_ref()
            .map(|(_, addrs)| addrs.clone())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Stream of decoded announcements only.
    pub fn broadcasts(&self) -> impl Stream<Item = DiscoveryMessage> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| match event {
            Ok(DiscoveryEvent::Broadcast(msg)) => Some(msg),
            _ => None,
        })
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Create and configure a UDP socket for a given port.
fn create_socket(ip: IpAddr, port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::new(ip, port);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_reuse_address(true) {
        warn!("Failed to set reuse_address on port {}: {}", port, e);
    }
    if let Err(e) = socket.set_broadcast(true) {
        warn!("Failed to set broadcast on port {}: {}", port, e);
    }

    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

async fn listen(
    socket: UdpSocket,
    codec: FrameCodec,
    encrypted: bool,
    events: broadcast::Sender<DiscoveryEvent>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            res = socket.recv_from(&mut buf) => {
                match res {
                    Ok((len, from)) => {
                        let data = &buf[..len];
                        debug!("Broadcast from {} ({} bytes)", from, len);

                        let raw = data.to_vec();
                        let _ = events.send(if encrypted {
                            DiscoveryEvent::RawEncrypted(raw)
                        } else {
                            DiscoveryEvent::RawPlain(raw)
                        });

                        // Other software may share these ports; undecodable
                        // datagrams are reported, not fatal.
                        let event = match parse_broadcast(&codec, data) {
                            Ok(msg) => DiscoveryEvent::Broadcast(msg),
                            Err(e) => {
                                debug!("Undecodable broadcast from {}: {}", from, e);
                                DiscoveryEvent::Error(e)
                            }
                        };
                        let _ = events.send(event);
                    }
                    Err(e) => {
                        warn!("Discovery receive failed: {}", e);
                        let _ = events.send(DiscoveryEvent::Error(e.into()));
                        break;
                    }
                }
            }
        }
    }
    debug!("Discovery receive task stopped");
}
