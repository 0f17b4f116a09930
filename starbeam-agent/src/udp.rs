//! Per-channel UDP relays: one socket per media channel, bridging the local
//! streaming host's UDP endpoints to the relay server's ingress ports.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use starbeam_proto::relay::{ChannelKind, PortAssignment, UdpChannelAckMessage, UdpChannelSetupMessage};

/// Streaming-host UDP port offsets from the base port.
pub const UDP_CONTROL_PORT_OFFSET: u16 = 8;
pub const UDP_VIDEO_PORT_OFFSET: u16 = 9;
pub const UDP_AUDIO_PORT_OFFSET: u16 = 10;

/// Datagram buffer size; one full UDP payload.
const RELAY_BUFFER_SIZE: usize = 65535;

#[derive(Debug, Clone)]
struct RelayTarget {
    host: String,
    video_port: u16,
    audio_port: u16,
    control_port: u16,
}

struct ChannelRecord {
    local_port: u16,
    running: Arc<AtomicBool>,
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

/// Owns the per-channel relay sockets. Configured once per registration with
/// the relay's UDP ingress ports; channels are created lazily on the first
/// `udp_channel_setup` for their kind and live until [`ChannelManager::shutdown`].
pub struct ChannelManager {
    base_port: u16,
    running: AtomicBool,
    relay: std::sync::Mutex<Option<RelayTarget>>,
    channels: Mutex<HashMap<ChannelKind, ChannelRecord>>,
}

impl ChannelManager {
    pub fn new(base_port: u16) -> Self {
        Self {
            base_port,
            running: AtomicBool::new(false),
            relay: std::sync::Mutex::new(None),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Record the relay's UDP ingress endpoints and accept channel setups.
    /// A manager that is already running keeps its existing configuration.
    pub fn configure(&self, relay_host: &str, ports: &PortAssignment) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.relay.lock().unwrap() = Some(RelayTarget {
            host: relay_host.to_string(),
            video_port: ports.video,
            audio_port: ports.audio,
            control_port: ports.control,
        });
        log::info!(
            "UDP relay configured for {relay_host} (video:{} audio:{} control:{})",
            ports.video,
            ports.audio,
            ports.control
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// OS-assigned local port of a channel, 0 if the channel doesn't exist.
    pub async fn local_port(&self, kind: ChannelKind) -> u16 {
        self.channels
            .lock()
            .await
            .get(&kind)
            .map(|record| record.local_port)
            .unwrap_or(0)
    }

    /// Create (or look up) the relay channel for a setup request. Safe to
    /// call concurrently; repeated setups for the same channel return the
    /// existing ports. Failures are signalled with zero ports in the ack.
    pub async fn handle_channel_setup(&self, setup: UdpChannelSetupMessage) -> UdpChannelAckMessage {
        let mut ack = UdpChannelAckMessage {
            session_id: setup.session_id,
            channel: setup.channel,
            relay_port: 0,
            local_port: 0,
        };

        if !self.is_running() {
            log::error!("rejecting {} channel setup: relay not configured", setup.channel);
            return ack;
        }

        let target = match self.relay.lock().unwrap().clone() {
            Some(target) => target,
            None => return ack,
        };

        let relay_port = match setup.channel {
            ChannelKind::Video => target.video_port,
            ChannelKind::Audio => target.audio_port,
            ChannelKind::Control => target.control_port,
        };
        let streaming_port = self.base_port
            + match setup.channel {
                ChannelKind::Video => UDP_VIDEO_PORT_OFFSET,
                ChannelKind::Audio => UDP_AUDIO_PORT_OFFSET,
                ChannelKind::Control => UDP_CONTROL_PORT_OFFSET,
            };

        let mut channels = self.channels.lock().await;

        if let Some(record) = channels.get(&setup.channel) {
            ack.relay_port = relay_port;
            ack.local_port = record.local_port;
            return ack;
        }

        let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                log::error!("failed to bind {} channel socket: {err}", setup.channel);
                return ack;
            }
        };
        let local_port = match socket.local_addr() {
            Ok(addr) => addr.port(),
            Err(err) => {
                log::error!("failed to read {} channel socket address: {err}", setup.channel);
                return ack;
            }
        };

        let relay_addr = match lookup_host((target.host.as_str(), relay_port)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    log::error!("relay host {} resolved to no addresses", target.host);
                    return ack;
                }
            },
            Err(err) => {
                log::error!("failed to resolve relay host {}: {err}", target.host);
                return ack;
            }
        };
        let streaming_addr = SocketAddr::from(([127, 0, 0, 1], streaming_port));

        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_channel(
            Arc::clone(&socket),
            relay_addr,
            streaming_addr,
            Arc::clone(&running),
            setup.channel,
        ));

        log::info!(
            "created {} channel (local:{local_port} -> relay:{relay_port})",
            setup.channel
        );

        channels.insert(
            setup.channel,
            ChannelRecord {
                local_port,
                running,
                socket,
                task,
            },
        );

        ack.relay_port = relay_port;
        ack.local_port = local_port;
        ack
    }

    /// Stop all forwarders, close their sockets and drop the records.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);

        let mut channels = self.channels.lock().await;
        for (kind, record) in channels.drain() {
            record.running.store(false, Ordering::Release);
            record.task.abort();
            let _ = record.task.await;
            drop(record.socket);
            log::debug!("closed {kind} channel (local:{})", record.local_port);
        }

        log::info!("UDP relay shut down");
    }
}

/// Forwarder loop for one channel. Datagrams from the relay endpoint go to
/// the streaming host; everything else (the streaming host's traffic) goes
/// to the relay.
async fn run_channel(
    socket: Arc<UdpSocket>,
    relay_addr: SocketAddr,
    streaming_addr: SocketAddr,
    running: Arc<AtomicBool>,
    kind: ChannelKind,
) {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    while running.load(Ordering::Acquire) {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                if running.load(Ordering::Acquire) {
                    log::warn!("{kind} channel receive error: {err}");
                }
                break;
            }
        };

        let dest = if src == relay_addr {
            streaming_addr
        } else {
            relay_addr
        };

        if let Err(err) = socket.send_to(&buf[..len], dest).await {
            log::warn!("{kind} channel send error: {err}");
        }
    }
}
