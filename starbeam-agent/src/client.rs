//! Control-channel client: a persistent, authenticated WebSocket connection
//! to the relay server, with a registration/reconnect state machine and
//! typed dispatch of ingress messages to pluggable handlers.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use url::Url;

use starbeam_proto::relay::{
    HostCapabilities, HttpRequestMessage, HttpResponseMessage, PortAssignment, RegisterMessage,
    RelayMessage, RtspRequestMessage, RtspResponseMessage, SessionEndMessage, SessionStartMessage,
    UdpChannelAckMessage, UdpChannelSetupMessage,
};

use crate::config::AgentConfig;

/// Outbound message queue depth; the writer task drains it.
const OUTBOUND_QUEUE: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Registered = 3,
    Error = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Registered,
            4 => ConnectionState::Error,
            _ => ConnectionState::Disconnected,
        }
    }
}

pub type HttpHandler =
    Arc<dyn Fn(HttpRequestMessage) -> BoxFuture<'static, HttpResponseMessage> + Send + Sync>;
pub type RtspHandler =
    Arc<dyn Fn(RtspRequestMessage) -> BoxFuture<'static, RtspResponseMessage> + Send + Sync>;
pub type SessionStartHandler = Arc<dyn Fn(SessionStartMessage) + Send + Sync>;
pub type SessionEndHandler = Arc<dyn Fn(u64) + Send + Sync>;
pub type UdpChannelSetupHandler =
    Arc<dyn Fn(UdpChannelSetupMessage) -> BoxFuture<'static, UdpChannelAckMessage> + Send + Sync>;
pub type StateChangeHandler = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;
/// Invoked on every successful registration with the relay host (from the
/// server URL) and the assigned ports.
pub type RegisteredHandler = Arc<dyn Fn(&str, &PortAssignment) + Send + Sync>;

#[derive(Default, Clone)]
struct HandlerTable {
    http: Option<HttpHandler>,
    rtsp: Option<RtspHandler>,
    session_start: Option<SessionStartHandler>,
    session_end: Option<SessionEndHandler>,
    udp_channel: Option<UdpChannelSetupHandler>,
    state_change: Option<StateChangeHandler>,
    registered: Option<RegisteredHandler>,
}

#[derive(Default, Clone)]
struct AssignedState {
    host_id: String,
    ports: PortAssignment,
    external_address: Option<String>,
}

struct Shared {
    server_url: String,
    auth_key: String,
    fixed_host_id: Option<String>,
    verify_tls: bool,
    reconnect_interval_secs: AtomicU64,

    hostname: Mutex<String>,
    unique_id: Mutex<String>,

    state: AtomicU8,
    running: AtomicBool,
    assigned: Mutex<AssignedState>,
    handlers: Mutex<HandlerTable>,

    /// Present exactly while a connection epoch is live.
    writer: Mutex<Option<mpsc::Sender<Message>>>,
    /// The live epoch's writer task; every teardown path aborts and joins
    /// it so no task outlives `stop()`.
    writer_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn set_state(&self, new: ConnectionState) {
        let old = ConnectionState::from_u8(self.state.swap(new as u8, Ordering::AcqRel));
        if old != new {
            let handler = self.handlers.lock().unwrap().state_change.clone();
            if let Some(handler) = handler {
                handler(old, new);
            }
        }
    }

    fn clear_assigned(&self) {
        *self.assigned.lock().unwrap() = AssignedState::default();
    }

    async fn join_writer(&self) {
        let task = self.writer_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    fn build_register(&self) -> RegisterMessage {
        RegisterMessage {
            hostname: self.hostname.lock().unwrap().clone(),
            unique_id: self.unique_id.lock().unwrap().clone(),
            auth_key: self.auth_key.clone(),
            host_id: self.fixed_host_id.clone(),
            capabilities: HostCapabilities {
                video_codecs: vec!["H264".into(), "HEVC".into(), "AV1".into()],
                audio_codecs: vec!["opus".into()],
                ..Default::default()
            },
        }
    }
}

struct RelayTarget {
    host: String,
    use_tls: bool,
}

impl RelayTarget {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("invalid relay URL '{raw}'"))?;
        let use_tls = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => bail!("unsupported relay URL scheme '{other}'"),
        };
        let host = url
            .host_str()
            .with_context(|| format!("relay URL '{raw}' has no host"))?
            .to_string();
        Ok(Self { host, use_tls })
    }
}

/// WebSocket client that keeps the agent registered with the relay server.
///
/// One I/O task runs the connect/register/read cycle and reconnects after a
/// fixed interval on any failure; a writer task serializes all outgoing
/// frames through a bounded queue.
pub struct RelayClient {
    shared: Arc<Shared>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayClient {
    pub fn new(config: &AgentConfig) -> Self {
        let hostname = config.hostname.clone().unwrap_or_else(default_hostname);
        let unique_id = format!("{}_{}", hostname, wallclock_ticks());
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                server_url: config.server_url.clone(),
                auth_key: config.auth_key.clone(),
                fixed_host_id: config.host_id.clone(),
                verify_tls: config.verify_tls,
                reconnect_interval_secs: AtomicU64::new(config.reconnect_interval_seconds),
                hostname: Mutex::new(hostname),
                unique_id: Mutex::new(unique_id),
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                running: AtomicBool::new(false),
                assigned: Mutex::new(AssignedState::default()),
                handlers: Mutex::new(HandlerTable::default()),
                writer: Mutex::new(None),
                writer_task: Mutex::new(None),
                shutdown,
            }),
            io_task: Mutex::new(None),
        }
    }

    /// Launch the I/O task. Idempotent; must be called on a Tokio runtime.
    pub fn start(&self) -> bool {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return true;
        }
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(run_io(shared));
        *self.io_task.lock().unwrap() = Some(task);
        true
    }

    /// Signal shutdown, abort in-flight work and wait for the I/O task.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.shutdown.send_replace(true);

        let task = self.io_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.shared.writer.lock().unwrap().take();
        self.shared.join_writer().await;
        self.shared.clear_assigned();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// True exactly when the client is registered with the relay.
    pub fn is_ready(&self) -> bool {
        self.get_state() == ConnectionState::Registered
    }

    pub fn get_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Host id assigned by the relay, empty until registered.
    pub fn get_host_id(&self) -> String {
        self.shared.assigned.lock().unwrap().host_id.clone()
    }

    /// Ports assigned by the relay, all zeros until registered.
    pub fn get_ports(&self) -> PortAssignment {
        self.shared.assigned.lock().unwrap().ports
    }

    pub fn get_external_address(&self) -> Option<String> {
        self.shared.assigned.lock().unwrap().external_address.clone()
    }

    pub fn set_hostname(&self, hostname: impl Into<String>) {
        *self.shared.hostname.lock().unwrap() = hostname.into();
    }

    pub fn set_unique_id(&self, unique_id: impl Into<String>) {
        *self.shared.unique_id.lock().unwrap() = unique_id.into();
    }

    pub fn set_reconnect_interval(&self, seconds: u64) {
        self.shared
            .reconnect_interval_secs
            .store(seconds, Ordering::Release);
    }

    pub fn set_http_handler(&self, handler: HttpHandler) {
        self.shared.handlers.lock().unwrap().http = Some(handler);
    }

    pub fn set_rtsp_handler(&self, handler: RtspHandler) {
        self.shared.handlers.lock().unwrap().rtsp = Some(handler);
    }

    pub fn set_session_start_handler(&self, handler: SessionStartHandler) {
        self.shared.handlers.lock().unwrap().session_start = Some(handler);
    }

    pub fn set_session_end_handler(&self, handler: SessionEndHandler) {
        self.shared.handlers.lock().unwrap().session_end = Some(handler);
    }

    pub fn set_udp_channel_handler(&self, handler: UdpChannelSetupHandler) {
        self.shared.handlers.lock().unwrap().udp_channel = Some(handler);
    }

    pub fn set_state_handler(&self, handler: StateChangeHandler) {
        self.shared.handlers.lock().unwrap().state_change = Some(handler);
    }

    pub fn set_registered_handler(&self, handler: RegisteredHandler) {
        self.shared.handlers.lock().unwrap().registered = Some(handler);
    }

    pub fn clear_handlers(&self) {
        *self.shared.handlers.lock().unwrap() = HandlerTable::default();
    }

    /// Notify the relay that a streaming session ended. Dropped silently if
    /// no connection epoch is live or the outbound queue is full.
    pub fn send_session_end(&self, session_id: u64, reason: Option<String>) {
        let msg = RelayMessage::SessionEnd(SessionEndMessage { session_id, reason });
        let writer = self.shared.writer.lock().unwrap().clone();
        if let Some(writer) = writer {
            if let Ok(text) = msg.to_json() {
                let _ = writer.try_send(Message::Text(text));
            }
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        // Best effort: wake the I/O task so it stops once the runtime polls it.
        self.shared.running.store(false, Ordering::Release);
        self.shared.shutdown.send_replace(true);
    }
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "starbeam-host".to_string())
}

fn wallclock_ticks() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Reconnect loop: one pass per connection epoch, fixed sleep in between.
async fn run_io(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();

    while shared.running.load(Ordering::Acquire) {
        shared.set_state(ConnectionState::Connecting);

        tokio::select! {
            _ = shutdown.changed() => {}
            result = connect_once(&shared) => {
                if let Err(err) = result {
                    log::error!("relay connection error: {err:#}");
                }
            }
        }

        // Shutdown can cancel connect_once mid-epoch; the writer task is
        // reachable through Shared, so tear it down here either way.
        shared.writer.lock().unwrap().take();
        shared.join_writer().await;
        shared.clear_assigned();
        shared.set_state(ConnectionState::Disconnected);

        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        let interval = shared.reconnect_interval_secs.load(Ordering::Acquire);
        log::info!("reconnecting to relay in {interval} seconds");
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
        }
    }
}

/// One connection epoch: connect, register, then serve the read loop until
/// the channel dies.
async fn connect_once(shared: &Arc<Shared>) -> anyhow::Result<()> {
    let target = match RelayTarget::parse(&shared.server_url) {
        Ok(target) => target,
        Err(err) => {
            shared.set_state(ConnectionState::Error);
            return Err(err);
        }
    };

    log::info!("connecting to relay at {}", shared.server_url);

    let (ws, _resp) = if target.use_tls {
        let connector = tls_connector(shared.verify_tls)?;
        tokio_tungstenite::connect_async_tls_with_config(
            shared.server_url.as_str(),
            None,
            false,
            Some(connector),
        )
        .await
        .context("relay connection failed")?
    } else {
        tokio_tungstenite::connect_async(shared.server_url.as_str())
            .await
            .context("relay connection failed")?
    };

    shared.set_state(ConnectionState::Connected);
    log::info!("connected to relay ({})", if target.use_tls { "wss" } else { "ws" });

    let (ws_tx, mut ws_rx) = ws.split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    *shared.writer_task.lock().unwrap() = Some(tokio::spawn(run_writer(ws_tx, out_rx)));
    *shared.writer.lock().unwrap() = Some(out_tx.clone());

    let register = shared.build_register();
    let registered_as = register.hostname.clone();
    send_message(&out_tx, &RelayMessage::Register(register)).await;
    log::info!("sent registration as '{registered_as}'");

    let result = read_loop(shared, &target.host, &out_tx, &mut ws_rx).await;

    shared.writer.lock().unwrap().take();
    drop(out_tx);
    shared.join_writer().await;

    result
}

fn tls_connector(verify: bool) -> anyhow::Result<Connector> {
    let mut builder = native_tls::TlsConnector::builder();
    builder.min_protocol_version(Some(native_tls::Protocol::Tlsv12));
    if !verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    let connector = builder.build().context("building TLS connector")?;
    Ok(Connector::NativeTls(connector))
}

/// Single consumer of the outbound queue; the only task that writes frames.
async fn run_writer(
    mut ws_tx: futures::stream::SplitSink<WsStream, Message>,
    mut out_rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = out_rx.recv().await {
        if let Err(err) = ws_tx.send(msg).await {
            log::error!("relay send error: {err}");
            break;
        }
    }
    let _ = ws_tx.close().await;
}

async fn send_message(out_tx: &mpsc::Sender<Message>, msg: &RelayMessage) {
    match msg.to_json() {
        Ok(text) => {
            if out_tx.send(Message::Text(text)).await.is_err() {
                log::error!("dropping outgoing {} message: channel closed", msg.type_name());
            }
        }
        Err(err) => {
            log::error!("failed to serialize {} message: {err}", msg.type_name());
        }
    }
}

async fn read_loop(
    shared: &Arc<Shared>,
    relay_host: &str,
    out_tx: &mpsc::Sender<Message>,
    ws_rx: &mut futures::stream::SplitStream<WsStream>,
) -> anyhow::Result<()> {
    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                log::info!("relay closed the control channel");
                break;
            }
            // Binary and transport-level ping/pong frames are not part of
            // the control protocol.
            Ok(_) => continue,
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => break,
            Err(err) => bail!("control channel read failed: {err}"),
        };

        let msg = match RelayMessage::from_json(&text) {
            Ok(msg) => msg,
            Err(err) => {
                log::warn!("dropping malformed control frame: {err}");
                continue;
            }
        };

        dispatch(shared, relay_host, out_tx, msg).await?;
    }

    Ok(())
}

async fn dispatch(
    shared: &Arc<Shared>,
    relay_host: &str,
    out_tx: &mpsc::Sender<Message>,
    msg: RelayMessage,
) -> anyhow::Result<()> {
    match msg {
        RelayMessage::RegisterAck(ack) => {
            {
                let mut assigned = shared.assigned.lock().unwrap();
                assigned.host_id = ack.host_id.clone();
                assigned.ports = ack.ports;
                assigned.external_address = ack.external_address.clone();
            }
            shared.set_state(ConnectionState::Registered);
            log::info!(
                "registered as '{}' with HTTP port {}",
                ack.host_id,
                ack.ports.http
            );

            let handler = shared.handlers.lock().unwrap().registered.clone();
            if let Some(handler) = handler {
                handler(relay_host, &ack.ports);
            }
        }
        RelayMessage::RegisterError(err) => {
            log::error!("registration rejected: {} ({})", err.message, err.code);
            shared.set_state(ConnectionState::Error);
            bail!("registration rejected by relay");
        }
        RelayMessage::HttpRequest(req) => {
            let handler = shared.handlers.lock().unwrap().http.clone();
            if let Some(handler) = handler {
                let resp = handler(req).await;
                send_message(out_tx, &RelayMessage::HttpResponse(resp)).await;
            }
        }
        RelayMessage::RtspRequest(req) => {
            let handler = shared.handlers.lock().unwrap().rtsp.clone();
            if let Some(handler) = handler {
                let resp = handler(req).await;
                send_message(out_tx, &RelayMessage::RtspResponse(resp)).await;
            }
        }
        RelayMessage::SessionStart(msg) => {
            let handler = shared.handlers.lock().unwrap().session_start.clone();
            if let Some(handler) = handler {
                handler(msg);
            }
        }
        RelayMessage::SessionEnd(msg) => {
            let handler = shared.handlers.lock().unwrap().session_end.clone();
            if let Some(handler) = handler {
                handler(msg.session_id);
            }
        }
        RelayMessage::UdpChannelSetup(setup) => {
            let handler = shared.handlers.lock().unwrap().udp_channel.clone();
            if let Some(handler) = handler {
                let ack = handler(setup).await;
                send_message(out_tx, &RelayMessage::UdpChannelAck(ack)).await;
            }
        }
        RelayMessage::Ping(ping) => {
            send_message(
                out_tx,
                &RelayMessage::Pong(starbeam_proto::relay::PongMessage { ts: ping.ts }),
            )
            .await;
        }
        RelayMessage::Error(err) => {
            log::error!("error from relay: {} ({})", err.message, err.code);
        }
        RelayMessage::Unknown => {
            log::warn!("ignoring control frame with unknown type");
        }
        other => {
            log::warn!("ignoring unexpected {} message", other.type_name());
        }
    }

    Ok(())
}
