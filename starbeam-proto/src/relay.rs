//! Control-channel messages exchanged between the agent and the Starbeam
//! relay server. One JSON object per WebSocket text frame, discriminated by
//! the top-level `type` field.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed control frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Ports assigned by the relay at registration time. All zeros until the
/// relay acks the registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    pub http: u16,
    pub https: u16,
    pub rtsp: u16,
    pub video: u16,
    pub audio: u16,
    pub control: u16,
}

/// Capabilities advertised in the `register` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fps: Option<u32>,
    #[serde(default)]
    pub video_codecs: Vec<String>,
    #[serde(default)]
    pub audio_codecs: Vec<String>,
}

/// One of the three UDP media paths of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Video,
    Audio,
    Control,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Video => f.write_str("video"),
            ChannelKind::Audio => f.write_str("audio"),
            ChannelKind::Control => f.write_str("control"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub hostname: String,
    pub unique_id: String,
    pub auth_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    pub capabilities: HostCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAckMessage {
    pub host_id: String,
    pub ports: PortAssignment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_address: Option<String>,
}

/// Carried by both `register_error` and `error` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestMessage {
    pub id: u64,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    #[serde(default)]
    pub is_https: bool,
    pub client_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponseMessage {
    pub id: u64,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtspRequestMessage {
    pub id: u64,
    pub method: String,
    pub uri: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub client_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtspResponseMessage {
    pub id: u64,
    pub status: u16,
    pub reason: String,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpChannelSetupMessage {
    pub session_id: u64,
    pub channel: ChannelKind,
    pub client_addr: String,
}

/// Reply to `udp_channel_setup`. Zero ports signal a setup failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpChannelAckMessage {
    pub session_id: u64,
    pub channel: ChannelKind,
    pub relay_port: u16,
    pub local_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartMessage {
    pub session_id: u64,
    pub client_id: String,
    pub client_addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEndMessage {
    pub session_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMessage {
    pub ts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongMessage {
    pub ts: u64,
}

/// The control-channel message envelope.
///
/// Frames whose `type` is not listed here parse as [`RelayMessage::Unknown`]
/// rather than failing, so newer relay servers can add message types without
/// breaking older agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Register(RegisterMessage),
    RegisterAck(RegisterAckMessage),
    RegisterError(ErrorMessage),
    HttpRequest(HttpRequestMessage),
    HttpResponse(HttpResponseMessage),
    RtspRequest(RtspRequestMessage),
    RtspResponse(RtspResponseMessage),
    UdpChannelSetup(UdpChannelSetupMessage),
    UdpChannelAck(UdpChannelAckMessage),
    /// Enumerated in the protocol but not currently produced or consumed.
    UdpChannelClose,
    SessionStart(SessionStartMessage),
    SessionEnd(SessionEndMessage),
    Ping(PingMessage),
    Pong(PongMessage),
    Error(ErrorMessage),
    #[serde(other)]
    Unknown,
}

impl RelayMessage {
    /// Parse one text frame. A syntactically valid frame with an
    /// unrecognized `type` yields [`RelayMessage::Unknown`], not an error.
    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize for sending as a single text frame.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Wire name of the message type, for log lines.
    pub fn type_name(&self) -> &'static str {
        match self {
            RelayMessage::Register(_) => "register",
            RelayMessage::RegisterAck(_) => "register_ack",
            RelayMessage::RegisterError(_) => "register_error",
            RelayMessage::HttpRequest(_) => "http_request",
            RelayMessage::HttpResponse(_) => "http_response",
            RelayMessage::RtspRequest(_) => "rtsp_request",
            RelayMessage::RtspResponse(_) => "rtsp_response",
            RelayMessage::UdpChannelSetup(_) => "udp_channel_setup",
            RelayMessage::UdpChannelAck(_) => "udp_channel_ack",
            RelayMessage::UdpChannelClose => "udp_channel_close",
            RelayMessage::SessionStart(_) => "session_start",
            RelayMessage::SessionEnd(_) => "session_end",
            RelayMessage::Ping(_) => "ping",
            RelayMessage::Pong(_) => "pong",
            RelayMessage::Error(_) => "error",
            RelayMessage::Unknown => "unknown",
        }
    }
}
