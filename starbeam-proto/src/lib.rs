pub mod relay;

pub use relay::{
    ChannelKind, DecodeError, ErrorMessage, HostCapabilities, HttpRequestMessage,
    HttpResponseMessage, PingMessage, PongMessage, PortAssignment, RegisterAckMessage,
    RegisterMessage, RelayMessage, RtspRequestMessage, RtspResponseMessage, SessionEndMessage,
    SessionStartMessage, UdpChannelAckMessage, UdpChannelSetupMessage,
};
