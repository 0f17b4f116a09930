mod agent;
pub mod client;
pub mod config;
pub mod forwarder;
pub mod udp;

pub use agent::RelayAgent;
pub use client::{ConnectionState, RelayClient};
pub use config::AgentConfig;
pub use forwarder::LoopbackForwarder;
pub use udp::ChannelManager;
