use anyhow::bail;
use serde::Deserialize;

/// Default streaming-host base port (the nvhttp port).
pub const DEFAULT_BASE_PORT: u16 = 47989;

/// Default delay between reconnect attempts, in seconds.
pub const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 5;

/// Agent configuration, supplied by whatever hosts the agent (the bundled
/// binary reads it from `STARBEAM_*` environment variables).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Gates agent startup entirely.
    pub enabled: bool,
    /// Control-channel URL, `ws://` or `wss://`. Required.
    pub server_url: String,
    /// Shared secret sent in the `register` message. Required.
    pub auth_key: String,
    /// Optional fixed identity to register under.
    pub host_id: Option<String>,
    /// Display-name override; defaults to the OS hostname.
    pub hostname: Option<String>,
    /// Fixed delay between reconnect attempts. No backoff.
    pub reconnect_interval_seconds: u64,
    /// The local streaming host's base port. HTTP/HTTPS/RTSP and the UDP
    /// media ports are derived from it by fixed offsets.
    pub base_port: u16,
    /// Verify the relay's TLS certificate on `wss://` connections.
    pub verify_tls: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: String::new(),
            auth_key: String::new(),
            host_id: None,
            hostname: None,
            reconnect_interval_seconds: DEFAULT_RECONNECT_INTERVAL_SECS,
            base_port: DEFAULT_BASE_PORT,
            verify_tls: false,
        }
    }
}

impl AgentConfig {
    /// Reject configurations the agent cannot start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_url.is_empty() {
            bail!("server URL not configured");
        }
        if self.auth_key.is_empty() {
            bail!("auth key not configured");
        }
        Ok(())
    }
}
