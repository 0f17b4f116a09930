//! Wires the forwarder and the UDP channel manager into the control client
//! and owns their shared lifecycle.

use std::sync::Arc;

use crate::client::{
    HttpHandler, RegisteredHandler, RelayClient, RtspHandler, UdpChannelSetupHandler,
};
use crate::config::AgentConfig;
use crate::forwarder::LoopbackForwarder;
use crate::udp::ChannelManager;

/// The relay-edge agent: one control client, one loopback forwarder, one
/// UDP channel manager.
pub struct RelayAgent {
    client: Arc<RelayClient>,
    channels: Arc<ChannelManager>,
}

impl RelayAgent {
    /// Validate the configuration and wire everything together. The client
    /// is not started yet.
    pub fn new(config: AgentConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let forwarder = Arc::new(LoopbackForwarder::new(config.base_port));
        let channels = Arc::new(ChannelManager::new(config.base_port));
        let client = Arc::new(RelayClient::new(&config));

        let http_forwarder = Arc::clone(&forwarder);
        let http_handler: HttpHandler = Arc::new(move |req| {
            let forwarder = Arc::clone(&http_forwarder);
            Box::pin(async move { forwarder.forward_http(&req).await })
        });
        client.set_http_handler(http_handler);

        let rtsp_forwarder = Arc::clone(&forwarder);
        let rtsp_handler: RtspHandler = Arc::new(move |req| {
            let forwarder = Arc::clone(&rtsp_forwarder);
            Box::pin(async move { forwarder.forward_rtsp(&req).await })
        });
        client.set_rtsp_handler(rtsp_handler);

        let setup_channels = Arc::clone(&channels);
        let udp_handler: UdpChannelSetupHandler = Arc::new(move |setup| {
            let channels = Arc::clone(&setup_channels);
            Box::pin(async move { channels.handle_channel_setup(setup).await })
        });
        client.set_udp_channel_handler(udp_handler);

        let registered_channels = Arc::clone(&channels);
        let registered: RegisteredHandler = Arc::new(move |relay_host, ports| {
            registered_channels.configure(relay_host, ports);
        });
        client.set_registered_handler(registered);

        Ok(Self { client, channels })
    }

    /// Start the control client; idempotent.
    pub fn start(&self) -> bool {
        self.client.start()
    }

    /// Tear everything down: handlers first, then the control channel, then
    /// the UDP relays.
    pub async fn stop(&self) {
        self.client.clear_handlers();
        self.client.stop().await;
        self.channels.shutdown().await;
    }

    /// True when the agent is registered and serving ingress requests.
    pub fn is_active(&self) -> bool {
        self.client.is_ready()
    }

    pub fn client(&self) -> &Arc<RelayClient> {
        &self.client
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }
}
