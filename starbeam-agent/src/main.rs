use starbeam_agent::{AgentConfig, RelayAgent};

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Assemble the agent configuration from `STARBEAM_*` environment variables.
fn config_from_env() -> AgentConfig {
    let mut config = AgentConfig::default();

    if let Some(enabled) = env_bool("STARBEAM_ENABLED") {
        config.enabled = enabled;
    }
    if let Ok(url) = std::env::var("STARBEAM_SERVER_URL") {
        config.server_url = url;
    }
    if let Ok(key) = std::env::var("STARBEAM_AUTH_KEY") {
        config.auth_key = key;
    }
    if let Ok(host_id) = std::env::var("STARBEAM_HOST_ID") {
        config.host_id = Some(host_id);
    }
    if let Ok(hostname) = std::env::var("STARBEAM_HOSTNAME") {
        config.hostname = Some(hostname);
    }
    if let Some(interval) = std::env::var("STARBEAM_RECONNECT_INTERVAL")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        config.reconnect_interval_seconds = interval;
    }
    if let Some(port) = std::env::var("STARBEAM_BASE_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        config.base_port = port;
    }
    if let Some(verify) = env_bool("STARBEAM_VERIFY_TLS") {
        config.verify_tls = verify;
    }

    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from_env();
    if !config.enabled {
        log::info!("starbeam agent disabled (set STARBEAM_ENABLED=1 to enable)");
        return Ok(());
    }

    let server_url = config.server_url.clone();
    let agent = RelayAgent::new(config)?;
    agent.start();
    log::info!("starbeam agent started, relay {server_url}");

    tokio::signal::ctrl_c().await?;

    log::info!("shutting down");
    agent.stop().await;
    Ok(())
}
