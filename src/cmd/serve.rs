//! HTTP + WebSocket server command: `memeloop serve`.

use anyhow::Result;

use memeloop::config::AppConfig;

pub async fn cmd_serve(mut config: AppConfig, port: Option<u16>, host: Option<String>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    config.validate()?;

    memeloop::server::start_server(&config).await
}
