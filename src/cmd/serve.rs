//! Job server command (`genforge serve`).

use anyhow::Result;
use genforge::config::GenforgeConfig;

pub async fn cmd_serve(config: &GenforgeConfig) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!(%warning, "configuration warning");
    }
    genforge::server::start_server(config).await
}
