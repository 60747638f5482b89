use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use cc_bridge::config::RelayServerConfig;
use cc_bridge::events::init_logging;
use cc_bridge::relay_server::{serve_relay, RelayHub};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayServerConfig::parse();
    init_logging(&config.log_level);

    let hub = RelayHub::with_idle_ttl(Duration::from_secs(config.idle_secs));
    let (_addr, mut handle) = serve_relay(config.listen, hub).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target = "cc_bridge::relay", "shutting down");
            handle.abort();
        }
        result = &mut handle => {
            if let Err(error) = result {
                anyhow::bail!("relay server task failed: {error}");
            }
        }
    }
    Ok(())
}
