use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use proxied_tools::{init_tracing, InMemoryToolHost, LogFormat, ProxyConfig, ProxyManager};

/// Usage: `proxied-tools [config.yaml]`
///
/// Without a config file, settings come from the environment
/// (`GRAFANA_URL`, `GRAFANA_API_KEY`, `TEMPO_PROXY_ENABLED`,
/// `TEMPO_POLLING_INTERVAL`). `LOG_FORMAT=json` switches to JSON logs.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format: LogFormat = std::env::var("LOG_FORMAT")
        .unwrap_or_default()
        .parse()
        .context("invalid LOG_FORMAT")?;
    init_tracing(format);

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => ProxyConfig::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ProxyConfig::from_env(),
    };

    let host = Arc::new(InMemoryToolHost::new());
    let cancel = CancellationToken::new();
    let manager = ProxyManager::start(&config, host.clone(), &cancel).await;

    tracing::info!(tools = ?host.tool_names(), "proxied tools ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    cancel.cancel();
    manager.shutdown().await;
    Ok(())
}
