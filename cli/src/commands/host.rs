use anyhow::Context;
use executor_core::tokio::TokioGlobal;
use ferry::{BridgeConfig, BridgeServer, ChannelRouter, HostBuilder};

use crate::cli::HostArgs;
use crate::error::CliResult;

pub async fn execute(args: HostArgs, config: BridgeConfig) -> CliResult<()> {
    let router = ChannelRouter::new();
    let channels: Vec<&str> = router.channels().collect();
    tracing::debug!(?channels, "extra channels available to invoke");
    let hosts = HostBuilder::new().config(config).router(router);
    let server = BridgeServer::new(hosts, &args.socket, TokioGlobal)
        .await
        .with_context(|| format!("failed to listen on {}", args.socket.display()))?;

    tracing::info!(socket = %server.socket_path().display(), "serving pages, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for interrupt")?;

    server.stop();
    tracing::info!(pages = server.pages(), "shutting down");
    Ok(())
}
