use anyhow::Context;
use peerprobe::DiscoveryConfig;
use peerprobe::DiscoveryListener;
use peerprobe::DiscoveryService;
use peerprobe::PeerReachable;
use peerprobe::PeerUnreachable;

pub async fn watch(config: DiscoveryConfig) -> anyhow::Result<()> {
    let port = config.port;
    let handle = DiscoveryService::start_with_config(config, LogListener)
        .await
        .with_context(|| format!("Failed to start discovery on port {}", port))?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;

    handle.stop();
    log::info!("Waiting for in-flight connections to unwind");
    handle.stopped().await;
    Ok(())
}

struct LogListener;

impl DiscoveryListener for LogListener {
    fn on_peer_reachable(&self, event: PeerReachable) {
        log::info!(
            "Reachable: {} ({:?}, connection {})",
            event.address,
            event.connection.origin(),
            event.connection.id()
        );
    }

    fn on_peer_unreachable(&self, event: PeerUnreachable) {
        log::info!(
            "Unreachable: {} (connection {})",
            event.address,
            event.connection_id
        );
    }
}
