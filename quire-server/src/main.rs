//! Quire collaboration server: standalone WebSocket relay.
//!
//! Reads `ServerConfig` from `QUIRE_CONFIG` / `QUIRE_*` variables, loads the
//! token table, and serves `/ws/{page_id}?token=...` until Ctrl-C.

use log::{info, warn};
use std::sync::Arc;

use quire_collab::{
    AllowAll, CollabServer, CollaborationHub, ConnectionRegistry, ServerConfig,
    StaticIdentityProvider,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::load()?;

    let identity = match &config.tokens_file {
        Some(path) => {
            let provider = StaticIdentityProvider::from_file(path)?;
            info!("Loaded {} tokens from {}", provider.len(), path.display());
            provider
        }
        None => {
            warn!("No tokens file configured; every connection will be rejected");
            StaticIdentityProvider::new()
        }
    };

    let registry = Arc::new(ConnectionRegistry::new());
    let hub = Arc::new(CollaborationHub::new(
        registry,
        Arc::new(identity),
        Arc::new(AllowAll),
    ));

    let server = CollabServer::new(config, hub);
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let stats = server.hub().stats();
    info!(
        "Stopped: {} connections accepted, {} rejected, {} messages sent",
        stats.connections_accepted, stats.connections_rejected, stats.messages_sent
    );
    Ok(())
}
