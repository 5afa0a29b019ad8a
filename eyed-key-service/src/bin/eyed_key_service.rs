use std::sync::Arc;

use eyed_common::{shutdown_handler::ShutdownHandler, tracing::initialize_tracing};
use eyed_key_service::{bus, config::KeyServiceConfig, he_context::HeContext};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cfg = KeyServiceConfig::load()?;
    initialize_tracing(&cfg.log_level)?;

    tracing::info!("EyeD key service starting");
    tracing::info!("  NATS URL:      {}", cfg.nats_url);
    tracing::info!("  key directory: {}", cfg.he_key_dir.display());

    // Keys are ready before the first subscription exists.
    let ctx = match HeContext::init(&cfg.he_key_dir) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            tracing::error!("FATAL: failed to initialize HE context: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!("HE context ready (ring_dim={})", ctx.ring_dimension());

    let client = match bus::connect_with_retry(&cfg.nats_url).await {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("FATAL: {e:#}");
            std::process::exit(1);
        }
    };
    tracing::info!("Connected to NATS");

    let shutdown = ShutdownHandler::new(30);
    shutdown.register_signal_handler().await;

    bus::serve(client, ctx, shutdown).await?;
    tracing::info!("Shutdown complete.");
    Ok(())
}
