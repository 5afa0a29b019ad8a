use eyre::{eyre, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the process-wide subscriber. `default_level` comes from config
/// (`log_level` / `EYED_LOG_LEVEL`); `RUST_LOG` wins when set.
pub fn initialize_tracing(default_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .try_init()
        .map_err(|e| eyre!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}
