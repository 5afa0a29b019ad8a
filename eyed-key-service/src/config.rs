use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Key-service configuration, environment-only: `EYED_NATS_URL`,
/// `EYED_HE_KEY_DIR`, `EYED_LOG_LEVEL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyServiceConfig {
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    #[serde(default = "default_he_key_dir")]
    pub he_key_dir: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_nats_url() -> String {
    "nats://nats:4222".to_string()
}

fn default_he_key_dir() -> PathBuf {
    PathBuf::from("/keys")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl KeyServiceConfig {
    pub fn load() -> eyre::Result<KeyServiceConfig> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("EYED").try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize::<KeyServiceConfig>()?)
    }
}
