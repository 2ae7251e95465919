use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_DATA_FILE: &str = "voice_data.json";
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DISCORD_TOKEN must be set (in the environment or .env)")]
    MissingToken,
    #[error("SWEEP_INTERVAL_SECS must be a positive integer, got {0:?}")]
    BadSweepInterval(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    pub data_file: PathBuf,
    pub sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = std::env::var("DISCORD_TOKEN").map_err(|_| ConfigError::MissingToken)?;
        let data_file = std::env::var("VOICE_DATA_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_FILE));
        let sweep_interval = match std::env::var("SWEEP_INTERVAL_SECS") {
            Ok(raw) => {
                let secs = raw
                    .parse::<u64>()
                    .ok()
                    .filter(|&secs| secs > 0)
                    .ok_or(ConfigError::BadSweepInterval(raw))?;
                Duration::from_secs(secs)
            }
            Err(_) => Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        };
        Ok(Self {
            token,
            data_file,
            sweep_interval,
        })
    }
}
