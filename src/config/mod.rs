mod schema;

pub use schema::*;

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

/// Startup validation; failures here are fatal.
fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.topology.endpoints.is_empty() && config.topology.static_backends.is_empty() {
        return Err(ConfigError::Invalid(
            "either topology.endpoints or topology.static_backends must be set".to_string(),
        ));
    }
    for direction in [&config.security.frontend, &config.security.backend] {
        if direction.cert.is_some() != direction.key.is_some() {
            return Err(ConfigError::Invalid(
                "tls cert and key must be set together".to_string(),
            ));
        }
        match direction.min_tls_version.as_str() {
            "1.2" | "1.3" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported min_tls_version {other:?}"
                )))
            }
        }
    }
    if config.balance.max_score_ratio < 1.0 {
        return Err(ConfigError::Invalid(
            "balance.max_score_ratio must be >= 1.0".to_string(),
        ));
    }
    Ok(())
}
