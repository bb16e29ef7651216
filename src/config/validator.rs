use std::collections::HashSet;

use thiserror::Error;

use super::parser::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.bot_token.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "auth.bot_token cannot be empty".to_string(),
            ));
        }

        if self.bridge.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.port must be between 1 and 65535".to_string(),
            ));
        }

        if self.bridge.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::InvalidConfig(format!(
                "bridge.timezone '{}' is not a known IANA timezone",
                self.bridge.timezone
            )));
        }

        if self.labels.recall_marker.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "labels.recall_marker cannot be empty".to_string(),
            ));
        }

        if self.database.connection_string().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "database connection string cannot be empty".to_string(),
            ));
        }

        if self.relays.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one relay must be configured".to_string(),
            ));
        }

        let mut seen_sources = HashSet::new();
        for relay in &self.relays {
            if !seen_sources.insert(relay.source_id) {
                return Err(ConfigError::InvalidConfig(format!(
                    "relay source {} is configured more than once",
                    relay.source_id
                )));
            }
            if relay.targets.is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "relay source {} has no targets",
                    relay.source_id
                )));
            }
        }

        Ok(())
    }
}
