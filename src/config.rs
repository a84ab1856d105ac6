//! Configuration and settings management
//!
//! Loads settings from environment variables and optional config files.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub bot_token: String,

    /// Redis connection URL
    pub redis_url: String,

    /// Comma-separated list of Telegram IDs with admin privileges
    #[serde(rename = "admin_user_ids")]
    pub admin_user_ids_str: Option<String>,

    /// Port for the health endpoint
    #[serde(default = "default_port")]
    pub port: u16,

    /// Deployment mode, also selects the optional `config/{run_mode}` file
    #[serde(default = "default_run_mode")]
    pub run_mode: String,
}

const fn default_port() -> u16 {
    10_000
}

fn default_run_mode() -> String {
    "development".to_string()
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(File::with_name("config/default").required(false))
            // Add in the current environment file
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Add in a local configuration file
            // This file shouldn't be checked into git
            .add_source(File::with_name("config/local").required(false))
            // Also add settings from environment variables directly (without prefix)
            // Note: Environment::default() auto-converts UPPER_SNAKE_CASE to snake_case
            // ignore_empty treats empty env vars as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Checks that the settings are complete enough to start the process.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError::Message` naming the first missing value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bot_token.trim().is_empty() {
            return Err(ConfigError::Message("BOT_TOKEN must not be empty".into()));
        }
        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::Message("REDIS_URL must not be empty".into()));
        }
        Ok(())
    }

    /// Returns the set of Telegram IDs granted admin privileges
    #[must_use]
    pub fn admin_user_ids(&self) -> HashSet<i64> {
        self.admin_user_ids_str
            .as_ref()
            .map(|s| {
                s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                    .filter(|token| !token.is_empty())
                    .filter_map(|id| id.parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}
