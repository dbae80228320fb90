//! Gateway configuration module
//!
//! Handles loading configuration from environment variables.

use crate::error::GatewayError;
use std::env;

/// Transport max message size in bytes (4 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Discord bot token
    pub discord_token: String,

    /// Override for the shard count. When absent the count recommended
    /// by gateway discovery is used.
    pub total_shards: Option<u64>,

    /// Shut the bot down on fatal close codes instead of reconnecting
    pub stop_on_fatal: bool,

    /// Re-shard autonomously when the server demands it. When false the
    /// re-shard is surfaced on the output channel and the bot stops.
    pub handle_reshard: bool,

    /// Transport max message size in bytes
    pub buffer_size: usize,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let discord_token = env::var("DISCORD_TOKEN")
            .or_else(|_| env::var("DISCORD_BOT_TOKEN"))
            .map_err(|_| {
                GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
            })?;

        let total_shards = match env::var("TOTAL_SHARDS") {
            Ok(value) => Some(value.parse().map_err(|e| {
                GatewayError::Config(format!("TOTAL_SHARDS must be a valid number: {e}"))
            })?),
            Err(_) => None,
        };

        let stop_on_fatal = parse_flag("STOP_ON_FATAL", false)?;
        let handle_reshard = parse_flag("HANDLE_RESHARD", true)?;

        let buffer_size = env::var("BUFFER_SIZE")
            .unwrap_or_else(|_| DEFAULT_BUFFER_SIZE.to_string())
            .parse()
            .map_err(|e| GatewayError::Config(format!("BUFFER_SIZE must be a valid number: {e}")))?;

        let http_port = env::var("HTTP_PORT")
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|e| GatewayError::Config(format!("HTTP_PORT must be a valid port number: {e}")))?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            discord_token,
            total_shards,
            stop_on_fatal,
            handle_reshard,
            buffer_size,
            http_port,
            log_level,
        })
    }
}

/// Parse a boolean environment flag, accepting `true`/`false`/`1`/`0`.
fn parse_flag(name: &str, default: bool) -> Result<bool, GatewayError> {
    match env::var(name) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(GatewayError::Config(format!(
                "{name} must be true or false, got '{other}'"
            ))),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_buffer_size_is_4_mib() {
        assert_eq!(DEFAULT_BUFFER_SIZE, 4 * 1024 * 1024);
    }

    #[test]
    fn test_flag_defaults() {
        // Unset variables fall back to the documented defaults.
        assert!(!parse_flag("WINTERMUTE_TEST_UNSET_FLAG_A", false).unwrap());
        assert!(parse_flag("WINTERMUTE_TEST_UNSET_FLAG_B", true).unwrap());
    }

    #[test]
    fn test_flag_parsing() {
        env::set_var("WINTERMUTE_TEST_FLAG_TRUE", "1");
        env::set_var("WINTERMUTE_TEST_FLAG_FALSE", "false");
        env::set_var("WINTERMUTE_TEST_FLAG_BAD", "maybe");

        assert!(parse_flag("WINTERMUTE_TEST_FLAG_TRUE", false).unwrap());
        assert!(!parse_flag("WINTERMUTE_TEST_FLAG_FALSE", true).unwrap());
        assert!(parse_flag("WINTERMUTE_TEST_FLAG_BAD", false).is_err());
    }
}
