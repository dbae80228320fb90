//! Domain error types for the gateway client
//!
//! Structured thiserror types for navigable diagnostics and
//! compile-time exhaustive handling.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process
//! boundary). All library code returns Result<T, GatewayError>.

use thiserror::Error;

/// Gateway domain errors
///
/// Every variant carries structured context fields so failures can be
/// pattern-matched instead of string-parsed.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// Websocket transport failure (connect or send)
    #[error("websocket transport error")]
    Transport {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Outbound frame serialization failed
    #[error("frame serialization failed")]
    Serialization {
        #[source]
        source: serde_json::Error,
    },

    /// Gateway discovery (`GET /gateway/bot`) failed
    #[error("gateway discovery failed")]
    Discovery {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Re-shard requested more session starts than the rolling window
    /// has left. Unrecoverable until the limit resets.
    #[error("re-shard needs {shards_requested} session starts but only {remaining_starts} remain")]
    SessionStartLimitExhausted {
        token: String,
        shards_requested: u64,
        remaining_starts: u64,
    },
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total`,
    /// enabling per-error-type monitoring and alerting.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Transport { .. } => "transport",
            Self::Serialization { .. } => "serialization",
            Self::Discovery { .. } => "discovery",
            Self::SessionStartLimitExhausted { .. } => "session_start_limit",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_error() -> Box<dyn std::error::Error + Send + Sync> {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, "test"))
    }

    #[test]
    fn every_variant_has_distinct_error_type_label() {
        let labels = [
            GatewayError::Config("test".to_string()).error_type_label(),
            GatewayError::Transport {
                source: test_error(),
            }
            .error_type_label(),
            GatewayError::Serialization {
                source: serde_json::from_str::<()>("invalid").unwrap_err(),
            }
            .error_type_label(),
            GatewayError::Discovery {
                source: test_error(),
            }
            .error_type_label(),
            GatewayError::SessionStartLimitExhausted {
                token: "t".to_string(),
                shards_requested: 4,
                remaining_starts: 1,
            }
            .error_type_label(),
        ];

        let mut unique = labels.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(labels.len(), unique.len(), "Duplicate error_type_label found");
    }

    #[test]
    fn session_start_limit_message_has_counts_but_not_token() {
        let err = GatewayError::SessionStartLimitExhausted {
            token: "Bot secret".to_string(),
            shards_requested: 4,
            remaining_starts: 1,
        };
        let msg = err.to_string();
        assert!(msg.contains('4'));
        assert!(msg.contains('1'));
        assert!(!msg.contains("secret"), "token must not leak into messages");
    }

    #[test]
    fn config_error_preserves_message() {
        let err = GatewayError::Config("DISCORD_TOKEN must be set".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: DISCORD_TOKEN must be set"
        );
    }
}
