//! Gateway discovery REST client
//!
//! The one REST call the lifecycle depends on: `GET /gateway/bot`,
//! which yields the websocket URL, the recommended shard count, and the
//! session-start budget consulted before a re-shard. The coordinator
//! depends on the [`Discovery`] trait rather than the concrete client
//! so tests can stub the session-start limit.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::GatewayError;
use crate::protocol::API_VERSION;

/// REST API base.
pub const API_BASE: &str = "https://discordapp.com/api/v6";

/// Gateway discovery endpoint.
pub const GATEWAY_BOT_URL: &str = "https://discordapp.com/api/gateway/bot?v=6&encoding=json";

/// `GET /gateway/bot` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    /// Websocket URL to connect shards to.
    pub url: String,
    /// Recommended shard count.
    pub shards: u64,
    pub session_start_limit: SessionStartLimit,
}

/// Rolling budget of fresh identifies.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    pub total: u64,
    pub remaining: u64,
    /// Milliseconds until the window resets.
    pub reset_after: u64,
    pub max_concurrency: u64,
}

/// Gateway discovery seam.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn gateway_bot(&self) -> Result<GatewayBot, GatewayError>;
}

/// Discovery backed by the real REST API.
pub struct RestClient {
    http: reqwest::Client,
    token: String,
}

impl RestClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl Discovery for RestClient {
    async fn gateway_bot(&self) -> Result<GatewayBot, GatewayError> {
        let body: GatewayBot = self
            .http
            .get(GATEWAY_BOT_URL)
            .header("Authorization", &self.token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| GatewayError::Discovery {
                source: Box::new(source),
            })?
            .json()
            .await
            .map_err(|source| GatewayError::Discovery {
                source: Box::new(source),
            })?;

        debug!(
            url = %body.url,
            shards = body.shards,
            remaining_starts = body.session_start_limit.remaining,
            "gateway discovery"
        );
        Ok(body)
    }
}

/// Append the protocol version and encoding to a discovered gateway URL.
pub fn versioned_gateway_url(base: &str) -> String {
    format!("{base}/?v={API_VERSION}&encoding=json")
}
