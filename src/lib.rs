//! Sharded Discord gateway client
//!
//! Implements the gateway-side lifecycle of a Discord bot:
//! - per-shard connection, identify, and resume handling
//! - heartbeating with zombie-connection detection
//! - close-code classification and reconnection
//! - coordinated multi-shard startup under the identify rate limit
//! - autonomous re-sharding when the server demands it
//!
//! The crate is consumed through [`shard::ShardPool`]: feed it a
//! discovered gateway URL and a command channel, and read dispatched
//! events from the output channel.

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod protocol;
pub mod rest;
pub mod shard;
pub mod transport;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use events::{BotEffect, OutputEvent};
pub use rest::{Discovery, GatewayBot, RestClient, SessionStartLimit};
pub use shard::{PoolCommand, ShardPool, ShardPoolOptions};
