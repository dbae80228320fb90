//! Shard management module
//!
//! The per-shard state machine, the runtime loop that drives it, the
//! bot-level coordinator, and the shared status view.

mod machine;
mod pool;
mod runner;
mod status;

pub use machine::{Effect, InboundEvent, ProtocolFlags, Shard};
pub use pool::{
    all_connected_delay, connect_delay, PoolCommand, ShardPool, ShardPoolOptions, IDENTIFY_STAGGER,
};
pub use runner::{RunnerContext, ShardCommand, ShardRunner};
pub use status::{ShardHealth, ShardStatusMap, StatusSnapshot};
