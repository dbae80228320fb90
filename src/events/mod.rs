//! Output event types
//!
//! What the rest of the application sees: gateway dispatches plus the
//! two coordinator notifications, delivered over the output channel in
//! `[event-type, payload]` shape.

use serde::Serialize;
use serde_json::Value;

/// Effects a shard runner surfaces to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum BotEffect {
    /// A gateway dispatch to forward on the output channel.
    DiscordEvent { event_type: String, payload: Value },
    /// The server demanded a different shard count.
    ReShard,
}

/// Events delivered on the output channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OutputEvent {
    /// A dispatched gateway event, READY included.
    Dispatch { event_type: String, payload: Value },
    /// All shards have had their staggered connect window.
    ConnectedAllShards,
    /// A re-shard was initiated.
    ReShard,
}

impl OutputEvent {
    /// The `[event-type, payload]` view of this event.
    pub fn parts(&self) -> (&str, Option<&Value>) {
        match self {
            Self::Dispatch {
                event_type,
                payload,
            } => (event_type, Some(payload)),
            Self::ConnectedAllShards => ("CONNECTED_ALL_SHARDS", None),
            Self::ReShard => ("RE_SHARD", None),
        }
    }
}
