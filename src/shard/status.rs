//! Shard status tracking
//!
//! Observability side channel between the runners and the HTTP
//! surface. Each runner writes only its own shard's record; readers
//! take an aggregate [`StatusSnapshot`] in one pass. The state machine
//! never consults any of this.

use dashmap::DashMap;
use std::sync::Arc;

/// Health of one shard, as its runner last reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardHealth {
    /// Attach scheduled or handshake in flight
    Connecting,
    /// Session established, dispatches flowing
    Ready,
    /// Trying to continue an interrupted session
    Resuming,
    /// Between connections
    Disconnected,
    /// Runner has terminated
    Dead,
}

impl ShardHealth {
    /// Counted as serving by the readiness probe.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Holds a session, or is in the middle of recovering one.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Ready | Self::Resuming)
    }
}

/// What one runner has reported so far.
#[derive(Debug)]
struct ShardRecord {
    health: ShardHealth,
    events_received: u64,
    events_dispatched: u64,
    reconnects: u64,
}

impl ShardRecord {
    fn new() -> Self {
        Self {
            health: ShardHealth::Connecting,
            events_received: 0,
            events_dispatched: 0,
            reconnects: 0,
        }
    }
}

/// Aggregate view of one bot, taken in a single pass over the records.
/// This is the whole vocabulary the readiness and metrics endpoints
/// need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub shards_total: usize,
    pub shards_ready: usize,
    pub shards_live: usize,
    pub events_received: u64,
    pub events_dispatched: u64,
    pub reconnects: u64,
}

impl StatusSnapshot {
    /// The bot serves traffic once any shard is ready.
    pub fn is_ready(&self) -> bool {
        self.shards_ready > 0
    }

    /// Every shard currently holds or is recovering a session.
    pub fn all_live(&self) -> bool {
        self.shards_live == self.shards_total
    }
}

/// Shared handle to the per-shard records of one bot.
#[derive(Debug, Clone)]
pub struct ShardStatusMap {
    shards: Arc<DashMap<u64, ShardRecord>>,
}

impl ShardStatusMap {
    /// Track the given shard ids, all starting out connecting.
    pub fn new(shard_ids: impl IntoIterator<Item = u64>) -> Self {
        let map = Self {
            shards: Arc::new(DashMap::new()),
        };
        map.reset(shard_ids);
        map
    }

    /// Swap in a new generation of shards. Used when a re-shard changes
    /// the shard count; everything previously recorded is gone.
    pub fn reset(&self, shard_ids: impl IntoIterator<Item = u64>) {
        self.shards.clear();
        for shard_id in shard_ids {
            self.shards.insert(shard_id, ShardRecord::new());
        }
    }

    /// Record a health transition. Unknown shard ids (a stale runner
    /// after a re-shard) are ignored.
    pub fn note_health(&self, shard_id: u64, health: ShardHealth) {
        if let Some(mut record) = self.shards.get_mut(&shard_id) {
            record.health = health;
        }
    }

    /// Record one inbound gateway payload.
    pub fn note_event(&self, shard_id: u64) {
        if let Some(mut record) = self.shards.get_mut(&shard_id) {
            record.events_received += 1;
        }
    }

    /// Record one dispatch forwarded to the output channel.
    pub fn note_dispatch(&self, shard_id: u64) {
        if let Some(mut record) = self.shards.get_mut(&shard_id) {
            record.events_dispatched += 1;
        }
    }

    /// Record one reconnect, whatever triggered it.
    pub fn note_reconnect(&self, shard_id: u64) {
        if let Some(mut record) = self.shards.get_mut(&shard_id) {
            record.reconnects += 1;
        }
    }

    /// Health of one shard, if it is tracked.
    pub fn health_of(&self, shard_id: u64) -> Option<ShardHealth> {
        self.shards.get(&shard_id).map(|record| record.health)
    }

    /// Aggregate the records.
    pub fn snapshot(&self) -> StatusSnapshot {
        let mut snapshot = StatusSnapshot {
            shards_total: 0,
            shards_ready: 0,
            shards_live: 0,
            events_received: 0,
            events_dispatched: 0,
            reconnects: 0,
        };
        for record in self.shards.iter() {
            snapshot.shards_total += 1;
            if record.health.is_ready() {
                snapshot.shards_ready += 1;
            }
            if record.health.is_live() {
                snapshot.shards_live += 1;
            }
            snapshot.events_received += record.events_received;
            snapshot.events_dispatched += record.events_dispatched;
            snapshot.reconnects += record.reconnects;
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_generation_starts_connecting() {
        let status = ShardStatusMap::new([0, 1]);
        assert_eq!(status.health_of(0), Some(ShardHealth::Connecting));
        assert_eq!(status.health_of(1), Some(ShardHealth::Connecting));

        let snapshot = status.snapshot();
        assert_eq!(snapshot.shards_total, 2);
        assert!(!snapshot.is_ready());
        assert!(!snapshot.all_live());
    }

    #[test]
    fn one_ready_shard_makes_the_bot_ready() {
        let status = ShardStatusMap::new([0, 1]);
        status.note_health(0, ShardHealth::Ready);

        let snapshot = status.snapshot();
        assert!(snapshot.is_ready());
        assert_eq!(snapshot.shards_ready, 1);
        // The other shard is still connecting, so not everything is
        // live yet.
        assert!(!snapshot.all_live());

        status.note_health(1, ShardHealth::Resuming);
        assert!(status.snapshot().all_live());
    }

    #[test]
    fn counters_roll_up_into_the_snapshot() {
        let status = ShardStatusMap::new([0, 1]);
        status.note_event(0);
        status.note_event(1);
        status.note_event(1);
        status.note_dispatch(1);
        status.note_reconnect(0);

        let snapshot = status.snapshot();
        assert_eq!(snapshot.events_received, 3);
        assert_eq!(snapshot.events_dispatched, 1);
        assert_eq!(snapshot.reconnects, 1);
    }

    #[test]
    fn unknown_shard_ids_are_ignored() {
        let status = ShardStatusMap::new([0]);
        status.note_event(7);
        status.note_health(7, ShardHealth::Ready);

        assert_eq!(status.health_of(7), None);
        let snapshot = status.snapshot();
        assert_eq!(snapshot.shards_total, 1);
        assert_eq!(snapshot.events_received, 0);
        assert!(!snapshot.is_ready());
    }

    #[test]
    fn reset_drops_the_previous_generation() {
        let status = ShardStatusMap::new([0, 1]);
        status.note_health(0, ShardHealth::Ready);
        status.note_event(0);

        status.reset(0..4);
        let snapshot = status.snapshot();
        assert_eq!(snapshot.shards_total, 4);
        assert_eq!(snapshot.events_received, 0);
        assert_eq!(status.health_of(0), Some(ShardHealth::Connecting));
    }
}
