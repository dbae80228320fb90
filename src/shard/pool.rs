//! Shard pool implementation
//!
//! The bot-level coordinator: owns every shard runner, staggers their
//! connects to respect the identify rate limit, forwards bot-level
//! effects to the output channel, and performs coordinated re-sharding
//! when the server demands it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::events::{BotEffect, OutputEvent};
use crate::metrics::GatewayMetrics;
use crate::rest::{self, Discovery};
use crate::shard::machine::{InboundEvent, ProtocolFlags, Shard};
use crate::shard::runner::{RunnerContext, ShardCommand, ShardRunner, COMMAND_CHANNEL_CAPACITY};
use crate::shard::status::ShardStatusMap;

/// One identify per 5 s window, plus a 100 ms safety margin.
pub const IDENTIFY_STAGGER: Duration = Duration::from_millis(5100);

/// Extra delay after the last connect slot before announcing
/// `ConnectedAllShards`.
const ALL_SHARDS_MARGIN: Duration = Duration::from_millis(100);

/// Connect slot for the shard at stagger `position`.
pub fn connect_delay(position: usize) -> Duration {
    IDENTIFY_STAGGER * position as u32
}

/// When the `ConnectedAllShards` notification fires for `shard_count`
/// shards.
pub fn all_connected_delay(shard_count: usize) -> Duration {
    IDENTIFY_STAGGER * shard_count.saturating_sub(1) as u32 + ALL_SHARDS_MARGIN
}

/// External commands to the coordinator.
#[derive(Debug)]
pub enum PoolCommand {
    /// Stop every shard; the bot exits once all runners drain.
    Disconnect,
    /// Inject a synthetic transport event into one shard (debugging and
    /// tests).
    SendDebugEvent { shard_id: u64, event: InboundEvent },
}

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct ShardPoolOptions {
    /// Discord bot token
    pub token: String,
    /// Fully versioned websocket URL shards connect to
    pub gateway_url: String,
    /// Total shard count
    pub shard_count: u64,
    /// Shard ids this pool runs (normally `0..shard_count`)
    pub shard_ids: Vec<u64>,
    /// Shut shards down on fatal close codes
    pub stop_on_fatal: bool,
    /// Re-shard autonomously on demand
    pub handle_reshard: bool,
    /// Transport max message size in bytes
    pub buffer_size: usize,
}

struct ShardHandle {
    id: u64,
    commands: mpsc::Sender<ShardCommand>,
    stop: Option<oneshot::Sender<()>>,
}

/// Shard pool managing every gateway shard of one bot
pub struct ShardPool {
    token: String,
    gateway_url: String,
    shard_count: u64,
    initial_ids: Vec<u64>,
    flags: ProtocolFlags,
    handle_reshard: bool,
    buffer_size: usize,
    discovery: Arc<dyn Discovery>,
    output: mpsc::UnboundedSender<OutputEvent>,
    status: ShardStatusMap,
    metrics: Arc<GatewayMetrics>,
    shards: Vec<ShardHandle>,
    tasks: JoinSet<u64>,
    effects_tx: mpsc::UnboundedSender<(u64, BotEffect)>,
    effects_rx: mpsc::UnboundedReceiver<(u64, BotEffect)>,
}

impl ShardPool {
    /// Create a new shard pool
    pub fn new(
        options: ShardPoolOptions,
        discovery: Arc<dyn Discovery>,
        output: mpsc::UnboundedSender<OutputEvent>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let status = ShardStatusMap::new(options.shard_ids.iter().copied());
        let (effects_tx, effects_rx) = mpsc::unbounded_channel();

        Self {
            token: options.token,
            gateway_url: options.gateway_url,
            shard_count: options.shard_count,
            initial_ids: options.shard_ids,
            flags: ProtocolFlags {
                stop_on_fatal: options.stop_on_fatal,
            },
            handle_reshard: options.handle_reshard,
            buffer_size: options.buffer_size,
            discovery,
            output,
            status,
            metrics,
            shards: Vec::new(),
            tasks: JoinSet::new(),
            effects_tx,
            effects_rx,
        }
    }

    /// Get shared status (for health checks)
    pub fn status(&self) -> ShardStatusMap {
        self.status.clone()
    }

    /// Run the bot: spawn all shards, stagger their connects, and drive
    /// the coordinator loop until every runner has stopped.
    ///
    /// The only error surfaced is session-start-limit exhaustion during
    /// a re-shard; everything else is logged or becomes an output event.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PoolCommand>,
    ) -> Result<(), GatewayError> {
        let ids = self.initial_ids.clone();
        self.spawn_shards(&ids);
        self.schedule_connects();

        let mut commands_closed = false;
        loop {
            if self.tasks.is_empty() {
                break;
            }

            tokio::select! {
                Some((shard_id, effect)) = self.effects_rx.recv() => {
                    match effect {
                        BotEffect::DiscordEvent { event_type, payload } => {
                            let _ = self.output.send(OutputEvent::Dispatch { event_type, payload });
                        }
                        BotEffect::ReShard => {
                            warn!(shard_id, "server demanded a re-shard");
                            let _ = self.output.send(OutputEvent::ReShard);
                            if self.handle_reshard {
                                self.reshard().await?;
                            } else {
                                info!("re-shard handling disabled, stopping shards");
                                self.stop_shards();
                                self.drain_tasks().await;
                                self.forward_pending_dispatches();
                                return Ok(());
                            }
                        }
                    }
                }
                command = commands.recv(), if !commands_closed => {
                    match command {
                        Some(PoolCommand::Disconnect) => {
                            info!("disconnect requested, stopping all shards");
                            self.stop_shards();
                        }
                        Some(PoolCommand::SendDebugEvent { shard_id, event }) => {
                            self.send_debug_event(shard_id, event).await;
                        }
                        None => {
                            // Caller dropped the command channel; treat
                            // as a disconnect.
                            commands_closed = true;
                            self.stop_shards();
                        }
                    }
                }
                Some(result) = self.tasks.join_next() => {
                    match result {
                        Ok(shard_id) => debug!(shard_id, "shard task finished"),
                        Err(err) => error!(error = %err, "shard task failed"),
                    }
                }
            }
        }

        self.forward_pending_dispatches();
        info!("all shards stopped, bot loop exiting");
        Ok(())
    }

    /// Stop every shard, drain the runners, re-discover the gateway,
    /// and start a fresh generation with the recommended shard count.
    async fn reshard(&mut self) -> Result<(), GatewayError> {
        self.stop_shards();
        self.drain_tasks().await;

        let gateway = match self.discovery.gateway_bot().await {
            Ok(gateway) => gateway,
            Err(err) => {
                // Without a discovery response there is nothing to
                // re-shard onto; stop cleanly.
                error!(error = %err, "gateway discovery failed during re-shard");
                self.forward_pending_dispatches();
                return Ok(());
            }
        };

        let remaining = gateway.session_start_limit.remaining;
        if gateway.shards > remaining {
            return Err(GatewayError::SessionStartLimitExhausted {
                token: self.token.clone(),
                shards_requested: gateway.shards,
                remaining_starts: remaining,
            });
        }

        info!(
            shard_count = gateway.shards,
            remaining_starts = remaining,
            url = %gateway.url,
            "re-sharding"
        );

        self.gateway_url = rest::versioned_gateway_url(&gateway.url);
        self.shard_count = gateway.shards;
        // Stale re-shard demands from the old generation must not
        // retrigger; their dispatches still go out.
        self.forward_pending_dispatches();

        let ids: Vec<u64> = (0..gateway.shards).collect();
        self.status.reset(ids.iter().copied());
        self.spawn_shards(&ids);
        self.schedule_connects();
        Ok(())
    }

    fn spawn_shards(&mut self, shard_ids: &[u64]) {
        self.shards.clear();

        let ctx = RunnerContext {
            token: self.token.clone(),
            gateway_url: self.gateway_url.clone(),
            buffer_size: self.buffer_size,
            flags: self.flags,
            effects: self.effects_tx.clone(),
            status: self.status.clone(),
            metrics: Arc::clone(&self.metrics),
        };

        for &shard_id in shard_ids {
            let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
            let (stop_tx, stop_rx) = oneshot::channel();
            let runner = ShardRunner::new(
                Shard::new(shard_id, self.shard_count),
                ctx.clone(),
                command_rx,
                stop_rx,
            );
            self.tasks.spawn(runner.run());
            self.shards.push(ShardHandle {
                id: shard_id,
                commands: command_tx,
                stop: Some(stop_tx),
            });
        }

        info!(
            shard_count = shard_ids.len(),
            total_shards = self.shard_count,
            "shards spawned"
        );
    }

    /// Schedule one connect per identify window and the
    /// `ConnectedAllShards` notification after the last slot. The timers
    /// are fire-and-forget: a slot that fires for an already-stopped
    /// shard is dropped on the closed command channel.
    fn schedule_connects(&self) {
        for (position, handle) in self.shards.iter().enumerate() {
            let commands = handle.commands.clone();
            let shard_id = handle.id;
            let delay = connect_delay(position);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if commands.send(ShardCommand::Connect).await.is_err() {
                    debug!(shard_id, "connect slot fired for a stopped shard");
                }
            });
        }

        let output = self.output.clone();
        let delay = all_connected_delay(self.shards.len());
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = output.send(OutputEvent::ConnectedAllShards);
        });
    }

    /// Signal stop to every runner. Shard vectors are untouched; shards
    /// drop out as their tasks resolve.
    fn stop_shards(&mut self) {
        for handle in &mut self.shards {
            if let Some(stop) = handle.stop.take() {
                let _ = stop.send(());
            }
        }
    }

    async fn drain_tasks(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                error!(error = %err, "shard task failed during drain");
            }
        }
    }

    /// Forward dispatches still queued from runners that have stopped;
    /// drop everything else.
    fn forward_pending_dispatches(&mut self) {
        while let Ok((_, effect)) = self.effects_rx.try_recv() {
            if let BotEffect::DiscordEvent {
                event_type,
                payload,
            } = effect
            {
                let _ = self.output.send(OutputEvent::Dispatch {
                    event_type,
                    payload,
                });
            }
        }
    }

    async fn send_debug_event(&self, shard_id: u64, event: InboundEvent) {
        match self.shards.iter().find(|handle| handle.id == shard_id) {
            Some(handle) => {
                if handle
                    .commands
                    .send(ShardCommand::Debug(event))
                    .await
                    .is_err()
                {
                    warn!(shard_id, "debug event dropped: shard stopped");
                }
            }
            None => warn!(shard_id, "debug event dropped: unknown shard"),
        }
    }
}
