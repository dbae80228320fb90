//! Per-shard runtime loop
//!
//! Binds one state machine to its websocket, heartbeat timer, command
//! channel, and stop channel. The loop waits on whichever channel is
//! ready next with a fixed priority — stop, then commands, then
//! heartbeat, then transport events — so shutdown always wins a tie.
//! Effects from the machine are executed here; the two bot-level ones
//! are forwarded to the coordinator.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::events::BotEffect;
use crate::metrics::GatewayMetrics;
use crate::protocol::{heartbeat_frame, identify_frame, resume_frame, CloseCode};
use crate::shard::machine::{Effect, InboundEvent, ProtocolFlags, Shard};
use crate::shard::status::{ShardHealth, ShardStatusMap};
use crate::transport::{self, WsHandle};

/// Capacity of the per-connection inbound event channel.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Capacity of the shard command channel.
pub(crate) const COMMAND_CHANNEL_CAPACITY: usize = 16;

/// Pause before retrying a failed transport open, so a dead endpoint
/// cannot spin the reconnect loop hot.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Commands accepted on a shard's communication channel. Anything else
/// a user might want to say to a shard is not a command the lifecycle
/// understands, and the coordinator drops it.
#[derive(Debug)]
pub enum ShardCommand {
    /// Attach the initial websocket.
    Connect,
    /// Inject a synthetic transport event (debugging and tests).
    Debug(InboundEvent),
}

/// Construction context shared by every runner of one bot.
#[derive(Clone)]
pub struct RunnerContext {
    pub token: String,
    pub gateway_url: String,
    pub buffer_size: usize,
    pub flags: ProtocolFlags,
    pub effects: mpsc::UnboundedSender<(u64, BotEffect)>,
    pub status: ShardStatusMap,
    pub metrics: Arc<GatewayMetrics>,
}

/// One shard's cooperative event loop.
pub struct ShardRunner {
    shard: Shard,
    ctx: RunnerContext,
    ws: Option<WsHandle>,
    event_tx: Option<mpsc::Sender<InboundEvent>>,
    event_rx: Option<mpsc::Receiver<InboundEvent>>,
    heartbeat_tx: Option<mpsc::Sender<()>>,
    heartbeat_rx: Option<mpsc::Receiver<()>>,
    commands: mpsc::Receiver<ShardCommand>,
    stop: oneshot::Receiver<()>,
}

enum Wake {
    Stop,
    Command(Option<ShardCommand>),
    HeartbeatTick,
    Event(InboundEvent),
}

impl ShardRunner {
    pub fn new(
        shard: Shard,
        ctx: RunnerContext,
        commands: mpsc::Receiver<ShardCommand>,
        stop: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            shard,
            ctx,
            ws: None,
            event_tx: None,
            event_rx: None,
            heartbeat_tx: None,
            heartbeat_rx: None,
            commands,
            stop,
        }
    }

    /// Drive the shard until it is stopped or hits a fatal close code.
    /// Returns the shard id for the coordinator's bookkeeping.
    pub async fn run(mut self) -> u64 {
        let shard_id = self.shard.id;
        info!(shard_id, shard_count = self.shard.count, "shard starting");

        loop {
            let wake = {
                let heartbeat = self.heartbeat_rx.as_mut();
                let events = self.event_rx.as_mut();
                tokio::select! {
                    biased;
                    _ = &mut self.stop => Wake::Stop,
                    command = self.commands.recv() => Wake::Command(command),
                    Some(()) = recv_or_pending(heartbeat) => Wake::HeartbeatTick,
                    Some(event) = recv_or_pending(events) => Wake::Event(event),
                }
            };

            match wake {
                Wake::Stop => {
                    info!(shard_id, "shard received stop");
                    break;
                }
                // A closed command channel means the coordinator is gone.
                Wake::Command(None) => break,
                Wake::Command(Some(ShardCommand::Connect)) => {
                    self.ctx.status.note_health(shard_id, ShardHealth::Connecting);
                    if self.attach().await && self.process(InboundEvent::Connect).await.is_break() {
                        break;
                    }
                }
                Wake::Command(Some(ShardCommand::Debug(event))) => {
                    if self.process(event).await.is_break() {
                        break;
                    }
                }
                Wake::HeartbeatTick => self.heartbeat_tick().await,
                Wake::Event(event) => {
                    if self.process(event).await.is_break() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        shard_id
    }

    /// Run one inbound event through the state machine and execute the
    /// effects. Reconnect-style effects queue a follow-up `Connect`
    /// rather than recursing.
    async fn process(&mut self, event: InboundEvent) -> ControlFlow<()> {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            self.observe(&event);
            let effects = self.shard.step(event, &self.ctx.flags);
            for effect in effects {
                if self.handle_effect(effect, &mut queue).await.is_break() {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn observe(&self, event: &InboundEvent) {
        match event {
            InboundEvent::Message(_) => {
                self.ctx.status.note_event(self.shard.id);
                self.ctx.metrics.record_event(self.shard.id);
            }
            InboundEvent::Disconnect { code, reason } => {
                debug!(
                    shard_id = self.shard.id,
                    close_code = ?code,
                    close_code_name = ?close_code_name(*code),
                    reason = %reason,
                    "gateway connection closed"
                );
                self.ctx
                    .status
                    .note_health(self.shard.id, ShardHealth::Disconnected);
            }
            _ => {}
        }
    }

    async fn handle_effect(
        &mut self,
        effect: Effect,
        queue: &mut VecDeque<InboundEvent>,
    ) -> ControlFlow<()> {
        let shard_id = self.shard.id;
        match effect {
            Effect::Identify => {
                debug!(shard_id, "identifying");
                let frame = identify_frame(&self.ctx.token, shard_id, self.shard.count);
                self.send_frame(&frame, "identify").await;
            }
            Effect::Resume => {
                info!(shard_id, seq = ?self.shard.seq, "resuming session");
                self.ctx.status.note_health(shard_id, ShardHealth::Resuming);
                // Resume is only ever emitted for the Connect of a
                // freshly attached socket, so it goes out on that
                // socket. Opening yet another one here would orphan a
                // live connection onto the current event channel, whose
                // eventual close would read as a real disconnect.
                if let (Some(session_id), Some(seq)) =
                    (self.shard.session_id.clone(), self.shard.seq)
                {
                    let frame = resume_frame(&self.ctx.token, &session_id, seq);
                    self.send_frame(&frame, "resume").await;
                }
            }
            Effect::StartHeartbeat(interval_ms) => {
                debug!(shard_id, interval_ms, "starting heartbeat");
                self.start_heartbeat(interval_ms);
            }
            Effect::SendHeartbeat => {
                if let Some(tx) = &self.heartbeat_tx {
                    // A pending tick coalesces with this one.
                    let _ = tx.try_send(());
                }
            }
            Effect::Reconnect => {
                info!(
                    shard_id,
                    close_code = ?self.shard.stop_code,
                    close_code_name = ?close_code_name(self.shard.stop_code),
                    reason = ?self.shard.disconnect_msg,
                    invalid_session = self.shard.invalid_session,
                    "reconnecting"
                );
                self.ctx
                    .metrics
                    .record_reconnect(shard_id, reconnect_reason(&self.shard));
                self.ctx.status.note_reconnect(shard_id);
                self.shard.clear_reconnect_meta();
                self.stop_heartbeat();
                if self.attach().await {
                    queue.push_back(InboundEvent::Connect);
                }
            }
            Effect::Disconnect => {
                warn!(
                    shard_id,
                    close_code = ?self.shard.stop_code,
                    close_code_name = ?close_code_name(self.shard.stop_code),
                    "fatal close code, shutting shard down"
                );
                return ControlFlow::Break(());
            }
            Effect::ReShard => {
                let _ = self.ctx.effects.send((shard_id, BotEffect::ReShard));
            }
            Effect::Error(err) => {
                error!(shard_id, error = %err, "gateway error");
            }
            Effect::Dispatch {
                event_type,
                payload,
            } => {
                if event_type == "READY" || event_type == "RESUMED" {
                    self.ctx.status.note_health(shard_id, ShardHealth::Ready);
                    info!(
                        shard_id,
                        session_id = ?self.shard.session_id,
                        event_type = %event_type,
                        "shard ready"
                    );
                }
                self.ctx.metrics.record_dispatch(shard_id, &event_type);
                self.ctx.status.note_dispatch(shard_id);
                let _ = self.ctx.effects.send((
                    shard_id,
                    BotEffect::DiscordEvent {
                        event_type,
                        payload,
                    },
                ));
            }
        }
        ControlFlow::Continue(())
    }

    /// Send a heartbeat if the previous one was acknowledged; otherwise
    /// declare the connection zombie and reset it.
    async fn heartbeat_tick(&mut self) {
        let shard_id = self.shard.id;
        if self.shard.ack {
            let frame = heartbeat_frame(self.shard.seq);
            self.shard.ack = false;
            debug!(shard_id, seq = ?self.shard.seq, "sending heartbeat");
            self.send_frame(&frame, "heartbeat").await;
            self.ctx.metrics.record_heartbeat(shard_id);
        } else {
            warn!(shard_id, "no ACK since last heartbeat, resetting zombie connection");
            self.ctx.metrics.record_zombie(shard_id);
            self.ctx.status.note_health(shard_id, ShardHealth::Disconnected);
            if self.attach().await {
                // Connect never produces a terminal effect.
                let _ = self.process(InboundEvent::Connect).await;
            }
        }
    }

    /// Open a websocket and install it behind a fresh event channel,
    /// orphaning whatever the previous connection still emits. The
    /// heartbeat stops with the old connection.
    async fn attach(&mut self) -> bool {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.event_tx = Some(events.clone());
        self.event_rx = Some(rx);
        self.stop_heartbeat();

        if let Some(old) = self.ws.take() {
            old.close().await;
        }

        match transport::connect(self.ctx.buffer_size, &self.ctx.gateway_url, events).await {
            Ok(handle) => {
                self.ws = Some(handle);
                true
            }
            Err(err) => {
                error!(
                    shard_id = self.shard.id,
                    error = %err,
                    "failed to open gateway connection"
                );
                self.ctx
                    .metrics
                    .record_error(self.shard.id, err.error_type_label());
                if let Some(tx) = self.event_tx.clone() {
                    let _ = tx.try_send(InboundEvent::Error(format!("connect failed: {err}")));
                    tokio::spawn(async move {
                        tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                        let _ = tx
                            .send(InboundEvent::Disconnect {
                                code: None,
                                reason: "connect failed".to_owned(),
                            })
                            .await;
                    });
                }
                false
            }
        }
    }

    /// Start the heartbeat producer: one immediate tick, then one per
    /// interval. Ticks that find the channel full coalesce; the producer
    /// exits once the channel is closed by a reconnect or shutdown.
    fn start_heartbeat(&mut self, interval_ms: u64) {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(());

        let producer = tx.clone();
        let interval = Duration::from_millis(interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match producer.try_send(()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
                    Err(mpsc::error::TrySendError::Closed(())) => break,
                }
            }
        });

        self.heartbeat_tx = Some(tx);
        self.heartbeat_rx = Some(rx);
        // The server owes no ACK before the first beat.
        self.shard.ack = true;
    }

    fn stop_heartbeat(&mut self) {
        self.heartbeat_tx = None;
        self.heartbeat_rx = None;
    }

    async fn send_frame<T: Serialize>(&mut self, frame: &T, kind: &'static str) {
        let Some(ws) = self.ws.as_mut() else {
            warn!(shard_id = self.shard.id, kind, "no websocket to send on");
            return;
        };
        if let Err(err) = ws.send_json(frame).await {
            // The transport will follow up with a disconnect.
            warn!(shard_id = self.shard.id, kind, error = %err, "gateway send failed");
            self.ctx
                .metrics
                .record_error(self.shard.id, err.error_type_label());
        }
    }

    async fn shutdown(&mut self) {
        self.stop_heartbeat();
        self.commands.close();
        self.event_tx = None;
        self.event_rx = None;
        if let Some(ws) = self.ws.take() {
            ws.close().await;
        }
        self.ctx.status.note_health(self.shard.id, ShardHealth::Dead);
        info!(shard_id = self.shard.id, "shard shut down");
    }
}

/// Table name for a close code, as a log field next to the raw value.
fn close_code_name(code: Option<u16>) -> Option<&'static str> {
    code.and_then(CloseCode::from_u16).map(CloseCode::name)
}

fn reconnect_reason(shard: &Shard) -> &'static str {
    if shard.invalid_session {
        "invalid_session"
    } else if shard.stop_code.is_some() {
        "close"
    } else {
        "requested"
    }
}

/// Await the next value of an optional channel; absent channels never
/// become ready, which disables their select branch.
async fn recv_or_pending<T>(rx: Option<&mut mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
