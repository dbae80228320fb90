//! Per-shard gateway state machine
//!
//! A pure reducer over inbound transport events: no I/O, no clocks, no
//! channels. The runner feeds it one event at a time and executes the
//! effects it returns. Everything protocol-visible about a shard —
//! resume eligibility, sequence tracking, heartbeat liveness — lives
//! here so it can be exercised by table-driven tests.

use serde_json::Value;

use crate::protocol::{self, GatewayPayload, HelloData, OpCode};

/// Dispatch event type that carries the session id.
const READY_EVENT: &str = "READY";

/// Protocol behavior toggles threaded into the state machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolFlags {
    /// Shut the shard down on fatal close codes instead of reconnecting.
    pub stop_on_fatal: bool,
}

/// Inbound events, one per transport callback plus the synthetic
/// effect-injection used by debugging and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A websocket attach completed.
    Connect,
    /// The transport closed, with the close frame's code and reason if
    /// one was received.
    Disconnect { code: Option<u16>, reason: String },
    /// Transport-level error; the transport will either recover or
    /// follow up with a `Disconnect`.
    Error(String),
    /// A text frame from the gateway.
    Message(String),
    /// Injected effects, passed through verbatim.
    Effects(Vec<Effect>),
}

/// Effects produced by [`Shard::step`], executed by the runner.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send the identify frame, starting a new session.
    Identify,
    /// Open a fresh socket and send the resume frame.
    Resume,
    /// Start the heartbeat timer at the given interval (milliseconds).
    StartHeartbeat(u64),
    /// Wake the heartbeat branch so it emits a beat now.
    SendHeartbeat,
    /// Tear the connection down and attach a fresh one.
    Reconnect,
    /// Terminal shutdown of this shard.
    Disconnect,
    /// The server demanded a different shard count.
    ReShard,
    /// Transport or protocol error to log; no state change.
    Error(String),
    /// A gateway dispatch to surface on the output channel.
    Dispatch { event_type: String, payload: Value },
}

/// Protocol state of one shard.
#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    /// Shard index in `[0, count)`.
    pub id: u64,
    /// Total shard count currently in use.
    pub count: u64,
    /// Session id from the READY dispatch; cleared on invalid-session.
    pub session_id: Option<String>,
    /// Sequence number of the most recent dispatch.
    pub seq: Option<u64>,
    /// Heartbeat liveness: true once the server has acknowledged the
    /// previous beat, cleared when a beat is sent.
    pub ack: bool,
    /// Close metadata, present between a disconnect and the next
    /// reconnect.
    pub stop_code: Option<u16>,
    pub disconnect_msg: Option<String>,
    /// Set on op 9, consumed (for logging) by the reconnect handler.
    pub invalid_session: bool,
}

impl Shard {
    pub fn new(id: u64, count: u64) -> Self {
        Self {
            id,
            count,
            session_id: None,
            seq: None,
            ack: false,
            stop_code: None,
            disconnect_msg: None,
            invalid_session: false,
        }
    }

    /// A shard may resume only with a live session whose last close code
    /// did not invalidate it.
    pub fn resume_eligible(&self) -> bool {
        self.session_id.is_some()
            && self.seq.is_some()
            && !self
                .stop_code
                .is_some_and(protocol::requires_new_session)
    }

    /// Clear the per-disconnect metadata. Called by the reconnect
    /// handler once the close has been logged.
    pub fn clear_reconnect_meta(&mut self) {
        self.invalid_session = false;
        self.stop_code = None;
        self.disconnect_msg = None;
    }

    /// Advance the state machine by one inbound event.
    ///
    /// Total: every event yields a (possibly empty) effect list, never a
    /// panic or an error.
    pub fn step(&mut self, event: InboundEvent, flags: &ProtocolFlags) -> Vec<Effect> {
        match event {
            InboundEvent::Connect => {
                if self.resume_eligible() {
                    vec![Effect::Resume]
                } else {
                    vec![Effect::Identify]
                }
            }
            InboundEvent::Disconnect { code, reason } => {
                self.stop_code = code;
                self.disconnect_msg = Some(reason);
                // An invalidated session must not be offered for resume
                // on the next attach.
                if code.is_some_and(protocol::requires_new_session) {
                    self.session_id = None;
                    self.seq = None;
                }
                match code {
                    Some(c) if protocol::requires_reshard(c) => vec![Effect::ReShard],
                    Some(c) if flags.stop_on_fatal && protocol::is_fatal(c) => {
                        vec![Effect::Disconnect]
                    }
                    _ => vec![Effect::Reconnect],
                }
            }
            InboundEvent::Error(err) => vec![Effect::Error(err)],
            InboundEvent::Message(text) => self.handle_message(&text),
            InboundEvent::Effects(effects) => effects,
        }
    }

    fn handle_message(&mut self, text: &str) -> Vec<Effect> {
        let payload: GatewayPayload = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(err) => return vec![Effect::Error(format!("undecodable gateway payload: {err}"))],
        };

        match payload.op {
            OpCode::Dispatch => self.handle_dispatch(payload),
            OpCode::Heartbeat => vec![Effect::SendHeartbeat],
            OpCode::Reconnect => vec![Effect::Reconnect],
            OpCode::InvalidSession => {
                self.session_id = None;
                self.seq = None;
                self.invalid_session = true;
                vec![Effect::Reconnect]
            }
            OpCode::Hello => match serde_json::from_value::<HelloData>(payload.d) {
                Ok(hello) => {
                    // The server owes us nothing yet; treat the zeroth
                    // beat as acknowledged.
                    self.ack = true;
                    vec![Effect::StartHeartbeat(hello.heartbeat_interval)]
                }
                Err(err) => vec![Effect::Error(format!("hello without interval: {err}"))],
            },
            OpCode::HeartbeatAck => {
                self.ack = true;
                vec![]
            }
            op @ (OpCode::Identify | OpCode::Resume) => {
                vec![Effect::Error(format!("server sent client-only op {op}"))]
            }
        }
    }

    fn handle_dispatch(&mut self, payload: GatewayPayload) -> Vec<Effect> {
        if let Some(s) = payload.s {
            self.seq = Some(s);
        }
        let Some(event_type) = payload.t else {
            return vec![Effect::Error("dispatch without event type".to_owned())];
        };
        if event_type == READY_EVENT {
            if let Some(session_id) = payload.d.get("session_id").and_then(Value::as_str) {
                self.session_id = Some(session_id.to_owned());
            }
        }
        vec![Effect::Dispatch {
            event_type,
            payload: payload.d,
        }]
    }
}
