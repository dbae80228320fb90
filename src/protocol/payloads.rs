//! Payload framing
//!
//! The inbound `{op, d, s, t}` envelope and the three outbound frames the
//! lifecycle emits. Outbound frames are plain serde structs so the encoded
//! field order is the declaration order; the wire shapes are covered
//! byte-for-byte by `tests/wire_format.rs`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::OpCode;

/// Gateway protocol version spoken on both the REST and websocket sides.
pub const API_VERSION: u8 = 6;

/// Client name reported in the identify properties.
pub const CLIENT_NAME: &str = "wintermute";

/// Inbound gateway message envelope
///
/// `d` defaults to `null` for payloads that omit it (heartbeat ACK),
/// `s`/`t` are only present on dispatches.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayload {
    pub op: OpCode,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

/// `d` of a Hello (op 10)
#[derive(Debug, Clone, Deserialize)]
pub struct HelloData {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

/// Outbound `{op, d}` frame
#[derive(Debug, Clone, Serialize)]
pub struct Frame<T> {
    op: OpCode,
    d: T,
}

/// `d` of an Identify (op 2)
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyData {
    token: String,
    properties: IdentifyProperties,
    compress: bool,
    large_threshold: u8,
    shard: [u64; 2],
}

/// Client connection properties
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyProperties {
    #[serde(rename = "$os")]
    os: &'static str,
    #[serde(rename = "$browser")]
    browser: &'static str,
    #[serde(rename = "$device")]
    device: &'static str,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: "linux",
            browser: CLIENT_NAME,
            device: CLIENT_NAME,
        }
    }
}

/// `d` of a Resume (op 6)
#[derive(Debug, Clone, Serialize)]
pub struct ResumeData {
    token: String,
    session_id: String,
    seq: u64,
}

/// Build the identify frame for one shard.
#[must_use]
pub fn identify_frame(token: &str, shard_id: u64, shard_count: u64) -> Frame<IdentifyData> {
    Frame {
        op: OpCode::Identify,
        d: IdentifyData {
            token: token.to_owned(),
            properties: IdentifyProperties::default(),
            compress: false,
            large_threshold: 50,
            shard: [shard_id, shard_count],
        },
    }
}

/// Build the resume frame for an interrupted session.
#[must_use]
pub fn resume_frame(token: &str, session_id: &str, seq: u64) -> Frame<ResumeData> {
    Frame {
        op: OpCode::Resume,
        d: ResumeData {
            token: token.to_owned(),
            session_id: session_id.to_owned(),
            seq,
        },
    }
}

/// Build a heartbeat frame carrying the last seen sequence number.
#[must_use]
pub fn heartbeat_frame(seq: Option<u64>) -> Frame<Option<u64>> {
    Frame {
        op: OpCode::Heartbeat,
        d: seq,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_decode_hello() {
        let payload: GatewayPayload =
            serde_json::from_str(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(payload.op, OpCode::Hello);
        assert_eq!(payload.s, None);
        assert_eq!(payload.t, None);

        let hello: HelloData = serde_json::from_value(payload.d).unwrap();
        assert_eq!(hello.heartbeat_interval, 41250);
    }

    #[test]
    fn test_payload_decode_dispatch() {
        let payload: GatewayPayload =
            serde_json::from_str(r#"{"op":0,"t":"READY","s":1,"d":{"session_id":"abc"}}"#).unwrap();
        assert_eq!(payload.op, OpCode::Dispatch);
        assert_eq!(payload.s, Some(1));
        assert_eq!(payload.t.as_deref(), Some("READY"));
        assert_eq!(payload.d["session_id"], "abc");
    }

    #[test]
    fn test_payload_decode_ack_without_d() {
        let payload: GatewayPayload = serde_json::from_str(r#"{"op":11}"#).unwrap();
        assert_eq!(payload.op, OpCode::HeartbeatAck);
        assert!(payload.d.is_null());
    }

    #[test]
    fn test_heartbeat_frame_null_seq() {
        let json = serde_json::to_string(&heartbeat_frame(None)).unwrap();
        assert_eq!(json, r#"{"op":1,"d":null}"#);
    }
}
