//! Gateway lifecycle scenarios
//!
//! Drives real shard runners against an in-process websocket server:
//! identify, READY dispatch, resume after a benign close, zombie
//! heartbeat reset, debug injection, and the two re-shard outcomes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use wintermute_gateway::error::GatewayError;
use wintermute_gateway::events::OutputEvent;
use wintermute_gateway::metrics::GatewayMetrics;
use wintermute_gateway::rest::{Discovery, GatewayBot, SessionStartLimit};
use wintermute_gateway::shard::{
    Effect, InboundEvent, PoolCommand, ShardPool, ShardPoolOptions,
};

type ServerWs = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

struct StubDiscovery {
    shards: u64,
    remaining: u64,
}

#[async_trait]
impl Discovery for StubDiscovery {
    async fn gateway_bot(&self) -> Result<GatewayBot, GatewayError> {
        Ok(GatewayBot {
            url: "ws://127.0.0.1:1".to_owned(),
            shards: self.shards,
            session_start_limit: SessionStartLimit {
                total: 1000,
                remaining: self.remaining,
                reset_after: 14_400_000,
                max_concurrency: 1,
            },
        })
    }
}

fn discovery(shards: u64, remaining: u64) -> Arc<dyn Discovery> {
    Arc::new(StubDiscovery { shards, remaining })
}

fn metrics() -> Arc<GatewayMetrics> {
    Arc::new(GatewayMetrics::new())
}

fn options(url: &str, shard_count: u64, handle_reshard: bool) -> ShardPoolOptions {
    ShardPoolOptions {
        token: "test-token".to_owned(),
        gateway_url: url.to_owned(),
        shard_count,
        shard_ids: (0..shard_count).collect(),
        stop_on_fatal: false,
        handle_reshard,
        buffer_size: 4 * 1024 * 1024,
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("timed out waiting for a connection")
        .unwrap();
    accept_async(stream).await.unwrap()
}

/// Read frames until the next text payload, returning its op and body.
async fn recv_op(ws: &mut ServerWs) -> (u64, Value) {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = message {
            let value: Value = serde_json::from_str(&text).unwrap();
            return (value["op"].as_u64().unwrap(), value);
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn close_with(ws: &mut ServerWs, code: u16) {
    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    })))
    .await
    .unwrap();
}

async fn next_event(output: &mut mpsc::UnboundedReceiver<OutputEvent>) -> OutputEvent {
    timeout(WAIT, output.recv())
        .await
        .expect("timed out waiting for an output event")
        .expect("output channel closed")
}

/// Skip output events until the wanted dispatch arrives.
async fn await_dispatch(
    output: &mut mpsc::UnboundedReceiver<OutputEvent>,
    wanted: &str,
) -> Value {
    loop {
        if let OutputEvent::Dispatch {
            event_type,
            payload,
        } = next_event(output).await
        {
            if event_type == wanted {
                return payload;
            }
        }
    }
}

#[tokio::test]
async fn shard_identifies_surfaces_ready_and_resumes() {
    let (listener, url) = bind().await;
    let (output_tx, mut output) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let pool = ShardPool::new(options(&url, 1, true), discovery(1, 1000), output_tx, metrics());
    let bot = tokio::spawn(pool.run(command_rx));

    let mut ws = accept(&listener).await;

    let (op, frame) = recv_op(&mut ws).await;
    assert_eq!(op, 2, "fresh shard must identify");
    assert_eq!(frame["d"]["token"], "test-token");
    assert_eq!(frame["d"]["shard"], json!([0, 1]));
    assert_eq!(frame["d"]["properties"]["$os"], "linux");

    send_json(&mut ws, json!({"op": 10, "d": {"heartbeat_interval": 45_000}})).await;
    let (op, frame) = recv_op(&mut ws).await;
    assert_eq!(op, 1, "first heartbeat follows the hello");
    assert!(frame["d"].is_null(), "no sequence seen yet");

    send_json(
        &mut ws,
        json!({"op": 0, "t": "READY", "s": 1, "d": {"session_id": "abc"}}),
    )
    .await;
    let payload = await_dispatch(&mut output, "READY").await;
    assert_eq!(payload["session_id"], "abc");

    // Benign server close: the shard reconnects and resumes.
    close_with(&mut ws, 4000).await;
    let mut ws = accept(&listener).await;
    let (op, frame) = recv_op(&mut ws).await;
    assert_eq!(op, 6, "live session must resume, not identify");
    assert_eq!(frame["d"]["session_id"], "abc");
    assert_eq!(frame["d"]["seq"], 1);

    command_tx.send(PoolCommand::Disconnect).unwrap();
    timeout(WAIT, bot).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn zombie_connection_is_reset() {
    let (listener, url) = bind().await;
    let (output_tx, _output) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let pool = ShardPool::new(options(&url, 1, true), discovery(1, 1000), output_tx, metrics());
    let bot = tokio::spawn(pool.run(command_rx));

    let mut ws = accept(&listener).await;
    let (op, _) = recv_op(&mut ws).await;
    assert_eq!(op, 2);

    // Short interval, and never acknowledge anything.
    send_json(&mut ws, json!({"op": 10, "d": {"heartbeat_interval": 100}})).await;
    let (op, _) = recv_op(&mut ws).await;
    assert_eq!(op, 1);

    // The next tick finds the beat unacknowledged: the runner resets
    // the connection, and with no session established it identifies.
    let mut ws = accept(&listener).await;
    let (op, _) = recv_op(&mut ws).await;
    assert_eq!(op, 2, "zombie reset without a session must identify");

    command_tx.send(PoolCommand::Disconnect).unwrap();
    timeout(WAIT, bot).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn injected_effects_reach_the_output_channel() {
    let (listener, url) = bind().await;
    let (output_tx, mut output) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let pool = ShardPool::new(options(&url, 1, true), discovery(1, 1000), output_tx, metrics());
    let bot = tokio::spawn(pool.run(command_rx));

    let mut ws = accept(&listener).await;
    let (op, _) = recv_op(&mut ws).await;
    assert_eq!(op, 2);

    command_tx
        .send(PoolCommand::SendDebugEvent {
            shard_id: 0,
            event: InboundEvent::Effects(vec![Effect::Dispatch {
                event_type: "SYNTHETIC".to_owned(),
                payload: json!({"ok": true}),
            }]),
        })
        .unwrap();

    let payload = await_dispatch(&mut output, "SYNTHETIC").await;
    assert_eq!(payload["ok"], true);

    command_tx.send(PoolCommand::Disconnect).unwrap();
    timeout(WAIT, bot).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn connected_all_shards_is_announced() {
    let (listener, url) = bind().await;
    let (output_tx, mut output) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let pool = ShardPool::new(options(&url, 1, true), discovery(1, 1000), output_tx, metrics());
    let bot = tokio::spawn(pool.run(command_rx));

    let mut ws = accept(&listener).await;
    let (op, _) = recv_op(&mut ws).await;
    assert_eq!(op, 2);

    loop {
        if next_event(&mut output).await == OutputEvent::ConnectedAllShards {
            break;
        }
    }

    command_tx.send(PoolCommand::Disconnect).unwrap();
    timeout(WAIT, bot).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn reshard_demand_stops_the_bot_when_not_handled() {
    let (listener, url) = bind().await;
    let (output_tx, mut output) = mpsc::unbounded_channel();
    let (_command_tx, command_rx) = mpsc::unbounded_channel::<PoolCommand>();
    let pool = ShardPool::new(options(&url, 2, false), discovery(4, 1000), output_tx, metrics());
    let bot = tokio::spawn(pool.run(command_rx));

    // Only shard 0's connect slot fires within the test; shard 1's
    // scheduled connect lands on a stopped shard and is dropped.
    let mut ws = accept(&listener).await;
    let (op, _) = recv_op(&mut ws).await;
    assert_eq!(op, 2);

    close_with(&mut ws, 4011).await;

    loop {
        if next_event(&mut output).await == OutputEvent::ReShard {
            break;
        }
    }

    let result = timeout(WAIT, bot).await.unwrap().unwrap();
    assert!(result.is_ok(), "surfacing a re-shard is a clean stop");
}

#[tokio::test]
async fn reshard_capacity_exhaustion_is_unrecoverable() {
    let (listener, url) = bind().await;
    let (output_tx, _output) = mpsc::unbounded_channel();
    let (_command_tx, command_rx) = mpsc::unbounded_channel::<PoolCommand>();
    // Discovery wants 4 shards but only one session start remains.
    let pool = ShardPool::new(options(&url, 2, true), discovery(4, 1), output_tx, metrics());
    let bot = tokio::spawn(pool.run(command_rx));

    let mut ws = accept(&listener).await;
    let (op, _) = recv_op(&mut ws).await;
    assert_eq!(op, 2);

    close_with(&mut ws, 4011).await;

    let result = timeout(WAIT, bot).await.unwrap().unwrap();
    match result {
        Err(GatewayError::SessionStartLimitExhausted {
            shards_requested,
            remaining_starts,
            ..
        }) => {
            assert_eq!(shards_requested, 4);
            assert_eq!(remaining_starts, 1);
        }
        other => panic!("expected session start limit exhaustion, got {other:?}"),
    }
}
