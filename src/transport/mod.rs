//! Websocket event adapter
//!
//! Wraps a tokio-tungstenite connection so that every transport event
//! arrives as one tagged [`InboundEvent`] on the shard's event channel,
//! in callback order. The adapter never inspects payload contents; the
//! state machine owns all interpretation.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::GatewayError;
use crate::shard::InboundEvent;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Write half of one gateway connection.
///
/// The read half lives in a spawned task that feeds the event channel
/// until the transport signals disconnect or the channel is replaced.
pub struct WsHandle {
    write: WsSink,
}

/// Open a websocket and start translating its events onto `events`.
///
/// `buffer_size` bounds both message and frame size; endpoint identity
/// is verified by the TLS layer for `wss://` URLs.
pub async fn connect(
    buffer_size: usize,
    url: &str,
    events: mpsc::Sender<InboundEvent>,
) -> Result<WsHandle, GatewayError> {
    let config = WebSocketConfig {
        max_message_size: Some(buffer_size),
        max_frame_size: Some(buffer_size),
        ..Default::default()
    };

    let (stream, _response) = connect_async_with_config(url, Some(config), false)
        .await
        .map_err(|source| GatewayError::Transport {
            source: Box::new(source),
        })?;

    let (write, read) = stream.split();
    tokio::spawn(read_loop(read, events));

    Ok(WsHandle { write })
}

impl WsHandle {
    /// Encode and send one frame.
    pub async fn send_json<T: Serialize>(&mut self, frame: &T) -> Result<(), GatewayError> {
        let text =
            serde_json::to_string(frame).map_err(|source| GatewayError::Serialization { source })?;
        self.write
            .send(Message::Text(text))
            .await
            .map_err(|source| GatewayError::Transport {
                source: Box::new(source),
            })
    }

    /// Initiate a normal close. Errors are logged and swallowed so a
    /// reconnect can never fail on the way out; events from the old
    /// connection keep arriving until the transport signals disconnect.
    pub async fn close(mut self) {
        if let Err(err) = self.write.send(Message::Close(None)).await {
            debug!(error = %err, "websocket close failed (ignored)");
        }
    }
}

async fn read_loop(
    mut read: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    events: mpsc::Sender<InboundEvent>,
) {
    while let Some(item) = read.next().await {
        let event = match item {
            Ok(Message::Text(text)) => InboundEvent::Message(text),
            Ok(Message::Close(frame)) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                    None => (None, String::new()),
                };
                let _ = events.send(InboundEvent::Disconnect { code, reason }).await;
                return;
            }
            // Ping/pong are answered by tungstenite itself; the v6 json
            // wire never carries binary frames.
            Ok(_) => continue,
            Err(err) => InboundEvent::Error(err.to_string()),
        };
        if events.send(event).await.is_err() {
            // Channel replaced by a reconnect; this connection is
            // abandoned.
            return;
        }
    }

    // Stream ended without a close frame.
    let _ = events
        .send(InboundEvent::Disconnect {
            code: None,
            reason: "transport stream ended".to_owned(),
        })
        .await;
}
