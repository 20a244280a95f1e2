//! Websocket client for the signaling relay.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::protocol::SignalMessage;
use crate::error::{TunnelError, TunnelResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Append `room=<room>` to the relay URL.
pub fn room_url(signal_url: &str, room: &str) -> TunnelResult<Url> {
    let mut url = Url::parse(signal_url)
        .map_err(|e| TunnelError::Signaling(format!("Invalid signaling URL {}: {}", signal_url, e)))?;
    url.query_pairs_mut().append_pair("room", room);
    Ok(url)
}

/// Connect to the relay and join `room`.
pub async fn connect(signal_url: &str, room: &str) -> TunnelResult<(SignalSender, SignalReceiver)> {
    let url = room_url(signal_url, room)?;
    info!("Connecting to signaling relay {} (room {})", signal_url, room);
    let (ws, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| TunnelError::Signaling(format!("Failed to connect to {}: {}", url, e)))?;
    let (sink, stream) = ws.split();
    Ok((SignalSender { sink }, SignalReceiver { stream }))
}

/// Sending half of a relay connection.
pub struct SignalSender {
    sink: SplitSink<WsStream, Message>,
}

impl SignalSender {
    pub async fn send(&mut self, msg: &SignalMessage) -> TunnelResult<()> {
        let text = msg.encode()?;
        debug!("Sending {} via relay", msg.kind());
        self.sink
            .send(Message::text(text))
            .await
            .map_err(|e| TunnelError::Signaling(format!("Failed to send {}: {}", msg.kind(), e)))
    }

    pub async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

/// Receiving half of a relay connection.
pub struct SignalReceiver {
    stream: SplitStream<WsStream>,
}

impl SignalReceiver {
    /// Next signaling message.
    ///
    /// Non-text frames and malformed JSON are skipped. `None` once the relay
    /// connection is gone.
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        while let Some(frame) = self.stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text.to_string(),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Signaling connection error: {}", e);
                    return None;
                }
            };
            match SignalMessage::decode(&text) {
                Ok(msg) => return Some(msg),
                Err(e) => warn!("Ignoring relay message: {}", e),
            }
        }
        None
    }
}
