//! Room-based websocket relay.
//!
//! Peers connect with `?room=<name>`. Every text message from a member is
//! forwarded verbatim to every other member of the same room. Delivery is best
//! effort: a dead peer never blocks delivery to the rest.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

/// Rejection body when the `room` query parameter is absent.
pub const MISSING_ROOM: &str = "room is required";

type Members = HashMap<u64, mpsc::UnboundedSender<String>>;

/// Room name → members. Empty rooms are removed.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Members>>,
    next_key: AtomicU64,
}

/// A member's place in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub room: String,
    pub key: u64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member. Returns its membership and the queue of messages relayed to it.
    pub async fn join(&self, room: &str) -> (Membership, mpsc::UnboundedReceiver<String>) {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room.to_string()).or_default();
        members.insert(key, tx);
        debug!("Peer {} joined room {} ({} members)", key, room, members.len());
        (
            Membership {
                room: room.to_string(),
                key,
            },
            rx,
        )
    }

    pub async fn leave(&self, membership: &Membership) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(&membership.room) {
            members.remove(&membership.key);
            debug!(
                "Peer {} left room {} ({} members)",
                membership.key,
                membership.room,
                members.len()
            );
            if members.is_empty() {
                rooms.remove(&membership.room);
                info!("Room {} removed", membership.room);
            }
        }
    }

    /// Relay `text` to every member of the sender's room except the sender.
    ///
    /// Returns the number of members the message was queued for.
    pub async fn broadcast(&self, from: &Membership, text: &str) -> usize {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(&from.room) else {
            return 0;
        };
        let mut delivered = 0;
        for (key, tx) in members {
            if *key == from.key {
                continue;
            }
            if tx.send(text.to_string()).is_ok() {
                delivered += 1;
            } else {
                debug!("Peer {} in room {} is gone, skipping", key, from.room);
            }
        }
        debug!(
            "Relayed {} bytes from peer {} to {} peers in room {}",
            text.len(),
            from.key,
            delivered,
            from.room
        );
        delivered
    }

    pub async fn member_count(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, |m| m.len())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

/// Extract a non-empty `room` from a request query string.
pub fn room_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "room")
        .map(|(_, value)| value.into_owned())
        .filter(|room| !room.is_empty())
}

/// Websocket signaling relay
#[derive(Debug, Clone, Default)]
pub struct SignalingRelay {
    registry: Arc<RoomRegistry>,
}

impl SignalingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Bind and serve forever.
    pub async fn run(&self, bind_addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind signaling relay on {}", bind_addr))?;
        info!("Signaling relay listening on ws://{}/ws", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("Connection from {}", peer_addr);
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_peer(stream, registry).await {
                            debug!("Peer {} disconnected: {:#}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_peer<S>(stream: S, registry: Arc<RoomRegistry>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut room = None;
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match room_from_query(req.uri().query()) {
            Some(name) => {
                room = Some(name);
                Ok(resp)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some(MISSING_ROOM.to_string()));
                *rejection.status_mut() = StatusCode::BAD_REQUEST;
                Err(rejection)
            }
        }
    })
    .await
    .context("Websocket handshake failed")?;
    let room = room.context("Handshake accepted without a room")?;

    let (mut sink, mut stream) = ws.split();
    let (membership, mut relayed) = registry.join(&room).await;

    let writer = tokio::spawn(async move {
        while let Some(text) = relayed.recv().await {
            if sink.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut loop_error = None;
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                registry.broadcast(&membership, &text.to_string()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                loop_error = Some(e);
                break;
            }
        }
    }

    // Always leave the room, whatever ended the loop.
    registry.leave(&membership).await;
    writer.abort();

    match loop_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;

    #[tokio::test]
    async fn test_registry_broadcast_skips_sender_and_other_rooms() {
        let registry = RoomRegistry::new();
        let (a, mut a_rx) = registry.join("R").await;
        let (_b, mut b_rx) = registry.join("R").await;
        let (_c, mut c_rx) = registry.join("R").await;
        let (_s, mut s_rx) = registry.join("S").await;

        assert_eq!(registry.broadcast(&a, "hello").await, 2);
        assert_eq!(b_rx.recv().await.unwrap(), "hello");
        assert_eq!(c_rx.recv().await.unwrap(), "hello");
        assert!(a_rx.try_recv().is_err());
        assert!(s_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_registry_dead_member_does_not_block_others() {
        let registry = RoomRegistry::new();
        let (a, _a_rx) = registry.join("R").await;
        let (_b, b_rx) = registry.join("R").await;
        let (_c, mut c_rx) = registry.join("R").await;
        drop(b_rx);

        assert_eq!(registry.broadcast(&a, "x").await, 1);
        assert_eq!(c_rx.recv().await.unwrap(), "x");
    }

    #[tokio::test]
    async fn test_registry_removes_empty_room() {
        let registry = RoomRegistry::new();
        let (a, _a_rx) = registry.join("R").await;
        let (b, _b_rx) = registry.join("R").await;
        assert_eq!(registry.member_count("R").await, 2);

        registry.leave(&a).await;
        assert_eq!(registry.member_count("R").await, 1);
        registry.leave(&b).await;
        assert_eq!(registry.room_count().await, 0);

        // Leaving twice is harmless.
        registry.leave(&b).await;
    }

    #[test]
    fn test_room_from_query() {
        assert_eq!(room_from_query(Some("room=ROOM123")), Some("ROOM123".into()));
        assert_eq!(room_from_query(Some("a=1&room=x%20y")), Some("x y".into()));
        assert_eq!(room_from_query(Some("room=")), None);
        assert_eq!(room_from_query(Some("other=1")), None);
        assert_eq!(room_from_query(None), None);
    }

    async fn start_relay() -> (SocketAddr, SignalingRelay) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = SignalingRelay::new();
        let server = relay.clone();
        tokio::spawn(async move { server.serve(listener).await });
        (addr, relay)
    }

    async fn wait_for_members(relay: &SignalingRelay, room: &str, n: usize) {
        for _ in 0..200 {
            if relay.registry().member_count(room).await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("room {} never reached {} members", room, n);
    }

    #[tokio::test]
    async fn test_relay_over_websocket() {
        let (addr, relay) = start_relay().await;
        let url = |room: &str| format!("ws://{}/ws?room={}", addr, room);

        let (mut a, _) = connect_async(url("R")).await.unwrap();
        let (mut b, _) = connect_async(url("R")).await.unwrap();
        let (mut s, _) = connect_async(url("S")).await.unwrap();
        wait_for_members(&relay, "R", 2).await;
        wait_for_members(&relay, "S", 1).await;

        a.send(Message::text(r#"{"type":"offer","sdp":"v=0"}"#))
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), b.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.to_text().unwrap(), r#"{"type":"offer","sdp":"v=0"}"#);

        // Neither the sender nor the other room sees it.
        assert!(tokio::time::timeout(Duration::from_millis(200), a.next())
            .await
            .is_err());
        assert!(tokio::time::timeout(Duration::from_millis(200), s.next())
            .await
            .is_err());

        drop(b);
        wait_for_members(&relay, "R", 1).await;
    }

    #[tokio::test]
    async fn test_missing_room_is_rejected() {
        let (addr, _relay) = start_relay().await;
        let err = connect_async(format!("ws://{}/ws", addr)).await.unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(resp) => {
                assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_over_in_memory_stream() {
        let registry = Arc::new(RoomRegistry::new());
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let peer = tokio::spawn(handle_peer(server_io, registry.clone()));

        let (mut ws, _) = tokio_tungstenite::client_async("ws://relay/ws?room=mem", client_io)
            .await
            .unwrap();
        for _ in 0..200 {
            if registry.member_count("mem").await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.member_count("mem").await, 1);

        ws.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), peer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(registry.member_count("mem").await, 0);
    }
}
