//! Protocol selection on a freshly opened stream.
//!
//! The opener writes the protocol id as one frame. The acceptor answers with
//! the same id when it has a handler for it, or with [`NOT_AVAILABLE`].

use dashmap::DashMap;

use super::{P2pStream, StreamHandler};
use crate::error::{TunnelError, TunnelResult};

/// Acceptor reply for an unknown protocol.
pub const NOT_AVAILABLE: &str = "na";

/// Upper bound for a protocol id frame.
const MAX_PROTOCOL_ID_LEN: usize = 1024;

/// Protocol id → inbound stream handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, StreamHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, protocol: &str, handler: StreamHandler) {
        if self.handlers.insert(protocol.to_string(), handler).is_some() {
            log::debug!("Replaced stream handler for {}", protocol);
        }
    }

    pub fn remove(&self, protocol: &str) {
        self.handlers.remove(protocol);
    }

    pub fn get(&self, protocol: &str) -> Option<StreamHandler> {
        self.handlers.get(protocol).map(|h| h.value().clone())
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.handlers.contains_key(protocol)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let protocols: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("HandlerRegistry")
            .field("protocols", &protocols)
            .finish()
    }
}

/// Opener side: request `protocol` and wait for the peer to confirm it.
pub async fn select_protocol(stream: &mut P2pStream, protocol: &str) -> TunnelResult<()> {
    stream.write_frame(protocol.as_bytes()).await?;
    let reply = stream.read_frame(MAX_PROTOCOL_ID_LEN).await?;
    if reply == protocol.as_bytes() {
        Ok(())
    } else {
        Err(TunnelError::Negotiation(format!(
            "Peer does not support protocol {}",
            protocol
        )))
    }
}

/// Acceptor side: read the requested protocol and look up its handler.
pub async fn accept_protocol(
    stream: &mut P2pStream,
    registry: &HandlerRegistry,
) -> TunnelResult<StreamHandler> {
    let requested = stream.read_frame(MAX_PROTOCOL_ID_LEN).await?;
    let protocol = String::from_utf8(requested)
        .map_err(|_| TunnelError::Negotiation("Protocol id is not UTF-8".into()))?;

    match registry.get(&protocol) {
        Some(handler) => {
            stream.write_frame(protocol.as_bytes()).await?;
            Ok(handler)
        }
        None => {
            stream.write_frame(NOT_AVAILABLE.as_bytes()).await?;
            Err(TunnelError::Negotiation(format!(
                "No handler for protocol {}",
                protocol
            )))
        }
    }
}
