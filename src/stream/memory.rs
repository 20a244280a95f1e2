//! In-process [`Host`] implementation.
//!
//! Peers live in a shared [`MemoryNetwork`] and talk over `tokio::io::duplex`
//! pipes, with the same protocol selection as the networked host.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;

use super::negotiate::{accept_protocol, select_protocol, HandlerRegistry};
use super::{Host, P2pStream, StreamHandler};
use crate::error::{TunnelError, TunnelResult};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Registry of in-process peers.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    hosts: DashMap<String, Arc<HandlerRegistry>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a host reachable under `id`.
    pub fn host(self: &Arc<Self>, id: &str) -> MemoryHost {
        let handlers = Arc::new(HandlerRegistry::new());
        self.hosts.insert(id.to_string(), handlers.clone());
        MemoryHost {
            id: id.to_string(),
            network: self.clone(),
            handlers,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryHost {
    id: String,
    network: Arc<MemoryNetwork>,
    handlers: Arc<HandlerRegistry>,
}

impl Host for MemoryHost {
    type PeerId = String;

    fn local_id(&self) -> String {
        self.id.clone()
    }

    fn open_stream(
        &self,
        peer: &String,
        protocol: &str,
    ) -> impl Future<Output = TunnelResult<P2pStream>> + Send {
        let remote = self.network.hosts.get(peer).map(|h| h.value().clone());
        let peer = peer.clone();
        let protocol = protocol.to_string();
        async move {
            let registry = remote
                .ok_or_else(|| TunnelError::ChannelClosed(format!("Unknown peer {}", peer)))?;

            let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
            let (local_recv, local_send) = tokio::io::split(local);
            let (remote_recv, remote_send) = tokio::io::split(remote);
            let mut local = P2pStream::new(local_send, local_recv);
            let mut remote = P2pStream::new(remote_send, remote_recv);

            tokio::spawn(async move {
                match accept_protocol(&mut remote, &registry).await {
                    Ok(handler) => handler(remote).await,
                    Err(e) => log::debug!("Inbound stream rejected: {}", e),
                }
            });

            select_protocol(&mut local, &protocol).await?;
            Ok(local)
        }
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        self.handlers.insert(protocol, handler);
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.handlers.remove(protocol);
    }
}
