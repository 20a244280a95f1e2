//! [`Host`] backed by an iroh endpoint.
//!
//! All protocols share one ALPN; the protocol id is selected per stream (see
//! [`super::negotiate`]). One QUIC connection per remote peer is cached and
//! reused, every exchange opens a fresh bidirectional stream on it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use iroh::{
    discovery::{dns::DnsDiscovery, pkarr::PkarrPublisher},
    endpoint::Connection,
    Endpoint, EndpointAddr, EndpointId, RelayMap, RelayMode, RelayUrl, SecretKey,
};
use tokio::task::JoinHandle;

use super::negotiate::{accept_protocol, select_protocol, HandlerRegistry};
use super::{Host, P2pStream, StreamHandler};
use crate::error::{TunnelError, TunnelResult};

/// ALPN shared by every tunnel protocol.
pub const ALPN: &[u8] = b"tunnel-http/1";

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Keep NAT mappings alive between requests.
pub const QUIC_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub const QUIC_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Parse relay URL strings into a RelayMode.
pub fn parse_relay_mode(relay_urls: &[String]) -> Result<RelayMode> {
    if relay_urls.is_empty() {
        return Ok(RelayMode::Default);
    }
    let parsed: Vec<RelayUrl> = relay_urls
        .iter()
        .map(|url| url.parse().context(format!("Invalid relay URL: {}", url)))
        .collect::<Result<Vec<_>>>()?;
    Ok(RelayMode::Custom(RelayMap::from_iter(parsed)))
}

pub struct IrohHost {
    endpoint: Endpoint,
    handlers: Arc<HandlerRegistry>,
    connections: DashMap<EndpointId, Connection>,
    accept_task: JoinHandle<()>,
}

impl IrohHost {
    /// Bind an endpoint and start accepting inbound connections.
    pub async fn bind(secret: Option<SecretKey>, relay_urls: &[String]) -> Result<Self> {
        let mut transport_config = iroh::endpoint::TransportConfig::default();
        let idle_timeout = QUIC_IDLE_TIMEOUT
            .try_into()
            .context("converting QUIC_IDLE_TIMEOUT to IdleTimeout")?;
        transport_config.max_idle_timeout(Some(idle_timeout));
        transport_config.keep_alive_interval(Some(QUIC_KEEP_ALIVE_INTERVAL));

        let mut builder = Endpoint::empty_builder(parse_relay_mode(relay_urls)?)
            .transport_config(transport_config)
            .discovery(PkarrPublisher::n0_dns())
            .discovery(DnsDiscovery::n0_dns())
            .alpns(vec![ALPN.to_vec()]);
        if let Some(secret) = secret {
            builder = builder.secret_key(secret);
        }

        let endpoint = builder.bind().await.context("Failed to create iroh endpoint")?;

        println!(
            "Waiting for endpoint to come online (timeout: {}s)...",
            CONNECT_TIMEOUT.as_secs()
        );
        if tokio::time::timeout(CONNECT_TIMEOUT, endpoint.online())
            .await
            .is_err()
        {
            anyhow::bail!(
                "Endpoint failed to come online after {}s - check relay server connectivity",
                CONNECT_TIMEOUT.as_secs()
            );
        }

        let handlers = Arc::new(HandlerRegistry::new());
        let accept_task = tokio::spawn(accept_loop(endpoint.clone(), handlers.clone()));

        Ok(Self {
            endpoint,
            handlers,
            connections: DashMap::new(),
            accept_task,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect(&self, peer: EndpointId) -> TunnelResult<Connection> {
        log::info!("Connecting to peer {}...", peer);
        let conn = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            self.endpoint.connect(EndpointAddr::new(peer), ALPN),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(TunnelError::ChannelClosed(format!(
                    "Failed to connect to {}: {}",
                    peer, e
                )))
            }
            Err(_) => {
                return Err(TunnelError::ChannelClosed(format!(
                    "Connection to {} timed out after {}s",
                    peer,
                    CONNECT_TIMEOUT.as_secs()
                )))
            }
        };
        self.connections.insert(peer, conn.clone());
        Ok(conn)
    }

    async fn open_bi(&self, peer: EndpointId) -> TunnelResult<P2pStream> {
        let cached = self.connections.get(&peer).map(|c| c.value().clone());
        if let Some(conn) = cached {
            match conn.open_bi().await {
                Ok((send, recv)) => return Ok(P2pStream::new(send, recv)),
                Err(e) => {
                    log::debug!("Cached connection to {} unusable: {}", peer, e);
                    self.connections.remove(&peer);
                }
            }
        }

        let conn = self.connect(peer).await?;
        let (send, recv) = conn.open_bi().await.map_err(|e| {
            TunnelError::ChannelClosed(format!("Failed to open stream to {}: {}", peer, e))
        })?;
        Ok(P2pStream::new(send, recv))
    }

    /// Close all connections and the endpoint.
    pub async fn shutdown(&self) {
        self.accept_task.abort();
        for entry in self.connections.iter() {
            entry.value().close(0u32.into(), b"done");
        }
        self.connections.clear();
        self.endpoint.close().await;
    }
}

impl Drop for IrohHost {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl Host for IrohHost {
    type PeerId = EndpointId;

    fn local_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    async fn open_stream(&self, peer: &EndpointId, protocol: &str) -> TunnelResult<P2pStream> {
        let mut stream = self.open_bi(*peer).await?;
        // The protocol id frame is also what makes the new stream visible to the peer.
        select_protocol(&mut stream, protocol).await?;
        Ok(stream)
    }

    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        self.handlers.insert(protocol, handler);
    }

    fn remove_stream_handler(&self, protocol: &str) {
        self.handlers.remove(protocol);
    }
}

async fn accept_loop(endpoint: Endpoint, handlers: Arc<HandlerRegistry>) {
    loop {
        let conn = match endpoint.accept().await {
            Some(incoming) => match incoming.await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
            None => {
                log::info!("Endpoint closed");
                break;
            }
        };

        let remote_id = conn.remote_id();
        log::info!("Peer connected: {}", remote_id);

        let handlers = handlers.clone();
        tokio::spawn(async move {
            loop {
                let (send, recv) = match conn.accept_bi().await {
                    Ok(streams) => streams,
                    Err(e) => {
                        log::info!("Peer {} disconnected: {}", remote_id, e);
                        break;
                    }
                };
                let handlers = handlers.clone();
                tokio::spawn(async move {
                    let mut stream = P2pStream::new(send, recv);
                    match accept_protocol(&mut stream, &handlers).await {
                        Ok(handler) => handler(stream).await,
                        Err(e) => log::debug!("Inbound stream from {} rejected: {}", remote_id, e),
                    }
                });
            }
        });
    }
}
