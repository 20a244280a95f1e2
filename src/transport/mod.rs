//! Envelope transports.
//!
//! Both transports answer the same question, "send this request envelope and
//! give me its response", and are chosen once at session setup:
//! - [`Transport::DataChannel`]: many requests multiplexed on one data channel
//! - [`Transport::Stream`]: one stream per request via a [`StreamTunnel`]

use std::sync::Arc;
use std::time::Duration;

use crate::envelope::{Envelope, RequestEnvelope, ResponseEnvelope};
use crate::error::{TunnelError, TunnelResult};
use crate::stream::{Host, IrohHost, StreamTunnel};

pub mod mux;

pub use mux::{Multiplexer, Outbound, MAX_CHANNEL_MESSAGE};

/// About 30 years out; used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, saturating instead of panicking on overflow.
pub fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Sends request envelopes to one fixed peer through a [`StreamTunnel`].
pub struct StreamTransport<H: Host> {
    tunnel: Arc<StreamTunnel<H>>,
    peer: H::PeerId,
}

impl<H: Host> StreamTransport<H> {
    pub fn new(tunnel: Arc<StreamTunnel<H>>, peer: H::PeerId) -> Self {
        Self { tunnel, peer }
    }

    pub fn peer(&self) -> &H::PeerId {
        &self.peer
    }

    pub async fn send_and_await(
        &self,
        req: RequestEnvelope,
        timeout: Duration,
    ) -> TunnelResult<ResponseEnvelope> {
        let id = req.id.clone();
        log::info!(
            "Sending request {} {} {} to {} ({} bytes)",
            id,
            req.method,
            req.path,
            self.peer,
            req.body.len()
        );
        let raw = Envelope::Request(req).encode()?;
        let reply = match self.tunnel.call(&self.peer, &raw, Some(timeout)).await {
            Ok(reply) => reply,
            Err(TunnelError::GatewayTimeout { timeout, .. }) => {
                log::error!("Timeout waiting for response to {}", id);
                return Err(TunnelError::GatewayTimeout { id, timeout });
            }
            Err(e) => return Err(e),
        };

        match Envelope::decode(&reply)? {
            Envelope::Response(res) if res.id == id => Ok(res),
            Envelope::Response(res) => Err(TunnelError::MalformedEnvelope(format!(
                "Response id {} does not match request {}",
                res.id, id
            ))),
            Envelope::Request(_) => Err(TunnelError::MalformedEnvelope(
                "Peer answered with a request envelope".into(),
            )),
        }
    }
}

/// The active transport of a bridge.
pub enum Transport<H: Host = IrohHost> {
    DataChannel(Arc<Multiplexer>),
    Stream(Arc<StreamTransport<H>>),
}

impl<H: Host> Clone for Transport<H> {
    fn clone(&self) -> Self {
        match self {
            Transport::DataChannel(mux) => Transport::DataChannel(mux.clone()),
            Transport::Stream(stream) => Transport::Stream(stream.clone()),
        }
    }
}

impl<H: Host> Transport<H> {
    pub fn is_ready(&self) -> bool {
        match self {
            Transport::DataChannel(mux) => mux.is_ready(),
            Transport::Stream(_) => true,
        }
    }

    /// Suspend until requests can be sent. Streams are opened on demand, so
    /// the stream transport is always ready.
    pub async fn wait_ready(&self) {
        if let Transport::DataChannel(mux) = self {
            mux.wait_ready().await;
        }
    }

    pub async fn send_and_await(
        &self,
        req: RequestEnvelope,
        timeout: Duration,
    ) -> TunnelResult<ResponseEnvelope> {
        match self {
            Transport::DataChannel(mux) => mux.send_and_await(req, timeout).await,
            Transport::Stream(stream) => stream.send_and_await(req, timeout).await,
        }
    }
}
