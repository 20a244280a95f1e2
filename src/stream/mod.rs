//! Stream-oriented P2P transport.
//!
//! A [`Host`] opens and accepts byte streams for a named protocol. On top of
//! it, a [`StreamTunnel`] carries exactly one framed request and one framed
//! response per stream.
//!
//! - `negotiate`: protocol selection on freshly opened streams
//! - `tunnel`: inbound handler registration and outbound calls
//! - `handlers`: raw handlers that reach the local HTTP service
//! - `iroh_host`: [`Host`] backed by an iroh endpoint
//! - `memory`: in-process [`Host`] for wiring peers without a network

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::TunnelResult;
use crate::framing::{read_frame, write_frame, FramingError};

pub mod handlers;
pub mod iroh_host;
pub mod memory;
pub mod negotiate;
pub mod tunnel;

pub use handlers::{EnvelopeHandler, RpcForwarder};
pub use iroh_host::IrohHost;
pub use memory::{MemoryHost, MemoryNetwork};
pub use tunnel::{RawHandler, StreamTunnel};

/// A bidirectional byte stream to a remote peer.
pub struct P2pStream {
    pub send: Box<dyn AsyncWrite + Send + Unpin>,
    pub recv: Box<dyn AsyncRead + Send + Unpin>,
}

impl P2pStream {
    pub fn new<W, R>(send: W, recv: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            send: Box::new(send),
            recv: Box::new(recv),
        }
    }

    pub async fn read_frame(&mut self, max_len: usize) -> Result<Vec<u8>, FramingError> {
        read_frame(&mut self.recv, max_len).await
    }

    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), FramingError> {
        write_frame(&mut self.send, payload).await
    }

    /// Finish the sending side. Errors are ignored: the peer may already be gone.
    pub async fn close(&mut self) {
        let _ = self.send.shutdown().await;
    }
}

impl fmt::Debug for P2pStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("P2pStream").finish_non_exhaustive()
    }
}

/// Callback invoked for every inbound stream of a registered protocol.
pub type StreamHandler = Arc<dyn Fn(P2pStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// Capability to open and accept protocol streams.
pub trait Host: Send + Sync + 'static {
    type PeerId: Clone + Send + Sync + fmt::Display + FromStr + 'static;

    fn local_id(&self) -> Self::PeerId;

    /// Open a new stream to `peer` speaking `protocol`.
    fn open_stream(
        &self,
        peer: &Self::PeerId,
        protocol: &str,
    ) -> impl Future<Output = TunnelResult<P2pStream>> + Send;

    /// Register (or replace) the handler for `protocol`.
    fn set_stream_handler(&self, protocol: &str, handler: StreamHandler);

    fn remove_stream_handler(&self, protocol: &str);
}
