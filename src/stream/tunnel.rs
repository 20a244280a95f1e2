//! One framed request, one framed response, per stream.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, warn};

use super::{Host, P2pStream, StreamHandler};
use crate::envelope::JsonRpcErrorResponse;
use crate::error::{TunnelError, TunnelResult};
use crate::transport::deadline_after;

/// Turns one raw request payload into one raw response payload.
pub trait RawHandler: Send + Sync + 'static {
    fn handle(&self, request: Vec<u8>) -> impl Future<Output = anyhow::Result<Vec<u8>>> + Send;
}

impl<F, Fut> RawHandler for F
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send,
{
    fn handle(&self, request: Vec<u8>) -> impl Future<Output = anyhow::Result<Vec<u8>>> + Send {
        self(request)
    }
}

#[derive(Debug)]
pub struct StreamTunnel<H: Host> {
    host: Arc<H>,
    protocol: String,
    max_message_bytes: usize,
    started: AtomicBool,
}

impl<H: Host> StreamTunnel<H> {
    pub fn new(host: Arc<H>, protocol: impl Into<String>, max_message_bytes: usize) -> Self {
        Self {
            host,
            protocol: protocol.into(),
            max_message_bytes,
            started: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Register `handler` for inbound streams.
    ///
    /// Returns `false` (and changes nothing) if already started.
    pub fn start<R: RawHandler>(&self, handler: Arc<R>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Stream handler for {} already registered", self.protocol);
            return false;
        }
        let max = self.max_message_bytes;
        let stream_handler: StreamHandler = Arc::new(move |stream: P2pStream| -> BoxFuture<'static, ()> {
            Box::pin(serve_stream(stream, handler.clone(), max))
        });
        self.host.set_stream_handler(&self.protocol, stream_handler);
        info!("Serving protocol {}", self.protocol);
        true
    }

    /// Unregister the inbound handler. Returns `false` if it was not started.
    pub fn stop(&self) -> bool {
        if !self.started.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.host.remove_stream_handler(&self.protocol);
        info!("Stopped serving protocol {}", self.protocol);
        true
    }

    /// Open a stream to `peer`, send `payload`, and read exactly one reply.
    ///
    /// The stream is closed on every exit path.
    pub async fn call(
        &self,
        peer: &H::PeerId,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> TunnelResult<Vec<u8>> {
        self.call_with(peer, &self.protocol, payload, timeout).await
    }

    /// [`StreamTunnel::call`] on an explicit protocol id.
    pub async fn call_with(
        &self,
        peer: &H::PeerId,
        protocol: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> TunnelResult<Vec<u8>> {
        let deadline = timeout.map(deadline_after);
        let timed_out = || TunnelError::GatewayTimeout {
            id: format!("stream to {}", peer),
            timeout: timeout.unwrap_or_default(),
        };

        let open = self.host.open_stream(peer, protocol);
        let mut stream = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, open)
                .await
                .map_err(|_| timed_out())??,
            None => open.await?,
        };

        let reply = exchange(&mut stream, payload, self.max_message_bytes);
        let result = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, reply).await {
                Ok(result) => result,
                Err(_) => Err(timed_out()),
            },
            None => reply.await,
        };

        stream.close().await;
        result
    }
}

async fn exchange(stream: &mut P2pStream, payload: &[u8], max: usize) -> TunnelResult<Vec<u8>> {
    stream.write_frame(payload).await?;
    Ok(stream.read_frame(max).await?)
}

async fn serve_stream<R: RawHandler>(mut stream: P2pStream, handler: Arc<R>, max: usize) {
    let result = async {
        let request = stream.read_frame(max).await?;
        debug!("Inbound stream request ({} bytes)", request.len());
        let response = handler
            .handle(request)
            .await
            .map_err(|e| TunnelError::Internal(format!("{:#}", e)))?;
        stream.write_frame(&response).await?;
        Ok::<_, TunnelError>(())
    }
    .await;

    if let Err(e) = result {
        warn!("Failed to handle inbound stream: {}", e);
        let cause = match e {
            TunnelError::Internal(cause) => cause,
            other => other.to_string(),
        };
        match JsonRpcErrorResponse::internal_error(cause).encode() {
            Ok(body) => {
                if let Err(e) = stream.write_frame(&body).await {
                    debug!("Could not deliver error reply: {}", e);
                }
            }
            Err(e) => debug!("Could not encode error reply: {}", e),
        }
    }
    stream.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::memory::{MemoryHost, MemoryNetwork};
    use std::sync::atomic::AtomicUsize;

    const PROTOCOL: &str = "/p2p-http/1.0";

    fn pair(max: usize) -> (StreamTunnel<MemoryHost>, StreamTunnel<MemoryHost>) {
        let network = MemoryNetwork::new();
        let client = StreamTunnel::new(Arc::new(network.host("client")), PROTOCOL, max);
        let server = StreamTunnel::new(Arc::new(network.host("server")), PROTOCOL, max);
        (client, server)
    }

    fn upper() -> Arc<impl RawHandler> {
        Arc::new(|req: Vec<u8>| async move { Ok::<_, anyhow::Error>(req.to_ascii_uppercase()) })
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (client, server) = pair(1024);
        assert!(server.start(upper()));

        let reply = client
            .call(&"server".to_string(), b"hello", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply, b"HELLO");

        // One exchange per stream: a second call opens a new stream.
        let reply = client.call(&"server".to_string(), b"again", None).await.unwrap();
        assert_eq!(reply, b"AGAIN");
    }

    #[tokio::test]
    async fn test_handler_error_yields_jsonrpc_error() {
        let (client, server) = pair(1024);
        server.start(Arc::new(|_req: Vec<u8>| async move {
            Err::<Vec<u8>, _>(anyhow::anyhow!("adapter exploded"))
        }));

        let reply = client.call(&"server".to_string(), b"{}", None).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value["error"]["code"], -32603);
        assert_eq!(value["error"]["message"], "Internal error");
        assert_eq!(value["error"]["data"], "adapter exploded");
        assert!(value["id"].is_null());
    }

    #[tokio::test]
    async fn test_oversized_request_yields_jsonrpc_error() {
        let (client, server) = pair(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        server.start(Arc::new(move |req: Vec<u8>| {
            seen.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, anyhow::Error>(req) }
        }));

        // The client allows larger replies than the server accepts requests.
        let big_client = StreamTunnel::new(client.host().clone(), PROTOCOL, 1024);
        let reply = big_client
            .call(&"server".to_string(), &[0u8; 64], None)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(value["error"]["code"], -32603);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let (client, server) = pair(1024);
        assert!(!server.stop());
        assert!(server.start(upper()));
        assert!(!server.start(upper()));
        assert!(server.is_started());

        assert!(server.stop());
        assert!(!server.stop());
        assert!(client.call(&"server".to_string(), b"x", None).await.is_err());
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let (client, server) = pair(1024);
        server.start(Arc::new(|req: Vec<u8>| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, anyhow::Error>(req)
        }));

        let err = client
            .call(&"server".to_string(), b"slow", Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::GatewayTimeout { .. }));
    }

    #[tokio::test]
    async fn test_unbounded_timeout_does_not_overflow() {
        let (client, server) = pair(1024);
        server.start(upper());

        let reply = client
            .call(&"server".to_string(), b"long", Some(Duration::from_secs(u64::MAX)))
            .await
            .unwrap();
        assert_eq!(reply, b"LONG");
    }
}
