//! Local HTTP surfaces and the upstream proxy.
//!
//! - `ingress`: local HTTP server that tunnels every request to the peer
//! - `egress`: replays tunnelled requests against the upstream service
//! - `control`: small JSON API for the stream modes
//! - `headers`: hop-by-hop filtering and header conversions

use std::convert::Infallible;
use std::future::Future;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub mod control;
pub mod egress;
pub mod headers;
pub mod ingress;

pub use control::ControlApi;
pub use egress::Egress;
pub use ingress::Ingress;

/// Plain-text response with the given status.
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain"),
    );
    response
}

/// JSON response with the given status.
pub fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(value.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}

/// Accept HTTP/1 connections until `cancel` fires, answering each request
/// with `handler`.
pub async fn serve<F, Fut>(listener: TcpListener, cancel: CancellationToken, handler: F) -> Result<()>
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Failed to accept HTTP connection: {}", e);
                    continue;
                }
            },
        };

        let handler = handler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let handler = handler.clone();
                async move { Ok::<_, Infallible>(handler(req).await) }
            });
            let conn = http1::Builder::new().serve_connection(io, service);
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = conn => {
                    if let Err(e) = result {
                        log::debug!("HTTP connection from {} ended: {}", peer_addr, e);
                    }
                }
            }
        });
    }
    Ok(())
}
