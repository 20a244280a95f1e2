//! Ingress side: every local HTTP request becomes one tunnelled exchange.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::headers::{header_list, header_map, strip_response_headers};
use super::text_response;
use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::TunnelError;
use crate::stream::{Host, IrohHost};
use crate::transport::Transport;

pub const GATEWAY_TIMEOUT_BODY: &str = "gateway timeout";

pub struct Ingress<H: Host = IrohHost> {
    transport: Transport<H>,
    timeout: Duration,
}

impl<H: Host> Ingress<H> {
    pub fn new(transport: Transport<H>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Serve local clients until `cancel` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        println!("Proxy listening on http://{}", listener.local_addr()?);
        super::serve(listener, cancel, move |req| {
            let this = self.clone();
            async move { this.handle(req).await }
        })
        .await
    }

    /// Tunnel one request. Always produces a response: `504` on timeout,
    /// `502` on any other failure.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Display,
    {
        let started = tokio::time::Instant::now();
        if tokio::time::timeout(self.timeout, self.transport.wait_ready())
            .await
            .is_err()
        {
            log::error!("Transport not ready after {:?}", self.timeout);
            return text_response(StatusCode::GATEWAY_TIMEOUT, GATEWAY_TIMEOUT_BODY);
        }
        // The readiness wait counts against the same budget.
        let remaining = self.timeout.saturating_sub(started.elapsed());

        let envelope = match request_envelope(req).await {
            Ok(envelope) => envelope,
            Err(e) => return text_response(StatusCode::BAD_GATEWAY, e),
        };
        let id = envelope.id.clone();

        match self.transport.send_and_await(envelope, remaining).await {
            Ok(res) => {
                let response = local_response(res);
                log::debug!("Responded to local client for {}: {}", id, response.status());
                response
            }
            Err(e @ TunnelError::GatewayTimeout { .. }) => {
                log::error!("{}", e);
                text_response(StatusCode::GATEWAY_TIMEOUT, GATEWAY_TIMEOUT_BODY)
            }
            Err(e) => {
                log::error!("Request {} failed: {}", id, e);
                let status =
                    StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);
                text_response(status, e.to_string())
            }
        }
    }
}

/// Build a request envelope with a fresh id from a local request.
pub async fn request_envelope<B>(req: Request<B>) -> Result<RequestEnvelope, String>
where
    B: Body,
    B::Error: Display,
{
    let (parts, body) = req.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| format!("Failed to read request body: {}", e))?
        .to_bytes();

    Ok(RequestEnvelope::new(parts.method.as_str(), parts.uri.path())
        .with_query(parts.uri.query().unwrap_or_default())
        .with_headers(header_list(&parts.headers))
        .with_body(body.to_vec()))
}

/// Turn a response envelope into the local HTTP response.
pub fn local_response(res: ResponseEnvelope) -> Response<Full<Bytes>> {
    let mut headers = res.headers;
    strip_response_headers(&mut headers);

    let mut response = Response::new(Full::new(Bytes::from(res.body)));
    *response.status_mut() = StatusCode::from_u16(res.status).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = header_map(&headers);
    response
}
