//! Egress side: replay a tunnelled request against the upstream service.

use std::time::Duration;

use crate::envelope::{RequestEnvelope, ResponseEnvelope};
use crate::error::{TunnelError, TunnelResult};
use crate::http::headers::{header_list, header_map, strip_request_headers};

/// Body returned when no upstream is configured.
pub const NO_UPSTREAM_BODY: &str = "no upstream";

/// Proxies request envelopes to an optional upstream base URL.
///
/// Without an upstream the egress runs in gateway-only mode and answers every
/// request with `502`.
#[derive(Debug, Clone)]
pub struct Egress {
    upstream: Option<String>,
    client: reqwest::Client,
}

/// Join the upstream base with a request path and query string.
///
/// `http://up/` + `status` + `a=1` → `http://up/status?a=1`
pub fn upstream_url(base: &str, path: &str, query: &str) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    if !path.starts_with('/') {
        url.push('/');
    }
    url.push_str(path);
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }
    url
}

impl Egress {
    pub fn new(upstream: Option<String>, timeout: Duration) -> TunnelResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TunnelError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        let upstream = upstream.filter(|u| !u.trim().is_empty());
        Ok(Self { upstream, client })
    }

    pub fn upstream(&self) -> Option<&str> {
        self.upstream.as_deref()
    }

    /// Forward `req` upstream and wrap the reply in a response envelope.
    pub async fn proxy(&self, req: &RequestEnvelope) -> TunnelResult<ResponseEnvelope> {
        let base = self.upstream.as_deref().ok_or(TunnelError::MissingUpstream)?;
        let url = upstream_url(base, &req.path, &req.query);

        let method = http::Method::from_bytes(req.method.as_bytes())
            .map_err(|e| TunnelError::UpstreamUnreachable(format!("Invalid method: {}", e)))?;
        let mut headers = req.headers.clone();
        strip_request_headers(&mut headers);

        log::info!(
            "Forwarding request {} {} {} to upstream ({} bytes)",
            req.id,
            req.method,
            url,
            req.body.len()
        );

        let response = self
            .client
            .request(method, &url)
            .headers(header_map(&headers))
            .body(req.body.clone())
            .send()
            .await
            .map_err(|e| TunnelError::UpstreamUnreachable(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = header_list(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| TunnelError::UpstreamUnreachable(e.to_string()))?;

        log::info!(
            "Upstream responded to {}: {} ({} bytes)",
            req.id,
            status,
            body.len()
        );

        Ok(ResponseEnvelope {
            id: req.id.clone(),
            status,
            headers,
            body: body.to_vec(),
        })
    }

    /// Like [`Egress::proxy`], but every failure becomes a `502` envelope.
    pub async fn respond(&self, req: &RequestEnvelope) -> ResponseEnvelope {
        match self.proxy(req).await {
            Ok(res) => res,
            Err(TunnelError::MissingUpstream) => {
                log::error!(
                    "Received request {} but no upstream configured; responded 502",
                    req.id
                );
                ResponseEnvelope::bad_gateway(&req.id, NO_UPSTREAM_BODY)
            }
            Err(e) => {
                log::error!("Error while proxying {} to upstream: {}", req.id, e);
                ResponseEnvelope::bad_gateway(&req.id, e.to_string())
            }
        }
    }
}
