//! Inbound stream handlers that reach the local HTTP service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use super::tunnel::RawHandler;
use crate::envelope::Envelope;
use crate::http::egress::{upstream_url, Egress};

/// Decodes a request envelope, proxies it through the [`Egress`], and
/// answers with the response envelope.
#[derive(Debug, Clone)]
pub struct EnvelopeHandler {
    egress: Arc<Egress>,
}

impl EnvelopeHandler {
    pub fn new(egress: Arc<Egress>) -> Self {
        Self { egress }
    }
}

impl RawHandler for EnvelopeHandler {
    async fn handle(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        let req = match Envelope::decode(&request)? {
            Envelope::Request(req) => req,
            Envelope::Response(res) => bail!("Expected a request envelope, got response {}", res.id),
        };
        let res = self.egress.respond(&req).await;
        Ok(Envelope::Response(res).encode()?)
    }
}

/// Posts the raw payload (a JSON-RPC body) to the application and returns the
/// raw response body, whatever its status.
#[derive(Debug, Clone)]
pub struct RpcForwarder {
    client: reqwest::Client,
    url: String,
}

impl RpcForwarder {
    pub fn new(upstream: &str, rpc_path: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: upstream_url(upstream, rpc_path, ""),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RawHandler for RpcForwarder {
    async fn handle(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        log::info!("Forwarding {} byte RPC body to {}", request.len(), self.url);
        let response = self
            .client
            .post(&self.url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(request)
            .send()
            .await
            .with_context(|| format!("RPC upstream {} unreachable", self.url))?;
        let status = response.status();
        let body = response.bytes().await.context("Failed to read RPC response")?;
        log::info!("RPC upstream responded: {} ({} bytes)", status, body.len());
        Ok(body.to_vec())
    }
}
