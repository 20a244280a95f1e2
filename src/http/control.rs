//! Control API for the stream modes.
//!
//! - `GET /identify` → `{"peerId": "...", "protocol": "/p2p-http/1.0"}`
//! - `POST /p2p/request` with `{"to", "protocol"?, "payload_b64"}` → `{"data_b64"}`
//!
//! Failures answer `500 {"error": "..."}`, unknown routes `404`.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::{Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{json_response, text_response};
use crate::envelope::{decode_base64, encode_base64};
use crate::stream::{Host, StreamTunnel};

#[derive(Debug, Deserialize)]
pub struct P2pRequest {
    pub to: String,
    #[serde(default)]
    pub protocol: Option<String>,
    pub payload_b64: String,
}

pub struct ControlApi<H: Host> {
    tunnel: Arc<StreamTunnel<H>>,
    timeout: Duration,
}

impl<H: Host> ControlApi<H>
where
    <H::PeerId as FromStr>::Err: Display,
{
    pub fn new(tunnel: Arc<StreamTunnel<H>>, timeout: Duration) -> Self {
        Self { tunnel, timeout }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        println!("Control API listening on http://{}", listener.local_addr()?);
        super::serve(listener, cancel, move |req| {
            let this = self.clone();
            async move { this.handle(req).await }
        })
        .await
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let mut response = match (&method, path.as_str()) {
            (&Method::OPTIONS, _) => {
                let mut response = Response::new(Full::new(Bytes::new()));
                *response.status_mut() = StatusCode::NO_CONTENT;
                response
            }
            (&Method::GET, "/identify") => json_response(
                StatusCode::OK,
                &json!({
                    "peerId": self.tunnel.host().local_id().to_string(),
                    "protocol": self.tunnel.protocol(),
                }),
            ),
            (&Method::POST, "/p2p/request") => match self.p2p_request(req).await {
                Ok(data_b64) => json_response(StatusCode::OK, &json!({ "data_b64": data_b64 })),
                Err(e) => {
                    log::warn!("Control request failed: {:#}", e);
                    json_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &json!({ "error": format!("{:#}", e) }),
                    )
                }
            },
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        };
        response.headers_mut().insert(
            http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
            http::HeaderValue::from_static("*"),
        );
        response
    }

    /// Returns the base64 reply payload.
    async fn p2p_request<B>(&self, req: Request<B>) -> Result<String>
    where
        B: Body,
        B::Error: Display,
    {
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| anyhow!("Failed to read body: {}", e))?
            .to_bytes();
        let request: P2pRequest = serde_json::from_slice(&body).context("Invalid request body")?;
        let peer = H::PeerId::from_str(&request.to)
            .map_err(|e| anyhow!("Invalid peer id {}: {}", request.to, e))?;
        let payload = decode_base64(&request.payload_b64)?;
        let protocol = request
            .protocol
            .unwrap_or_else(|| self.tunnel.protocol().to_string());

        let data = self
            .tunnel
            .call_with(&peer, &protocol, &payload, Some(self.timeout))
            .await?;
        Ok(encode_base64(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{MemoryHost, MemoryNetwork};

    const PROTOCOL: &str = "/p2p-http/1.0";

    fn api() -> ControlApi<MemoryHost> {
        let network = MemoryNetwork::new();
        let server = StreamTunnel::new(Arc::new(network.host("bob")), PROTOCOL, 1024);
        server.start(Arc::new(|req: Vec<u8>| async move {
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(&req);
            Ok::<_, anyhow::Error>(reply)
        }));
        let client = Arc::new(StreamTunnel::new(Arc::new(network.host("alice")), PROTOCOL, 1024));
        ControlApi::new(client, Duration::from_secs(5))
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(body: serde_json::Value) -> Request<Full<Bytes>> {
        Request::post("/p2p/request")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    #[tokio::test]
    async fn test_identify() {
        let api = api();
        let response = api
            .handle(Request::get("/identify").body(Full::new(Bytes::new())).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        let value = body_json(response).await;
        assert_eq!(value["peerId"], "alice");
        assert_eq!(value["protocol"], PROTOCOL);
    }

    #[tokio::test]
    async fn test_p2p_request() {
        let api = api();
        let response = api
            .handle(post(json!({"to": "bob", "payload_b64": encode_base64(b"ping")})))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_json(response).await;
        let data = decode_base64(value["data_b64"].as_str().unwrap()).unwrap();
        assert_eq!(data, b"echo:ping");
    }

    #[tokio::test]
    async fn test_p2p_request_errors() {
        let api = api();

        let response = api
            .handle(post(json!({"to": "bob", "protocol": "/other/1.0", "payload_b64": ""})))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_json(response).await["error"].is_string());

        let response = api.handle(post(json!({"payload_b64": ""}))).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_route_and_preflight() {
        let api = api();
        let response = api
            .handle(Request::get("/nope").body(Full::new(Bytes::new())).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = api
            .handle(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/p2p/request")
                    .body(Full::new(Bytes::new()))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
