//! Wire envelopes carried over the tunnel.
//!
//! Request:
//! ```json
//! {"typ":"http_req","id":"..","method":"GET","path":"/status","query":"","headers":[["accept","*/*"]],"body":""}
//! ```
//! Response:
//! ```json
//! {"typ":"http_res","id":"..","status":200,"headers":[["content-type","text/plain"]],"body":"b2s="}
//! ```
//! Bodies are standard base64.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{TunnelError, TunnelResult};

/// JSON-RPC version string
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC "Internal error" code.
pub const INTERNAL_ERROR_CODE: i32 = -32603;

/// Ordered header list; duplicates are allowed.
pub type HeaderList = Vec<(String, String)>;

/// One HTTP request or response travelling over the tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typ")]
pub enum Envelope {
    #[serde(rename = "http_req")]
    Request(RequestEnvelope),
    #[serde(rename = "http_res")]
    Response(ResponseEnvelope),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: HeaderList,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
}

fn default_status() -> u16 {
    502
}

/// Fresh 128-bit correlation id, hex encoded.
pub fn new_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

impl Envelope {
    pub fn id(&self) -> &str {
        match self {
            Envelope::Request(req) => &req.id,
            Envelope::Response(res) => &res.id,
        }
    }

    /// Encode to bytes for transmission.
    pub fn encode(&self) -> TunnelResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| TunnelError::Internal(format!("Failed to encode envelope: {}", e)))
    }

    /// Encode to a text frame for data channels.
    pub fn encode_text(&self) -> TunnelResult<String> {
        serde_json::to_string(self)
            .map_err(|e| TunnelError::Internal(format!("Failed to encode envelope: {}", e)))
    }

    /// Decode from bytes.
    pub fn decode(data: &[u8]) -> TunnelResult<Self> {
        serde_json::from_slice(data).map_err(|e| TunnelError::MalformedEnvelope(e.to_string()))
    }
}

impl RequestEnvelope {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            method: method.into(),
            path: path.into(),
            query: String::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_headers(mut self, headers: HeaderList) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

impl ResponseEnvelope {
    pub fn new(id: impl Into<String>, status: u16) -> Self {
        Self {
            id: id.into(),
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// `502` with a plain-text explanation.
    pub fn bad_gateway(id: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            id: id.into(),
            status: 502,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: reason.into_bytes(),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// JSON-RPC error response (id is always null here: the request could not be read).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: String,
    pub error: JsonRpcError,
    pub id: Option<serde_json::Value>,
}

impl JsonRpcErrorResponse {
    pub fn internal_error(cause: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            error: JsonRpcError {
                code: INTERNAL_ERROR_CODE,
                message: "Internal error".to_string(),
                data: Some(serde_json::Value::String(cause.into())),
            },
            id: None,
        }
    }

    pub fn encode(&self) -> TunnelResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| TunnelError::Internal(format!("Failed to encode error: {}", e)))
    }
}

mod base64_body {
    use super::BASE64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Decode a standard base64 string.
pub fn decode_base64(data: &str) -> TunnelResult<Vec<u8>> {
    BASE64
        .decode(data.as_bytes())
        .map_err(|e| TunnelError::MalformedEnvelope(format!("Invalid base64: {}", e)))
}

/// Encode bytes as standard base64.
pub fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}
