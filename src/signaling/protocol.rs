//! Signaling message types exchanged through the relay.
//!
//! ```json
//! {"type":"offer","sdp":"v=0..."}
//! {"type":"answer","sdp":"v=0..."}
//! {"type":"candidate","candidate":"candidate:1 1 udp ...","sdpMid":"0","sdpMLineIndex":0}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{TunnelError, TunnelResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid", default)]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", default)]
        sdp_m_line_index: Option<u16>,
    },
}

impl SignalMessage {
    pub fn candidate(candidate: impl Into<String>) -> Self {
        SignalMessage::Candidate {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
        }
    }

    pub fn encode(&self) -> TunnelResult<String> {
        serde_json::to_string(self)
            .map_err(|e| TunnelError::Signaling(format!("Failed to encode {}: {}", self.kind(), e)))
    }

    pub fn decode(text: &str) -> TunnelResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| TunnelError::Signaling(format!("Invalid signaling message: {}", e)))
    }
}
