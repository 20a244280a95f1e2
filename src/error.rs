//! Error types for the tunnel.

use std::time::Duration;

use thiserror::Error;

use crate::framing::FramingError;

/// How the caller should react to a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Log and keep going; the channel stays usable.
    Ignore,
    /// Fail the current exchange only (one request, one stream).
    FailExchange,
    /// Tear down the session or channel.
    Fatal,
}

/// Tunnel errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Malformed length prefix or truncated stream.
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    /// No matching response arrived before the deadline.
    #[error("Gateway timeout: no response for {id} within {timeout:?}")]
    GatewayTimeout { id: String, timeout: Duration },

    /// Proxy attempt to the upstream service failed.
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Gateway mode without a configured upstream.
    #[error("No upstream configured")]
    MissingUpstream,

    /// Non-JSON or schema-violating payload.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Unexpected failure while handling a stream.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The underlying channel or stream is gone.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Envelope exceeds what the data channel carries in one message.
    #[error("Message too large: {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    /// The channel refused an outbound message.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Signaling relay failure.
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Offer/answer/candidate negotiation failure.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Network error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Retry-vs-abort policy for this error.
    pub fn disposition(&self) -> Disposition {
        match self {
            TunnelError::MalformedEnvelope(_) => Disposition::Ignore,
            TunnelError::GatewayTimeout { .. }
            | TunnelError::UpstreamUnreachable(_)
            | TunnelError::MissingUpstream
            | TunnelError::Internal(_)
            | TunnelError::Framing(_)
            | TunnelError::MessageTooLarge { .. }
            | TunnelError::SendFailed(_)
            | TunnelError::Io(_) => Disposition::FailExchange,
            TunnelError::ChannelClosed(_)
            | TunnelError::Signaling(_)
            | TunnelError::Negotiation(_) => Disposition::Fatal,
        }
    }

    /// HTTP status surfaced to the local client.
    pub fn status_code(&self) -> u16 {
        match self {
            TunnelError::GatewayTimeout { .. } => 504,
            _ => 502,
        }
    }
}

/// Result type alias for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_maps_to_504() {
        let err = TunnelError::GatewayTimeout {
            id: "abc".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.status_code(), 504);
        assert_eq!(err.disposition(), Disposition::FailExchange);
    }

    #[test]
    fn test_proxy_failures_map_to_502() {
        assert_eq!(TunnelError::MissingUpstream.status_code(), 502);
        assert_eq!(
            TunnelError::UpstreamUnreachable("refused".into()).status_code(),
            502
        );
    }

    #[test]
    fn test_oversized_message_fails_only_the_exchange() {
        let err = TunnelError::MessageTooLarge { size: 70_000, limit: 65_536 };
        assert_eq!(err.status_code(), 502);
        assert_eq!(err.disposition(), Disposition::FailExchange);
        assert_eq!(TunnelError::SendFailed("full".into()).status_code(), 502);
    }

    #[test]
    fn test_malformed_envelope_is_ignored() {
        let err = TunnelError::MalformedEnvelope("not json".into());
        assert_eq!(err.disposition(), Disposition::Ignore);
        assert_eq!(
            TunnelError::ChannelClosed("dc".into()).disposition(),
            Disposition::Fatal
        );
    }
}
