//! tunnel-http library
//!
//! Carries HTTP/JSON-RPC exchanges between two peers over either iroh
//! streams or a WebRTC data channel.

pub mod bridge;
pub mod config;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod http;
pub mod rtc;
pub mod secret;
pub mod signaling;
pub mod stream;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{TunnelError, TunnelResult};
