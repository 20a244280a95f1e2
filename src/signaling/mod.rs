//! Signaling for the data-channel transport.
//!
//! - `protocol`: offer / answer / candidate messages
//! - `relay`: room-based websocket relay server
//! - `client`: relay client split into sender and receiver halves

pub mod client;
pub mod protocol;
pub mod relay;

pub use client::{connect, SignalReceiver, SignalSender};
pub use protocol::SignalMessage;
pub use relay::{RoomRegistry, SignalingRelay};
