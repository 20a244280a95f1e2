//! WebRTC data-channel transport.
//!
//! - `state`: offer/answer state machine, no I/O
//! - `gather`: UDP sockets and ICE candidates (host + STUN)
//! - `session`: dispatch loop driving `str0m` and the multiplexer

pub mod gather;
pub mod session;
pub mod state;

pub use session::{Session, SessionConfig, CHANNEL_LABEL};
pub use state::{Action, Negotiator, Role, SessionState};
