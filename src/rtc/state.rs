//! Offer/answer state machine.
//!
//! Pure state: every input returns the [`Action`]s the session loop must
//! perform, in order. Nothing here touches sockets or the WebRTC stack.
//!
//! ```text
//! New -> Offering | AwaitingOffer -> Negotiating -> Connected -> Closed
//! ```
//! `Closed` is terminal and reachable from every state.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;

use crate::signaling::SignalMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "offer" | "offerer" => Ok(Role::Offerer),
            "answer" | "answerer" => Ok(Role::Answerer),
            other => bail!("Invalid role '{}': expected 'offer' or 'answer'", other),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => write!(f, "offerer"),
            Role::Answerer => write!(f, "answerer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Offering,
    AwaitingOffer,
    Negotiating,
    Connected,
    Closed,
}

/// Work requested from the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Create the data channel and a local offer, then call
    /// [`Negotiator::offer_created`].
    CreateOffer,
    /// Apply the remote offer, then call [`Negotiator::answer_created`].
    AcceptOffer(String),
    AcceptAnswer(String),
    AddRemoteCandidate(String),
    Signal(SignalMessage),
    /// The data channel can carry envelopes.
    ChannelReady,
    Teardown(String),
}

#[derive(Debug)]
pub struct Negotiator {
    role: Role,
    state: SessionState,
    local_description_sent: bool,
    remote_description_applied: bool,
    queued_local: Vec<String>,
    queued_remote: Vec<String>,
    close_reason: Option<String>,
}

impl Negotiator {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: SessionState::New,
            local_description_sent: false,
            remote_description_applied: false,
            queued_local: Vec::new(),
            queued_remote: Vec::new(),
            close_reason: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// Leave `New`. Calling it again is a no-op.
    pub fn start(&mut self) -> Vec<Action> {
        if self.state != SessionState::New {
            return Vec::new();
        }
        match self.role {
            Role::Offerer => {
                self.transition(SessionState::Offering);
                vec![Action::CreateOffer]
            }
            Role::Answerer => {
                self.transition(SessionState::AwaitingOffer);
                Vec::new()
            }
        }
    }

    pub fn offer_created(&mut self, sdp: String) -> Vec<Action> {
        if self.role != Role::Offerer || self.state != SessionState::Offering {
            return Vec::new();
        }
        self.transition(SessionState::Negotiating);
        self.local_description_sent = true;
        let mut actions = vec![Action::Signal(SignalMessage::Offer { sdp })];
        actions.extend(self.flush_local());
        actions
    }

    pub fn answer_created(&mut self, sdp: String) -> Vec<Action> {
        if self.role != Role::Answerer
            || self.state != SessionState::Negotiating
            || self.local_description_sent
        {
            return Vec::new();
        }
        self.local_description_sent = true;
        let mut actions = vec![Action::Signal(SignalMessage::Answer { sdp })];
        actions.extend(self.flush_local());
        actions
    }

    /// A message relayed from the other peer.
    pub fn on_signal(&mut self, msg: SignalMessage) -> Vec<Action> {
        if self.is_closed() {
            return Vec::new();
        }
        match msg {
            SignalMessage::Offer { sdp } => {
                let waiting = matches!(self.state, SessionState::New | SessionState::AwaitingOffer);
                if self.role != Role::Answerer || !waiting {
                    log::debug!("Ignoring offer in state {:?} as {}", self.state, self.role);
                    return Vec::new();
                }
                self.transition(SessionState::Negotiating);
                self.remote_description_applied = true;
                let mut actions = vec![Action::AcceptOffer(sdp)];
                actions.extend(self.flush_remote());
                actions
            }
            SignalMessage::Answer { sdp } => {
                if self.role != Role::Offerer
                    || self.state != SessionState::Negotiating
                    || self.remote_description_applied
                {
                    log::debug!("Ignoring answer in state {:?} as {}", self.state, self.role);
                    return Vec::new();
                }
                self.remote_description_applied = true;
                let mut actions = vec![Action::AcceptAnswer(sdp)];
                actions.extend(self.flush_remote());
                actions
            }
            SignalMessage::Candidate { candidate, .. } => {
                if self.remote_description_applied {
                    vec![Action::AddRemoteCandidate(candidate)]
                } else {
                    self.queued_remote.push(candidate);
                    Vec::new()
                }
            }
        }
    }

    /// A local candidate was discovered.
    pub fn on_local_candidate(&mut self, candidate: String) -> Vec<Action> {
        if self.is_closed() {
            return Vec::new();
        }
        if self.local_description_sent {
            vec![Action::Signal(SignalMessage::candidate(candidate))]
        } else {
            self.queued_local.push(candidate);
            Vec::new()
        }
    }

    pub fn on_channel_open(&mut self) -> Vec<Action> {
        if self.state != SessionState::Negotiating {
            return Vec::new();
        }
        self.transition(SessionState::Connected);
        vec![Action::ChannelReady]
    }

    /// Fatal negotiation or transport error.
    pub fn fail(&mut self, reason: impl Into<String>) -> Vec<Action> {
        self.close(reason.into())
    }

    pub fn shutdown(&mut self) -> Vec<Action> {
        self.close("shutdown".to_string())
    }

    fn close(&mut self, reason: String) -> Vec<Action> {
        if self.is_closed() {
            return Vec::new();
        }
        self.transition(SessionState::Closed);
        self.queued_local.clear();
        self.queued_remote.clear();
        self.close_reason = Some(reason.clone());
        vec![Action::Teardown(reason)]
    }

    fn flush_local(&mut self) -> Vec<Action> {
        self.queued_local
            .drain(..)
            .map(|c| Action::Signal(SignalMessage::candidate(c)))
            .collect()
    }

    fn flush_remote(&mut self) -> Vec<Action> {
        self.queued_remote
            .drain(..)
            .map(Action::AddRemoteCandidate)
            .collect()
    }

    fn transition(&mut self, next: SessionState) {
        log::info!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}
