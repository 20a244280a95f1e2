//! Request/response multiplexing over a single data channel.
//!
//! Many HTTP conversations share one channel. Each outbound request carries a
//! correlation id and parks a waiter in the pending map; inbound messages are
//! dispatched by type:
//! - `http_res` resolves the matching waiter (unknown ids are dropped)
//! - `http_req` is proxied through the [`Egress`] and answered on the channel
//! - anything unparseable is logged and ignored
//!
//! All outbound text goes through one unbounded queue so the session loop is
//! the only writer on the channel. Each queued message stays within
//! [`MAX_CHANNEL_MESSAGE`]; a request that does not fit fails with `502`
//! right away, and an upstream response that does not fit is replaced by a
//! small `502` envelope.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::envelope::{new_id, Envelope, RequestEnvelope, ResponseEnvelope};
use crate::error::{TunnelError, TunnelResult};
use crate::http::egress::Egress;
use crate::transport::deadline_after;

/// Largest text message written to the data channel in one piece.
pub const MAX_CHANNEL_MESSAGE: usize = 64 * 1024;

/// One message queued for the data channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Correlation id when this carries a local request, so a failed write
    /// can fail the waiter.
    pub request_id: Option<String>,
    pub text: String,
}

/// Single-resolution waiter for one in-flight request.
#[derive(Debug)]
struct PendingRequest {
    tx: oneshot::Sender<TunnelResult<ResponseEnvelope>>,
    deadline: Instant,
    timeout: Duration,
}

#[derive(Debug)]
pub struct Multiplexer {
    pending: DashMap<String, PendingRequest>,
    outbound: mpsc::UnboundedSender<Outbound>,
    ready: watch::Sender<bool>,
    egress: Arc<Egress>,
}

impl Multiplexer {
    /// Create a multiplexer.
    ///
    /// Returns the multiplexer and the receiver of text frames that must be
    /// written to the data channel in order.
    pub fn new(egress: Arc<Egress>) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (ready, _) = watch::channel(false);
        let mux = Arc::new(Self {
            pending: DashMap::new(),
            outbound,
            ready,
            egress,
        });
        (mux, outbound_rx)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Suspend until the channel is open.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send `req` and wait for the response carrying the same id.
    ///
    /// The id is replaced if it collides with one already in flight. On
    /// timeout the pending entry is removed and a later response is dropped.
    pub async fn send_and_await(
        &self,
        mut req: RequestEnvelope,
        timeout: Duration,
    ) -> TunnelResult<ResponseEnvelope> {
        let (tx, rx) = oneshot::channel();
        let pending = PendingRequest {
            tx,
            deadline: deadline_after(timeout),
            timeout,
        };
        loop {
            match self.pending.entry(req.id.clone()) {
                Entry::Occupied(_) => req.id = new_id(),
                Entry::Vacant(slot) => {
                    slot.insert(pending);
                    break;
                }
            }
        }

        let id = req.id.clone();
        log::info!(
            "Sending request {} {} {}{} ({} bytes)",
            id,
            req.method,
            req.path,
            if req.query.is_empty() {
                String::new()
            } else {
                format!("?{}", req.query)
            },
            req.body.len()
        );

        let text = match Envelope::Request(req).encode_text() {
            Ok(text) if text.len() > MAX_CHANNEL_MESSAGE => {
                self.pending.remove(&id);
                log::error!("Request {} is {} bytes encoded; not sent", id, text.len());
                return Err(TunnelError::MessageTooLarge {
                    size: text.len(),
                    limit: MAX_CHANNEL_MESSAGE,
                });
            }
            Ok(text) => text,
            Err(e) => {
                self.pending.remove(&id);
                return Err(e);
            }
        };
        let message = Outbound {
            request_id: Some(id.clone()),
            text,
        };
        if self.outbound.send(message).is_err() {
            self.pending.remove(&id);
            return Err(TunnelError::ChannelClosed("data channel writer stopped".into()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TunnelError::ChannelClosed("multiplexer dropped".into())),
            Err(_) => {
                self.pending.remove(&id);
                log::error!("Timeout waiting for response to {}", id);
                Err(TunnelError::GatewayTimeout { id, timeout })
            }
        }
    }

    /// Dispatch one text message received from the data channel.
    pub fn handle_inbound(&self, text: &str) {
        let envelope = match Envelope::decode(text.as_bytes()) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Ignoring message on data channel: {}", e);
                return;
            }
        };

        match envelope {
            Envelope::Response(res) => self.resolve(res),
            Envelope::Request(req) => {
                let egress = self.egress.clone();
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let res = egress.respond(&req).await;
                    match encode_response(res) {
                        Ok(text) => {
                            let message = Outbound {
                                request_id: None,
                                text,
                            };
                            if outbound.send(message).is_err() {
                                log::warn!("Channel closed before response to {} was sent", req.id);
                            }
                        }
                        Err(e) => log::error!("Failed to encode response to {}: {}", req.id, e),
                    }
                });
            }
        }
    }

    /// Fail the waiter for `id` with `err`, e.g. when the channel refused
    /// the write. Unknown ids are ignored.
    pub fn fail_request(&self, id: &str, err: TunnelError) {
        if let Some((_, pending)) = self.pending.remove(id) {
            log::error!("Request {} failed: {}", id, err);
            let _ = pending.tx.send(Err(err));
        }
    }

    fn resolve(&self, res: ResponseEnvelope) {
        match self.pending.remove(&res.id) {
            Some((_, pending)) => {
                log::debug!("Received response {} (status {})", res.id, res.status);
                let _ = pending.tx.send(Ok(res));
            }
            None => log::debug!("Dropping response for unknown or expired id {}", res.id),
        }
    }

    /// Fail every waiter whose deadline is at or before `now`.
    ///
    /// Returns how many entries were removed.
    pub fn expire_overdue(&self, now: Instant) -> usize {
        let overdue: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = 0;
        for id in overdue {
            if let Some((id, pending)) = self.pending.remove(&id) {
                let timeout = pending.timeout;
                let _ = pending.tx.send(Err(TunnelError::GatewayTimeout { id, timeout }));
                expired += 1;
            }
        }
        expired
    }

    /// Mark the channel not ready and fail all in-flight requests.
    pub fn close(&self, reason: &str) {
        self.set_ready(false);
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending
                    .tx
                    .send(Err(TunnelError::ChannelClosed(reason.to_string())));
            }
        }
    }
}

/// Encode a response for the channel, swapping in a `502` when it would not
/// fit in one message.
fn encode_response(res: ResponseEnvelope) -> TunnelResult<String> {
    let id = res.id.clone();
    let text = Envelope::Response(res).encode_text()?;
    if text.len() <= MAX_CHANNEL_MESSAGE {
        return Ok(text);
    }
    log::warn!(
        "Response to {} is {} bytes encoded; answering 502 instead",
        id,
        text.len()
    );
    let reason = format!(
        "response too large: {} bytes exceeds the {} byte data channel limit",
        text.len(),
        MAX_CHANNEL_MESSAGE
    );
    Envelope::Response(ResponseEnvelope::bad_gateway(id, reason)).encode_text()
}
