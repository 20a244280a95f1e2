//! One WebRTC session: signaling, ICE, and the data channel that carries the
//! multiplexer's envelopes.
//!
//! A single dispatch loop owns the `str0m` instance and the [`Negotiator`].
//! Relay messages, UDP datagrams, discovered candidates, outbound envelope
//! text, and str0m timeouts all arrive as `select!` branches; each turns into
//! a state-machine input, and the resulting actions run before the next
//! branch is polled.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::{ChannelData, ChannelId};
use str0m::net::{Protocol, Receive, Transmit};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::gather::{gather_host, gather_server_reflexive, is_no_route_error, Gathered, LocalSocket};
use super::state::{Action, Negotiator, Role, SessionState};
use crate::error::{TunnelError, TunnelResult};
use crate::signaling::{self, SignalMessage, SignalSender};
use crate::transport::{Multiplexer, Outbound};

pub const CHANNEL_LABEL: &str = "tunnel";

const RECV_BUFFER: usize = 2000;
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// (local socket, remote source, datagram)
type Packet = (SocketAddr, SocketAddr, Vec<u8>);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    pub room: String,
    pub signal_url: String,
    pub stun_servers: Vec<String>,
}

pub struct Session {
    config: SessionConfig,
    mux: Arc<Multiplexer>,
}

impl Session {
    pub fn new(config: SessionConfig, mux: Arc<Multiplexer>) -> Self {
        Self { config, mux }
    }

    /// Negotiate and then pump the data channel until it closes or `cancel`
    /// fires.
    ///
    /// `outbound` is the multiplexer's outbound queue; its text is written to
    /// the channel once it is open. A request the channel refuses fails its
    /// waiter with `502`. Returns `Ok` on shutdown and the close
    /// reason as an error otherwise.
    pub async fn run(
        self,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let SessionConfig {
            role,
            room,
            signal_url,
            stun_servers,
        } = self.config;

        let (signal_tx, mut signal_rx) = signaling::connect(&signal_url, &room).await?;
        println!("Joined room '{}' as {}", room, role);

        // Child token: stops socket readers and STUN gathering with the session.
        let tasks = cancel.child_token();
        let (packet_tx, mut packet_rx) = mpsc::unbounded_channel::<Packet>();
        let (srflx_tx, mut srflx_rx) = mpsc::unbounded_channel::<Gathered>();

        let mut driver = Driver::new(role, signal_tx, self.mux.clone(), packet_tx, tasks.clone());

        let start = driver.negotiator.start();
        driver.queue(start);
        for gathered in gather_host()? {
            driver.add_local(gathered);
        }
        if !stun_servers.is_empty() {
            let tasks = tasks.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tasks.cancelled() => {}
                    gathered = gather_server_reflexive(&stun_servers) => {
                        for g in gathered {
                            if srflx_tx.send(g).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);

        loop {
            driver.run_actions().await;
            if driver.negotiator.is_closed() {
                break;
            }

            let timeout = match driver.poll_rtc().await {
                Ok(timeout) => timeout,
                Err(e) => {
                    let actions = driver.negotiator.fail(e.to_string());
                    driver.queue(actions);
                    continue;
                }
            };
            if driver.has_actions() {
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let actions = driver.negotiator.shutdown();
                    driver.queue(actions);
                }
                msg = signal_rx.recv(), if driver.signaling_open => match msg {
                    Some(msg) => {
                        log::debug!("Received {} via relay", msg.kind());
                        let actions = driver.negotiator.on_signal(msg);
                        driver.queue(actions);
                    }
                    None => {
                        driver.signaling_open = false;
                        if driver.negotiator.state() == SessionState::Connected {
                            log::warn!("Signaling connection closed; data channel stays up");
                        } else {
                            let actions = driver.negotiator.fail("signaling connection closed");
                            driver.queue(actions);
                        }
                    }
                },
                Some(gathered) = srflx_rx.recv() => driver.add_local(gathered),
                Some((local, source, data)) = packet_rx.recv() => driver.receive(local, source, &data),
                Some(message) = outbound.recv(), if driver.channel.is_some() => driver.write_channel(message),
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(timeout)) => {
                    driver.handle_input(Input::Timeout(Instant::now()));
                }
                _ = housekeeping.tick() => {
                    let expired = driver.mux.expire_overdue(tokio::time::Instant::now());
                    if expired > 0 {
                        log::warn!("Expired {} overdue request(s)", expired);
                    }
                }
            }
        }

        tasks.cancel();
        driver.signal_tx.close().await;
        match driver.negotiator.close_reason() {
            None | Some("shutdown") => Ok(()),
            Some(reason) => Err(anyhow!("Session closed: {}", reason)),
        }
    }
}

/// Owns the WebRTC stack and performs negotiator actions.
struct Driver {
    rtc: Rtc,
    negotiator: Negotiator,
    signal_tx: SignalSender,
    signaling_open: bool,
    mux: Arc<Multiplexer>,
    sockets: HashMap<SocketAddr, Arc<UdpSocket>>,
    packet_tx: mpsc::UnboundedSender<Packet>,
    tasks: CancellationToken,
    actions: VecDeque<Action>,
    pending_offer: Option<SdpPendingOffer>,
    channel: Option<ChannelId>,
}

impl Driver {
    fn new(
        role: Role,
        signal_tx: SignalSender,
        mux: Arc<Multiplexer>,
        packet_tx: mpsc::UnboundedSender<Packet>,
        tasks: CancellationToken,
    ) -> Self {
        Self {
            rtc: Rtc::builder().build(),
            negotiator: Negotiator::new(role),
            signal_tx,
            signaling_open: true,
            mux,
            sockets: HashMap::new(),
            packet_tx,
            tasks,
            actions: VecDeque::new(),
            pending_offer: None,
            channel: None,
        }
    }

    fn queue(&mut self, actions: Vec<Action>) {
        self.actions.extend(actions);
    }

    fn has_actions(&self) -> bool {
        !self.actions.is_empty()
    }

    async fn run_actions(&mut self) {
        while let Some(action) = self.actions.pop_front() {
            if let Err(e) = self.perform(action).await {
                log::error!("Negotiation failed: {}", e);
                let actions = self.negotiator.fail(e.to_string());
                self.queue(actions);
            }
        }
    }

    async fn perform(&mut self, action: Action) -> TunnelResult<()> {
        match action {
            Action::CreateOffer => {
                let mut api = self.rtc.sdp_api();
                api.add_channel(CHANNEL_LABEL.to_string());
                let (offer, pending) = api
                    .apply()
                    .ok_or_else(|| TunnelError::Negotiation("Nothing to offer".into()))?;
                self.pending_offer = Some(pending);
                let next = self.negotiator.offer_created(offer.to_sdp_string());
                self.queue(next);
            }
            Action::AcceptOffer(sdp) => {
                let offer = SdpOffer::from_sdp_string(&sdp)
                    .map_err(|e| TunnelError::Negotiation(format!("Invalid offer: {}", e)))?;
                let answer = self
                    .rtc
                    .sdp_api()
                    .accept_offer(offer)
                    .map_err(|e| TunnelError::Negotiation(format!("Failed to accept offer: {}", e)))?;
                let next = self.negotiator.answer_created(answer.to_sdp_string());
                self.queue(next);
            }
            Action::AcceptAnswer(sdp) => {
                let pending = self
                    .pending_offer
                    .take()
                    .ok_or_else(|| TunnelError::Negotiation("Answer without a pending offer".into()))?;
                let answer = SdpAnswer::from_sdp_string(&sdp)
                    .map_err(|e| TunnelError::Negotiation(format!("Invalid answer: {}", e)))?;
                self.rtc
                    .sdp_api()
                    .accept_answer(pending, answer)
                    .map_err(|e| TunnelError::Negotiation(format!("Failed to accept answer: {}", e)))?;
            }
            Action::AddRemoteCandidate(candidate) => match Candidate::from_sdp_string(&candidate) {
                Ok(parsed) => {
                    log::debug!("Adding remote candidate {}", candidate);
                    self.rtc.add_remote_candidate(parsed);
                }
                // One bad candidate does not spoil the others.
                Err(e) => log::warn!("Ignoring invalid remote candidate {}: {}", candidate, e),
            },
            Action::Signal(msg) => self.signal(msg).await?,
            Action::ChannelReady => {
                println!("Data channel open");
                self.mux.set_ready(true);
            }
            Action::Teardown(reason) => {
                log::info!("Tearing down session: {}", reason);
                self.channel = None;
                self.mux.close(&reason);
                self.rtc.disconnect();
            }
        }
        Ok(())
    }

    /// Publish `msg` on the relay.
    ///
    /// Once the data channel is up the relay is no longer needed: a lost
    /// relay only drops late trickled candidates.
    async fn signal(&mut self, msg: SignalMessage) -> TunnelResult<()> {
        let connected = self.negotiator.state() == SessionState::Connected;
        if !self.signaling_open {
            if connected {
                log::debug!("Signaling closed; not sending {}", msg.kind());
                return Ok(());
            }
            return Err(TunnelError::Signaling("signaling connection closed".into()));
        }
        match self.signal_tx.send(&msg).await {
            Ok(()) => Ok(()),
            Err(e) if connected => {
                log::warn!("{}; data channel stays up", e);
                self.signaling_open = false;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Register a gathered candidate and, if str0m accepts it, start reading
    /// its socket and advertise it.
    fn add_local(&mut self, gathered: Gathered) {
        let Gathered { candidate, socket } = gathered;
        let Some(added) = self.rtc.add_local_candidate(candidate) else {
            log::debug!("Skipping redundant local candidate on {}", socket.local_addr);
            return;
        };
        let sdp = added.to_sdp_string();
        log::info!("Local candidate {}", sdp);
        self.spawn_reader(socket);
        let actions = self.negotiator.on_local_candidate(sdp);
        self.queue(actions);
    }

    fn spawn_reader(&mut self, socket: LocalSocket) {
        let LocalSocket { udp, local_addr } = socket;
        self.sockets.insert(local_addr, udp.clone());
        let tx = self.packet_tx.clone();
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER];
            loop {
                tokio::select! {
                    _ = tasks.cancelled() => break,
                    result = udp.recv_from(&mut buf) => match result {
                        Ok((len, source)) => {
                            if tx.send((local_addr, source, buf[..len].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::debug!("UDP receive on {} failed: {}", local_addr, e);
                            break;
                        }
                    },
                }
            }
        });
    }

    fn receive(&mut self, local: SocketAddr, source: SocketAddr, data: &[u8]) {
        match Receive::new(Protocol::Udp, source, local, data) {
            Ok(receive) => self.handle_input(Input::Receive(Instant::now(), receive)),
            Err(e) => log::debug!("Dropping datagram from {}: {}", source, e),
        }
    }

    fn handle_input(&mut self, input: Input<'_>) {
        if let Err(e) = self.rtc.handle_input(input) {
            let actions = self.negotiator.fail(format!("WebRTC input error: {}", e));
            self.queue(actions);
        }
    }

    fn write_channel(&mut self, message: Outbound) {
        let Outbound { request_id, text } = message;
        let Some(cid) = self.channel else {
            return;
        };
        let failure = match self.rtc.channel(cid) {
            Some(mut channel) => match channel.write(false, text.as_bytes()) {
                Ok(_) => return,
                Err(e) => format!("data channel write of {} bytes failed: {}", text.len(), e),
            },
            None => format!("data channel {:?} is gone", cid),
        };
        match request_id {
            Some(id) => self.mux.fail_request(&id, TunnelError::SendFailed(failure)),
            None => log::warn!("Dropping response: {}", failure),
        }
    }

    /// Drain str0m output until it asks to be woken at a deadline.
    async fn poll_rtc(&mut self) -> TunnelResult<Instant> {
        loop {
            if !self.rtc.is_alive() {
                return Err(TunnelError::Negotiation("WebRTC connection is no longer alive".into()));
            }
            let output = self
                .rtc
                .poll_output()
                .map_err(|e| TunnelError::Negotiation(format!("WebRTC error: {}", e)))?;
            match output {
                Output::Timeout(deadline) => return Ok(deadline),
                Output::Transmit(transmit) => self.transmit(transmit).await,
                Output::Event(event) => self.on_event(event),
            }
        }
    }

    async fn transmit(&self, transmit: Transmit) {
        let Some(udp) = self.sockets.get(&transmit.source) else {
            log::warn!("No socket for source {}", transmit.source);
            return;
        };
        if let Err(e) = udp.send_to(&transmit.contents, transmit.destination).await {
            if is_no_route_error(&e) {
                log::debug!("No route to {}", transmit.destination);
            } else {
                log::warn!("Failed to send to {}: {}", transmit.destination, e);
            }
        }
    }

    fn on_event(&mut self, event: Event) {
        let actions = match event {
            Event::IceConnectionStateChange(state) => {
                log::info!("ICE state: {:?}", state);
                if state == IceConnectionState::Disconnected {
                    self.negotiator.fail("ICE disconnected")
                } else {
                    Vec::new()
                }
            }
            Event::ChannelOpen(cid, label) => {
                log::info!("Data channel '{}' open", label);
                self.channel = Some(cid);
                self.negotiator.on_channel_open()
            }
            Event::ChannelData(ChannelData { id, data, .. }) => {
                if Some(id) == self.channel {
                    match std::str::from_utf8(&data) {
                        Ok(text) => self.mux.handle_inbound(text),
                        Err(_) => log::warn!("Ignoring non-UTF-8 data channel message"),
                    }
                }
                Vec::new()
            }
            Event::ChannelClose(cid) => {
                if Some(cid) == self.channel {
                    self.negotiator.fail("data channel closed")
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        };
        self.queue(actions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RequestEnvelope;
    use crate::http::egress::Egress;
    use crate::http::Ingress;
    use crate::signaling::SignalingRelay;
    use crate::stream::MemoryHost;
    use crate::testing::spawn_upstream;
    use crate::transport::Transport;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::{Request, StatusCode};
    use tokio::net::TcpListener;

    async fn relay_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { SignalingRelay::new().serve(listener).await });
        format!("ws://{}/ws", addr)
    }

    fn config(role: Role, signal_url: String) -> SessionConfig {
        SessionConfig {
            role,
            room: "test-room".to_string(),
            signal_url,
            stun_servers: Vec::new(),
        }
    }

    fn mux() -> (Arc<Multiplexer>, mpsc::UnboundedReceiver<Outbound>) {
        Multiplexer::new(Arc::new(Egress::new(None, Duration::from_secs(1)).unwrap()))
    }

    /// Offerer driver already in `Connected`, without any real negotiation.
    async fn connected_driver(url: &str) -> Driver {
        let (signal_tx, _rx) = signaling::connect(url, "test-room").await.unwrap();
        let (mux, _outbound) = mux();
        let (packet_tx, _packet_rx) = mpsc::unbounded_channel();
        let mut driver = Driver::new(Role::Offerer, signal_tx, mux, packet_tx, CancellationToken::new());

        driver.negotiator.start();
        driver.negotiator.offer_created("v=0".into());
        driver.negotiator.on_signal(SignalMessage::Answer { sdp: "v=0".into() });
        driver.negotiator.on_channel_open();
        assert_eq!(driver.negotiator.state(), SessionState::Connected);
        driver
    }

    fn host_candidate() -> Gathered {
        gather_host().unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_cancel_shuts_down_cleanly() {
        let url = relay_url().await;
        let (mux, outbound) = mux();
        let cancel = CancellationToken::new();
        let session = Session::new(config(Role::Answerer, url), mux.clone());
        let handle = tokio::spawn(session.run(outbound, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(!mux.is_ready());
    }

    #[tokio::test]
    async fn test_unreachable_relay_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mux, outbound) = mux();
        let session = Session::new(config(Role::Offerer, format!("ws://{}/ws", addr)), mux);
        assert!(session.run(outbound, CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_offerer_publishes_offer_to_room() {
        let url = relay_url().await;
        let (_tx, mut peer) = signaling::connect(&url, "test-room").await.unwrap();

        let (mux, outbound) = mux();
        let cancel = CancellationToken::new();
        let session = Session::new(config(Role::Offerer, url), mux);
        let handle = tokio::spawn(session.run(outbound, cancel.clone()));

        let msg = tokio::time::timeout(Duration::from_secs(5), peer.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            SignalMessage::Offer { sdp } => {
                assert!(sdp.starts_with("v=0"));
                assert!(sdp.contains("webrtc-datachannel"));
            }
            other => panic!("expected offer, got {:?}", other),
        }

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_garbage_offer_closes_answerer() {
        let url = relay_url().await;
        let (mut tx, _rx) = signaling::connect(&url, "test-room").await.unwrap();

        let (mux, outbound) = mux();
        let session = Session::new(config(Role::Answerer, url), mux);
        let handle = tokio::spawn(session.run(outbound, CancellationToken::new()));

        // Give the session time to join before publishing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(&SignalMessage::Offer { sdp: "not sdp".into() }).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid offer"), "{}", err);
    }

    #[tokio::test]
    async fn test_late_candidate_after_signaling_loss_keeps_session() {
        let url = relay_url().await;
        let mut driver = connected_driver(&url).await;

        // Relay read side ended.
        driver.signaling_open = false;
        driver.add_local(host_candidate());
        driver.run_actions().await;
        assert!(!driver.negotiator.is_closed());

        // Relay write side refuses.
        let mut driver = connected_driver(&url).await;
        driver.signal_tx.close().await;
        driver.add_local(host_candidate());
        driver.run_actions().await;
        assert!(!driver.negotiator.is_closed());
        driver.tasks.cancel();
    }

    #[tokio::test]
    async fn test_signaling_loss_before_connect_fails() {
        let url = relay_url().await;
        let (signal_tx, _rx) = signaling::connect(&url, "test-room").await.unwrap();
        let (mux, _outbound) = mux();
        let (packet_tx, _packet_rx) = mpsc::unbounded_channel();
        let mut driver = Driver::new(Role::Offerer, signal_tx, mux, packet_tx, CancellationToken::new());
        driver.negotiator.start();
        driver.signaling_open = false;

        let actions = driver.negotiator.offer_created("v=0".into());
        driver.queue(actions);
        driver.run_actions().await;
        assert!(driver.negotiator.is_closed());
    }

    #[tokio::test]
    async fn test_loopback_sessions_carry_requests() {
        let url = relay_url().await;
        let upstream = spawn_upstream().await;
        let cancel = CancellationToken::new();

        let gateway_egress = Egress::new(Some(format!("http://{}", upstream)), Duration::from_secs(5)).unwrap();
        let (gateway, gateway_out) = Multiplexer::new(Arc::new(gateway_egress));
        let answerer = Session::new(config(Role::Answerer, url.clone()), gateway.clone());
        let answerer = tokio::spawn(answerer.run(gateway_out, cancel.clone()));
        // Answerer first: the relay does not keep the offer for late joiners.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let (client, client_out) = mux();
        let offerer = Session::new(config(Role::Offerer, url), client.clone());
        let offerer = tokio::spawn(offerer.run(client_out, cancel.clone()));

        tokio::time::timeout(Duration::from_secs(15), client.wait_ready())
            .await
            .expect("data channel did not open");
        tokio::time::timeout(Duration::from_secs(5), gateway.wait_ready())
            .await
            .expect("answerer never saw the channel");

        let ingress = Ingress::<MemoryHost>::new(Transport::DataChannel(client.clone()), Duration::from_secs(5));
        let response = ingress
            .handle(Request::get("/status").body(Full::new(Bytes::new())).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");

        // Larger than one datagram but within a single channel message.
        let payload = "y".repeat(30_000);
        let res = client
            .send_and_await(
                RequestEnvelope::new("POST", "/echo").with_body(payload.clone().into_bytes()),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(res.status, 200);
        assert!(String::from_utf8(res.body).unwrap().ends_with(&payload));

        // Too large in either direction: fast 502, never a timeout.
        let started = std::time::Instant::now();
        let response = ingress
            .handle(Request::get("/large").body(Full::new(Bytes::new())).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let response = ingress
            .handle(
                Request::post("/upload")
                    .body(Full::new(Bytes::from(vec![b'z'; 100_000])))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(client.pending_count(), 0);

        cancel.cancel();
        assert!(offerer.await.unwrap().is_ok());
        assert!(answerer.await.unwrap().is_ok());
    }
}
