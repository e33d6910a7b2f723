//! Call orchestration
//!
//! A [`CallSession`] owns the two endpoints of a loopback call. Each endpoint
//! runs in its own driver task, which owns the endpoint's `Rtc`, UDP socket and
//! signaling link and multiplexes them with `tokio::select!`:
//!
//! 1. signaling messages from the other endpoint (descriptions, candidates)
//! 2. datagrams arriving on the socket
//! 3. the `Rtc` timeout
//! 4. the hang-up signal
//!
//! State visible to the outside world is published through a `watch` channel
//! as an [`EndpointSnapshot`] after every step.

use std::{
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use str0m::{
    media::{Direction, MediaKind},
    net::{Protocol, Receive},
    Event, IceConnectionState, Input, Output,
};
use tokio::{net::UdpSocket, sync::watch, task::JoinHandle};
use tracing::{debug, error, info, trace, warn};

use crate::{
    call::{
        endpoint::{Endpoint, LocalTrack, Role, SignalingState},
        sdp::{negotiated_codec, NegotiatedCodec},
        signaling::{loopback_pair, SignalMessage, SignalingLink},
    },
    error::NegotiationError,
    model::{
        codec::{prefer_codec, video_capabilities, CodecPreference},
        description::{SdpType, SessionDescription},
    },
};

/// Id of the single local stream the initiator sends.
const LOCAL_STREAM_ID: &str = "loopback-stream";
const VIDEO_TRACK_ID: &str = "loopback-video";

/// Poll interval while an endpoint has no `Rtc` to ask for a timeout.
const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Address both endpoints bind their UDP socket to.
    pub bind_ip: IpAddr,
    /// Video codec the initiator moves to the front of its list.
    pub codec_preference: Option<CodecPreference>,
}

/// What one endpoint looks like from the outside.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub label: &'static str,
    pub signaling_state: SignalingState,
    pub ice_state: Option<String>,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub active_codec: Option<NegotiatedCodec>,
    pub remote_tracks: Vec<String>,
    pub candidates_sent: usize,
    pub candidates_received: usize,
}

impl EndpointSnapshot {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            signaling_state: SignalingState::Stable,
            ice_state: None,
            local_description: None,
            remote_description: None,
            active_codec: None,
            remote_tracks: vec![],
            candidates_sent: 0,
            candidates_received: 0,
        }
    }

    /// ICE reached `Connected` or `Completed`.
    pub fn is_connected(&self) -> bool {
        matches!(self.ice_state.as_deref(), Some("Connected" | "Completed"))
    }

    /// Both descriptions applied and back in stable state.
    pub fn is_negotiated(&self) -> bool {
        self.signaling_state == SignalingState::Stable
            && self.local_description.is_some()
            && self.remote_description.is_some()
    }
}

struct EndpointHandle {
    state: watch::Receiver<EndpointSnapshot>,
    task: JoinHandle<()>,
}

pub struct CallSession {
    started_at: DateTime<Utc>,
    shutdown: watch::Sender<bool>,
    pc1: EndpointHandle,
    pc2: EndpointHandle,
}

impl CallSession {
    /// Sets up both endpoints and starts the handshake. Returns once the driver
    /// tasks are running; negotiation continues in the background.
    pub async fn call(config: CallConfig) -> Result<Self, NegotiationError> {
        info!("Starting call");
        let started = Instant::now();
        let started_at = Utc::now();

        let track = LocalTrack {
            id: VIDEO_TRACK_ID.to_string(),
            kind: MediaKind::Video,
            label: "test pattern".to_string(),
        };
        info!("Using video device: {}", track.label);

        let mut pc1 = Endpoint::new(Role::Initiator, LOCAL_STREAM_ID);
        info!("Created local peer connection object pc1");
        let pc2 = Endpoint::new(Role::Responder, LOCAL_STREAM_ID);
        info!("Created remote peer connection object pc2");

        pc1.add_track(track)?;
        pc1.add_transceiver(MediaKind::Audio, Direction::RecvOnly)?;
        info!("Added local stream to pc1");

        if let Some(preference) = &config.codec_preference {
            let codecs = prefer_codec(&video_capabilities(), preference)?;
            debug!("pc1 codec order: {:?}", codecs);
            info!("Preferred video codec: {}", codecs[0]);
            pc1.set_codec_preferences(VIDEO_TRACK_ID, codecs)?;
        }

        let socket1 = UdpSocket::bind(SocketAddr::new(config.bind_ip, 0)).await?;
        let socket2 = UdpSocket::bind(SocketAddr::new(config.bind_ip, 0)).await?;
        let (link1, link2) = loopback_pair();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let pc1 = Driver::spawn(pc1, socket1, link1, shutdown_rx.clone(), started)?;
        let pc2 = Driver::spawn(pc2, socket2, link2, shutdown_rx, started)?;

        Ok(Self {
            started_at,
            shutdown,
            pc1,
            pc2,
        })
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn snapshot(&self, role: Role) -> EndpointSnapshot {
        self.handle(role).state.borrow().clone()
    }

    /// True while either driver task is still running.
    pub fn is_running(&self) -> bool {
        !self.pc1.task.is_finished() || !self.pc2.task.is_finished()
    }

    /// Waits until both endpoints have applied both descriptions.
    pub async fn wait_until_negotiated(&mut self) -> Result<(), NegotiationError> {
        for handle in [&mut self.pc1, &mut self.pc2] {
            let closed = {
                let snapshot = handle
                    .state
                    .wait_for(|s| s.is_negotiated() || s.signaling_state == SignalingState::Closed)
                    .await
                    .map_err(|_| NegotiationError::ChannelClosed)?;
                snapshot.signaling_state == SignalingState::Closed
            };

            if closed {
                let label = handle.state.borrow().label;
                return Err(NegotiationError::InvalidState {
                    label,
                    reason: "endpoint closed before negotiation finished".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Waits until the initiator reports a connected ICE state. Fails if the
    /// endpoint closes first.
    pub async fn wait_until_connected(&mut self) -> Result<(), NegotiationError> {
        let closed = {
            let snapshot = self
                .pc1
                .state
                .wait_for(|s| s.is_connected() || s.signaling_state == SignalingState::Closed)
                .await
                .map_err(|_| NegotiationError::ChannelClosed)?;
            !snapshot.is_connected()
        };

        if closed {
            return Err(NegotiationError::InvalidState {
                label: Role::Initiator.label(),
                reason: "endpoint closed before ICE connected".to_string(),
            });
        }
        Ok(())
    }

    /// Closes both endpoints and waits for their driver tasks to end.
    /// Returns the final `(pc1, pc2)` snapshots.
    pub async fn hang_up(self) -> (EndpointSnapshot, EndpointSnapshot) {
        info!("Ending call");
        self.shutdown.send_replace(true);

        (finish(self.pc1).await, finish(self.pc2).await)
    }

    fn handle(&self, role: Role) -> &EndpointHandle {
        match role {
            Role::Initiator => &self.pc1,
            Role::Responder => &self.pc2,
        }
    }
}

async fn finish(handle: EndpointHandle) -> EndpointSnapshot {
    if let Err(e) = handle.task.await {
        error!("Endpoint task ended abnormally: {}", e);
    }
    let snapshot = handle.state.borrow().clone();
    snapshot
}

/// Owns one endpoint and everything it talks to.
struct Driver {
    endpoint: Endpoint,
    socket: UdpSocket,
    local_addr: SocketAddr,
    link: SignalingLink,
    link_open: bool,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<EndpointSnapshot>,
    snapshot: EndpointSnapshot,
    started: Instant,
    setup_logged: bool,
}

impl Driver {
    fn spawn(
        endpoint: Endpoint,
        socket: UdpSocket,
        link: SignalingLink,
        shutdown: watch::Receiver<bool>,
        started: Instant,
    ) -> Result<EndpointHandle, NegotiationError> {
        let local_addr = socket.local_addr()?;
        let label = endpoint.label();
        debug!("{} bound to {}", label, local_addr);

        let snapshot = EndpointSnapshot::new(label);
        let (state, state_rx) = watch::channel(snapshot.clone());

        let driver = Driver {
            endpoint,
            socket,
            local_addr,
            link,
            link_open: true,
            shutdown,
            state,
            snapshot,
            started,
            setup_logged: false,
        };
        let task = tokio::spawn(driver.run());

        Ok(EndpointHandle { state: state_rx, task })
    }

    fn label(&self) -> &'static str {
        self.endpoint.label()
    }

    async fn run(mut self) {
        if self.endpoint.role() == Role::Initiator {
            self.start_offer();
        }
        self.publish();

        let mut buf = vec![0; 2000];

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let timeout = self.drive_output().await;
            self.publish();

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                message = self.link.recv(), if self.link_open => match message {
                    Some(message) => self.handle_signal(message),
                    None => {
                        debug!("{} signaling peer went away", self.label());
                        self.link_open = false;
                    }
                },
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, source)) => self.handle_datagram(&buf[..n], source),
                    Err(e) => warn!("{} socket receive failed: {}", self.label(), e),
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(timeout)) => {
                    self.handle_timeout();
                }
            }
        }

        self.endpoint.close();
        self.link.close();
        self.publish();
        info!("{} closed", self.label());
    }

    /// Phases 1 and 2 on the initiator's side.
    fn start_offer(&mut self) {
        let label = self.label();

        info!("{} createOffer start", label);
        let offer = match self.endpoint.create_offer() {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Failed to create session description: {}", e);
                return;
            }
        };
        info!("Offer from {}\n{}", label, offer.sdp);

        if !self.apply_local(offer.clone()) {
            return;
        }
        self.send(SignalMessage::Description { description: offer });
        self.gather_and_send();
    }

    fn handle_signal(&mut self, message: SignalMessage) {
        let label = self.label();

        match message {
            SignalMessage::Description { description } => {
                let kind = description.kind;

                info!("{} setRemoteDescription start", label);
                if let Err(e) = self.endpoint.set_remote_description(description) {
                    warn!("{} failed to set session description: {}", label, e);
                    return;
                }
                info!("{} setRemoteDescription complete", label);

                match kind {
                    SdpType::Offer => self.answer(),
                    SdpType::Answer => {
                        let answer = self.endpoint.remote_description().map(|d| d.sdp.clone());
                        self.report_codec(answer.as_deref());
                    }
                }
            }
            SignalMessage::Candidate { candidate } => {
                if candidate.is_some() {
                    self.snapshot.candidates_received += 1;
                }
                match self.endpoint.add_ice_candidate(candidate.as_deref()) {
                    Ok(()) => info!(
                        "{} addIceCandidate success: {}",
                        label,
                        candidate.as_deref().unwrap_or("(null)")
                    ),
                    Err(e) => warn!("{} failed to add ICE Candidate: {}", label, e),
                }
            }
        }
    }

    /// Phase 3 on the responder's side.
    fn answer(&mut self) {
        let label = self.label();

        info!("{} createAnswer start", label);
        let answer = match self.endpoint.create_answer() {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Failed to create session description: {}", e);
                return;
            }
        };
        info!("Answer from {}:\n{}", label, answer.sdp);

        if !self.apply_local(answer.clone()) {
            return;
        }
        self.report_codec(Some(&answer.sdp));
        self.send(SignalMessage::Description { description: answer });
        self.gather_and_send();
    }

    fn apply_local(&mut self, description: SessionDescription) -> bool {
        let label = self.label();

        info!("{} setLocalDescription start", label);
        match self.endpoint.set_local_description(description) {
            Ok(()) => {
                info!("{} setLocalDescription complete", label);
                true
            }
            Err(e) => {
                warn!("{} failed to set session description: {}", label, e);
                false
            }
        }
    }

    fn report_codec(&mut self, answer: Option<&str>) {
        let codec = answer.and_then(|sdp| negotiated_codec(sdp, "video"));
        match &codec {
            Some(codec) => info!("{} using {}", self.label(), codec),
            None => warn!("{} answer carries no video codec", self.label()),
        }
        self.snapshot.active_codec = codec;
    }

    /// Phase 4: trickles every local candidate, then the end marker.
    fn gather_and_send(&mut self) {
        let label = self.label();

        for candidate in self.endpoint.gather_candidates(self.local_addr) {
            info!("{} ICE candidate:\n{}", label, candidate);
            self.send(SignalMessage::Candidate {
                candidate: Some(candidate),
            });
            self.snapshot.candidates_sent += 1;
        }

        debug!("{} ICE candidate: (null)", label);
        self.send(SignalMessage::Candidate { candidate: None });
    }

    fn send(&mut self, message: SignalMessage) {
        if let Err(e) = self.link.send(&message) {
            warn!("{} failed to signal peer: {}", self.label(), e);
        }
    }

    /// Flushes queued transmits and events. Returns when the next timeout
    /// is due.
    async fn drive_output(&mut self) -> Instant {
        let fallback = Instant::now() + IDLE_POLL;
        let label = self.label();

        loop {
            let Some(rtc) = self.endpoint.rtc_mut() else {
                return fallback;
            };
            if !rtc.is_alive() {
                return fallback;
            }

            match rtc.poll_output() {
                Ok(Output::Timeout(timeout)) => return timeout,
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self
                        .socket
                        .send_to(&transmit.contents, transmit.destination)
                        .await
                    {
                        debug!("{} send to {} failed: {}", label, transmit.destination, e);
                    }
                }
                Ok(Output::Event(event)) => self.handle_event(event),
                Err(e) => {
                    warn!("{} rtc failed: {}", label, e);
                    rtc.disconnect();
                    return fallback;
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        let label = self.label();

        match event {
            Event::IceConnectionStateChange(state) => {
                info!("{} ICE state: {:?}", label, state);
                self.snapshot.ice_state = Some(format!("{:?}", state));

                let connected = matches!(
                    state,
                    IceConnectionState::Connected | IceConnectionState::Completed
                );
                if connected && self.endpoint.role() == Role::Initiator && !self.setup_logged {
                    self.setup_logged = true;
                    info!(
                        "Setup time: {:.3}ms",
                        self.started.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Event::Connected => info!("{} connected", label),
            Event::MediaAdded(media) => {
                info!("{} received remote stream: {:?} {:?}", label, media.kind, media.mid);
                self.snapshot
                    .remote_tracks
                    .push(format!("{:?}:{:?}", media.kind, media.mid));
            }
            other => trace!("{} event: {:?}", label, other),
        }
    }

    fn handle_datagram(&mut self, data: &[u8], source: SocketAddr) {
        let label = self.label();
        let destination = self.local_addr;
        let Some(rtc) = self.endpoint.rtc_mut() else {
            trace!("{} dropping datagram from {} before negotiation", label, source);
            return;
        };

        let contents = match data.try_into() {
            Ok(contents) => contents,
            Err(e) => {
                debug!("{} unparseable datagram from {}: {:?}", label, source, e);
                return;
            }
        };

        let input = Input::Receive(
            Instant::now(),
            Receive {
                proto: Protocol::Udp,
                source,
                destination,
                contents,
            },
        );

        if let Err(e) = rtc.handle_input(input) {
            warn!("{} failed to handle datagram: {}", label, e);
        }
    }

    fn handle_timeout(&mut self) {
        let label = self.label();
        if let Some(rtc) = self.endpoint.rtc_mut() {
            if let Err(e) = rtc.handle_input(Input::Timeout(Instant::now())) {
                warn!("{} failed to handle timeout: {}", label, e);
            }
        }
    }

    fn publish(&mut self) {
        self.snapshot.signaling_state = self.endpoint.signaling_state();
        self.snapshot.local_description = self.endpoint.local_description().cloned();
        self.snapshot.remote_description = self.endpoint.remote_description().cloned();
        self.state.send_replace(self.snapshot.clone());
    }
}
