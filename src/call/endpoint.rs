//! One side of a two-party negotiation
//!
//! [`Endpoint`] wraps a `str0m` [`Rtc`] behind the operations a browser peer
//! connection exposes: tracks and transceivers, codec preferences, offer and
//! answer creation, local/remote descriptions and trickled candidates.
//!
//! `str0m` fuses some of these steps (accepting an offer also produces and
//! applies the answer). The endpoint keeps the browser ordering on top of
//! that and rejects calls made in the wrong signaling state.

use std::{collections::BTreeSet, net::SocketAddr};

use serde::Serialize;
use str0m::{
    change::{SdpAnswer, SdpOffer, SdpPendingOffer},
    media::{Direction, Frequency, MediaKind, Mid, Pt},
    Candidate, Rtc,
};
use tracing::debug;

use crate::{
    call::sdp::{offered_codecs, NegotiatedCodec},
    error::NegotiationError,
    model::{
        codec::{video_capabilities, CodecCapability},
        description::{SdpType, SessionDescription},
    },
    util::host_candidates,
};

/// Which side of the call an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Log label, matching the classic `pc1`/`pc2` naming.
    pub fn label(self) -> &'static str {
        match self {
            Role::Initiator => "pc1",
            Role::Responder => "pc2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// A local media source attached to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
}

#[derive(Debug)]
pub struct Transceiver {
    pub kind: MediaKind,
    pub direction: Direction,
    /// The local track feeding the sender, if any.
    pub track: Option<LocalTrack>,
    /// Assigned when the transceiver is first put in an offer.
    pub mid: Option<Mid>,
    codec_preferences: Option<Vec<CodecCapability>>,
}

pub struct Endpoint {
    role: Role,
    stream_id: String,
    rtc: Option<Rtc>,
    transceivers: Vec<Transceiver>,
    state: SignalingState,
    created_offer: Option<SessionDescription>,
    pending_offer: Option<SdpPendingOffer>,
    created_answer: Option<SessionDescription>,
    /// The applied remote offer, consumed by `create_answer`.
    remote_offer: Option<SdpOffer>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    /// Remote candidates that arrived before the remote description.
    buffered_candidates: Vec<Candidate>,
    remote_gathering_done: bool,
}

impl Endpoint {
    pub fn new(role: Role, stream_id: impl Into<String>) -> Self {
        Self {
            role,
            stream_id: stream_id.into(),
            rtc: None,
            transceivers: vec![],
            state: SignalingState::Stable,
            created_offer: None,
            pending_offer: None,
            created_answer: None,
            remote_offer: None,
            local_description: None,
            remote_description: None,
            buffered_candidates: vec![],
            remote_gathering_done: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn label(&self) -> &'static str {
        self.role.label()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn transceivers(&self) -> &[Transceiver] {
        &self.transceivers
    }

    pub fn buffered_candidates(&self) -> usize {
        self.buffered_candidates.len()
    }

    pub fn remote_gathering_done(&self) -> bool {
        self.remote_gathering_done
    }

    /// The underlying session, once negotiation has started.
    pub fn rtc_mut(&mut self) -> Option<&mut Rtc> {
        self.rtc.as_mut()
    }

    /// Attaches a local track on a new send/receive transceiver.
    pub fn add_track(&mut self, track: LocalTrack) -> Result<(), NegotiationError> {
        self.ensure_configurable("add a track")?;
        debug!("{} adding {:?} track '{}'", self.label(), track.kind, track.id);
        self.transceivers.push(Transceiver {
            kind: track.kind,
            direction: Direction::SendRecv,
            track: Some(track),
            mid: None,
            codec_preferences: None,
        });
        Ok(())
    }

    /// Adds a transceiver with no local track, e.g. to receive audio only.
    pub fn add_transceiver(&mut self, kind: MediaKind, direction: Direction) -> Result<(), NegotiationError> {
        self.ensure_configurable("add a transceiver")?;
        self.transceivers.push(Transceiver {
            kind,
            direction,
            track: None,
            mid: None,
            codec_preferences: None,
        });
        Ok(())
    }

    /// Sets the codec order for the transceiver sending `track_id`.
    ///
    /// Every entry must come from the local capabilities. Preferences must be
    /// set before the first offer is created.
    pub fn set_codec_preferences(
        &mut self,
        track_id: &str,
        codecs: Vec<CodecCapability>,
    ) -> Result<(), NegotiationError> {
        self.ensure_configurable("set codec preferences")?;
        let label = self.label();

        let transceiver = self
            .transceivers
            .iter_mut()
            .find(|t| t.track.as_ref().is_some_and(|track| track.id == track_id))
            .ok_or_else(|| NegotiationError::NoMatchingTransceiver {
                label,
                track_id: track_id.to_string(),
            })?;

        if transceiver.kind != MediaKind::Video {
            return Err(NegotiationError::InvalidState {
                label,
                reason: format!("track '{track_id}' is not a video track"),
            });
        }

        let capabilities = video_capabilities();
        if codecs.is_empty() {
            return Err(NegotiationError::CodecNotFound("empty codec list".to_string()));
        }
        if let Some(unknown) = codecs.iter().find(|c| !capabilities.contains(c)) {
            return Err(NegotiationError::CodecNotFound(unknown.to_string()));
        }

        transceiver.codec_preferences = Some(codecs);
        Ok(())
    }

    /// Creates an offer covering every transceiver not yet negotiated.
    pub fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        if self.state != SignalingState::Stable || self.pending_offer.is_some() {
            return Err(self.invalid_state("create an offer"));
        }
        if self.transceivers.iter().all(|t| t.mid.is_some()) {
            return Err(NegotiationError::Sdp {
                label: self.label(),
                reason: "nothing to negotiate".to_string(),
            });
        }

        let rtc = self
            .rtc
            .get_or_insert_with(|| build_rtc(&local_codecs(&self.transceivers)));

        let mut change = rtc.sdp_api();
        for transceiver in self.transceivers.iter_mut().filter(|t| t.mid.is_none()) {
            let track_id = transceiver.track.as_ref().map(|t| t.id.clone());
            let mid = change.add_media(
                transceiver.kind,
                transceiver.direction,
                Some(self.stream_id.clone()),
                track_id,
                None,
            );
            transceiver.mid = Some(mid);
        }

        let Some((offer, pending)) = change.apply() else {
            return Err(NegotiationError::Sdp {
                label: self.role.label(),
                reason: "no changes to offer".to_string(),
            });
        };

        let description = SessionDescription::offer(offer.to_sdp_string());
        self.created_offer = Some(description.clone());
        self.pending_offer = Some(pending);
        Ok(description)
    }

    /// Answers the applied remote offer.
    pub fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        if self.state != SignalingState::HaveRemoteOffer || self.created_answer.is_some() {
            return Err(self.invalid_state("create an answer"));
        }
        let label = self.label();

        let offer = self
            .remote_offer
            .take()
            .ok_or_else(|| self.invalid_state("create an answer without a remote offer"))?;

        let answer = self
            .ensure_rtc()
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| NegotiationError::Rtc {
                label,
                reason: e.to_string(),
            })?;

        let description = SessionDescription::answer(answer.to_sdp_string());
        self.created_answer = Some(description.clone());
        Ok(description)
    }

    /// Applies a description this endpoint created.
    pub fn set_local_description(&mut self, description: SessionDescription) -> Result<(), NegotiationError> {
        match (description.kind, self.state) {
            (SdpType::Offer, SignalingState::Stable) => {
                if self.created_offer.as_ref() != Some(&description) {
                    return Err(self.invalid_state("apply an offer this endpoint did not create"));
                }
                self.created_offer = None;
                self.state = SignalingState::HaveLocalOffer;
            }
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                if self.created_answer.as_ref() != Some(&description) {
                    return Err(self.invalid_state("apply an answer this endpoint did not create"));
                }
                self.created_answer = None;
                self.state = SignalingState::Stable;
            }
            _ => {
                return Err(self.invalid_state(&format!("apply a local {:?}", description.kind)));
            }
        }

        self.local_description = Some(description);
        Ok(())
    }

    /// Applies a description received from the other endpoint.
    pub fn set_remote_description(&mut self, description: SessionDescription) -> Result<(), NegotiationError> {
        let label = self.label();

        match (description.kind, self.state) {
            (SdpType::Offer, SignalingState::Stable) if self.pending_offer.is_none() => {
                let offer = SdpOffer::from_sdp_string(&description.sdp).map_err(|e| {
                    NegotiationError::Sdp {
                        label,
                        reason: e.to_string(),
                    }
                })?;

                // Answer in the offerer's order so its first choice wins.
                if self.rtc.is_none() {
                    let order = answer_codec_order(&offered_codecs(&description.sdp, "video"));
                    debug!("{} answering with codec order {:?}", label, order);
                    self.rtc = Some(build_rtc(&order));
                }
                self.remote_offer = Some(offer);
                self.state = SignalingState::HaveRemoteOffer;
            }
            (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                let answer = SdpAnswer::from_sdp_string(&description.sdp).map_err(|e| {
                    NegotiationError::Sdp {
                        label,
                        reason: e.to_string(),
                    }
                })?;
                let pending = self
                    .pending_offer
                    .take()
                    .ok_or_else(|| self.invalid_state("apply an answer without a pending offer"))?;

                self.ensure_rtc()
                    .sdp_api()
                    .accept_answer(pending, answer)
                    .map_err(|e| NegotiationError::Rtc {
                        label,
                        reason: e.to_string(),
                    })?;
                self.state = SignalingState::Stable;
            }
            _ => {
                return Err(self.invalid_state(&format!("apply a remote {:?}", description.kind)));
            }
        }

        self.remote_description = Some(description);
        self.flush_candidates();
        Ok(())
    }

    /// Adds a candidate trickled from the other endpoint. `None` marks the end
    /// of its gathering. Candidates received before the remote description are
    /// held back until it is applied.
    pub fn add_ice_candidate(&mut self, candidate: Option<&str>) -> Result<(), NegotiationError> {
        if self.state == SignalingState::Closed {
            return Err(self.invalid_state("add an ICE candidate"));
        }

        let Some(candidate) = candidate else {
            self.remote_gathering_done = true;
            return Ok(());
        };

        let candidate = Candidate::from_sdp_string(candidate).map_err(|e| NegotiationError::Candidate {
            label: self.label(),
            reason: e.to_string(),
        })?;

        self.buffered_candidates.push(candidate);
        if self.remote_description.is_some() {
            self.flush_candidates();
        }
        Ok(())
    }

    /// Registers host candidates for a socket bound to `local` and returns
    /// them in SDP form, ready to be trickled to the other side.
    /// A closed endpoint gathers nothing.
    pub fn gather_candidates(&mut self, local: SocketAddr) -> Vec<String> {
        if self.state == SignalingState::Closed {
            return vec![];
        }
        let rtc = self.ensure_rtc();

        host_candidates(local)
            .into_iter()
            .filter_map(|candidate| rtc.add_local_candidate(candidate).map(|c| c.to_sdp_string()))
            .collect()
    }

    /// Closes the endpoint. Pending negotiation work is abandoned.
    pub fn close(&mut self) {
        if let Some(rtc) = self.rtc.as_mut() {
            rtc.disconnect();
        }
        self.pending_offer = None;
        self.created_offer = None;
        self.created_answer = None;
        self.remote_offer = None;
        self.buffered_candidates.clear();
        self.state = SignalingState::Closed;
    }

    fn ensure_rtc(&mut self) -> &mut Rtc {
        self.rtc
            .get_or_insert_with(|| build_rtc(&local_codecs(&self.transceivers)))
    }

    fn ensure_configurable(&self, action: &str) -> Result<(), NegotiationError> {
        if self.state == SignalingState::Closed || self.rtc.is_some() {
            return Err(self.invalid_state(action));
        }
        Ok(())
    }

    fn flush_candidates(&mut self) {
        if self.buffered_candidates.is_empty() {
            return;
        }
        let label = self.label();
        let candidates = std::mem::take(&mut self.buffered_candidates);
        let rtc = self.ensure_rtc();
        for candidate in candidates {
            debug!("{} applying remote candidate {}", label, candidate.to_sdp_string());
            rtc.add_remote_candidate(candidate);
        }
    }

    fn invalid_state(&self, action: &str) -> NegotiationError {
        NegotiationError::InvalidState {
            label: self.label(),
            reason: format!("cannot {action} in state {:?}", self.state),
        }
    }
}

/// The first video transceiver's preferences, else the default capabilities.
fn local_codecs(transceivers: &[Transceiver]) -> Vec<CodecCapability> {
    transceivers
        .iter()
        .filter(|t| t.kind == MediaKind::Video)
        .find_map(|t| t.codec_preferences.clone())
        .unwrap_or_else(video_capabilities)
}

/// Local capabilities reordered to follow the offered video codecs. Codecs
/// the offer does not mention keep their default order at the end.
fn answer_codec_order(offered: &[NegotiatedCodec]) -> Vec<CodecCapability> {
    let mut remaining = video_capabilities();
    let mut order = Vec::with_capacity(remaining.len());

    for codec in offered {
        if let Some(index) = remaining.iter().position(|c| same_codec(c, codec)) {
            order.push(remaining.remove(index));
        }
    }
    order.append(&mut remaining);

    order
}

fn same_codec(capability: &CodecCapability, offered: &NegotiatedCodec) -> bool {
    capability.mime_type.eq_ignore_ascii_case(&offered.mime_type)
        && (capability.payload_type == offered.payload_type
            || fmtp_params(capability.sdp_fmtp_line.as_deref())
                == fmtp_params(offered.sdp_fmtp_line.as_deref()))
}

/// fmtp parameters as a set, so parameter order does not matter.
fn fmtp_params(line: Option<&str>) -> BTreeSet<&str> {
    line.map(|l| l.split(';').map(str::trim).filter(|p| !p.is_empty()).collect())
        .unwrap_or_default()
}

/// Builds the session with the video codecs in the given order.
fn build_rtc(codecs: &[CodecCapability]) -> Rtc {
    let mut config = Rtc::builder().clear_codecs().enable_opus(true);
    for capability in codecs {
        let Some(codec) = capability.codec() else {
            continue;
        };
        config.codec_config().add_config(
            Pt::from(capability.payload_type),
            Some(Pt::from(capability.rtx_payload_type())),
            codec,
            Frequency::NINETY_KHZ,
            None,
            capability.format_params(),
        );
    }

    config.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        call::sdp::negotiated_codec,
        model::codec::{prefer_codec, CodecPreference},
    };

    fn video_track() -> LocalTrack {
        LocalTrack {
            id: "video-0".to_string(),
            kind: MediaKind::Video,
            label: "test pattern".to_string(),
        }
    }

    fn initiator() -> Endpoint {
        let mut pc1 = Endpoint::new(Role::Initiator, "stream-0");
        pc1.add_track(video_track()).unwrap();
        pc1
    }

    #[test]
    fn four_phase_handshake_crosses_descriptions() {
        let mut pc1 = initiator();
        let mut pc2 = Endpoint::new(Role::Responder, "stream-1");

        let offer = pc1.create_offer().unwrap();
        pc1.set_local_description(offer.clone()).unwrap();
        pc2.set_remote_description(offer).unwrap();
        let answer = pc2.create_answer().unwrap();

        pc2.set_local_description(answer.clone()).unwrap();
        pc1.set_remote_description(answer).unwrap();

        assert_eq!(pc1.signaling_state(), SignalingState::Stable);
        assert_eq!(pc2.signaling_state(), SignalingState::Stable);
        assert_eq!(pc1.local_description(), pc2.remote_description());
        assert_eq!(pc2.local_description(), pc1.remote_description());
        assert_eq!(pc1.local_description().unwrap().kind, SdpType::Offer);
        assert!(pc1.transceivers()[0].mid.is_some());
    }

    #[test]
    fn preferences_need_a_matching_transceiver() {
        let mut pc1 = initiator();

        let err = pc1
            .set_codec_preferences("no-such-track", video_capabilities())
            .unwrap_err();

        assert!(matches!(err, NegotiationError::NoMatchingTransceiver { .. }));
    }

    #[test]
    fn preferences_are_fixed_once_negotiation_starts() {
        let mut pc1 = initiator();
        pc1.create_offer().unwrap();

        let err = pc1
            .set_codec_preferences("video-0", video_capabilities())
            .unwrap_err();

        assert!(matches!(err, NegotiationError::InvalidState { .. }));
    }

    #[test]
    fn preferred_codec_leads_the_offer() {
        let mut pc1 = initiator();
        let pref: CodecPreference = "video/VP9 profile-id=0".parse().unwrap();
        let codecs = prefer_codec(&video_capabilities(), &pref).unwrap();
        pc1.set_codec_preferences("video-0", codecs).unwrap();

        let offer = pc1.create_offer().unwrap();
        let codec = negotiated_codec(&offer.sdp, "video").unwrap();

        assert_eq!(codec.mime_type, "video/VP9");
        assert_eq!(codec.payload_type, 98);
    }

    #[test]
    fn answer_in_stable_state_is_rejected() {
        let mut pc1 = initiator();

        let err = pc1
            .set_remote_description(SessionDescription::answer("v=0\r\n"))
            .unwrap_err();

        assert!(matches!(err, NegotiationError::InvalidState { .. }));
    }

    #[test]
    fn foreign_local_offer_is_rejected() {
        let mut pc1 = initiator();
        pc1.create_offer().unwrap();

        let err = pc1
            .set_local_description(SessionDescription::offer("v=0\r\n"))
            .unwrap_err();

        assert!(matches!(err, NegotiationError::InvalidState { .. }));
        assert_eq!(pc1.signaling_state(), SignalingState::Stable);
    }

    #[test]
    fn early_candidates_wait_for_remote_description() {
        let mut pc1 = initiator();
        let mut pc2 = Endpoint::new(Role::Responder, "stream-1");
        let candidate = Candidate::host("10.0.0.7:50000".parse().unwrap(), "udp")
            .unwrap()
            .to_sdp_string();

        pc2.add_ice_candidate(Some(&candidate)).unwrap();
        pc2.add_ice_candidate(None).unwrap();
        assert_eq!(pc2.buffered_candidates(), 1);
        assert!(pc2.remote_gathering_done());

        let offer = pc1.create_offer().unwrap();
        pc1.set_local_description(offer.clone()).unwrap();
        pc2.set_remote_description(offer).unwrap();

        assert_eq!(pc2.buffered_candidates(), 0);
    }

    #[test]
    fn closed_endpoint_rejects_candidates() {
        let mut pc2 = Endpoint::new(Role::Responder, "stream-1");
        pc2.close();

        assert!(pc2.add_ice_candidate(None).is_err());
        assert_eq!(pc2.signaling_state(), SignalingState::Closed);
    }

    #[test]
    fn malformed_candidate_is_an_error() {
        let mut pc2 = Endpoint::new(Role::Responder, "stream-1");

        let err = pc2.add_ice_candidate(Some("not a candidate")).unwrap_err();

        assert!(matches!(err, NegotiationError::Candidate { .. }));
    }

    #[test]
    fn malformed_remote_offer_leaves_endpoint_stable() {
        let mut pc1 = initiator();
        let mut pc2 = Endpoint::new(Role::Responder, "stream-1");

        let err = pc2
            .set_remote_description(SessionDescription::offer("garbage"))
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Sdp { .. }));
        assert_eq!(pc2.signaling_state(), SignalingState::Stable);
        assert!(pc2.remote_description().is_none());

        let offer = pc1.create_offer().unwrap();
        pc1.set_local_description(offer.clone()).unwrap();
        pc2.set_remote_description(offer).unwrap();
        assert!(pc2.create_answer().is_ok());
    }

    #[test]
    fn answer_follows_the_offered_preference() {
        let mut pc1 = initiator();
        let mut pc2 = Endpoint::new(Role::Responder, "stream-1");
        let pref: CodecPreference = "video/VP9 profile-id=0".parse().unwrap();
        pc1.set_codec_preferences("video-0", prefer_codec(&video_capabilities(), &pref).unwrap())
            .unwrap();

        let offer = pc1.create_offer().unwrap();
        pc1.set_local_description(offer.clone()).unwrap();
        pc2.set_remote_description(offer).unwrap();
        let answer = pc2.create_answer().unwrap();

        let codec = negotiated_codec(&answer.sdp, "video").unwrap();
        assert_eq!(codec.mime_type, "video/VP9");
        assert_eq!(codec.sdp_fmtp_line.as_deref(), Some("profile-id=0"));
    }

    #[test]
    fn answer_order_puts_offered_codecs_first() {
        let offered = vec![
            NegotiatedCodec {
                payload_type: 120,
                mime_type: "video/H264".to_string(),
                clock_rate: 90_000,
                sdp_fmtp_line: Some(
                    "profile-level-id=42e01f;packetization-mode=1;level-asymmetry-allowed=1"
                        .to_string(),
                ),
            },
            NegotiatedCodec {
                payload_type: 121,
                mime_type: "video/rtx".to_string(),
                clock_rate: 90_000,
                sdp_fmtp_line: Some("apt=120".to_string()),
            },
            NegotiatedCodec {
                payload_type: 96,
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                sdp_fmtp_line: None,
            },
        ];

        let order = answer_codec_order(&offered);

        assert_eq!(order.len(), video_capabilities().len());
        assert_eq!(order[0].payload_type, 106);
        assert_eq!(order[1].mime_type, "video/VP8");
        assert_eq!(order[2].mime_type, "video/VP9");
    }

    #[test]
    fn closed_endpoint_gathers_nothing() {
        let mut pc1 = initiator();
        pc1.close();

        assert!(pc1.gather_candidates("10.0.0.7:50000".parse().unwrap()).is_empty());
        assert!(pc1.rtc_mut().is_none());
    }
}
