//! Reading the negotiated codec back out of a session description.

use serde::Serialize;

/// The codec a media section settled on: the first payload type listed on
/// its m-line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiatedCodec {
    pub payload_type: u8,
    pub mime_type: String,
    pub clock_rate: u32,
    pub sdp_fmtp_line: Option<String>,
}

impl std::fmt::Display for NegotiatedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ", self.mime_type)?;
        if let Some(fmtp) = &self.sdp_fmtp_line {
            write!(f, "{} ", fmtp)?;
        }
        write!(f, ", payloadType={}", self.payload_type)
    }
}

/// Finds the first `m=<kind>` section of `sdp` and describes its preferred
/// codec.
pub fn negotiated_codec(sdp: &str, kind: &str) -> Option<NegotiatedCodec> {
    offered_codecs(sdp, kind).into_iter().next()
}

/// Every payload type of the first `m=<kind>` section, in m-line order.
/// Payload types without an rtpmap line are skipped.
pub fn offered_codecs(sdp: &str, kind: &str) -> Vec<NegotiatedCodec> {
    let Some(section) = media_section(sdp, kind) else {
        return vec![];
    };

    // m=video 9 UDP/TLS/RTP/SAVPF 96 97 98
    section[0]
        .split_whitespace()
        .skip(3)
        .filter_map(|pt| pt.parse().ok())
        .filter_map(|payload_type| describe(&section, kind, payload_type))
        .collect()
}

fn describe(section: &[&str], kind: &str, payload_type: u8) -> Option<NegotiatedCodec> {
    let rtpmap_prefix = format!("a=rtpmap:{payload_type} ");
    let fmtp_prefix = format!("a=fmtp:{payload_type} ");

    let (encoding, clock) = section
        .iter()
        .find_map(|line| line.strip_prefix(rtpmap_prefix.as_str()))?
        .split_once('/')?;
    let clock_rate = clock.split('/').next()?.parse().ok()?;

    let sdp_fmtp_line = section
        .iter()
        .find_map(|line| line.strip_prefix(fmtp_prefix.as_str()))
        .map(|fmtp| fmtp.trim().to_string());

    Some(NegotiatedCodec {
        payload_type,
        mime_type: format!("{kind}/{encoding}"),
        clock_rate,
        sdp_fmtp_line,
    })
}

fn media_section<'a>(sdp: &'a str, kind: &str) -> Option<Vec<&'a str>> {
    let m_line = format!("m={kind} ");
    let mut lines = sdp.lines().map(str::trim_end).skip_while(|l| !l.starts_with(&m_line));

    let first = lines.next()?;
    let mut section = vec![first];
    section.extend(lines.take_while(|l| !l.starts_with("m=")));

    Some(section)
}
