//! Video codec capabilities and the user-selected preference
//!
//! The capability catalog plays the role of `RTCRtpSender.getCapabilities`:
//! an ordered list of what the local stack can send. Moving one entry to the
//! front of that list is how a codec preference is expressed.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use str0m::format::{Codec, FormatParams};

use crate::error::NegotiationError;

/// One video codec the local stack can negotiate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecCapability {
    /// e.g. `video/VP9`
    pub mime_type: String,
    pub clock_rate: u32,
    /// e.g. `profile-id=0`
    pub sdp_fmtp_line: Option<String>,
    /// Payload type this catalog assigns to the codec. The retransmission
    /// stream uses the next value.
    pub payload_type: u8,
}

impl CodecCapability {
    fn video(payload_type: u8, name: &str, fmtp: Option<&str>) -> Self {
        Self {
            mime_type: format!("video/{name}"),
            clock_rate: 90_000,
            sdp_fmtp_line: fmtp.map(str::to_string),
            payload_type,
        }
    }

    /// The codec name without the media type prefix, e.g. `VP9`.
    pub fn name(&self) -> &str {
        self.mime_type
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.mime_type)
    }

    pub fn rtx_payload_type(&self) -> u8 {
        self.payload_type + 1
    }

    /// The `str0m` codec this capability maps to, if any.
    pub fn codec(&self) -> Option<Codec> {
        match self.name().to_ascii_uppercase().as_str() {
            "VP8" => Some(Codec::Vp8),
            "VP9" => Some(Codec::Vp9),
            "H264" => Some(Codec::H264),
            _ => None,
        }
    }

    /// Format parameters parsed from the fmtp line.
    pub fn format_params(&self) -> FormatParams {
        let mut params = FormatParams::default();

        let Some(line) = &self.sdp_fmtp_line else {
            return params;
        };

        for (key, value) in line.split(';').filter_map(|kv| kv.trim().split_once('=')) {
            match key {
                "packetization-mode" => params.packetization_mode = value.parse().ok(),
                "profile-level-id" => {
                    params.profile_level_id = u32::from_str_radix(value, 16).ok()
                }
                "level-asymmetry-allowed" => params.level_asymmetry_allowed = Some(value == "1"),
                "profile-id" => params.profile_id = value.parse().ok(),
                _ => {}
            }
        }

        params
    }

    /// The selector value for this codec: `"mimeType sdpFmtpLine"`.
    pub fn selector_value(&self) -> String {
        match &self.sdp_fmtp_line {
            Some(fmtp) => format!("{} {}", self.mime_type, fmtp),
            None => self.mime_type.clone(),
        }
    }

    pub fn matches(&self, preference: &CodecPreference) -> bool {
        self.mime_type.eq_ignore_ascii_case(&preference.mime_type)
            && self.sdp_fmtp_line == preference.sdp_fmtp_line
    }
}

impl fmt::Display for CodecCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.selector_value())
    }
}

/// The video codecs offered by default, in default preference order.
pub fn video_capabilities() -> Vec<CodecCapability> {
    vec![
        CodecCapability::video(96, "VP8", None),
        CodecCapability::video(98, "VP9", Some("profile-id=0")),
        CodecCapability::video(100, "VP9", Some("profile-id=2")),
        CodecCapability::video(
            102,
            "H264",
            Some("level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f"),
        ),
        CodecCapability::video(
            104,
            "H264",
            Some("level-asymmetry-allowed=1;packetization-mode=0;profile-level-id=42001f"),
        ),
        CodecCapability::video(
            106,
            "H264",
            Some("level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"),
        ),
        CodecCapability::video(
            108,
            "H264",
            Some("level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=4d001f"),
        ),
    ]
}

/// A codec chosen in the selector, encoded as `"mimeType sdpFmtpLine"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecPreference {
    pub mime_type: String,
    pub sdp_fmtp_line: Option<String>,
}

impl CodecPreference {
    /// Parses a selector value. An empty value means "no preference".
    pub fn parse_selector(value: &str) -> Result<Option<Self>, NegotiationError> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(None);
        }
        value.parse().map(Some)
    }
}

impl FromStr for CodecPreference {
    type Err = NegotiationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (mime_type, fmtp) = match s.split_once(' ') {
            Some((mime, fmtp)) => (mime, Some(fmtp.trim())),
            None => (s, None),
        };

        if !mime_type.contains('/') {
            return Err(NegotiationError::CodecNotFound(s.to_string()));
        }

        Ok(Self {
            mime_type: mime_type.to_string(),
            sdp_fmtp_line: fmtp.filter(|f| !f.is_empty()).map(str::to_string),
        })
    }
}

impl fmt::Display for CodecPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sdp_fmtp_line {
            Some(fmtp) => write!(f, "{} {}", self.mime_type, fmtp),
            None => write!(f, "{}", self.mime_type),
        }
    }
}

/// Moves the single capability matching `preference` to the front of the
/// list, keeping the relative order of every other entry.
pub fn prefer_codec(
    capabilities: &[CodecCapability],
    preference: &CodecPreference,
) -> Result<Vec<CodecCapability>, NegotiationError> {
    let index = capabilities
        .iter()
        .position(|c| c.matches(preference))
        .ok_or_else(|| NegotiationError::CodecNotFound(preference.to_string()))?;

    let mut codecs = capabilities.to_vec();
    let selected = codecs.remove(index);
    codecs.insert(0, selected);

    Ok(codecs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_selector_value() {
        let pref: CodecPreference = "video/H264 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .parse()
            .unwrap();
        assert_eq!(pref.mime_type, "video/H264");
        assert_eq!(
            pref.sdp_fmtp_line.as_deref(),
            Some("level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f")
        );

        let pref: CodecPreference = "video/VP8".parse().unwrap();
        assert_eq!(pref.sdp_fmtp_line, None);

        assert_eq!(CodecPreference::parse_selector("").unwrap(), None);
        assert!("VP8".parse::<CodecPreference>().is_err());
    }

    #[test]
    fn preferred_codec_moves_to_front() {
        let caps = video_capabilities();
        let pref: CodecPreference = "video/VP9 profile-id=2".parse().unwrap();

        let reordered = prefer_codec(&caps, &pref).unwrap();

        assert!(reordered[0].matches(&pref));
        assert_eq!(reordered.len(), caps.len());
        for cap in &caps {
            assert_eq!(reordered.iter().filter(|c| *c == cap).count(), 1);
        }
        // Everything else keeps its relative order.
        let rest: Vec<_> = caps.iter().filter(|c| !c.matches(&pref)).collect();
        let reordered_rest: Vec<_> = reordered[1..].iter().collect();
        assert_eq!(rest, reordered_rest);
    }

    #[test]
    fn fmtp_line_must_match_exactly() {
        let caps = video_capabilities();
        let pref: CodecPreference = "video/VP9 profile-id=3".parse().unwrap();

        assert!(matches!(
            prefer_codec(&caps, &pref),
            Err(NegotiationError::CodecNotFound(_))
        ));
    }

    #[test]
    fn selector_values_round_trip_through_preferences() {
        for cap in video_capabilities() {
            let pref: CodecPreference = cap.selector_value().parse().unwrap();
            assert!(cap.matches(&pref), "{cap}");
        }
    }

    #[test]
    fn h264_fmtp_maps_to_format_params() {
        let caps = video_capabilities();
        let params = caps[5].format_params();

        assert_eq!(params.packetization_mode, Some(1));
        assert_eq!(params.profile_level_id, Some(0x42e01f));
        assert_eq!(params.level_asymmetry_allowed, Some(true));
        assert_eq!(caps[5].codec(), Some(Codec::H264));
    }
}
