//! Codec configuration and router capability filtering.
//!
//! The media engine router is configured once with a fixed codec set: one
//! audio codec and one video codec. Capabilities handed to clients are the
//! router's capabilities narrowed to that set, plus retransmission entries
//! whose `apt` parameter references a kept payload type.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Audio codec the router is configured with.
pub const AUDIO_MIME_TYPE: &str = "audio/opus";
pub const AUDIO_CLOCK_RATE: u32 = 48_000;
pub const AUDIO_CHANNELS: u8 = 2;

/// Video codec the router is configured with.
pub const VIDEO_MIME_TYPE: &str = "video/VP8";
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// A codec entry in the router configuration or in router capabilities.
///
/// Unknown fields (`rtcpFeedback` and friends) pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCodec {
    pub kind: String,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MediaCodec {
    /// Retransmission codec (`audio/rtx`, `video/rtx`).
    pub fn is_rtx(&self) -> bool {
        self.mime_type
            .rsplit('/')
            .next()
            .is_some_and(|subtype| subtype.eq_ignore_ascii_case("rtx"))
    }

    /// Payload type this rtx entry retransmits for.
    pub fn apt(&self) -> Option<u64> {
        self.parameters.get("apt").and_then(Value::as_u64)
    }

    fn matches(&self, configured: &MediaCodec) -> bool {
        self.mime_type.eq_ignore_ascii_case(&configured.mime_type)
            && self.clock_rate == configured.clock_rate
            && (configured.channels.is_none() || self.channels == configured.channels)
    }
}

/// Router RTP capabilities as reported by the media engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<MediaCodec>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

/// The fixed codec set, with the video start bitrate hint applied.
pub fn configured_codecs(video_start_bitrate_kbps: u32) -> Vec<MediaCodec> {
    let mut video_parameters = Map::new();
    video_parameters.insert(
        "x-google-start-bitrate".to_string(),
        Value::from(video_start_bitrate_kbps),
    );

    vec![
        MediaCodec {
            kind: "audio".to_string(),
            mime_type: AUDIO_MIME_TYPE.to_string(),
            clock_rate: AUDIO_CLOCK_RATE,
            channels: Some(AUDIO_CHANNELS),
            preferred_payload_type: None,
            parameters: Map::new(),
            extra: Map::new(),
        },
        MediaCodec {
            kind: "video".to_string(),
            mime_type: VIDEO_MIME_TYPE.to_string(),
            clock_rate: VIDEO_CLOCK_RATE,
            channels: None,
            preferred_payload_type: None,
            parameters: video_parameters,
            extra: Map::new(),
        },
    ]
}

/// Narrow router capabilities to the configured codecs.
pub fn filter_capabilities(
    router: &RtpCapabilities,
    configured: &[MediaCodec],
) -> RtpCapabilities {
    let kept: Vec<&MediaCodec> = router
        .codecs
        .iter()
        .filter(|codec| !codec.is_rtx() && configured.iter().any(|c| codec.matches(c)))
        .collect();

    let kept_payload_types: HashSet<u64> = kept
        .iter()
        .filter_map(|codec| codec.preferred_payload_type.map(u64::from))
        .collect();

    let rtx = router.codecs.iter().filter(|codec| {
        codec.is_rtx()
            && codec
                .apt()
                .is_some_and(|apt| kept_payload_types.contains(&apt))
    });

    RtpCapabilities {
        codecs: kept.into_iter().chain(rtx).cloned().collect(),
        header_extensions: router.header_extensions.clone(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router_capabilities() -> RtpCapabilities {
        serde_json::from_value(json!({
            "codecs": [
                {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2, "preferredPayloadType": 100},
                {"kind": "audio", "mimeType": "audio/PCMU", "clockRate": 8000, "preferredPayloadType": 0},
                {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000, "preferredPayloadType": 101,
                 "rtcpFeedback": [{"type": "nack"}]},
                {"kind": "video", "mimeType": "video/rtx", "clockRate": 90000, "preferredPayloadType": 102,
                 "parameters": {"apt": 101}},
                {"kind": "video", "mimeType": "video/H264", "clockRate": 90000, "preferredPayloadType": 103},
                {"kind": "video", "mimeType": "video/rtx", "clockRate": 90000, "preferredPayloadType": 104,
                 "parameters": {"apt": 103}}
            ],
            "headerExtensions": [{"uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "preferredId": 1}]
        }))
        .unwrap()
    }

    #[test]
    fn test_configured_codecs_carry_bitrate_hint() {
        let codecs = configured_codecs(1500);
        assert_eq!(codecs.len(), 2);

        let video = codecs.iter().find(|c| c.kind == "video").unwrap();
        assert_eq!(video.mime_type, VIDEO_MIME_TYPE);
        assert_eq!(
            video.parameters.get("x-google-start-bitrate"),
            Some(&json!(1500))
        );

        let serialized = serde_json::to_value(&codecs).unwrap();
        assert_eq!(serialized[0]["mimeType"], "audio/opus");
        assert_eq!(serialized[0]["channels"], 2);
    }

    #[test]
    fn test_filter_keeps_configured_codecs_and_their_rtx() {
        let filtered = filter_capabilities(&router_capabilities(), &configured_codecs(1000));

        let mimes: Vec<&str> = filtered.codecs.iter().map(|c| c.mime_type.as_str()).collect();
        assert_eq!(mimes, vec!["audio/opus", "video/VP8", "video/rtx"]);

        let rtx = filtered.codecs.iter().find(|c| c.is_rtx()).unwrap();
        assert_eq!(rtx.apt(), Some(101), "Only the rtx for the kept VP8 survives");
    }

    #[test]
    fn test_filter_passes_through_extensions_and_extra_fields() {
        let filtered = filter_capabilities(&router_capabilities(), &configured_codecs(1000));

        assert_eq!(filtered.header_extensions.len(), 1);
        let vp8 = filtered
            .codecs
            .iter()
            .find(|c| c.mime_type == "video/VP8")
            .unwrap();
        assert!(vp8.extra.contains_key("rtcpFeedback"));
    }

    #[test]
    fn test_filter_is_case_insensitive_on_mime_type() {
        let mut router = router_capabilities();
        for codec in &mut router.codecs {
            codec.mime_type = codec.mime_type.to_lowercase();
        }

        let filtered = filter_capabilities(&router, &configured_codecs(1000));
        assert!(filtered.codecs.iter().any(|c| c.mime_type == "video/vp8"));
    }
}
