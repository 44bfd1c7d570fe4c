//! Media socket protocol types.
//!
//! The provider speaks JSON text frames over a persistent WebSocket: a
//! `connected` event, a `start` event carrying the media-session id, then
//! `media` events with base64 payloads, and finally `stop`.

use serde::{Deserialize, Serialize};

/// An event received from the provider on the media socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundEvent {
    /// Socket-level connection acknowledged; no media session yet.
    Connected,
    /// Media session established.
    Start {
        /// Media-session id required on every outbound frame.
        stream_id: Option<String>,
    },
    /// One frame of call audio.
    Media {
        /// Media-session id (also present before `start` in rare races).
        stream_id: Option<String>,
        media: MediaPayload,
    },
    /// The provider ended the media stream.
    Stop,
}

/// Payload of a `media` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded wire-codec audio.
    pub payload: String,
}

/// An outbound media frame.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    /// Always `"media"`.
    pub event: &'static str,
    /// Media-session id issued by the provider's `start` event.
    pub stream_id: String,
    pub media: MediaPayload,
}

impl OutboundFrame {
    /// Wrap already-encoded wire bytes in a media frame.
    pub fn new(stream_id: &str, wire_bytes: &[u8]) -> Self {
        use base64::Engine as _;
        Self {
            event: "media",
            stream_id: stream_id.to_owned(),
            media: MediaPayload {
                payload: base64::engine::general_purpose::STANDARD.encode(wire_bytes),
            },
        }
    }

    /// Serialize to the JSON text frame sent on the socket.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("frame serialization cannot fail")
    }
}

/// Parse one inbound text frame. Unknown or malformed events yield `None`.
pub fn parse_event(text: &str) -> Option<InboundEvent> {
    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_events() {
        assert!(matches!(
            parse_event(r#"{"event":"connected"}"#),
            Some(InboundEvent::Connected)
        ));
        match parse_event(r#"{"event":"start","stream_id":"ms-1"}"#) {
            Some(InboundEvent::Start { stream_id }) => {
                assert_eq!(stream_id.as_deref(), Some("ms-1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        match parse_event(r#"{"event":"media","stream_id":"ms-1","media":{"payload":"AAAA"}}"#) {
            Some(InboundEvent::Media { media, .. }) => assert_eq!(media.payload, "AAAA"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            parse_event(r#"{"event":"stop"}"#),
            Some(InboundEvent::Stop)
        ));
        assert!(parse_event("not json").is_none());
        assert!(parse_event(r#"{"event":"dtmf"}"#).is_none());
    }

    #[test]
    fn outbound_frame_shape() {
        let frame = OutboundFrame::new("ms-7", &[0xFF, 0xFF]);
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).expect("json");
        assert_eq!(json["event"], "media");
        assert_eq!(json["stream_id"], "ms-7");
        assert_eq!(json["media"]["payload"], "//8=");
    }
}
