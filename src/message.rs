//! Wire message types exchanged over an open [`crate::session::ControlSession`]
//! (spec.md §5). Every message is a canonical-JSON object framed per
//! [`crate::framing`]; WebRTC signaling payloads are relayed opaquely —
//! this crate never parses SDP or ICE candidates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::noise_event::NoiseEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "NOISE_EVENT")]
    NoiseEvent { payload: NoiseEvent },

    #[serde(rename = "START_STREAM_REQUEST")]
    StartStreamRequest { stream_type: String, request_id: String },

    #[serde(rename = "START_STREAM_RESPONSE")]
    StartStreamResponse {
        request_id: String,
        accepted: bool,
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename = "END_STREAM")]
    EndStream { request_id: String },

    #[serde(rename = "PIN_STREAM")]
    PinStream { stream_type: String },

    #[serde(rename = "WEBRTC_OFFER")]
    WebrtcOffer { sdp: Value },

    #[serde(rename = "WEBRTC_ANSWER")]
    WebrtcAnswer { sdp: Value },

    #[serde(rename = "WEBRTC_ICE")]
    WebrtcIce { candidate: Value },

    #[serde(rename = "FCM_TOKEN_UPDATE")]
    FcmTokenUpdate { delivery_token: String, platform_tag: String },

    #[serde(rename = "PING")]
    Ping { nonce: u64 },

    #[serde(rename = "PONG")]
    Pong { nonce: u64 },

    #[serde(rename = "UNSUPPORTED_MESSAGE")]
    UnsupportedMessage { original_type: String },
}

impl ControlMessage {
    /// Messages that must bypass normal queueing and displace lower
    /// priority backlog when the outbound queue is full (spec.md §5.4).
    pub fn is_priority(&self) -> bool {
        matches!(
            self,
            ControlMessage::Pong { .. }
                | ControlMessage::EndStream { .. }
                | ControlMessage::NoiseEvent { .. }
        )
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            ControlMessage::NoiseEvent { .. } => "NOISE_EVENT",
            ControlMessage::StartStreamRequest { .. } => "START_STREAM_REQUEST",
            ControlMessage::StartStreamResponse { .. } => "START_STREAM_RESPONSE",
            ControlMessage::EndStream { .. } => "END_STREAM",
            ControlMessage::PinStream { .. } => "PIN_STREAM",
            ControlMessage::WebrtcOffer { .. } => "WEBRTC_OFFER",
            ControlMessage::WebrtcAnswer { .. } => "WEBRTC_ANSWER",
            ControlMessage::WebrtcIce { .. } => "WEBRTC_ICE",
            ControlMessage::FcmTokenUpdate { .. } => "FCM_TOKEN_UPDATE",
            ControlMessage::Ping { .. } => "PING",
            ControlMessage::Pong { .. } => "PONG",
            ControlMessage::UnsupportedMessage { .. } => "UNSUPPORTED_MESSAGE",
        }
    }

    /// Parse a raw decoded frame, degrading an unrecognized `type` tag to
    /// [`ControlMessage::UnsupportedMessage`] instead of failing the whole
    /// session (spec.md §5.6 forward-compatibility requirement).
    pub fn from_frame(bytes: &[u8]) -> Result<Self, crate::error::CribCallError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| crate::error::CribCallError::ProtocolError(e.to_string()))?;
        match serde_json::from_value::<Self>(value.clone()) {
            Ok(msg) => Ok(msg),
            Err(_) => {
                let original_type = value
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("UNKNOWN")
                    .to_string();
                Ok(ControlMessage::UnsupportedMessage { original_type })
            }
        }
    }
}
