use crate::dispatch::OutboundCommand;
use crate::normalize::RawEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Frames carry full annotated video stills, so the cap is far above a control message.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 5 * 1024 * 1024;

/// One message on the fleet server link: an event kind plus its payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn into_raw(self, received_at: DateTime<Utc>) -> RawEvent {
        RawEvent {
            kind: self.event,
            payload: self.data,
            received_at,
        }
    }
}

impl From<&OutboundCommand> for EventFrame {
    fn from(command: &OutboundCommand) -> Self {
        EventFrame::new(
            command.kind(),
            serde_json::json!({ "camera_sid": command.agent_id() }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame(frame: &EventFrame, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(frame).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame(raw: &str, max_frame_bytes: usize) -> Result<EventFrame, FrameError> {
    let raw = raw.trim_end_matches(&['\n', '\r'][..]);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    let frame: EventFrame =
        serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))?;
    if frame.event.trim().is_empty() {
        return Err(FrameError::Decode("missing event name".to_string()));
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_connected_frame() {
        let frame = decode_frame(
            r#"{"event":"camera:connected","data":{"sid":"s1","username":"op","camera_id":"gate"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        assert_eq!(frame.event, "camera:connected");
        assert_eq!(frame.data["camera_id"], "gate");
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let frame = decode_frame(r#"{"event":"camera:list"}"#, DEFAULT_MAX_FRAME_BYTES)
            .expect("decode");
        assert!(frame.data.is_null());
    }

    #[test]
    fn rejects_blank_event_and_garbage() {
        assert!(matches!(
            decode_frame(r#"{"event":"  ","data":{}}"#, DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
        assert!(matches!(
            decode_frame("{not json", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
    }

    #[test]
    fn enforces_size_limit_both_ways() {
        let frame = EventFrame::new("detection:result", serde_json::json!({"frame": "x".repeat(256)}));
        assert!(matches!(
            encode_frame(&frame, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
        let encoded = encode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert!(matches!(
            decode_frame(&encoded, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn outbound_command_uses_camera_sid_payload() {
        let frame = EventFrame::from(&OutboundCommand::DeployStop {
            agent_id: "sid-7".to_string(),
        });
        assert_eq!(frame.event, "deploy_stop");
        assert_eq!(frame.data, serde_json::json!({"camera_sid": "sid-7"}));
    }
}
