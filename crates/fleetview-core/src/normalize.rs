//! Turns untyped transport payloads into the closed set of [`FleetEvent`]s.
//!
//! Everything here is a pure transform: no state, no logging, no clock reads.
//! The arrival time travels in with the [`RawEvent`] so the result is a function
//! of its input alone.

use crate::model::{BoundingBox, Detection, DetectionRecord};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

pub const CAMERA_LIST: &str = "camera:list";
pub const CAMERA_CONNECTED: &str = "camera:connected";
pub const CAMERA_DISCONNECT: &str = "camera:disconnect";
pub const DEPLOY_SUCCESS: &str = "deploy:success";
pub const DEPLOY_FAILED: &str = "deploy:failed";
pub const DETECTION_RESULT: &str = "detection:result";

/// Every kind the synchronizer consumes from the fleet server.
pub const FLEET_EVENT_KINDS: [&str; 6] = [
    CAMERA_LIST,
    CAMERA_CONNECTED,
    CAMERA_DISCONNECT,
    DEPLOY_SUCCESS,
    DEPLOY_FAILED,
    DETECTION_RESULT,
];

const UNKNOWN_LABEL: &str = "Unknown";
const EPOCH_SECONDS_FLOOR: f64 = 1.0e9;

#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub kind: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub agent_id: String,
    pub display_name: String,
    pub operator_label: String,
    pub deployed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    AgentJoined {
        agent_id: String,
        display_name: String,
        operator_label: String,
    },
    AgentLeft {
        agent_id: String,
    },
    DeployAck {
        agent_id: String,
    },
    DeployRejected {
        agent_id: Option<String>,
        reason: String,
    },
    DetectionReported(DetectionRecord),
    RosterSynced {
        agents: Vec<RosterEntry>,
    },
}

impl FleetEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FleetEvent::AgentJoined { .. } => "agent_joined",
            FleetEvent::AgentLeft { .. } => "agent_left",
            FleetEvent::DeployAck { .. } => "deploy_ack",
            FleetEvent::DeployRejected { .. } => "deploy_rejected",
            FleetEvent::DetectionReported(_) => "detection_reported",
            FleetEvent::RosterSynced { .. } => "roster_synced",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("unknown event kind '{0}'")]
    UnknownKind(String),
    #[error("{kind}: payload must be a JSON object")]
    PayloadNotObject { kind: &'static str },
    #[error("{kind}: missing required field '{field}'")]
    MissingField { kind: &'static str, field: String },
    #[error("{kind}: invalid field '{field}': {reason}")]
    InvalidField {
        kind: &'static str,
        field: String,
        reason: String,
    },
}

impl NormalizationError {
    /// The offending field, when the error is about one.
    pub fn field(&self) -> Option<&str> {
        match self {
            NormalizationError::MissingField { field, .. }
            | NormalizationError::InvalidField { field, .. } => Some(field),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            NormalizationError::UnknownKind(_) => "unknown_kind",
            NormalizationError::PayloadNotObject { .. } => "payload_not_object",
            NormalizationError::MissingField { .. } => "missing_field",
            NormalizationError::InvalidField { .. } => "invalid_field",
        }
    }
}

pub fn normalize(raw: &RawEvent) -> Result<FleetEvent, NormalizationError> {
    match raw.kind.trim() {
        CAMERA_CONNECTED => parse_joined(&raw.payload),
        CAMERA_DISCONNECT => {
            let payload = object(CAMERA_DISCONNECT, &raw.payload)?;
            Ok(FleetEvent::AgentLeft {
                agent_id: required_str(CAMERA_DISCONNECT, payload, "sid")?,
            })
        }
        DEPLOY_SUCCESS => {
            let payload = object(DEPLOY_SUCCESS, &raw.payload)?;
            Ok(FleetEvent::DeployAck {
                agent_id: required_str(DEPLOY_SUCCESS, payload, "camera_sid")?,
            })
        }
        DEPLOY_FAILED => {
            let payload = object(DEPLOY_FAILED, &raw.payload)?;
            Ok(FleetEvent::DeployRejected {
                agent_id: optional_str(DEPLOY_FAILED, payload, "camera_sid")?,
                reason: optional_str(DEPLOY_FAILED, payload, "error")?
                    .unwrap_or_else(|| "deploy rejected".to_string()),
            })
        }
        DETECTION_RESULT => parse_detection(&raw.payload, raw.received_at),
        CAMERA_LIST => parse_roster(&raw.payload),
        other => Err(NormalizationError::UnknownKind(other.to_string())),
    }
}

fn parse_joined(value: &Value) -> Result<FleetEvent, NormalizationError> {
    let payload = object(CAMERA_CONNECTED, value)?;
    let agent_id = required_str(CAMERA_CONNECTED, payload, "sid")?;
    let camera_id = optional_str(CAMERA_CONNECTED, payload, "camera_id")?;
    let username = optional_str(CAMERA_CONNECTED, payload, "username")?;
    let display_name = camera_id
        .or_else(|| username.clone())
        .ok_or_else(|| missing(CAMERA_CONNECTED, "camera_id"))?;
    Ok(FleetEvent::AgentJoined {
        operator_label: username.unwrap_or_else(|| display_name.clone()),
        agent_id,
        display_name,
    })
}

fn parse_roster(value: &Value) -> Result<FleetEvent, NormalizationError> {
    let payload = object(CAMERA_LIST, value)?;
    let cameras = match payload.get("cameras") {
        None | Some(Value::Null) => return Err(missing(CAMERA_LIST, "cameras")),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(invalid(CAMERA_LIST, "cameras", "expected an array")),
    };

    let mut seen = HashSet::new();
    let mut agents = Vec::with_capacity(cameras.len());
    for (idx, camera) in cameras.iter().enumerate() {
        let field = |name: &str| format!("cameras[{idx}].{name}");
        let Value::Object(entry) = camera else {
            return Err(invalid(CAMERA_LIST, &format!("cameras[{idx}]"), "expected an object"));
        };
        let agent_id = match entry.get("sid") {
            Some(Value::String(sid)) if !sid.trim().is_empty() => sid.trim().to_string(),
            None | Some(Value::Null) => return Err(missing(CAMERA_LIST, &field("sid"))),
            Some(_) => return Err(invalid(CAMERA_LIST, &field("sid"), "expected a non-empty string")),
        };
        let camera_id = entry
            .get("camera_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let username = entry
            .get("username")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let deployed = match entry.get("deployed") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => *flag,
            Some(_) => return Err(invalid(CAMERA_LIST, &field("deployed"), "expected a boolean")),
        };
        if !seen.insert(agent_id.clone()) {
            continue;
        }
        let display_name = camera_id.or(username).unwrap_or(agent_id.as_str()).to_string();
        agents.push(RosterEntry {
            operator_label: username.unwrap_or(display_name.as_str()).to_string(),
            display_name,
            agent_id,
            deployed,
        });
    }
    Ok(FleetEvent::RosterSynced { agents })
}

fn parse_detection(
    value: &Value,
    received_at: DateTime<Utc>,
) -> Result<FleetEvent, NormalizationError> {
    let payload = object(DETECTION_RESULT, value)?;
    let agent_id = required_str(DETECTION_RESULT, payload, "camera_sid")?;
    let camera_label = optional_str(DETECTION_RESULT, payload, "camera_id")?;
    let frame = match payload.get("frame") {
        None | Some(Value::Null) => None,
        Some(Value::String(blob)) if blob.is_empty() => None,
        Some(Value::String(blob)) => Some(blob.clone()),
        Some(_) => return Err(invalid(DETECTION_RESULT, "frame", "expected an encoded string")),
    };
    let (detection_count, detections) = parse_detection_set(payload.get("detections"))?;

    Ok(FleetEvent::DetectionReported(DetectionRecord {
        agent_id,
        camera_label,
        frame,
        detection_count,
        detections,
        captured_at: captured_at(payload.get("timestamp"), received_at),
        received_at,
    }))
}

fn parse_detection_set(value: Option<&Value>) -> Result<(u64, Vec<Detection>), NormalizationError> {
    let set = match value {
        None | Some(Value::Null) => return Err(missing(DETECTION_RESULT, "detections")),
        Some(Value::Object(set)) => set,
        Some(_) => return Err(invalid(DETECTION_RESULT, "detections", "expected an object")),
    };

    let detections = if let Some(items) = set.get("items") {
        parse_items(items)?
    } else if let Some(boxes) = set.get("boxes") {
        parse_parallel_arrays(boxes, set.get("labels"), set.get("confidences"))?
    } else {
        Vec::new()
    };

    let count = match set.get("count") {
        None | Some(Value::Null) => detections.len() as u64,
        Some(value) => value.as_u64().ok_or_else(|| {
            invalid(
                DETECTION_RESULT,
                "detections.count",
                "expected a non-negative integer",
            )
        })?,
    };
    Ok((count, detections))
}

fn parse_items(items: &Value) -> Result<Vec<Detection>, NormalizationError> {
    let Value::Array(items) = items else {
        return Err(invalid(DETECTION_RESULT, "detections.items", "expected an array"));
    };
    let mut detections = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let prefix = format!("detections.items[{idx}]");
        let Value::Object(item) = item else {
            return Err(invalid(DETECTION_RESULT, &prefix, "expected an object"));
        };
        let label = match item.get("label") {
            None | Some(Value::Null) => UNKNOWN_LABEL.to_string(),
            Some(Value::String(label)) => label.clone(),
            Some(_) => {
                return Err(invalid(DETECTION_RESULT, &format!("{prefix}.label"), "expected a string"))
            }
        };
        let confidence = parse_confidence(item.get("confidence"), &format!("{prefix}.confidence"))?;
        let bounding_box = item
            .get("box")
            .or_else(|| item.get("bbox"))
            .or_else(|| item.get("bounding_box"))
            .ok_or_else(|| missing(DETECTION_RESULT, &format!("{prefix}.box")))?;
        detections.push(Detection {
            label,
            confidence,
            bounding_box: parse_box(bounding_box, &format!("{prefix}.box"))?,
        });
    }
    Ok(detections)
}

fn parse_parallel_arrays(
    boxes: &Value,
    labels: Option<&Value>,
    confidences: Option<&Value>,
) -> Result<Vec<Detection>, NormalizationError> {
    let Value::Array(boxes) = boxes else {
        return Err(invalid(DETECTION_RESULT, "detections.boxes", "expected an array"));
    };
    let labels = optional_array(labels, "detections.labels")?;
    let confidences = optional_array(confidences, "detections.confidences")?;

    let mut detections = Vec::with_capacity(boxes.len());
    for (idx, raw_box) in boxes.iter().enumerate() {
        let label = labels
            .get(idx)
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_LABEL)
            .to_string();
        let confidence = parse_confidence(
            confidences.get(idx),
            &format!("detections.confidences[{idx}]"),
        )?;
        detections.push(Detection {
            label,
            confidence,
            bounding_box: parse_box(raw_box, &format!("detections.boxes[{idx}]"))?,
        });
    }
    Ok(detections)
}

fn optional_array<'a>(
    value: Option<&'a Value>,
    field: &str,
) -> Result<&'a [Value], NormalizationError> {
    match value {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(invalid(DETECTION_RESULT, field, "expected an array")),
    }
}

fn parse_confidence(value: Option<&Value>, field: &str) -> Result<f64, NormalizationError> {
    let Some(value) = value.filter(|value| !value.is_null()) else {
        return Ok(0.0);
    };
    match value.as_f64() {
        Some(confidence) if confidence.is_finite() && (0.0..=1.0).contains(&confidence) => {
            Ok(confidence)
        }
        _ => Err(invalid(DETECTION_RESULT, field, "expected a number between 0 and 1")),
    }
}

fn parse_box(value: &Value, field: &str) -> Result<BoundingBox, NormalizationError> {
    let coords = match value {
        Value::Array(coords) if coords.len() == 4 => {
            let mut parsed = [0i64; 4];
            for (slot, coord) in parsed.iter_mut().zip(coords) {
                *slot = coordinate(coord)
                    .ok_or_else(|| invalid(DETECTION_RESULT, field, "coordinates must be numbers"))?;
            }
            parsed
        }
        Value::Object(map) => {
            let mut parsed = [0i64; 4];
            for (slot, key) in parsed.iter_mut().zip(["x1", "y1", "x2", "y2"]) {
                *slot = map
                    .get(key)
                    .and_then(coordinate)
                    .ok_or_else(|| invalid(DETECTION_RESULT, field, "coordinates must be numbers"))?;
            }
            parsed
        }
        _ => {
            return Err(invalid(
                DETECTION_RESULT,
                field,
                "expected [x1, y1, x2, y2]",
            ))
        }
    };
    Ok(BoundingBox {
        x1: coords[0],
        y1: coords[1],
        x2: coords[2],
        y2: coords[3],
    })
}

fn coordinate(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|coord| coord.is_finite())
            .map(|coord| coord.round() as i64)
    })
}

/// RFC3339 strings and epoch seconds are honored; anything else (the fleet
/// server sends its monotonic loop clock) falls back to the arrival time.
fn captured_at(value: Option<&Value>, received_at: DateTime<Utc>) -> DateTime<Utc> {
    match value {
        Some(Value::String(text)) => DateTime::parse_from_rfc3339(text.trim())
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or(received_at),
        Some(Value::Number(number)) => number
            .as_f64()
            .filter(|secs| secs.is_finite() && *secs >= EPOCH_SECONDS_FLOOR)
            .and_then(|secs| Utc.timestamp_millis_opt((secs * 1000.0) as i64).single())
            .unwrap_or(received_at),
        _ => received_at,
    }
}

fn object<'a>(
    kind: &'static str,
    value: &'a Value,
) -> Result<&'a Map<String, Value>, NormalizationError> {
    value
        .as_object()
        .ok_or(NormalizationError::PayloadNotObject { kind })
}

fn required_str(
    kind: &'static str,
    payload: &Map<String, Value>,
    field: &str,
) -> Result<String, NormalizationError> {
    match payload.get(field) {
        None | Some(Value::Null) => Err(missing(kind, field)),
        Some(Value::String(text)) if text.trim().is_empty() => {
            Err(invalid(kind, field, "must not be empty"))
        }
        Some(Value::String(text)) => Ok(text.trim().to_string()),
        Some(_) => Err(invalid(kind, field, "expected a string")),
    }
}

fn optional_str(
    kind: &'static str,
    payload: &Map<String, Value>,
    field: &str,
) -> Result<Option<String>, NormalizationError> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.trim().to_string())),
        Some(_) => Err(invalid(kind, field, "expected a string")),
    }
}

fn missing(kind: &'static str, field: &str) -> NormalizationError {
    NormalizationError::MissingField {
        kind,
        field: field.to_string(),
    }
}

fn invalid(kind: &'static str, field: &str, reason: &str) -> NormalizationError {
    NormalizationError::InvalidField {
        kind,
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
