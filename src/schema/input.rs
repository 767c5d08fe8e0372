//! examguard.input.v1 schema definition
//!
//! One record per observable input of a session, in arrival order:
//! - host events (visibility, fullscreen, clipboard, context menu, focus)
//! - vision frames
//! - fullscreen probe results
//! - candidate commands (submit, advance to the next section)

use crate::adapters::HostEventKind;
use crate::types::VisionFrame;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Current schema version
pub const SCHEMA_VERSION: &str = "examguard.input.v1";

/// Type of record contained in the input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    /// Window-level host event
    Host,
    /// Vision inference result
    Frame,
    /// Periodic fullscreen check
    FullscreenProbe,
    /// Candidate action
    Command,
}

/// Vision inference result; the capture time is the record timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePayload {
    pub face_count: u32,
    /// Similarity to the reference image (0.0 - 1.0)
    pub identity_score: f64,
    /// Gaze deviation magnitude (>= 0)
    pub gaze_deviation: f64,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub detected_objects: BTreeSet<String>,
}

impl FramePayload {
    pub fn to_frame(&self, captured_at: DateTime<Utc>) -> VisionFrame {
        VisionFrame {
            face_count: self.face_count,
            identity_score: self.identity_score,
            gaze_deviation: self.gaze_deviation,
            detected_objects: self.detected_objects.clone(),
            captured_at,
        }
    }
}

/// Fullscreen probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbePayload {
    pub active: bool,
}

/// Candidate commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Submit,
    Advance,
}

/// Record payload - one of the four record types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Host { host: HostEventKind },
    Frame { frame: FramePayload },
    FullscreenProbe { fullscreen_probe: ProbePayload },
    Command { command: Command },
}

impl Payload {
    fn type_name(&self) -> &'static str {
        match self {
            Payload::Host { .. } => "host",
            Payload::Frame { .. } => "frame",
            Payload::FullscreenProbe { .. } => "fullscreen_probe",
            Payload::Command { .. } => "command",
        }
    }
}

/// The main examguard.input.v1 record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    /// Schema version identifier
    pub schema_version: String,
    /// Optional record identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    /// When the input was observed (UTC)
    pub timestamp: DateTime<Utc>,
    pub record_type: RecordType,
    pub payload: Payload,
}

impl InputRecord {
    fn build(timestamp: DateTime<Utc>, record_type: RecordType, payload: Payload) -> Self {
        InputRecord {
            schema_version: SCHEMA_VERSION.to_string(),
            record_id: Some(uuid::Uuid::new_v4().to_string()),
            timestamp,
            record_type,
            payload,
        }
    }

    pub fn host(timestamp: DateTime<Utc>, host: HostEventKind) -> Self {
        Self::build(timestamp, RecordType::Host, Payload::Host { host })
    }

    pub fn frame(timestamp: DateTime<Utc>, frame: FramePayload) -> Self {
        Self::build(timestamp, RecordType::Frame, Payload::Frame { frame })
    }

    pub fn fullscreen_probe(timestamp: DateTime<Utc>, active: bool) -> Self {
        Self::build(
            timestamp,
            RecordType::FullscreenProbe,
            Payload::FullscreenProbe {
                fullscreen_probe: ProbePayload { active },
            },
        )
    }

    pub fn command(timestamp: DateTime<Utc>, command: Command) -> Self {
        Self::build(timestamp, RecordType::Command, Payload::Command { command })
    }

    /// Validate the record
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(ValidationError::InvalidSchemaVersion {
                expected: SCHEMA_VERSION.to_string(),
                actual: self.schema_version.clone(),
            });
        }

        match (&self.record_type, &self.payload) {
            (RecordType::Host, Payload::Host { .. })
            | (RecordType::FullscreenProbe, Payload::FullscreenProbe { .. })
            | (RecordType::Command, Payload::Command { .. }) => Ok(()),
            (RecordType::Frame, Payload::Frame { frame }) => validate_frame(frame),
            _ => Err(ValidationError::PayloadTypeMismatch {
                record_type: format!("{:?}", self.record_type),
                payload_type: self.payload.type_name().to_string(),
            }),
        }
    }
}

fn validate_frame(frame: &FramePayload) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&frame.identity_score) {
        return Err(ValidationError::OutOfRange {
            field: "identity_score",
            value: frame.identity_score,
        });
    }
    if frame.gaze_deviation.is_nan() || frame.gaze_deviation < 0.0 {
        return Err(ValidationError::OutOfRange {
            field: "gaze_deviation",
            value: frame.gaze_deviation,
        });
    }
    Ok(())
}

/// Validation errors for input records
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid schema version: expected {expected}, got {actual}")]
    InvalidSchemaVersion { expected: String, actual: String },

    #[error("Payload type mismatch: record_type is {record_type} but payload is {payload_type}")]
    PayloadTypeMismatch { record_type: String, payload_type: String },

    #[error("Field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("Timestamp {actual} is earlier than the previous record ({previous})")]
    OutOfOrder {
        previous: DateTime<Utc>,
        actual: DateTime<Utc>,
    },
}
