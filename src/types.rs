//! Core types for the Examguard integrity engine
//!
//! This module defines the data structures that flow between components:
//! raw host signals, vision frames, classified violations, section timer
//! state and the session state owned by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Kind of raw host signal produced by an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    VisibilityLost,
    FullscreenExit,
    Clipboard,
    RightClick,
    WindowBlur,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::VisibilityLost => "visibility_lost",
            SignalKind::FullscreenExit => "fullscreen_exit",
            SignalKind::Clipboard => "clipboard",
            SignalKind::RightClick => "right_click",
            SignalKind::WindowBlur => "window_blur",
        }
    }
}

/// Uniform signal emitted by every adapter. Never persisted directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSignal {
    /// What happened
    pub kind: SignalKind,
    /// When the host observed it (UTC)
    pub occurred_at: DateTime<Utc>,
}

impl RawSignal {
    pub fn new(kind: SignalKind, occurred_at: DateTime<Utc>) -> Self {
        Self { kind, occurred_at }
    }
}

/// One inference result from the vision provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionFrame {
    /// Number of faces in view
    pub face_count: u32,
    /// Similarity to the reference image (0-1)
    pub identity_score: f64,
    /// Magnitude of gaze deviation from the screen (>= 0)
    pub gaze_deviation: f64,
    /// Object labels detected in the frame
    #[serde(default)]
    pub detected_objects: BTreeSet<String>,
    /// When the frame was captured (UTC)
    pub captured_at: DateTime<Utc>,
}

impl VisionFrame {
    /// Clamp scores into their documented ranges.
    ///
    /// NaN identity scores become 0 and NaN gaze deviations become 0.
    pub fn sanitized(mut self) -> Self {
        self.identity_score = if self.identity_score.is_nan() {
            0.0
        } else {
            self.identity_score.clamp(0.0, 1.0)
        };
        self.gaze_deviation = if self.gaze_deviation.is_nan() {
            0.0
        } else {
            self.gaze_deviation.max(0.0)
        };
        self
    }
}

/// Classified violation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    TabSwitch,
    FullscreenExit,
    CopyPaste,
    RightClick,
    WindowBlur,
    NoFace,
    MultipleFaces,
    IdentityMismatch,
    GazeAway,
    ProhibitedObject,
}

impl ViolationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationType::TabSwitch => "tab_switch",
            ViolationType::FullscreenExit => "fullscreen_exit",
            ViolationType::CopyPaste => "copy_paste",
            ViolationType::RightClick => "right_click",
            ViolationType::WindowBlur => "window_blur",
            ViolationType::NoFace => "no_face",
            ViolationType::MultipleFaces => "multiple_faces",
            ViolationType::IdentityMismatch => "identity_mismatch",
            ViolationType::GazeAway => "gaze_away",
            ViolationType::ProhibitedObject => "prohibited_object",
        }
    }

    /// Whether the type originates from vision inference rather than host events
    pub fn is_vision(&self) -> bool {
        matches!(
            self,
            ViolationType::NoFace
                | ViolationType::MultipleFaces
                | ViolationType::IdentityMismatch
                | ViolationType::GazeAway
                | ViolationType::ProhibitedObject
        )
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified, rate-limited record of a suspected integrity breach.
///
/// Immutable once created; `severity_count` is the running count of `kind`
/// within the session, including this violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ViolationType,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub severity_count: u32,
}

impl Violation {
    /// Detail payload sent to the persistence endpoint
    pub fn detail(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id.to_string(),
            "message": self.message,
            "occurred_at": self.occurred_at.to_rfc3339(),
            "severity_count": self.severity_count,
        })
    }
}

/// Section timer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Idle,
    Running,
    Expired,
    Completed,
}

impl TimerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TimerStatus::Expired | TimerStatus::Completed)
    }
}

/// Countdown state for the active section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionTimerState {
    pub section_id: String,
    /// Seconds left; never exceeds `time_limit_seconds`
    pub time_remaining_seconds: u32,
    /// Section limit in seconds (> 0)
    pub time_limit_seconds: u32,
    /// Server-confirmed start time, if known
    pub started_at: Option<DateTime<Utc>>,
    pub status: TimerStatus,
    /// Server syncs are failing; the local deadline keeps counting
    #[serde(default)]
    pub sync_pending: bool,
}

/// What the UI should show for a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "seconds")]
pub enum TimerDisplay {
    Remaining(u32),
    SyncPending,
}

impl SectionTimerState {
    /// Idle or unsynced timers show "sync pending" rather than a possibly
    /// fabricated value.
    pub fn display(&self) -> TimerDisplay {
        match self.status {
            TimerStatus::Idle => TimerDisplay::SyncPending,
            TimerStatus::Running if self.sync_pending => TimerDisplay::SyncPending,
            _ => TimerDisplay::Remaining(self.time_remaining_seconds),
        }
    }
}

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Setup,
    InProgress,
    Submitted,
    Terminated,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Setup => "setup",
            SessionPhase::InProgress => "in_progress",
            SessionPhase::Submitted => "submitted",
            SessionPhase::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Submitted | SessionPhase::Terminated)
    }
}

/// Why a session ended; the code is consumed by the routing layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    TabSwitchLimitExceeded,
    TimeExpired,
    Submitted,
}

impl TerminationReason {
    pub fn as_code(&self) -> &'static str {
        match self {
            TerminationReason::TabSwitchLimitExceeded => "tab_switch_limit_exceeded",
            TerminationReason::TimeExpired => "time_expired",
            TerminationReason::Submitted => "submitted",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// State owned by the session orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub violation_total: u32,
    pub termination_reason: Option<TerminationReason>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Setup,
            violation_total: 0,
            termination_reason: None,
        }
    }
}

/// Persisted result of a finished session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub phase: SessionPhase,
    pub reason: TerminationReason,
    pub violation_total: u32,
    pub ended_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_frame_sanitized_clamps_scores() {
        let frame = VisionFrame {
            face_count: 1,
            identity_score: 1.4,
            gaze_deviation: -0.2,
            detected_objects: BTreeSet::new(),
            captured_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        }
        .sanitized();

        assert_eq!(frame.identity_score, 1.0);
        assert_eq!(frame.gaze_deviation, 0.0);

        let nan = VisionFrame {
            identity_score: f64::NAN,
            gaze_deviation: f64::NAN,
            ..frame
        }
        .sanitized();
        assert_eq!(nan.identity_score, 0.0);
        assert_eq!(nan.gaze_deviation, 0.0);
    }

    #[test]
    fn test_idle_timer_displays_sync_pending() {
        let mut state = SectionTimerState {
            section_id: "s1".to_string(),
            time_remaining_seconds: 120,
            time_limit_seconds: 600,
            started_at: None,
            status: TimerStatus::Idle,
            sync_pending: false,
        };
        assert_eq!(state.display(), TimerDisplay::SyncPending);

        state.status = TimerStatus::Running;
        assert_eq!(state.display(), TimerDisplay::Remaining(120));

        state.sync_pending = true;
        assert_eq!(state.display(), TimerDisplay::SyncPending);

        state.status = TimerStatus::Expired;
        assert_eq!(state.display(), TimerDisplay::Remaining(120));
    }

    #[test]
    fn test_violation_serializes_type_field() {
        let violation = Violation {
            id: Uuid::nil(),
            kind: ViolationType::GazeAway,
            message: "Looking away from the screen".to_string(),
            occurred_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
            severity_count: 2,
        };

        let json = serde_json::to_value(&violation).unwrap();
        assert_eq!(json["type"], "gaze_away");
        assert_eq!(violation.detail()["severity_count"], 2);
    }

    #[test]
    fn test_termination_codes() {
        assert_eq!(
            TerminationReason::TabSwitchLimitExceeded.as_code(),
            "tab_switch_limit_exceeded"
        );
        assert!(SessionPhase::Terminated.is_terminal());
        assert!(!SessionPhase::InProgress.is_terminal());
        assert!(ViolationType::NoFace.is_vision());
        assert!(!ViolationType::TabSwitch.is_vision());
    }
}
