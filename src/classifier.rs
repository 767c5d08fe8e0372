//! Violation classification and debouncing
//!
//! Raw host signals and vision frames are mapped to [`Violation`]s under the
//! configured policy. A per-type cool-down bounds the emission rate no matter
//! how fast raw input arrives: a candidate of type `T` is dropped while
//! `now - last_emitted_at[T] < cool_down`, otherwise it is emitted and the
//! running count for `T` is incremented exactly once.
//!
//! Host signals and vision frames are debounced on separate tracks, each
//! with its own cool-down. The two tracks never share a type, and the
//! severity counter is a single map across both.

use crate::config::{PolicyConfig, VisionConfig};
use crate::types::{RawSignal, SignalKind, Violation, ViolationType, VisionFrame};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Per-type cool-down gate
#[derive(Debug, Clone)]
pub struct Debouncer {
    cool_down: Duration,
    last_emitted_at: HashMap<ViolationType, DateTime<Utc>>,
}

impl Debouncer {
    pub fn new(cool_down: std::time::Duration) -> Self {
        Self {
            cool_down: Duration::from_std(cool_down).unwrap_or(Duration::MAX),
            last_emitted_at: HashMap::new(),
        }
    }

    /// Admit a candidate at `now`, recording it if admitted.
    ///
    /// Timestamps earlier than the last emission (out-of-order delivery)
    /// count as inside the window.
    pub fn admit(&mut self, kind: ViolationType, now: DateTime<Utc>) -> bool {
        if let Some(last) = self.last_emitted_at.get(&kind) {
            if now - *last < self.cool_down {
                return false;
            }
        }
        self.last_emitted_at.insert(kind, now);
        true
    }

    pub fn last_emitted_at(&self, kind: ViolationType) -> Option<DateTime<Utc>> {
        self.last_emitted_at.get(&kind).copied()
    }
}

/// Maps signals and frames to violations for one session
#[derive(Debug, Clone)]
pub struct ViolationClassifier {
    policy: PolicyConfig,
    vision: VisionConfig,
    prohibited: Vec<String>,
    signal_track: Debouncer,
    vision_track: Debouncer,
    counts: BTreeMap<ViolationType, u32>,
}

impl ViolationClassifier {
    pub fn new(policy: PolicyConfig, vision: VisionConfig) -> Self {
        let prohibited = vision
            .prohibited_objects
            .iter()
            .map(|label| label.trim().to_lowercase())
            .filter(|label| !label.is_empty())
            .collect();
        Self {
            signal_track: Debouncer::new(policy.cool_down()),
            vision_track: Debouncer::new(vision.cool_down()),
            policy,
            vision,
            prohibited,
            counts: BTreeMap::new(),
        }
    }

    /// Classify a host signal
    pub fn classify_signal(&mut self, signal: &RawSignal) -> Option<Violation> {
        let kind = match signal.kind {
            SignalKind::VisibilityLost => ViolationType::TabSwitch,
            SignalKind::FullscreenExit => ViolationType::FullscreenExit,
            SignalKind::Clipboard if self.policy.report_clipboard => ViolationType::CopyPaste,
            SignalKind::RightClick if self.policy.report_right_click => ViolationType::RightClick,
            SignalKind::WindowBlur if self.policy.report_window_blur => ViolationType::WindowBlur,
            // Disabled by policy: no violation and no debounce bookkeeping.
            SignalKind::Clipboard | SignalKind::RightClick | SignalKind::WindowBlur => {
                return None
            }
        };

        if !self.signal_track.admit(kind, signal.occurred_at) {
            return None;
        }
        Some(self.emit(kind, signal.occurred_at))
    }

    /// Result of the periodic fullscreen probe.
    ///
    /// Emits the same type as the fullscreen adapter, through the same
    /// cool-down, so a missed exit event is still caught.
    pub fn probe_fullscreen(&mut self, fullscreen_active: bool, now: DateTime<Utc>) -> Option<Violation> {
        if !self.policy.require_fullscreen || fullscreen_active {
            return None;
        }
        let kind = ViolationType::FullscreenExit;
        if !self.signal_track.admit(kind, now) {
            return None;
        }
        Some(self.emit(kind, now))
    }

    /// Classify one vision frame; a frame can yield several violation types
    pub fn classify_frame(&mut self, frame: &VisionFrame) -> Vec<Violation> {
        let frame = frame.clone().sanitized();
        let at = frame.captured_at;

        let mut candidates = Vec::new();
        match frame.face_count {
            0 => candidates.push(ViolationType::NoFace),
            1 => {
                // Identity is only meaningful with exactly one face in view.
                if frame.identity_score < self.vision.identity_threshold {
                    candidates.push(ViolationType::IdentityMismatch);
                }
            }
            _ => candidates.push(ViolationType::MultipleFaces),
        }
        if frame.face_count > 0 && frame.gaze_deviation > self.vision.gaze_threshold {
            candidates.push(ViolationType::GazeAway);
        }
        if self.has_prohibited_object(&frame) {
            candidates.push(ViolationType::ProhibitedObject);
        }

        let admitted: Vec<ViolationType> = candidates
            .into_iter()
            .filter(|kind| self.vision_track.admit(*kind, at))
            .collect();
        admitted
            .into_iter()
            .map(|kind| self.emit_for_frame(kind, &frame))
            .collect()
    }

    /// Running count for one type
    pub fn count(&self, kind: ViolationType) -> u32 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// Running counts for every type seen so far
    pub fn counts(&self) -> &BTreeMap<ViolationType, u32> {
        &self.counts
    }

    pub fn tab_switch_limit(&self) -> u32 {
        self.policy.tab_switch_limit
    }

    fn has_prohibited_object(&self, frame: &VisionFrame) -> bool {
        frame
            .detected_objects
            .iter()
            .any(|label| self.prohibited.contains(&label.trim().to_lowercase()))
    }

    fn next_count(&mut self, kind: ViolationType) -> u32 {
        let count = self.counts.entry(kind).or_insert(0);
        *count += 1;
        *count
    }

    fn emit(&mut self, kind: ViolationType, at: DateTime<Utc>) -> Violation {
        let count = self.next_count(kind);
        let message = self.message_for(kind, count);
        Violation {
            id: Uuid::new_v4(),
            kind,
            message,
            occurred_at: at,
            severity_count: count,
        }
    }

    fn emit_for_frame(&mut self, kind: ViolationType, frame: &VisionFrame) -> Violation {
        let mut violation = self.emit(kind, frame.captured_at);
        if kind == ViolationType::ProhibitedObject {
            let seen: Vec<&str> = frame
                .detected_objects
                .iter()
                .filter(|label| self.prohibited.contains(&label.trim().to_lowercase()))
                .map(String::as_str)
                .collect();
            violation.message = format!("{} ({})", violation.message, seen.join(", "));
        }
        violation
    }

    fn message_for(&self, kind: ViolationType, count: u32) -> String {
        match kind {
            ViolationType::TabSwitch => {
                let limit = self.policy.tab_switch_limit;
                if count > limit {
                    format!(
                        "Critical: tab switch limit exceeded ({} of {} allowed)",
                        count, limit
                    )
                } else {
                    let remaining = limit - count;
                    format!(
                        "Tab switch detected ({} of {}); {} remaining before termination",
                        count, limit, remaining
                    )
                }
            }
            ViolationType::FullscreenExit => {
                "Fullscreen mode exited; return to fullscreen to continue".to_string()
            }
            ViolationType::CopyPaste => "Copy, cut and paste are not allowed".to_string(),
            ViolationType::RightClick => "Right-click is disabled during the assessment".to_string(),
            ViolationType::WindowBlur => "Assessment window lost focus".to_string(),
            ViolationType::NoFace => "No face detected in camera view".to_string(),
            ViolationType::MultipleFaces => "Multiple faces detected in camera view".to_string(),
            ViolationType::IdentityMismatch => {
                "Face does not match the registered candidate".to_string()
            }
            ViolationType::GazeAway => "Looking away from the screen".to_string(),
            ViolationType::ProhibitedObject => "Prohibited object detected".to_string(),
        }
    }
}
