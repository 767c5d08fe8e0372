//! Engine configuration
//!
//! Every knob has a default so an empty TOML document is a valid config.
//! Durations are stored in milliseconds and exposed as [`Duration`].

use crate::error::IntegrityError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default cool-down between two violations of the same type
pub const DEFAULT_COOL_DOWN_MS: u64 = 5_000;

/// Default number of tab switches tolerated before termination
pub const DEFAULT_TAB_SWITCH_LIMIT: u32 = 3;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub policy: PolicyConfig,
    pub vision: VisionConfig,
    pub timer: TimerConfig,
    pub reporter: ReporterConfig,
    pub session: SessionConfig,
}

/// Host-signal policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Tab switches tolerated; the next one terminates the session
    pub tab_switch_limit: u32,
    /// Cool-down for host-signal violations (ms)
    pub cool_down_ms: u64,
    /// Report clipboard activity as a violation
    pub report_clipboard: bool,
    /// Prevent the default copy/cut/paste action
    pub block_clipboard: bool,
    /// Report context-menu opens as a violation
    pub report_right_click: bool,
    /// Prevent the default context menu
    pub block_context_menu: bool,
    /// Report window blur as a violation
    pub report_window_blur: bool,
    /// Whether fullscreen is required (enables adapter and probe)
    pub require_fullscreen: bool,
    /// Fullscreen probe interval (ms)
    pub fullscreen_poll_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            tab_switch_limit: DEFAULT_TAB_SWITCH_LIMIT,
            cool_down_ms: DEFAULT_COOL_DOWN_MS,
            report_clipboard: true,
            block_clipboard: true,
            report_right_click: true,
            block_context_menu: true,
            report_window_blur: true,
            require_fullscreen: true,
            fullscreen_poll_ms: 5_000,
        }
    }
}

impl PolicyConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    pub fn fullscreen_poll(&self) -> Duration {
        Duration::from_millis(self.fullscreen_poll_ms)
    }
}

/// Vision inference settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub enabled: bool,
    /// Minimum interval between consumed frames (ms)
    pub sampling_interval_ms: u64,
    /// Cool-down for vision violations (ms)
    pub cool_down_ms: u64,
    /// Identity scores below this are a mismatch
    pub identity_threshold: f64,
    /// Gaze deviations above this count as looking away
    pub gaze_threshold: f64,
    /// Object labels that must not appear in frame
    pub prohibited_objects: Vec<String>,
    /// Reference image of the contestant, if identity matching is wanted
    pub reference_image_url: Option<String>,
    /// Video source handed to the provider
    pub video_source: String,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling_interval_ms: 1_000,
            cool_down_ms: DEFAULT_COOL_DOWN_MS,
            identity_threshold: 0.6,
            gaze_threshold: 0.35,
            prohibited_objects: vec![
                "cell phone".to_string(),
                "book".to_string(),
                "laptop".to_string(),
            ],
            reference_image_url: None,
            video_source: "default".to_string(),
        }
    }
}

impl VisionConfig {
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }

    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }
}

/// Section timer synchronization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Local countdown tick (ms)
    pub tick_ms: u64,
    /// Server reconciliation interval (ms)
    pub sync_interval_ms: u64,
    /// Drift beyond this many seconds is corrected from the server
    pub drift_threshold_secs: u32,
    /// Retries after a sync yields no usable data
    pub sync_retries: u32,
    /// Backoff between sync retries (ms)
    pub retry_backoff_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            sync_interval_ms: 5_000,
            drift_threshold_secs: 2,
            sync_retries: 3,
            retry_backoff_ms: 1_000,
        }
    }
}

impl TimerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Violation delivery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// First retry delay for queued violations (ms)
    pub retry_initial_ms: u64,
    /// Upper bound on the retry delay (ms)
    pub retry_max_ms: u64,
    /// A persist call that has not answered after this long counts as failed (ms)
    pub delivery_timeout_ms: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            retry_initial_ms: 1_000,
            retry_max_ms: 30_000,
            delivery_timeout_ms: 10_000,
        }
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Final-section expiry submits instead of terminating
    pub submit_on_final_expiry: bool,
    /// Send presence heartbeats (non-shared context mode)
    pub heartbeat_enabled: bool,
    /// Heartbeat interval (ms)
    pub heartbeat_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            submit_on_final_expiry: true,
            heartbeat_enabled: false,
            heartbeat_interval_ms: 30_000,
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(toml_str: &str) -> Result<Self, IntegrityError> {
        let config: EngineConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_path(path: &Path) -> Result<Self, IntegrityError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Render as TOML (used by the CLI to show the effective config)
    pub fn to_toml_string(&self) -> Result<String, IntegrityError> {
        toml::to_string_pretty(self).map_err(|e| IntegrityError::Config(e.to_string()))
    }

    /// Reject values that would break the engine's invariants
    pub fn validate(&self) -> Result<(), IntegrityError> {
        let positive = [
            ("policy.fullscreen_poll_ms", self.policy.fullscreen_poll_ms),
            ("vision.sampling_interval_ms", self.vision.sampling_interval_ms),
            ("timer.tick_ms", self.timer.tick_ms),
            ("timer.sync_interval_ms", self.timer.sync_interval_ms),
            ("reporter.retry_initial_ms", self.reporter.retry_initial_ms),
            ("reporter.delivery_timeout_ms", self.reporter.delivery_timeout_ms),
            ("session.heartbeat_interval_ms", self.session.heartbeat_interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(IntegrityError::Config(format!("{} must be > 0", name)));
            }
        }

        if self.reporter.retry_max_ms < self.reporter.retry_initial_ms {
            return Err(IntegrityError::Config(
                "reporter.retry_max_ms must be >= reporter.retry_initial_ms".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.vision.identity_threshold) {
            return Err(IntegrityError::Config(
                "vision.identity_threshold must be within [0, 1]".to_string(),
            ));
        }

        if self.vision.gaze_threshold.is_nan() || self.vision.gaze_threshold < 0.0 {
            return Err(IntegrityError::Config(
                "vision.gaze_threshold must be >= 0".to_string(),
            ));
        }

        Ok(())
    }
}
