//! Error types for Examguard

use thiserror::Error;

/// Errors surfaced by the integrity engine.
///
/// Transient network failures are absorbed by the reporter and the timer
/// synchronizer; only setup, configuration and input parsing reach callers.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to parse input: {0}")]
    ParseError(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Section {0} was already started")]
    SectionAlreadyStarted(String),

    #[error("Inference unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("Setup blocked: {0}")]
    SetupBlocked(String),

    #[error("Cannot {action} while session is {phase}")]
    InvalidTransition { phase: String, action: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntegrityError {
    /// Whether the failure is worth retrying (network-class errors).
    pub fn is_transient(&self) -> bool {
        matches!(self, IntegrityError::Transport(_))
    }
}
