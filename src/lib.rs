//! Examguard - Integrity engine for proctored assessment sessions
//!
//! Examguard fuses independent integrity signals into a bounded, debounced
//! violation stream and keeps per-section countdowns consistent between the
//! client and an authoritative server:
//! host adapters + vision frames → classifier → reporter, with the section
//! timer synchronizer running alongside and the session orchestrator making
//! every terminal decision.
//!
//! ## Modules
//!
//! - **Signals**: `adapters` (host events) and `vision` (inference provider)
//! - **Decisions**: `classifier` (debounce, escalation) and `session`
//! - **Delivery**: `reporter` (at-least-once violation delivery)
//! - **Time**: `timer` (dual-clock section timers)
//! - **Replay**: `schema` and `replay` for recorded examguard.input.v1 streams

pub mod adapters;
pub mod backend;
pub mod classifier;
pub mod config;
pub mod error;
pub mod replay;
pub mod reporter;
pub mod schema;
pub mod session;
pub mod timer;
pub mod types;
pub mod vision;

pub use classifier::ViolationClassifier;
pub use config::EngineConfig;
pub use error::IntegrityError;
pub use replay::{replay_records, ReplayReport};
pub use reporter::ViolationReporter;
pub use session::{AssessmentPlan, Entry, ProctoringSession, SessionEvent, SessionServices, SetupChecks};
pub use timer::{merge_timer, TimerSynchronizer};

// Schema exports
pub use schema::{InputRecord, RecordReader, SCHEMA_VERSION};

/// Engine version reported by the CLI
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name used in replay reports and logs
pub const PRODUCER_NAME: &str = "examguard";
