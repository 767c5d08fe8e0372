//! Offline session replay
//!
//! Feeds recorded examguard.input.v1 records through a real
//! [`ProctoringSession`] wired to a [`SimulatedHost`] and an
//! [`InMemoryBackend`], and reports what the engine decided.
//!
//! Records are handled strictly in order; host events go through the
//! adapters exactly as live events would.

use crate::adapters::{HostEvent, SimulatedHost};
use crate::backend::InMemoryBackend;
use crate::config::EngineConfig;
use crate::error::IntegrityError;
use crate::schema::{Command, InputRecord, Payload, RecordReader};
use crate::session::{AssessmentPlan, Entry, ProctoringSession, SessionServices, SetupChecks};
use crate::types::{SessionOutcome, SessionState, Violation, ViolationType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// What a replay produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub records_read: usize,
    /// Records after the session ended are not applied
    pub records_applied: usize,
    pub violations: Vec<Violation>,
    pub counts: BTreeMap<ViolationType, u32>,
    pub final_state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SessionOutcome>,
    /// Violations the sink received
    pub delivered: usize,
}

/// Replay recorded input against a fresh session.
///
/// # Arguments
/// * `records` - Input records in arrival order
/// * `plan` - Assessment and sections to run
/// * `config` - Engine configuration
///
/// # Returns
/// The violations emitted and the session's final state
///
/// # Example
/// ```ignore
/// let records = RecordReader::parse_ndjson(&input)?;
/// let report = replay_records(&records, plan, EngineConfig::default()).await?;
/// println!("{}", serde_json::to_string_pretty(&report)?);
/// ```
pub async fn replay_records(
    records: &[InputRecord],
    plan: AssessmentPlan,
    config: EngineConfig,
) -> Result<ReplayReport, IntegrityError> {
    if let Some(failure) = RecordReader::validate_records(records).into_iter().next() {
        let reason = failure
            .result
            .map(|e| e.to_string())
            .unwrap_or_else(|| "invalid record".to_string());
        return Err(IntegrityError::ParseError(format!(
            "record {}: {}",
            failure.index, reason
        )));
    }

    let host = Arc::new(SimulatedHost::new());
    host.set_fullscreen(true);
    let mut backend = InMemoryBackend::new();
    for section in &plan.sections {
        backend = backend.with_section(&section.section_id, section.duration_seconds);
    }
    let backend = Arc::new(backend);

    let services = SessionServices {
        host: host.clone(),
        vision: None,
        violations: backend.clone(),
        timers: backend.clone(),
        heartbeat: None,
        outcomes: backend.clone(),
    };

    let mut session = match ProctoringSession::enter(plan, config, services)? {
        Entry::Fresh(session) => session,
        Entry::Redirect(outcome) => {
            return Err(IntegrityError::InvalidTransition {
                phase: outcome.phase.as_str().to_string(),
                action: "replay".to_string(),
            })
        }
    };
    session.begin(&SetupChecks::passing()).await?;

    let mut violations = Vec::new();
    let mut applied = 0;
    for record in records {
        if session.state().phase.is_terminal() {
            debug!(remaining = records.len() - applied, "Session ended; ignoring remaining records");
            break;
        }
        applied += 1;
        apply_record(&mut session, &host, record, &mut violations)?;
    }

    session.shutdown().await;
    let report = ReplayReport {
        records_read: records.len(),
        records_applied: applied,
        counts: session.classifier().counts().clone(),
        final_state: session.state().clone(),
        outcome: session.outcome().cloned(),
        delivered: backend.persisted().len(),
        violations,
    };
    info!(
        records = report.records_applied,
        violations = report.violations.len(),
        phase = report.final_state.phase.as_str(),
        "Replay finished"
    );
    Ok(report)
}

fn apply_record(
    session: &mut ProctoringSession,
    host: &SimulatedHost,
    record: &InputRecord,
    violations: &mut Vec<Violation>,
) -> Result<(), IntegrityError> {
    match &record.payload {
        Payload::Host { host: kind } => {
            host.dispatch(HostEvent::new(*kind, record.timestamp));
            let mut events = session.subscribe();
            session.process_pending();
            while let Ok(event) = events.try_recv() {
                if let crate::session::SessionEvent::ViolationRecorded(v) = event {
                    violations.push(v);
                }
            }
        }
        Payload::Frame { frame } => {
            violations.extend(session.on_frame(&frame.to_frame(record.timestamp)));
        }
        Payload::FullscreenProbe { fullscreen_probe } => {
            host.set_fullscreen(fullscreen_probe.active);
            violations.extend(session.on_fullscreen_probe(fullscreen_probe.active, record.timestamp));
        }
        Payload::Command { command: Command::Submit } => {
            session.submit()?;
        }
        Payload::Command { command: Command::Advance } => {
            session.advance_section()?;
        }
    }
    Ok(())
}
