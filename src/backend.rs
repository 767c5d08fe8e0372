//! External endpoints consumed by the engine
//!
//! The server side of the platform is reached only through these traits.
//! [`InMemoryBackend`] implements all of them in-process for the replay CLI
//! and for tests, with switches to simulate network loss.

use crate::error::IntegrityError;
use crate::types::{SessionOutcome, ViolationType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Violation persistence endpoint. Duplicate deliveries are tolerated.
#[async_trait]
pub trait ViolationSink: Send + Sync {
    async fn persist(
        &self,
        session_token: &str,
        violation_type: ViolationType,
        detail: &serde_json::Value,
    ) -> Result<(), IntegrityError>;
}

/// Server acknowledgement of a section start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionStart {
    pub time_remaining: u32,
    pub time_limit: u32,
    pub started_at: DateTime<Utc>,
}

/// Timer status as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteTimerStatus {
    Running,
    Expired,
    Completed,
}

/// Server view of a section timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    /// Seconds left; may be zero or negative once the deadline passed
    pub time_left: i64,
    pub status: RemoteTimerStatus,
}

/// Section timer endpoints
#[async_trait]
pub trait TimerEndpoint: Send + Sync {
    /// Start a section. Returns `SectionAlreadyStarted` on a repeated start.
    async fn start_section(
        &self,
        assessment_id: &str,
        section_id: &str,
    ) -> Result<SectionStart, IntegrityError>;

    /// Current server timer; `None` when the server has no usable data
    async fn get_timer(
        &self,
        assessment_id: &str,
        section_id: &str,
    ) -> Result<Option<TimerSnapshot>, IntegrityError>;
}

/// Presence heartbeat used when the session is not in a shared context
#[async_trait]
pub trait HeartbeatEndpoint: Send + Sync {
    async fn heartbeat(&self, session_token: &str) -> Result<(), IntegrityError>;
}

/// Where finished-session outcomes live (session storage in a browser)
pub trait OutcomeStore: Send + Sync {
    fn record(&self, session_token: &str, outcome: &SessionOutcome);
    fn lookup(&self, session_token: &str) -> Option<SessionOutcome>;
}

/// A violation as received by the in-memory sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedViolation {
    pub session_token: String,
    pub violation_type: ViolationType,
    pub detail: serde_json::Value,
}

struct StartedSection {
    clock: tokio::time::Instant,
    started_at: DateTime<Utc>,
}

/// In-process implementation of every endpoint
#[derive(Default)]
pub struct InMemoryBackend {
    limits: Mutex<HashMap<String, u32>>,
    started: Mutex<HashMap<String, StartedSection>>,
    completed: Mutex<HashSet<String>>,
    persisted: Mutex<Vec<PersistedViolation>>,
    outcomes: Mutex<HashMap<String, SessionOutcome>>,
    offline: AtomicBool,
    persist_failures: AtomicU32,
    persist_calls: AtomicUsize,
    start_calls: AtomicUsize,
    timer_calls: AtomicUsize,
    heartbeat_calls: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a section and its limit in seconds
    pub fn with_section(self, section_id: &str, limit_seconds: u32) -> Self {
        if let Ok(mut limits) = self.limits.lock() {
            limits.insert(section_id.to_string(), limit_seconds);
        }
        self
    }

    /// Simulate total network loss
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next `n` persist calls fail
    pub fn fail_next_persists(&self, n: u32) {
        self.persist_failures.store(n, Ordering::SeqCst);
    }

    /// Mark a section completed on the server
    pub fn complete_section(&self, section_id: &str) {
        if let Ok(mut completed) = self.completed.lock() {
            completed.insert(section_id.to_string());
        }
    }

    pub fn persisted(&self) -> Vec<PersistedViolation> {
        self.persisted.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn timer_calls(&self) -> usize {
        self.timer_calls.load(Ordering::SeqCst)
    }

    pub fn heartbeat_calls(&self) -> usize {
        self.heartbeat_calls.load(Ordering::SeqCst)
    }

    /// Server-side start time of a section, if started
    pub fn started_at(&self, section_id: &str) -> Option<DateTime<Utc>> {
        self.started
            .lock()
            .ok()
            .and_then(|s| s.get(section_id).map(|s| s.started_at))
    }

    fn check_online(&self) -> Result<(), IntegrityError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(IntegrityError::Transport("network unreachable".to_string()))
        } else {
            Ok(())
        }
    }

    fn lock_poisoned() -> IntegrityError {
        IntegrityError::Transport("backend state unavailable".to_string())
    }
}

#[async_trait]
impl ViolationSink for InMemoryBackend {
    async fn persist(
        &self,
        session_token: &str,
        violation_type: ViolationType,
        detail: &serde_json::Value,
    ) -> Result<(), IntegrityError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let failed = self
            .persist_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(IntegrityError::Transport("persist rejected".to_string()));
        }

        self.persisted
            .lock()
            .map_err(|_| Self::lock_poisoned())?
            .push(PersistedViolation {
                session_token: session_token.to_string(),
                violation_type,
                detail: detail.clone(),
            });
        Ok(())
    }
}

#[async_trait]
impl TimerEndpoint for InMemoryBackend {
    async fn start_section(
        &self,
        _assessment_id: &str,
        section_id: &str,
    ) -> Result<SectionStart, IntegrityError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let limit = self
            .limits
            .lock()
            .map_err(|_| Self::lock_poisoned())?
            .get(section_id)
            .copied()
            .ok_or_else(|| IntegrityError::Transport(format!("unknown section {}", section_id)))?;

        let mut started = self.started.lock().map_err(|_| Self::lock_poisoned())?;
        if started.contains_key(section_id) {
            return Err(IntegrityError::SectionAlreadyStarted(section_id.to_string()));
        }

        let now = Utc::now();
        started.insert(
            section_id.to_string(),
            StartedSection {
                clock: tokio::time::Instant::now(),
                started_at: now,
            },
        );
        Ok(SectionStart {
            time_remaining: limit,
            time_limit: limit,
            started_at: now,
        })
    }

    async fn get_timer(
        &self,
        _assessment_id: &str,
        section_id: &str,
    ) -> Result<Option<TimerSnapshot>, IntegrityError> {
        self.timer_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let limit = match self
            .limits
            .lock()
            .map_err(|_| Self::lock_poisoned())?
            .get(section_id)
        {
            Some(limit) => *limit as i64,
            None => return Ok(None),
        };
        let elapsed = match self
            .started
            .lock()
            .map_err(|_| Self::lock_poisoned())?
            .get(section_id)
        {
            Some(section) => section.clock.elapsed().as_secs() as i64,
            None => return Ok(None),
        };

        let time_left = limit - elapsed;
        let completed = self
            .completed
            .lock()
            .map_err(|_| Self::lock_poisoned())?
            .contains(section_id);
        let status = if completed {
            RemoteTimerStatus::Completed
        } else if time_left <= 0 {
            RemoteTimerStatus::Expired
        } else {
            RemoteTimerStatus::Running
        };

        Ok(Some(TimerSnapshot {
            time_left: time_left.max(0),
            status,
        }))
    }
}

#[async_trait]
impl HeartbeatEndpoint for InMemoryBackend {
    async fn heartbeat(&self, _session_token: &str) -> Result<(), IntegrityError> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()
    }
}

impl OutcomeStore for InMemoryBackend {
    fn record(&self, session_token: &str, outcome: &SessionOutcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.insert(session_token.to_string(), outcome.clone());
        }
    }

    fn lookup(&self, session_token: &str) -> Option<SessionOutcome> {
        self.outcomes
            .lock()
            .ok()
            .and_then(|outcomes| outcomes.get(session_token).cloned())
    }
}
