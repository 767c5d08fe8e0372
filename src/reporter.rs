//! Violation delivery
//!
//! Reporting never blocks or fails from the caller's point of view: a
//! violation is either acknowledged by the sink or queued for background
//! retry. Nothing is dropped; whatever is still queued when the session
//! ends gets one final attempt and is then handed back to the caller.
//!
//! Every persist call is bounded by the delivery timeout, so a sink that
//! never answers delays shutdown by at most one timeout.

use crate::backend::ViolationSink;
use crate::config::ReporterConfig;
use crate::error::IntegrityError;
use crate::types::{Violation, ViolationType};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a single report call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// The sink accepted the violation
    Acked,
    /// Delivery failed or is waiting behind earlier items; retried later
    Queued,
}

/// Exponential backoff for queued deliveries.
///
/// Backoff doubles with each failed round: initial → 2×initial → … → max.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a single persist call
    pub delivery_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ReporterConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.retry_initial_ms),
            max_backoff: Duration::from_millis(config.retry_max_ms),
            delivery_timeout: Duration::from_millis(config.delivery_timeout_ms),
        }
    }

    /// Delay before retry round `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ReporterConfig::default())
    }
}

#[derive(Debug, Default)]
struct Tally {
    total: u32,
    by_type: BTreeMap<ViolationType, u32>,
}

/// At-least-once violation reporter for one session
pub struct ViolationReporter {
    sink: Arc<dyn ViolationSink>,
    session_token: String,
    policy: RetryPolicy,
    queue: Mutex<VecDeque<Violation>>,
    tally: Mutex<Tally>,
}

impl ViolationReporter {
    pub fn new(sink: Arc<dyn ViolationSink>, session_token: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            sink,
            session_token: session_token.into(),
            policy,
            queue: Mutex::new(VecDeque::new()),
            tally: Mutex::new(Tally::default()),
        }
    }

    /// Report a violation. Never returns an error.
    ///
    /// Items queue behind earlier undelivered ones so the sink sees them in
    /// arrival order.
    pub async fn report(&self, violation: Violation) -> ReportOutcome {
        self.count(&violation);

        if self.pending_len() > 0 {
            debug!(violation = %violation.kind, "Queued behind undelivered violations");
            self.enqueue(violation);
            return ReportOutcome::Queued;
        }

        match self.deliver(&violation).await {
            Ok(()) => ReportOutcome::Acked,
            Err(e) => {
                warn!(violation = %violation.kind, error = %e, "Violation delivery failed; queued for retry");
                self.enqueue(violation);
                ReportOutcome::Queued
            }
        }
    }

    /// Retry queued violations in order, stopping at the first failure.
    ///
    /// Returns how many were delivered.
    pub async fn flush(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = match self.queue.lock() {
                Ok(queue) => queue.front().cloned(),
                Err(_) => None,
            };
            let Some(violation) = next else { break };

            match self.deliver(&violation).await {
                Ok(()) => {
                    if let Ok(mut queue) = self.queue.lock() {
                        queue.pop_front();
                    }
                    delivered += 1;
                }
                Err(e) => {
                    debug!(error = %e, pending = self.pending_len(), "Retry round failed");
                    break;
                }
            }
        }
        delivered
    }

    /// Undelivered violations, oldest first
    pub fn pending(&self) -> Vec<Violation> {
        self.queue
            .lock()
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Violations reported this session, delivered or not
    pub fn tally(&self) -> u32 {
        self.tally.lock().map(|t| t.total).unwrap_or(0)
    }

    pub fn tally_for(&self, kind: ViolationType) -> u32 {
        self.tally
            .lock()
            .ok()
            .and_then(|t| t.by_type.get(&kind).copied())
            .unwrap_or(0)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Count and queue without attempting delivery
    fn defer(&self, violation: Violation) {
        self.count(&violation);
        self.enqueue(violation);
    }

    fn count(&self, violation: &Violation) {
        if let Ok(mut tally) = self.tally.lock() {
            tally.total += 1;
            *tally.by_type.entry(violation.kind).or_insert(0) += 1;
        }
    }

    fn enqueue(&self, violation: Violation) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(violation);
        }
    }

    async fn deliver(&self, violation: &Violation) -> Result<(), IntegrityError> {
        let detail = violation.detail();
        let persist = self.sink.persist(&self.session_token, violation.kind, &detail);
        match tokio::time::timeout(self.policy.delivery_timeout, persist).await {
            Ok(result) => result,
            Err(_) => Err(IntegrityError::Transport(format!(
                "persist timed out after {:?}",
                self.policy.delivery_timeout
            ))),
        }
    }
}

/// Spawn the delivery worker for a session.
///
/// Violations arrive on `violations` in emission order and are reported one
/// at a time; queued items are retried with the reporter's backoff.
/// Cancellation interrupts an in-flight delivery (the violation goes back to
/// the queue). Anything still in the channel is then queued, one final
/// flush runs, and the task returns whatever remains undelivered.
pub fn spawn_delivery(
    reporter: Arc<ViolationReporter>,
    mut violations: mpsc::UnboundedReceiver<Violation>,
    cancel: CancellationToken,
) -> JoinHandle<Vec<Violation>> {
    tokio::spawn(async move {
        let policy = reporter.retry_policy();
        let mut attempt: u32 = 0;
        let mut retry_at: Option<Instant> = None;

        loop {
            let deadline = retry_at;
            let retry_sleep = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                received = violations.recv() => {
                    let Some(violation) = received else { break };
                    let in_flight = violation.clone();
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            reporter.enqueue(in_flight);
                            break;
                        }
                        outcome = reporter.report(violation) => outcome,
                    };
                    if outcome == ReportOutcome::Queued && retry_at.is_none() {
                        retry_at = Some(Instant::now() + policy.backoff(attempt));
                    }
                }

                _ = retry_sleep => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = reporter.flush() => {}
                    }
                    if reporter.pending_len() == 0 {
                        attempt = 0;
                        retry_at = None;
                    } else {
                        attempt = attempt.saturating_add(1);
                        retry_at = Some(Instant::now() + policy.backoff(attempt));
                    }
                }
            }
        }

        violations.close();
        while let Ok(violation) = violations.try_recv() {
            reporter.defer(violation);
        }
        reporter.flush().await;

        let remaining = reporter.pending();
        if remaining.is_empty() {
            info!(reported = reporter.tally(), "Violation delivery finished");
        } else {
            warn!(
                undelivered = remaining.len(),
                "Session ended with undelivered violations"
            );
        }
        remaining
    })
}
