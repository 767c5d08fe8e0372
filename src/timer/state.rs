//! Section timer state machine
//!
//! `Idle → Running → {Expired, Completed}`. Both end states are terminal for
//! the section instance; a new section gets a new [`SectionTimer`].
//!
//! Losing the server only marks a running timer sync-pending: the display
//! hides the value but the local deadline keeps counting and still expires.
//!
//! The local clock ticks for responsiveness while the server stays the
//! authority: [`merge_timer`] decides, for one server snapshot, which value
//! wins.

use crate::backend::{RemoteTimerStatus, SectionStart, TimerSnapshot};
use crate::types::{SectionTimerState, TimerStatus};

/// Authoritative values after merging a local state with a server snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedTimer {
    pub time_remaining_seconds: u32,
    pub status: TimerStatus,
    /// Whether the server value replaced the local one
    pub corrected: bool,
}

/// Merge a local timer with a server snapshot.
///
/// - a terminal local state never changes
/// - a server that says `running` with no time left forces `Expired`
/// - drift above `drift_threshold` seconds, or a status mismatch, adopts the
///   server value (clamped to `[0, limit]`)
/// - otherwise the local value stands
pub fn merge_timer(local: &SectionTimerState, remote: &TimerSnapshot, drift_threshold: u32) -> MergedTimer {
    let keep = MergedTimer {
        time_remaining_seconds: local.time_remaining_seconds,
        status: local.status,
        corrected: false,
    };

    if local.status.is_terminal() {
        return keep;
    }

    let remote_status = match remote.status {
        RemoteTimerStatus::Running if remote.time_left <= 0 => TimerStatus::Expired,
        RemoteTimerStatus::Running => TimerStatus::Running,
        RemoteTimerStatus::Expired => TimerStatus::Expired,
        RemoteTimerStatus::Completed => TimerStatus::Completed,
    };
    let remote_remaining = if remote_status == TimerStatus::Expired {
        0
    } else {
        remote
            .time_left
            .clamp(0, i64::from(local.time_limit_seconds)) as u32
    };

    let drift = local.time_remaining_seconds.abs_diff(remote_remaining);
    if drift > drift_threshold || remote_status != local.status {
        MergedTimer {
            time_remaining_seconds: remote_remaining,
            status: remote_status,
            corrected: true,
        }
    } else {
        keep
    }
}

/// Result of one local tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not running; nothing changed
    Inactive,
    /// Decremented, still time left
    Counting(u32),
    /// Reached zero on this tick
    Expired,
}

/// Result of applying server data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Unchanged,
    Corrected { from: u32, to: u32 },
    Expired,
    Completed,
}

/// Countdown for one section instance
#[derive(Debug, Clone)]
pub struct SectionTimer {
    state: SectionTimerState,
    end_reported: bool,
}

impl SectionTimer {
    /// New idle timer; a zero limit is raised to one second
    pub fn new(section_id: impl Into<String>, time_limit_seconds: u32) -> Self {
        let limit = time_limit_seconds.max(1);
        Self {
            state: SectionTimerState {
                section_id: section_id.into(),
                time_remaining_seconds: limit,
                time_limit_seconds: limit,
                started_at: None,
                status: TimerStatus::Idle,
                sync_pending: false,
            },
            end_reported: false,
        }
    }

    pub fn state(&self) -> &SectionTimerState {
        &self.state
    }

    pub fn section_id(&self) -> &str {
        &self.state.section_id
    }

    pub fn is_terminal(&self) -> bool {
        self.state.status.is_terminal()
    }

    /// Show the full duration while the server start is in flight.
    ///
    /// Only valid from a fresh idle timer; returns false otherwise.
    pub fn start_optimistic(&mut self) -> bool {
        if self.state.status != TimerStatus::Idle || self.state.started_at.is_some() {
            return false;
        }
        self.state.time_remaining_seconds = self.state.time_limit_seconds;
        self.state.status = TimerStatus::Running;
        true
    }

    /// One local second
    pub fn tick(&mut self) -> TickOutcome {
        if self.state.status != TimerStatus::Running {
            return TickOutcome::Inactive;
        }
        self.state.time_remaining_seconds = self.state.time_remaining_seconds.saturating_sub(1);
        if self.state.time_remaining_seconds == 0 {
            self.state.status = TimerStatus::Expired;
            self.state.sync_pending = false;
            if self.mark_end_reported() {
                return TickOutcome::Expired;
            }
            return TickOutcome::Inactive;
        }
        TickOutcome::Counting(self.state.time_remaining_seconds)
    }

    /// Apply the server's start acknowledgement
    pub fn apply_start(&mut self, ack: &SectionStart) -> Reconciliation {
        if self.is_terminal() {
            return Reconciliation::Unchanged;
        }
        let limit = ack.time_limit.max(1);
        let from = self.state.time_remaining_seconds;
        self.state.time_limit_seconds = limit;
        self.state.time_remaining_seconds = ack.time_remaining.min(limit);
        self.state.started_at = Some(ack.started_at);
        self.state.sync_pending = false;

        if self.state.time_remaining_seconds == 0 {
            return self.finish(TimerStatus::Expired);
        }
        self.state.status = TimerStatus::Running;
        if from == self.state.time_remaining_seconds {
            Reconciliation::Unchanged
        } else {
            Reconciliation::Corrected {
                from,
                to: self.state.time_remaining_seconds,
            }
        }
    }

    /// Periodic reconciliation against a server snapshot.
    ///
    /// The first good snapshot after a sync-pending stretch is always adopted
    /// and reported, so the display leaves "sync pending".
    pub fn reconcile(&mut self, snapshot: &TimerSnapshot, drift_threshold: u32) -> Reconciliation {
        let recovering = std::mem::take(&mut self.state.sync_pending);
        let threshold = if recovering { 0 } else { drift_threshold };
        let merged = merge_timer(&self.state, snapshot, threshold);
        let from = self.state.time_remaining_seconds;
        if !merged.corrected {
            if recovering && !self.is_terminal() {
                return Reconciliation::Corrected { from, to: from };
            }
            return Reconciliation::Unchanged;
        }

        self.state.time_remaining_seconds = merged.time_remaining_seconds;
        match merged.status {
            TimerStatus::Expired | TimerStatus::Completed => self.finish(merged.status),
            status => {
                self.state.status = status;
                Reconciliation::Corrected {
                    from,
                    to: merged.time_remaining_seconds,
                }
            }
        }
    }

    /// Take the server value unconditionally (the optimistic value is void)
    pub fn adopt(&mut self, snapshot: &TimerSnapshot) -> Reconciliation {
        self.reconcile(snapshot, 0)
    }

    /// No usable server data: stop showing a value until the next good sync.
    ///
    /// The countdown itself continues. Returns true if the timer was running
    /// and not already pending.
    pub fn mark_sync_pending(&mut self) -> bool {
        if self.state.status != TimerStatus::Running || self.state.sync_pending {
            return false;
        }
        self.state.sync_pending = true;
        true
    }

    fn finish(&mut self, status: TimerStatus) -> Reconciliation {
        self.state.status = status;
        self.state.sync_pending = false;
        if status == TimerStatus::Expired {
            self.state.time_remaining_seconds = 0;
        }
        if !self.mark_end_reported() {
            return Reconciliation::Unchanged;
        }
        match status {
            TimerStatus::Completed => Reconciliation::Completed,
            _ => Reconciliation::Expired,
        }
    }

    fn mark_end_reported(&mut self) -> bool {
        let first = !self.end_reported;
        self.end_reported = true;
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimerDisplay;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn running(section: &str, limit: u32) -> SectionTimer {
        let mut timer = SectionTimer::new(section, limit);
        assert!(timer.start_optimistic());
        timer
    }

    fn snapshot(time_left: i64, status: RemoteTimerStatus) -> TimerSnapshot {
        TimerSnapshot { time_left, status }
    }

    fn ack(remaining: u32, limit: u32) -> SectionStart {
        SectionStart {
            time_remaining: remaining,
            time_limit: limit,
            started_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_example_drift_scenario() {
        let mut timer = running("s1", 600);
        assert_eq!(timer.state().time_remaining_seconds, 600);

        timer.apply_start(&ack(598, 600));
        for _ in 0..3 {
            timer.tick();
        }
        assert_eq!(timer.state().time_remaining_seconds, 595);

        let outcome = timer.reconcile(&snapshot(590, RemoteTimerStatus::Running), 2);
        assert_eq!(outcome, Reconciliation::Corrected { from: 595, to: 590 });
        assert_eq!(timer.state().time_remaining_seconds, 590);
        assert_eq!(timer.state().status, TimerStatus::Running);
    }

    #[test]
    fn test_drift_within_threshold_keeps_local() {
        let mut timer = running("s1", 600);
        for _ in 0..10 {
            timer.tick();
        }
        let outcome = timer.reconcile(&snapshot(588, RemoteTimerStatus::Running), 2);
        assert_eq!(outcome, Reconciliation::Unchanged);
        assert_eq!(timer.state().time_remaining_seconds, 590);
    }

    #[test]
    fn test_tick_floor_and_single_expiry() {
        let mut timer = running("s1", 3);
        assert_eq!(timer.tick(), TickOutcome::Counting(2));
        assert_eq!(timer.tick(), TickOutcome::Counting(1));
        assert_eq!(timer.tick(), TickOutcome::Expired);
        for _ in 0..5 {
            assert_eq!(timer.tick(), TickOutcome::Inactive);
        }
        assert_eq!(timer.state().time_remaining_seconds, 0);
        assert_eq!(timer.state().status, TimerStatus::Expired);

        // Server data cannot revive or re-expire a terminal timer.
        assert_eq!(
            timer.reconcile(&snapshot(100, RemoteTimerStatus::Running), 2),
            Reconciliation::Unchanged
        );
        assert_eq!(timer.state().status, TimerStatus::Expired);
    }

    #[test]
    fn test_server_running_with_no_time_forces_expiry() {
        let mut timer = running("s1", 600);
        let outcome = timer.reconcile(&snapshot(0, RemoteTimerStatus::Running), 2);
        assert_eq!(outcome, Reconciliation::Expired);
        assert_eq!(timer.state().time_remaining_seconds, 0);

        let mut timer = running("s2", 600);
        let outcome = timer.reconcile(&snapshot(-4, RemoteTimerStatus::Running), 700);
        assert_eq!(outcome, Reconciliation::Expired);
    }

    #[test]
    fn test_server_completed_is_terminal() {
        let mut timer = running("s1", 600);
        assert_eq!(
            timer.reconcile(&snapshot(300, RemoteTimerStatus::Completed), 2),
            Reconciliation::Completed
        );
        assert!(timer.is_terminal());
        assert_eq!(timer.tick(), TickOutcome::Inactive);
    }

    #[test]
    fn test_remaining_never_exceeds_limit() {
        let mut timer = running("s1", 600);
        timer.reconcile(&snapshot(5_000, RemoteTimerStatus::Running), 2);
        assert_eq!(timer.state().time_remaining_seconds, 600);

        let mut timer = running("s2", 600);
        timer.apply_start(&ack(900, 300));
        assert_eq!(timer.state().time_limit_seconds, 300);
        assert_eq!(timer.state().time_remaining_seconds, 300);
    }

    #[test]
    fn test_sync_pending_then_recovery() {
        let mut timer = running("s1", 600);
        assert!(timer.mark_sync_pending());
        assert!(!timer.mark_sync_pending());
        assert_eq!(timer.state().display(), TimerDisplay::SyncPending);
        assert_eq!(timer.tick(), TickOutcome::Counting(599));

        // The first good snapshot is reported even without drift.
        let outcome = timer.reconcile(&snapshot(599, RemoteTimerStatus::Running), 2);
        assert_eq!(outcome, Reconciliation::Corrected { from: 599, to: 599 });
        assert_eq!(timer.state().status, TimerStatus::Running);
        assert_eq!(timer.state().display(), TimerDisplay::Remaining(599));

        // Back to the normal threshold afterwards.
        let outcome = timer.reconcile(&snapshot(598, RemoteTimerStatus::Running), 2);
        assert_eq!(outcome, Reconciliation::Unchanged);
    }

    #[test]
    fn test_sync_pending_still_expires_at_deadline() {
        let mut timer = running("s1", 3);
        assert!(timer.mark_sync_pending());
        assert_eq!(timer.tick(), TickOutcome::Counting(2));
        assert_eq!(timer.tick(), TickOutcome::Counting(1));
        assert_eq!(timer.tick(), TickOutcome::Expired);
        assert_eq!(timer.state().status, TimerStatus::Expired);
        assert_eq!(timer.state().display(), TimerDisplay::Remaining(0));
        assert!(!timer.mark_sync_pending());
    }

    #[test]
    fn test_adopt_discards_optimistic_value() {
        let mut timer = running("s1", 600);
        let outcome = timer.adopt(&snapshot(599, RemoteTimerStatus::Running));
        assert_eq!(outcome, Reconciliation::Corrected { from: 600, to: 599 });
    }

    #[test]
    fn test_optimistic_start_only_once() {
        let mut timer = SectionTimer::new("s1", 0);
        assert_eq!(timer.state().time_limit_seconds, 1);
        assert!(timer.start_optimistic());
        assert!(!timer.start_optimistic());
    }

    #[test]
    fn test_merge_is_pure() {
        let local = running("s1", 600).state().clone();
        let merged = merge_timer(&local, &snapshot(590, RemoteTimerStatus::Running), 2);
        assert_eq!(
            merged,
            MergedTimer {
                time_remaining_seconds: 590,
                status: TimerStatus::Running,
                corrected: true
            }
        );
        assert_eq!(local.time_remaining_seconds, 600);
    }
}
