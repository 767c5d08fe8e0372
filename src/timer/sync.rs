//! Dual-clock section timer driver
//!
//! A local tick keeps the countdown responsive while a periodic server sync
//! keeps it honest. Both run as tasks under a per-section child of the
//! session's cancellation token, so tearing down the session stops every
//! timer request in flight.

use super::state::{Reconciliation, SectionTimer, TickOutcome};
use crate::backend::{TimerEndpoint, TimerSnapshot};
use crate::config::TimerConfig;
use crate::error::IntegrityError;
use crate::types::SectionTimerState;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timer transitions the session reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// The section ran out of time (reported once per section)
    Expired { section_id: String },
    /// The server marked the section completed
    Completed { section_id: String },
    /// The server value replaced the local one
    Corrected { section_id: String, from: u32, to: u32 },
    /// Sync retries ran out; the display shows "sync pending"
    SyncPending { section_id: String },
}

impl TimerEvent {
    pub fn section_id(&self) -> &str {
        match self {
            TimerEvent::Expired { section_id }
            | TimerEvent::Completed { section_id }
            | TimerEvent::Corrected { section_id, .. }
            | TimerEvent::SyncPending { section_id } => section_id,
        }
    }
}

/// Result of [`TimerSynchronizer::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The section is already counting down; nothing changed
    AlreadyRunning,
    /// The section already ended; a sync was scheduled instead
    AlreadyEnded,
}

struct SectionRun {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the timer of the active section
pub struct TimerSynchronizer {
    endpoint: Arc<dyn TimerEndpoint>,
    assessment_id: String,
    config: TimerConfig,
    current: Arc<Mutex<Option<SectionTimer>>>,
    events: mpsc::UnboundedSender<TimerEvent>,
    cancel: CancellationToken,
    run: Option<SectionRun>,
    /// Tasks of stopped sections, awaited on shutdown
    stopped: Vec<JoinHandle<()>>,
}

impl TimerSynchronizer {
    pub fn new(
        endpoint: Arc<dyn TimerEndpoint>,
        assessment_id: impl Into<String>,
        config: TimerConfig,
        events: mpsc::UnboundedSender<TimerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            endpoint,
            assessment_id: assessment_id.into(),
            config,
            current: Arc::new(Mutex::new(None)),
            events,
            cancel,
            run: None,
            stopped: Vec::new(),
        }
    }

    /// Start counting down a section.
    ///
    /// The full duration is shown immediately; the server start request and
    /// a first sync run concurrently and correct it. Starting the section
    /// that is already active is a no-op, and restarting one that already
    /// ended falls back to a sync.
    pub fn start(&mut self, section_id: &str, duration_seconds: u32) -> StartOutcome {
        if let Some(state) = self.state() {
            if state.section_id == section_id {
                if !state.status.is_terminal() {
                    return StartOutcome::AlreadyRunning;
                }
                warn!(section = section_id, "Section already ended; syncing instead of restarting");
                let worker = self.worker(section_id, self.cancel.child_token());
                let handle = tokio::spawn(async move { worker.sync_once().await });
                match self.run.as_mut() {
                    Some(run) => run.tasks.push(handle),
                    None => self.stopped.push(handle),
                }
                return StartOutcome::AlreadyEnded;
            }
        }

        self.stop_section();

        let mut timer = SectionTimer::new(section_id, duration_seconds);
        timer.start_optimistic();
        if let Ok(mut current) = self.current.lock() {
            *current = Some(timer);
        }

        let token = self.cancel.child_token();
        let worker = self.worker(section_id, token.clone());
        let tasks = vec![
            tokio::spawn(worker.clone().bootstrap()),
            tokio::spawn(worker.clone().tick_loop()),
            tokio::spawn(worker.sync_loop()),
        ];
        self.run = Some(SectionRun { token, tasks });

        info!(
            section = section_id,
            duration_seconds,
            "Section timer started"
        );
        StartOutcome::Started
    }

    /// Snapshot of the active section's timer
    pub fn state(&self) -> Option<SectionTimerState> {
        self.current
            .lock()
            .ok()
            .and_then(|current| current.as_ref().map(|timer| timer.state().clone()))
    }

    /// Stop the active section's tasks without waiting for them.
    ///
    /// The handles are kept until [`Self::shutdown`] awaits them.
    pub fn stop_section(&mut self) {
        self.stopped.retain(|task| !task.is_finished());
        if let Some(run) = self.run.take() {
            run.token.cancel();
            self.stopped.extend(run.tasks);
        }
    }

    /// Cancel everything and wait for the tasks of every section to exit
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.stop_section();
        for task in self.stopped.drain(..) {
            let _ = task.await;
        }
        debug!("Timer synchronizer shut down");
    }

    fn worker(&self, section_id: &str, token: CancellationToken) -> SectionWorker {
        SectionWorker {
            endpoint: self.endpoint.clone(),
            assessment_id: self.assessment_id.clone(),
            section_id: section_id.to_string(),
            config: self.config.clone(),
            current: self.current.clone(),
            events: self.events.clone(),
            token,
        }
    }
}

/// Task-side handle for one section
#[derive(Clone)]
struct SectionWorker {
    endpoint: Arc<dyn TimerEndpoint>,
    assessment_id: String,
    section_id: String,
    config: TimerConfig,
    current: Arc<Mutex<Option<SectionTimer>>>,
    events: mpsc::UnboundedSender<TimerEvent>,
    token: CancellationToken,
}

impl SectionWorker {
    /// Run `f` against the timer if it still belongs to this section
    fn with_timer<R>(&self, f: impl FnOnce(&mut SectionTimer) -> R) -> Option<R> {
        let mut current = self.current.lock().ok()?;
        match current.as_mut() {
            Some(timer) if timer.section_id() == self.section_id => Some(f(timer)),
            _ => None,
        }
    }

    fn emit(&self, event: TimerEvent) {
        // The session may already be gone.
        let _ = self.events.send(event);
    }

    fn apply(&self, reconciliation: Reconciliation) {
        let section_id = self.section_id.clone();
        match reconciliation {
            Reconciliation::Unchanged => {}
            Reconciliation::Corrected { from, to } => {
                debug!(section = %section_id, from, to, "Timer corrected from server");
                self.emit(TimerEvent::Corrected { section_id, from, to });
            }
            Reconciliation::Expired => {
                info!(section = %section_id, "Section time expired");
                self.emit(TimerEvent::Expired { section_id });
                self.token.cancel();
            }
            Reconciliation::Completed => {
                info!(section = %section_id, "Section completed on server");
                self.emit(TimerEvent::Completed { section_id });
                self.token.cancel();
            }
        }
    }

    async fn fetch(&self) -> Option<TimerSnapshot> {
        let request = self.endpoint.get_timer(&self.assessment_id, &self.section_id);
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => return None,
            result = request => result,
        };
        match result {
            Ok(Some(snapshot)) => Some(snapshot),
            Ok(None) => {
                debug!(section = %self.section_id, "Server returned no timer data");
                None
            }
            Err(e) => {
                debug!(section = %self.section_id, error = %e, "Timer sync failed");
                None
            }
        }
    }

    async fn fetch_with_retry(&self) -> Option<TimerSnapshot> {
        let backoff = self.config.retry_backoff();
        for attempt in 0..=self.config.sync_retries {
            if attempt > 0 {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return None,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            if let Some(snapshot) = self.fetch().await {
                return Some(snapshot);
            }
            if self.token.is_cancelled() {
                return None;
            }
        }
        None
    }

    /// Server start and first sync, issued together
    async fn bootstrap(self) {
        let start = self.endpoint.start_section(&self.assessment_id, &self.section_id);
        let (started, snapshot) = tokio::select! {
            biased;
            _ = self.token.cancelled() => return,
            pair = async { tokio::join!(start, self.fetch()) } => pair,
        };

        let mut conflict = false;
        match started {
            Ok(ack) => {
                if let Some(reconciliation) = self.with_timer(|timer| timer.apply_start(&ack)) {
                    self.apply(reconciliation);
                }
            }
            Err(IntegrityError::SectionAlreadyStarted(_)) => {
                info!(section = %self.section_id, "Section already started on server; using server timer");
                conflict = true;
            }
            Err(e) => {
                warn!(section = %self.section_id, error = %e, "Section start request failed; counting down locally");
            }
        }

        let drift = self.config.drift_threshold_secs;
        match snapshot {
            Some(snapshot) => {
                let reconciliation = self.with_timer(|timer| {
                    if conflict {
                        timer.adopt(&snapshot)
                    } else {
                        timer.reconcile(&snapshot, drift)
                    }
                });
                if let Some(reconciliation) = reconciliation {
                    self.apply(reconciliation);
                }
            }
            None if conflict => self.fall_back_to_pending(),
            None => {}
        }
    }

    async fn tick_loop(self) {
        let period = self.config.tick();
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => break,

                _ = ticker.tick() => {
                    match self.with_timer(|timer| timer.tick()) {
                        Some(TickOutcome::Expired) => {
                            self.apply(Reconciliation::Expired);
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
    }

    async fn sync_loop(self) {
        let period = self.config.sync_interval();
        let drift = self.config.drift_threshold_secs;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.with_timer(|timer| timer.is_terminal()) != Some(false) {
                break;
            }

            match self.fetch_with_retry().await {
                Some(snapshot) => {
                    if let Some(reconciliation) = self.with_timer(|timer| timer.reconcile(&snapshot, drift)) {
                        self.apply(reconciliation);
                    }
                }
                None if self.token.is_cancelled() => break,
                None => self.fall_back_to_pending(),
            }
        }
    }

    async fn sync_once(self) {
        let drift = self.config.drift_threshold_secs;
        if let Some(snapshot) = self.fetch().await {
            if let Some(reconciliation) = self.with_timer(|timer| timer.reconcile(&snapshot, drift)) {
                self.apply(reconciliation);
            }
        }
    }

    fn fall_back_to_pending(&self) {
        if self.with_timer(|timer| timer.mark_sync_pending()) == Some(true) {
            warn!(section = %self.section_id, "No server timer data; showing sync pending");
            self.emit(TimerEvent::SyncPending {
                section_id: self.section_id.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::types::{TimerDisplay, TimerStatus};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn synchronizer(
        backend: &Arc<InMemoryBackend>,
    ) -> (TimerSynchronizer, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sync = TimerSynchronizer::new(
            backend.clone(),
            "a1",
            TimerConfig::default(),
            tx,
            CancellationToken::new(),
        );
        (sync, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_display_before_server_answers() {
        let backend = Arc::new(InMemoryBackend::new().with_section("s1", 600));
        let (mut sync, _rx) = synchronizer(&backend);

        assert_eq!(sync.start("s1", 600), StartOutcome::Started);
        let state = sync.state().unwrap();
        assert_eq!(state.display(), TimerDisplay::Remaining(600));
        assert_eq!(state.status, TimerStatus::Running);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(sync.state().unwrap().time_remaining_seconds, 597);
        assert!(sync.state().unwrap().started_at.is_some());
        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_section_expires_locally() {
        let backend = Arc::new(InMemoryBackend::new().with_section("s1", 3));
        backend.set_offline(true);
        let (mut sync, mut rx) = synchronizer(&backend);
        let began = Instant::now();

        sync.start("s1", 3);
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            TimerEvent::Expired {
                section_id: "s1".to_string()
            }
        );
        assert!(began.elapsed() < Duration::from_secs(5));
        assert_eq!(sync.state().unwrap().time_remaining_seconds, 0);

        // Expiry is reported once and the loops stop.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(backend.timer_calls(), 1);
        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_show_sync_pending_then_recover() {
        let backend = Arc::new(InMemoryBackend::new().with_section("s1", 600));
        let (mut sync, mut rx) = synchronizer(&backend);

        sync.start("s1", 600);
        tokio::time::sleep(Duration::from_millis(10)).await;
        backend.set_offline(true);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            TimerEvent::SyncPending {
                section_id: "s1".to_string()
            }
        );
        assert_eq!(sync.state().unwrap().display(), TimerDisplay::SyncPending);
        // One initial attempt plus the configured retries.
        assert_eq!(backend.timer_calls(), 1 + 1 + 3);

        backend.set_offline(false);
        match rx.recv().await.unwrap() {
            TimerEvent::Corrected { to, .. } => assert!((589..=591).contains(&to)),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(sync.state().unwrap().status, TimerStatus::Running);
        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_loss_after_start_still_expires_on_time() {
        let backend = Arc::new(InMemoryBackend::new().with_section("s1", 60));
        let (mut sync, mut rx) = synchronizer(&backend);
        let began = Instant::now();

        sync.start("s1", 60);
        tokio::time::sleep(Duration::from_millis(10)).await;
        backend.set_offline(true);

        assert_eq!(
            rx.recv().await.unwrap(),
            TimerEvent::SyncPending {
                section_id: "s1".to_string()
            }
        );
        let pending = sync.state().unwrap();
        assert_eq!(pending.status, TimerStatus::Running);
        assert_eq!(pending.display(), TimerDisplay::SyncPending);

        assert_eq!(
            rx.recv().await.unwrap(),
            TimerEvent::Expired {
                section_id: "s1".to_string()
            }
        );
        assert!(began.elapsed() <= Duration::from_secs(61));
        let state = sync.state().unwrap();
        assert_eq!(state.status, TimerStatus::Expired);
        assert_eq!(state.time_remaining_seconds, 0);

        let calls = backend.timer_calls();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(backend.timer_calls(), calls);
        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_completion_ends_section() {
        let backend = Arc::new(InMemoryBackend::new().with_section("s1", 600));
        let (mut sync, mut rx) = synchronizer(&backend);

        sync.start("s1", 600);
        tokio::time::sleep(Duration::from_millis(10)).await;
        backend.complete_section("s1");

        assert_eq!(
            rx.recv().await.unwrap(),
            TimerEvent::Completed {
                section_id: "s1".to_string()
            }
        );
        assert_eq!(sync.state().unwrap().status, TimerStatus::Completed);
        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_start_is_idempotent() {
        let backend = Arc::new(InMemoryBackend::new().with_section("s1", 600));
        let (mut sync, _rx) = synchronizer(&backend);

        assert_eq!(sync.start("s1", 600), StartOutcome::Started);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sync.start("s1", 600), StartOutcome::AlreadyRunning);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.start_calls(), 1);
        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_conflict_adopts_server_timer() {
        let backend = Arc::new(InMemoryBackend::new().with_section("s1", 600));
        backend.start_section("a1", "s1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(100)).await;

        let (mut sync, mut rx) = synchronizer(&backend);
        sync.start("s1", 600);

        assert_eq!(
            rx.recv().await.unwrap(),
            TimerEvent::Corrected {
                section_id: "s1".to_string(),
                from: 600,
                to: 500
            }
        );
        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_awaits_replaced_sections() {
        let backend = Arc::new(
            InMemoryBackend::new()
                .with_section("s1", 600)
                .with_section("s2", 600),
        );
        let (mut sync, _rx) = synchronizer(&backend);

        sync.start("s1", 600);
        tokio::time::sleep(Duration::from_secs(2)).await;
        sync.start("s2", 600);
        assert_eq!(sync.stopped.len(), 3);
        assert_eq!(sync.state().unwrap().section_id, "s2");

        sync.shutdown().await;
        assert!(sync.run.is_none());
        assert!(sync.stopped.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_all_timer_requests() {
        let backend = Arc::new(InMemoryBackend::new().with_section("s1", 600));
        let (mut sync, _rx) = synchronizer(&backend);

        sync.start("s1", 600);
        tokio::time::sleep(Duration::from_secs(6)).await;
        sync.shutdown().await;

        let timer_calls = backend.timer_calls();
        let start_calls = backend.start_calls();
        let remaining = sync.state().unwrap().time_remaining_seconds;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.timer_calls(), timer_calls);
        assert_eq!(backend.start_calls(), start_calls);
        assert_eq!(sync.state().unwrap().time_remaining_seconds, remaining);
    }
}
