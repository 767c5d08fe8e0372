//! Session orchestration
//!
//! [`ProctoringSession`] is the top-level state machine
//! (`Setup → InProgress → {Submitted, Terminated}`). It arms and disarms the
//! adapters, the vision pump, the section timers, the reporter and the
//! heartbeat, and it is the only component that ends a session.
//!
//! Every session builds fresh instances of every stateful component; nothing
//! is shared between sessions except the external services.

use crate::adapters::{standard_adapters, AdapterSet, EventHost};
use crate::backend::{HeartbeatEndpoint, OutcomeStore, TimerEndpoint, ViolationSink};
use crate::classifier::ViolationClassifier;
use crate::config::EngineConfig;
use crate::error::IntegrityError;
use crate::reporter::{spawn_delivery, RetryPolicy, ViolationReporter};
use crate::timer::{TimerEvent, TimerSynchronizer};
use crate::types::{
    RawSignal, SectionTimerState, SessionOutcome, SessionPhase, SessionState, TerminationReason,
    Violation, ViolationType, VisionFrame,
};
use crate::vision::{spawn_frame_pump, VisionProvider};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;
const FRAME_BUFFER: usize = 8;

/// One timed section of an assessment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionPlan {
    pub section_id: String,
    pub duration_seconds: u32,
}

/// What the session runs: the assessment and its ordered sections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentPlan {
    pub assessment_id: String,
    pub session_token: String,
    pub sections: Vec<SectionPlan>,
}

/// Pre-flight results collected by the host before `begin`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupChecks {
    pub consent: bool,
    pub camera: bool,
    pub microphone: bool,
    pub browser_supported: bool,
}

impl SetupChecks {
    /// All checks passed
    pub fn passing() -> Self {
        Self {
            consent: true,
            camera: true,
            microphone: true,
            browser_supported: true,
        }
    }

    /// First failing check, as a setup error
    pub fn verify(&self) -> Result<(), IntegrityError> {
        let failed = if !self.consent {
            Some("consent not given")
        } else if !self.camera {
            Some("camera check failed")
        } else if !self.microphone {
            Some("microphone check failed")
        } else if !self.browser_supported {
            Some("browser not supported")
        } else {
            None
        };
        match failed {
            Some(reason) => Err(IntegrityError::SetupBlocked(reason.to_string())),
            None => Ok(()),
        }
    }
}

/// External collaborators a session talks to
#[derive(Clone)]
pub struct SessionServices {
    pub host: Arc<dyn EventHost>,
    /// `None` runs the session without vision monitoring
    pub vision: Option<Arc<dyn VisionProvider>>,
    pub violations: Arc<dyn ViolationSink>,
    pub timers: Arc<dyn TimerEndpoint>,
    /// Only used when `session.heartbeat_enabled` is set
    pub heartbeat: Option<Arc<dyn HeartbeatEndpoint>>,
    pub outcomes: Arc<dyn OutcomeStore>,
}

/// Notifications for whoever renders the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Emitted synchronously for every violation, whatever the network does
    ViolationRecorded(Violation),
    SectionStarted { section_id: String, index: usize },
    Timer(TimerEvent),
    Ended(SessionOutcome),
}

/// Result of entering a session
pub enum Entry {
    Fresh(ProctoringSession),
    /// The session already ended; route to its outcome instead
    Redirect(SessionOutcome),
}

struct Inbox {
    signals: mpsc::UnboundedReceiver<RawSignal>,
    frames: mpsc::Receiver<VisionFrame>,
    timer: mpsc::UnboundedReceiver<TimerEvent>,
}

/// A single proctored session
pub struct ProctoringSession {
    plan: AssessmentPlan,
    config: EngineConfig,
    services: SessionServices,
    state: SessionState,
    outcome: Option<SessionOutcome>,
    classifier: ViolationClassifier,
    reporter: Arc<ViolationReporter>,
    timer: TimerSynchronizer,
    section_index: usize,
    cancel: CancellationToken,
    adapters: Option<AdapterSet>,
    signals_tx: mpsc::UnboundedSender<RawSignal>,
    frames_tx: mpsc::Sender<VisionFrame>,
    violations_tx: mpsc::UnboundedSender<Violation>,
    violations_rx: Option<mpsc::UnboundedReceiver<Violation>>,
    inbox: Option<Inbox>,
    events: broadcast::Sender<SessionEvent>,
    delivery: Option<JoinHandle<Vec<Violation>>>,
    tasks: Vec<JoinHandle<()>>,
    undelivered: Vec<Violation>,
    disarmed: bool,
}

impl ProctoringSession {
    /// Enter a session.
    ///
    /// If the outcome store already holds an outcome for the session token,
    /// nothing is armed and the stored outcome is returned.
    ///
    /// # Arguments
    /// * `plan` - Assessment id, session token and ordered sections
    /// * `config` - Engine configuration (validated here)
    /// * `services` - External collaborators
    ///
    /// # Example
    /// ```ignore
    /// match ProctoringSession::enter(plan, config, services)? {
    ///     Entry::Fresh(mut session) => {
    ///         session.begin(&SetupChecks::passing()).await?;
    ///         let final_state = session.run().await?;
    ///     }
    ///     Entry::Redirect(outcome) => show_result(outcome),
    /// }
    /// ```
    pub fn enter(
        plan: AssessmentPlan,
        config: EngineConfig,
        services: SessionServices,
    ) -> Result<Entry, IntegrityError> {
        config.validate()?;
        if plan.sections.is_empty() {
            return Err(IntegrityError::Config(
                "assessment has no sections".to_string(),
            ));
        }

        if let Some(outcome) = services.outcomes.lookup(&plan.session_token) {
            info!(
                phase = outcome.phase.as_str(),
                reason = outcome.reason.as_code(),
                "Session already ended; redirecting"
            );
            return Ok(Entry::Redirect(outcome));
        }

        Ok(Entry::Fresh(Self::new(plan, config, services)))
    }

    fn new(plan: AssessmentPlan, config: EngineConfig, services: SessionServices) -> Self {
        let cancel = CancellationToken::new();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (violations_tx, violations_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let classifier = ViolationClassifier::new(config.policy.clone(), config.vision.clone());
        let reporter = Arc::new(ViolationReporter::new(
            services.violations.clone(),
            plan.session_token.clone(),
            RetryPolicy::from_config(&config.reporter),
        ));
        let timer = TimerSynchronizer::new(
            services.timers.clone(),
            plan.assessment_id.clone(),
            config.timer.clone(),
            timer_tx,
            cancel.clone(),
        );

        Self {
            plan,
            config,
            services,
            state: SessionState::default(),
            outcome: None,
            classifier,
            reporter,
            timer,
            section_index: 0,
            cancel,
            adapters: None,
            signals_tx,
            frames_tx,
            violations_tx,
            violations_rx: Some(violations_rx),
            inbox: Some(Inbox {
                signals: signals_rx,
                frames: frames_rx,
                timer: timer_rx,
            }),
            events,
            delivery: None,
            tasks: Vec::new(),
            undelivered: Vec::new(),
            disarmed: false,
        }
    }

    /// Run setup checks and arm monitoring.
    ///
    /// This is the single gate that attaches adapters and starts the vision
    /// pump, the first section timer, the fullscreen probe and the reporter.
    /// When a vision provider is configured it must initialize, load the
    /// reference image (if one is configured) and return a camera snapshot.
    pub async fn begin(&mut self, checks: &SetupChecks) -> Result<(), IntegrityError> {
        self.expect_phase(SessionPhase::Setup, "begin")?;
        checks.verify()?;

        if let Some(vision) = self.vision_provider() {
            if !vision.initialize(&self.config.vision).await {
                return Err(IntegrityError::SetupBlocked(
                    "vision inference unavailable".to_string(),
                ));
            }
            if let Some(url) = self.config.vision.reference_image_url.as_deref() {
                if !vision.load_reference_image(url).await {
                    return Err(IntegrityError::SetupBlocked(
                        "reference image could not be loaded".to_string(),
                    ));
                }
            }
            if vision.capture_snapshot().await.is_none() {
                return Err(IntegrityError::SetupBlocked(
                    "camera snapshot unavailable".to_string(),
                ));
            }
        }

        self.arm().await;
        Ok(())
    }

    async fn arm(&mut self) {
        let mut adapters = AdapterSet::new(self.services.host.clone(), self.signals_tx.clone());
        for adapter in standard_adapters(&self.config.policy) {
            adapters.attach(adapter);
        }
        self.adapters = Some(adapters);

        if let Some(vision) = self.vision_provider() {
            vision.start(&self.config.vision.video_source).await;
            self.tasks.push(spawn_frame_pump(
                vision,
                &self.config.vision,
                self.frames_tx.clone(),
                self.cancel.clone(),
            ));
        }

        if let Some(violations) = self.violations_rx.take() {
            self.delivery = Some(spawn_delivery(
                self.reporter.clone(),
                violations,
                self.cancel.clone(),
            ));
        }

        if self.config.session.heartbeat_enabled {
            if let Some(endpoint) = self.services.heartbeat.clone() {
                self.tasks.push(spawn_heartbeat(
                    endpoint,
                    self.plan.session_token.clone(),
                    self.config.session.heartbeat_interval(),
                    self.cancel.clone(),
                ));
            }
        }

        self.state.phase = SessionPhase::InProgress;
        info!(
            assessment = %self.plan.assessment_id,
            sections = self.plan.sections.len(),
            vision = self.vision_provider().is_some(),
            "Session started"
        );
        self.start_section(0);
    }

    /// Drive every input until the session ends or is cancelled.
    ///
    /// Not cancel-safe: stop it through [`Self::cancellation_token`] rather
    /// than by dropping the future. Returns the final state after teardown.
    pub async fn run(&mut self) -> Result<SessionState, IntegrityError> {
        self.expect_phase(SessionPhase::InProgress, "run")?;
        let mut inbox = self.inbox.take().ok_or_else(|| IntegrityError::InvalidTransition {
            phase: self.state.phase.as_str().to_string(),
            action: "run twice".to_string(),
        })?;

        let cancel = self.cancel.clone();
        let probe_enabled = self.config.policy.require_fullscreen;
        let probe_period = self.config.policy.fullscreen_poll();
        let mut probe = interval_at(Instant::now() + probe_period, probe_period);

        while !self.state.phase.is_terminal() {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(event) = inbox.timer.recv() => self.on_timer_event(event),

                Some(signal) = inbox.signals.recv() => {
                    self.on_signal(&signal);
                }

                Some(frame) = inbox.frames.recv() => {
                    self.on_frame(&frame);
                }

                _ = probe.tick(), if probe_enabled => {
                    let active = self.services.host.is_fullscreen();
                    self.on_fullscreen_probe(active, Utc::now());
                }

                else => break,
            }
        }

        self.inbox = Some(inbox);
        self.shutdown().await;
        Ok(self.state.clone())
    }

    /// Handle everything already queued without waiting.
    ///
    /// Returns how many inputs were handled.
    pub fn process_pending(&mut self) -> usize {
        let Some(mut inbox) = self.inbox.take() else {
            return 0;
        };

        let mut handled = 0;
        while !self.state.phase.is_terminal() {
            if let Ok(event) = inbox.timer.try_recv() {
                self.on_timer_event(event);
            } else if let Ok(signal) = inbox.signals.try_recv() {
                self.on_signal(&signal);
            } else if let Ok(frame) = inbox.frames.try_recv() {
                self.on_frame(&frame);
            } else {
                break;
            }
            handled += 1;
        }

        self.inbox = Some(inbox);
        handled
    }

    /// Classify one host signal and apply the termination policy
    pub fn on_signal(&mut self, signal: &RawSignal) -> Option<Violation> {
        if self.state.phase != SessionPhase::InProgress {
            return None;
        }
        let violation = self.classifier.classify_signal(signal)?;
        self.record(violation.clone());

        if violation.kind == ViolationType::TabSwitch
            && violation.severity_count > self.classifier.tab_switch_limit()
        {
            self.finish(SessionPhase::Terminated, TerminationReason::TabSwitchLimitExceeded);
        }
        Some(violation)
    }

    /// Classify one vision frame
    pub fn on_frame(&mut self, frame: &VisionFrame) -> Vec<Violation> {
        if self.state.phase != SessionPhase::InProgress {
            return Vec::new();
        }
        let violations = self.classifier.classify_frame(frame);
        for violation in &violations {
            self.record(violation.clone());
        }
        violations
    }

    /// Result of one fullscreen probe.
    ///
    /// `at` is on the same wall-clock UTC timeline as host event timestamps;
    /// the probe and the fullscreen adapter share one cool-down.
    pub fn on_fullscreen_probe(&mut self, active: bool, at: DateTime<Utc>) -> Option<Violation> {
        if self.state.phase != SessionPhase::InProgress {
            return None;
        }
        let violation = self.classifier.probe_fullscreen(active, at)?;
        self.record(violation.clone());
        Some(violation)
    }

    /// React to a timer transition of the active section.
    ///
    /// Events for any other section are stale and ignored.
    pub fn on_timer_event(&mut self, event: TimerEvent) {
        if self.state.phase != SessionPhase::InProgress {
            return;
        }
        let current = self
            .plan
            .sections
            .get(self.section_index)
            .map(|section| section.section_id.as_str());
        if current != Some(event.section_id()) {
            debug!(section = event.section_id(), "Ignoring stale timer event");
            return;
        }

        let ended = match &event {
            TimerEvent::Expired { .. } => Some(TerminationReason::TimeExpired),
            TimerEvent::Completed { .. } => Some(TerminationReason::Submitted),
            TimerEvent::Corrected { .. } | TimerEvent::SyncPending { .. } => None,
        };
        self.publish(SessionEvent::Timer(event));

        if let Some(reason) = ended {
            self.section_ended(reason);
        }
    }

    /// Move to the next section ahead of its timer
    pub fn advance_section(&mut self) -> Result<(), IntegrityError> {
        self.expect_phase(SessionPhase::InProgress, "advance")?;
        let next = self.section_index + 1;
        if next >= self.plan.sections.len() {
            return Err(IntegrityError::InvalidTransition {
                phase: self.state.phase.as_str().to_string(),
                action: "advance past the final section".to_string(),
            });
        }
        self.start_section(next);
        Ok(())
    }

    /// Explicit submission by the candidate
    pub fn submit(&mut self) -> Result<SessionOutcome, IntegrityError> {
        self.expect_phase(SessionPhase::InProgress, "submit")?;
        Ok(self.finish(SessionPhase::Submitted, TerminationReason::Submitted))
    }

    /// Stop everything now. Idempotent and synchronous; call
    /// [`Self::shutdown`] to also wait for background tasks.
    pub fn disarm(&mut self) {
        if self.disarmed {
            return;
        }
        self.disarmed = true;
        self.cancel.cancel();
        self.timer.stop_section();
        if let Some(mut adapters) = self.adapters.take() {
            adapters.detach_all();
        }
        debug!("Session disarmed");
    }

    /// Disarm and wait for every background task to exit.
    ///
    /// Violations still undelivered after the final attempt are kept in
    /// [`Self::undelivered`].
    pub async fn shutdown(&mut self) {
        self.disarm();
        self.timer.shutdown().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        if let Some(delivery) = self.delivery.take() {
            if let Ok(remaining) = delivery.await {
                self.undelivered = remaining;
            }
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    /// Timer of the active section
    pub fn timer_state(&self) -> Option<SectionTimerState> {
        self.timer.state()
    }

    pub fn current_section(&self) -> Option<&SectionPlan> {
        self.plan.sections.get(self.section_index)
    }

    pub fn reporter(&self) -> &Arc<ViolationReporter> {
        &self.reporter
    }

    pub fn classifier(&self) -> &ViolationClassifier {
        &self.classifier
    }

    pub fn undelivered(&self) -> &[Violation] {
        &self.undelivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Cancelling this token stops `run` and every background task
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn vision_provider(&self) -> Option<Arc<dyn VisionProvider>> {
        if !self.config.vision.enabled {
            return None;
        }
        self.services.vision.clone()
    }

    fn expect_phase(&self, phase: SessionPhase, action: &str) -> Result<(), IntegrityError> {
        if self.state.phase == phase {
            Ok(())
        } else {
            Err(IntegrityError::InvalidTransition {
                phase: self.state.phase.as_str().to_string(),
                action: action.to_string(),
            })
        }
    }

    fn start_section(&mut self, index: usize) {
        let Some(section) = self.plan.sections.get(index).cloned() else {
            return;
        };
        self.section_index = index;
        self.timer.start(&section.section_id, section.duration_seconds);
        self.publish(SessionEvent::SectionStarted {
            section_id: section.section_id,
            index,
        });
    }

    fn section_ended(&mut self, reason: TerminationReason) {
        if self.section_index + 1 < self.plan.sections.len() {
            self.start_section(self.section_index + 1);
            return;
        }
        match reason {
            TerminationReason::TimeExpired if !self.config.session.submit_on_final_expiry => {
                self.finish(SessionPhase::Terminated, reason);
            }
            _ => {
                self.finish(SessionPhase::Submitted, reason);
            }
        }
    }

    fn record(&mut self, violation: Violation) {
        self.state.violation_total += 1;
        warn!(
            violation = %violation.kind,
            count = violation.severity_count,
            total = self.state.violation_total,
            "{}",
            violation.message
        );
        // The delivery worker is gone only after teardown.
        let _ = self.violations_tx.send(violation.clone());
        self.publish(SessionEvent::ViolationRecorded(violation));
    }

    fn finish(&mut self, phase: SessionPhase, reason: TerminationReason) -> SessionOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        self.state.phase = phase;
        self.state.termination_reason = Some(reason);
        let outcome = SessionOutcome {
            phase,
            reason,
            violation_total: self.state.violation_total,
            ended_at: Utc::now(),
        };
        self.outcome = Some(outcome.clone());

        self.disarm();
        self.services
            .outcomes
            .record(&self.plan.session_token, &outcome);
        info!(
            phase = phase.as_str(),
            reason = reason.as_code(),
            violations = self.state.violation_total,
            "Session ended"
        );
        self.publish(SessionEvent::Ended(outcome.clone()));
        outcome
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for ProctoringSession {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn spawn_heartbeat(
    endpoint: Arc<dyn HeartbeatEndpoint>,
    session_token: String,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let beat = endpoint.heartbeat(&session_token);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = beat => {
                    if let Err(e) = result {
                        debug!(error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{HostEvent, HostEventKind, SimulatedHost};
    use crate::backend::InMemoryBackend;
    use crate::types::TimerStatus;
    use crate::vision::testing::ScriptedVision;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::sync::atomic::Ordering;

    struct Fixture {
        host: Arc<SimulatedHost>,
        backend: Arc<InMemoryBackend>,
        vision: Arc<ScriptedVision>,
    }

    impl Fixture {
        fn new(sections: &[(&str, u32)]) -> Self {
            let mut backend = InMemoryBackend::new();
            for (id, limit) in sections {
                backend = backend.with_section(id, *limit);
            }
            let host = Arc::new(SimulatedHost::new());
            host.set_fullscreen(true);
            Self {
                host,
                backend: Arc::new(backend),
                vision: Arc::new(ScriptedVision::healthy()),
            }
        }

        fn services(&self, with_vision: bool) -> SessionServices {
            SessionServices {
                host: self.host.clone(),
                vision: if with_vision {
                    Some(self.vision.clone())
                } else {
                    None
                },
                violations: self.backend.clone(),
                timers: self.backend.clone(),
                heartbeat: Some(self.backend.clone()),
                outcomes: self.backend.clone(),
            }
        }
    }

    fn plan(sections: &[(&str, u32)]) -> AssessmentPlan {
        AssessmentPlan {
            assessment_id: "a1".to_string(),
            session_token: "tok-1".to_string(),
            sections: sections
                .iter()
                .map(|(id, secs)| SectionPlan {
                    section_id: id.to_string(),
                    duration_seconds: *secs,
                })
                .collect(),
        }
    }

    fn fresh(entry: Entry) -> ProctoringSession {
        match entry {
            Entry::Fresh(session) => session,
            Entry::Redirect(outcome) => panic!("unexpected redirect: {:?}", outcome),
        }
    }

    fn at(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(sec as i64)
    }

    fn hidden(sec: u32) -> HostEvent {
        HostEvent::new(HostEventKind::VisibilityChange { hidden: true }, at(sec))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_tab_switch_terminates_with_limit_three() {
        let sections = [("s1", 600)];
        let fx = Fixture::new(&sections);
        let mut session = fresh(
            ProctoringSession::enter(plan(&sections), EngineConfig::default(), fx.services(false))
                .unwrap(),
        );
        session.begin(&SetupChecks::passing()).await.unwrap();
        assert_eq!(session.state().phase, SessionPhase::InProgress);

        for i in 0..3 {
            fx.host.dispatch(hidden(i * 6));
        }
        session.process_pending();
        // Reaching the limit is tolerated.
        assert_eq!(session.state().phase, SessionPhase::InProgress);
        assert_eq!(session.state().violation_total, 3);
        assert_eq!(session.classifier().count(ViolationType::TabSwitch), 3);
        assert!(session.outcome().is_none());
        assert_eq!(fx.host.listener_count(), 5);

        fx.host.dispatch(hidden(18));
        let final_state = session.run().await.unwrap();

        assert_eq!(final_state.phase, SessionPhase::Terminated);
        assert_eq!(
            final_state.termination_reason,
            Some(TerminationReason::TabSwitchLimitExceeded)
        );
        assert_eq!(final_state.violation_total, 4);
        assert_eq!(fx.host.listener_count(), 0);

        let persisted = fx.backend.persisted();
        assert_eq!(persisted.len(), 4);
        assert!(persisted
            .iter()
            .all(|p| p.violation_type == ViolationType::TabSwitch));
        assert_eq!(persisted[3].detail["severity_count"], 4);
        assert!(persisted[3].detail["message"]
            .as_str()
            .unwrap()
            .starts_with("Critical"));
        assert_eq!(
            fx.backend.lookup("tok-1").map(|o| o.reason),
            Some(TerminationReason::TabSwitchLimitExceeded)
        );
    }

    /// Violation sink that never answers
    struct UnresponsiveSink;

    #[async_trait::async_trait]
    impl ViolationSink for UnresponsiveSink {
        async fn persist(
            &self,
            _session_token: &str,
            _violation_type: ViolationType,
            _detail: &serde_json::Value,
        ) -> Result<(), IntegrityError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_completes_when_sink_never_answers() {
        let sections = [("s1", 600)];
        let fx = Fixture::new(&sections);
        let services = SessionServices {
            violations: Arc::new(UnresponsiveSink),
            ..fx.services(false)
        };
        let mut session = fresh(
            ProctoringSession::enter(plan(&sections), EngineConfig::default(), services).unwrap(),
        );
        session.begin(&SetupChecks::passing()).await.unwrap();

        fx.host.dispatch(HostEvent::new(HostEventKind::Blur, at(0)));
        session.process_pending();
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.submit().unwrap();

        tokio::time::timeout(Duration::from_secs(3600), session.shutdown())
            .await
            .expect("shutdown blocked on the violation sink");
        assert_eq!(session.state().phase, SessionPhase::Submitted);
        let undelivered: Vec<ViolationType> = session.undelivered().iter().map(|v| v.kind).collect();
        assert_eq!(undelivered, vec![ViolationType::WindowBlur]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tab_switches_inside_cool_down_do_not_count() {
        let sections = [("s1", 600)];
        let fx = Fixture::new(&sections);
        let mut session = fresh(
            ProctoringSession::enter(plan(&sections), EngineConfig::default(), fx.services(false))
                .unwrap(),
        );
        session.begin(&SetupChecks::passing()).await.unwrap();

        for i in 0..8 {
            fx.host.dispatch(hidden(i));
        }
        session.process_pending();

        assert_eq!(session.state().phase, SessionPhase::InProgress);
        assert_eq!(session.classifier().count(ViolationType::TabSwitch), 2);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_stops_every_task() {
        let sections = [("s1", 600)];
        let fx = Fixture::new(&sections);
        let config = EngineConfig {
            session: crate::config::SessionConfig {
                heartbeat_enabled: true,
                ..Default::default()
            },
            ..EngineConfig::default()
        };
        let mut session = fresh(
            ProctoringSession::enter(plan(&sections), config, fx.services(true)).unwrap(),
        );
        session.begin(&SetupChecks::passing()).await.unwrap();
        assert!(fx.vision.started.load(Ordering::SeqCst));
        assert_eq!(fx.host.listener_count(), 5);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(fx.backend.heartbeat_calls() >= 1);

        let outcome = session.submit().unwrap();
        assert_eq!(outcome.reason, TerminationReason::Submitted);
        session.shutdown().await;
        // Idempotent.
        session.disarm();
        session.shutdown().await;

        assert_eq!(fx.host.listener_count(), 0);
        assert!(fx.vision.stopped.load(Ordering::SeqCst));
        let timer_calls = fx.backend.timer_calls();
        let heartbeats = fx.backend.heartbeat_calls();
        let polls = fx.vision.polls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fx.backend.timer_calls(), timer_calls);
        assert_eq!(fx.backend.heartbeat_calls(), heartbeats);
        assert_eq!(fx.vision.polls.load(Ordering::SeqCst), polls);

        // Terminal states are irreversible.
        assert!(session.submit().is_err());
        assert!(session.advance_section().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reentry_redirects_to_stored_outcome() {
        let sections = [("s1", 600)];
        let fx = Fixture::new(&sections);
        let mut session = fresh(
            ProctoringSession::enter(plan(&sections), EngineConfig::default(), fx.services(false))
                .unwrap(),
        );
        session.begin(&SetupChecks::passing()).await.unwrap();
        session.submit().unwrap();
        session.shutdown().await;

        let entry =
            ProctoringSession::enter(plan(&sections), EngineConfig::default(), fx.services(false))
                .unwrap();
        match entry {
            Entry::Redirect(outcome) => {
                assert_eq!(outcome.phase, SessionPhase::Submitted);
                assert_eq!(outcome.reason.as_code(), "submitted");
            }
            Entry::Fresh(_) => panic!("expected redirect"),
        }
        assert_eq!(fx.host.listener_count(), 0);
        assert_eq!(fx.backend.start_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_blocked_arms_nothing() {
        let sections = [("s1", 600)];
        let fx = Fixture::new(&sections);
        let mut session = fresh(
            ProctoringSession::enter(plan(&sections), EngineConfig::default(), fx.services(false))
                .unwrap(),
        );
        let checks = SetupChecks {
            consent: false,
            ..SetupChecks::passing()
        };
        assert!(matches!(
            session.begin(&checks).await,
            Err(IntegrityError::SetupBlocked(_))
        ));

        let camera_less = Fixture {
            vision: Arc::new(ScriptedVision {
                camera_ok: false,
                ..ScriptedVision::healthy()
            }),
            ..Fixture::new(&sections)
        };
        let mut session = fresh(
            ProctoringSession::enter(
                plan(&sections),
                EngineConfig::default(),
                camera_less.services(true),
            )
            .unwrap(),
        );
        assert!(matches!(
            session.begin(&SetupChecks::passing()).await,
            Err(IntegrityError::SetupBlocked(_))
        ));
        assert_eq!(session.state().phase, SessionPhase::Setup);
        assert_eq!(camera_less.host.listener_count(), 0);
        assert!(!camera_less.vision.started.load(Ordering::SeqCst));
        assert_eq!(camera_less.backend.start_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_section_expiry_submits() {
        let sections = [("s1", 2), ("s2", 3)];
        let fx = Fixture::new(&sections);
        let mut session = fresh(
            ProctoringSession::enter(plan(&sections), EngineConfig::default(), fx.services(false))
                .unwrap(),
        );
        let mut events = session.subscribe();
        session.begin(&SetupChecks::passing()).await.unwrap();

        let final_state = session.run().await.unwrap();
        assert_eq!(final_state.phase, SessionPhase::Submitted);
        assert_eq!(final_state.termination_reason, Some(TerminationReason::TimeExpired));
        assert_eq!(fx.backend.start_calls(), 2);

        let mut started = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::SectionStarted { section_id, .. } = event {
                started.push(section_id);
            }
        }
        assert_eq!(started, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_expiry_terminates_without_auto_submit() {
        let sections = [("s1", 2)];
        let fx = Fixture::new(&sections);
        let config = EngineConfig {
            session: crate::config::SessionConfig {
                submit_on_final_expiry: false,
                ..Default::default()
            },
            ..EngineConfig::default()
        };
        let mut session =
            fresh(ProctoringSession::enter(plan(&sections), config, fx.services(false)).unwrap());
        session.begin(&SetupChecks::passing()).await.unwrap();

        let final_state = session.run().await.unwrap();
        assert_eq!(final_state.phase, SessionPhase::Terminated);
        assert_eq!(final_state.termination_reason, Some(TerminationReason::TimeExpired));
        assert_eq!(
            session.timer_state().map(|t| t.status),
            Some(TimerStatus::Expired)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_vision_frames_become_violations() {
        let sections = [("s1", 600)];
        let fx = Fixture::new(&sections);
        fx.vision.push(Ok(Some(VisionFrame {
            face_count: 0,
            identity_score: 0.0,
            gaze_deviation: 0.0,
            detected_objects: BTreeSet::from(["Cell Phone".to_string()]),
            captured_at: at(1),
        })));
        let mut session = fresh(
            ProctoringSession::enter(plan(&sections), EngineConfig::default(), fx.services(true))
                .unwrap(),
        );
        session.begin(&SetupChecks::passing()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        session.process_pending();

        let kinds: Vec<ViolationType> = session.classifier().counts().keys().copied().collect();
        assert_eq!(
            kinds,
            vec![ViolationType::NoFace, ViolationType::ProhibitedObject]
        );
        assert_eq!(session.state().violation_total, 2);
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fullscreen_probe_and_stale_timer_events() {
        let sections = [("s1", 600), ("s2", 600)];
        let fx = Fixture::new(&sections);
        let mut session = fresh(
            ProctoringSession::enter(plan(&sections), EngineConfig::default(), fx.services(false))
                .unwrap(),
        );
        session.begin(&SetupChecks::passing()).await.unwrap();

        assert!(session.on_fullscreen_probe(true, at(0)).is_none());
        assert!(session.on_fullscreen_probe(false, at(1)).is_some());
        assert!(session.on_fullscreen_probe(false, at(3)).is_none());

        session.advance_section().unwrap();
        assert_eq!(session.current_section().unwrap().section_id, "s2");
        session.on_timer_event(TimerEvent::Expired {
            section_id: "s1".to_string(),
        });
        assert_eq!(session.state().phase, SessionPhase::InProgress);
        assert!(session.advance_section().is_err());
        session.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fullscreen_poll_shares_cool_down_with_adapter() {
        let sections = [("s1", 600)];
        let fx = Fixture::new(&sections);
        let mut session = fresh(
            ProctoringSession::enter(plan(&sections), EngineConfig::default(), fx.services(false))
                .unwrap(),
        );
        session.begin(&SetupChecks::passing()).await.unwrap();

        fx.host.set_fullscreen(false);
        fx.host
            .dispatch(HostEvent::new(HostEventKind::FullscreenChange { active: false }, at(10)));
        session.process_pending();
        assert_eq!(session.classifier().count(ViolationType::FullscreenExit), 1);

        // Same timeline: the probe inside the adapter's cool-down is swallowed.
        assert!(session.on_fullscreen_probe(false, at(12)).is_none());
        let violation = session.on_fullscreen_probe(false, at(16)).unwrap();
        assert_eq!(violation.kind, ViolationType::FullscreenExit);
        assert_eq!(violation.severity_count, 2);
        session.shutdown().await;
    }
}
