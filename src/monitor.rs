//! The exam monitor.
//!
//! `ExamMonitor` owns every piece of per-session state: the ledger, the
//! escalation policy, the session state machine, the sensors and the timer
//! queue. All methods take `&mut self`, so the monitor is the single
//! critical section in which violations are accepted and escalation
//! decisions are made. Hosts feed it inputs with `handle`, drive its timers
//! with `tick`, and receive decisions through `MonitorCallbacks`.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;

use crate::channel::{
    ChannelEvent, ConnectionState, SecureChannelCoordinator, SecurityAlert,
};
use crate::clock::{Clock, TimerId, TimerQueue};
use crate::detect::{FaceDetection, SharedFaceDetector};
use crate::error::IntegrityError;
use crate::frame::FaceFrame;
use crate::identity::{new_reference_handle, IdentityConfig, IdentityVerifier, VerificationResult};
use crate::policy::{AutoSubmitState, EscalationPolicy, PolicyAction, PolicyConfig, SecondInfractionAction};
use crate::sensors::{
    FaceInferenceOutcome, HostRequest, InferenceTicket, InputVerdict, SensorConfig, SensorInput,
    SensorSet, SensorSignal,
};
use crate::session::{ExamSession, ExamSessionStateMachine, ExamStage, SubStage, SubmitReason};
use crate::storage::SharedProgressStore;
use crate::violation::{
    CandidateViolation, LedgerConfig, LedgerSummary, RiskLevel, SensorKind, Violation,
    ViolationKind, ViolationLedger,
};

/// Countdown notice shown before auto-submission.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Warning {
    pub message: String,
    pub countdown_ms: u64,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AutoSubmit {
    pub reason: SubmitReason,
    pub violations: Vec<Violation>,
}

/// Host hooks. Every hook defaults to a no-op.
pub trait MonitorCallbacks {
    fn on_violation(&mut self, _violation: &Violation) {}

    fn on_warning(&mut self, _warning: &Warning) {}

    fn on_auto_submit(&mut self, _submit: &AutoSubmit) {}

    fn on_security_alert(&mut self, _alert: &SecurityAlert) {}

    fn on_connection_state_change(&mut self, _state: ConnectionState) {}

    fn on_first_warning(&mut self, _violation: &Violation) {}

    fn on_second_infraction(&mut self, _violation: &Violation, _action: SecondInfractionAction) {}

    /// Fullscreen was left while required; block the UI until re-entered.
    fn on_fullscreen_required(&mut self) {}

    fn on_stage_change(&mut self, _stage: ExamStage) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCallbacks;

impl MonitorCallbacks for NoopCallbacks {}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    Violation { violation: Violation },
    Warning { warning: Warning },
    AutoSubmit { submit: AutoSubmit },
    SecurityAlert { alert: SecurityAlert },
    ConnectionState { state: ConnectionState },
    FirstWarning { kind: ViolationKind },
    SecondInfraction {
        kind: ViolationKind,
        action: SecondInfractionAction,
    },
    FullscreenRequired,
    StageChange { stage: ExamStage },
}

/// Records every callback in order. Used by tests and the replay tool.
#[derive(Clone, Debug, Default)]
pub struct RecordingCallbacks {
    pub events: Vec<MonitorEvent>,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn violations(&self) -> Vec<&Violation> {
        self.events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::Violation { violation } => Some(violation),
                _ => None,
            })
            .collect()
    }

    pub fn warnings(&self) -> Vec<&Warning> {
        self.events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::Warning { warning } => Some(warning),
                _ => None,
            })
            .collect()
    }

    pub fn auto_submits(&self) -> Vec<&AutoSubmit> {
        self.events
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::AutoSubmit { submit } => Some(submit),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&MonitorEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

impl MonitorCallbacks for RecordingCallbacks {
    fn on_violation(&mut self, violation: &Violation) {
        self.events.push(MonitorEvent::Violation {
            violation: violation.clone(),
        });
    }

    fn on_warning(&mut self, warning: &Warning) {
        self.events.push(MonitorEvent::Warning {
            warning: warning.clone(),
        });
    }

    fn on_auto_submit(&mut self, submit: &AutoSubmit) {
        self.events.push(MonitorEvent::AutoSubmit {
            submit: submit.clone(),
        });
    }

    fn on_security_alert(&mut self, alert: &SecurityAlert) {
        self.events.push(MonitorEvent::SecurityAlert {
            alert: alert.clone(),
        });
    }

    fn on_connection_state_change(&mut self, state: ConnectionState) {
        self.events.push(MonitorEvent::ConnectionState { state });
    }

    fn on_first_warning(&mut self, violation: &Violation) {
        self.events.push(MonitorEvent::FirstWarning {
            kind: violation.kind,
        });
    }

    fn on_second_infraction(&mut self, violation: &Violation, action: SecondInfractionAction) {
        self.events.push(MonitorEvent::SecondInfraction {
            kind: violation.kind,
            action,
        });
    }

    fn on_fullscreen_required(&mut self) {
        self.events.push(MonitorEvent::FullscreenRequired);
    }

    fn on_stage_change(&mut self, stage: ExamStage) {
        self.events.push(MonitorEvent::StageChange { stage });
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MonitorConfig {
    pub ledger: LedgerConfig,
    pub policy: PolicyConfig,
    pub sensors: SensorConfig,
    pub identity: IdentityConfig,
    pub sub_stages: Vec<SubStage>,
    /// Leaving fullscreen blocks sub-stage completion until re-entered.
    pub require_fullscreen: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            policy: PolicyConfig::default(),
            sensors: SensorConfig::default(),
            identity: IdentityConfig::default(),
            sub_stages: SubStage::DEFAULT_ORDER.to_vec(),
            require_fullscreen: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MonitorTimer {
    AutoSubmit,
    SensorPoll(usize),
}

pub struct ExamMonitor<H: MonitorCallbacks = NoopCallbacks> {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    callbacks: H,
    ledger: ViolationLedger,
    policy: EscalationPolicy,
    session: ExamSessionStateMachine,
    sensors: SensorSet,
    identity: IdentityVerifier,
    timers: TimerQueue<MonitorTimer>,
    auto_submit_timer: Option<TimerId>,
    channel: Option<SecureChannelCoordinator>,
    monitoring: bool,
    fullscreen_blocked: bool,
    pending_requests: Vec<HostRequest>,
}

impl<H: MonitorCallbacks> ExamMonitor<H> {
    /// Opens (or resumes) the session for `exam_id`. A resumed session in
    /// `Monitoring` needs `start_monitoring` to re-attach the sensors.
    ///
    /// The reference identity is never persisted. A resumed session has no
    /// reference, so `face_mismatch` cannot fire until the host runs a new
    /// identity check on a fresh session.
    pub fn new(
        exam_id: &str,
        config: MonitorConfig,
        store: SharedProgressStore,
        clock: Arc<dyn Clock>,
        callbacks: H,
    ) -> Result<Self> {
        let now = clock.now_ms();
        let session =
            ExamSessionStateMachine::open(exam_id, config.sub_stages.clone(), store.clone(), now)?;
        let ledger = ViolationLedger::restore(config.ledger, session.session().violations.clone());
        let policy = EscalationPolicy::restore(
            config.policy,
            ledger.records(),
            session.session().escalation.as_ref(),
            session.is_submitted(),
        );
        let reference = new_reference_handle();
        let sensors = SensorSet::standard(&config.sensors, store, reference.clone())?;
        let identity = IdentityVerifier::new(config.identity, reference);
        Ok(Self {
            config,
            clock,
            callbacks,
            ledger,
            policy,
            session,
            sensors,
            identity,
            timers: TimerQueue::new(),
            auto_submit_timer: None,
            channel: None,
            monitoring: false,
            fullscreen_blocked: false,
            pending_requests: Vec::new(),
        })
    }

    pub fn callbacks(&self) -> &H {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut H {
        &mut self.callbacks
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn session(&self) -> &ExamSession {
        self.session.session()
    }

    pub fn stage(&self) -> ExamStage {
        self.session.stage()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    pub fn is_fullscreen_blocked(&self) -> bool {
        self.fullscreen_blocked
    }

    pub fn auto_submit_state(&self) -> AutoSubmitState {
        self.policy.state()
    }

    pub fn consecutive_critical(&self) -> u32 {
        self.policy.consecutive_critical()
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.ledger.snapshot()
    }

    pub fn risk_score(&self) -> u8 {
        self.ledger.risk_score(self.clock.now_ms())
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.ledger.risk_level(self.clock.now_ms())
    }

    pub fn summary(&self) -> LedgerSummary {
        self.ledger.summary(self.clock.now_ms())
    }

    /// Earliest pending timer, for hosts that sleep between ticks.
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    // -------------------- Identity --------------------

    fn require_stage(&self, stage: ExamStage, operation: &str) -> Result<()> {
        if self.session.stage() != stage {
            return Err(IntegrityError::InvalidTransition {
                from: self.session.stage().as_str().to_string(),
                to: operation.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn capture_reference(&mut self, faces: &[FaceDetection]) -> Result<()> {
        self.require_stage(ExamStage::Identity, "capture_reference")?;
        let now = self.clock.now_ms();
        self.identity.capture_reference(faces, now)
    }

    /// Verifies the candidate. A match moves the exam into `Monitoring` and
    /// starts the sensors.
    pub fn verify_identity(&mut self, faces: &[FaceDetection]) -> Result<VerificationResult> {
        self.require_stage(ExamStage::Identity, "verify_identity")?;
        let now = self.clock.now_ms();
        let result = self.identity.verify(faces, now)?;
        if result.matched {
            self.enter_monitoring()?;
        }
        Ok(result)
    }

    pub fn capture_reference_from_frame(
        &mut self,
        detector: &SharedFaceDetector,
        frame: Arc<FaceFrame>,
    ) -> Result<()> {
        self.require_stage(ExamStage::Identity, "capture_reference")?;
        let now = self.clock.now_ms();
        self.identity.capture_from_frame(detector, frame, now)
    }

    pub fn verify_identity_from_frame(
        &mut self,
        detector: &SharedFaceDetector,
        frame: Arc<FaceFrame>,
    ) -> Result<VerificationResult> {
        self.require_stage(ExamStage::Identity, "verify_identity")?;
        let now = self.clock.now_ms();
        let result = self.identity.verify_from_frame(detector, frame, now)?;
        if result.matched {
            self.enter_monitoring()?;
        }
        Ok(result)
    }

    /// Clears the reference and attempt counter for a fresh identity check.
    pub fn retry_identity(&mut self) -> Result<()> {
        self.require_stage(ExamStage::Identity, "retry_identity")?;
        self.identity.retry()
    }

    fn enter_monitoring(&mut self) -> Result<()> {
        self.session.complete_identity()?;
        self.callbacks.on_stage_change(ExamStage::Monitoring);
        self.start_monitoring()
    }

    // -------------------- Monitoring lifecycle --------------------

    /// Starts every sensor and schedules their polls. Sensors that fail to
    /// start are degraded and logged; the others keep running. On a resumed
    /// session the auto-submit countdown is re-armed if the threshold was
    /// already reached. A countdown armed before `stop` keeps its deadline,
    /// or fires on the next tick if that deadline has passed.
    pub fn start_monitoring(&mut self) -> Result<()> {
        self.require_stage(ExamStage::Monitoring, "start_monitoring")?;
        if self.monitoring {
            return Ok(());
        }
        let now = self.clock.now_ms();
        for (kind, err) in self.sensors.start_all(now) {
            let degraded = IntegrityError::SensorInitFailure {
                sensor: kind.as_str().to_string(),
                reason: format!("{:#}", err),
            };
            log::warn!("{}", degraded);
        }
        for (index, interval) in self.sensors.poll_schedule() {
            self.timers
                .schedule(now + interval, MonitorTimer::SensorPoll(index));
        }
        self.monitoring = true;
        log::info!(
            "monitoring exam {} with {} sensors",
            self.session.exam_id(),
            self.sensors.len()
        );

        if let Some(action) = self.policy.arm_if_threshold_reached(now) {
            self.apply_action(action, None);
        } else if let AutoSubmitState::Armed { deadline_ms } = self.policy.state() {
            if self.auto_submit_timer.is_none() {
                log::info!("resuming auto-submit countdown, deadline {} ms", deadline_ms);
                self.auto_submit_timer = Some(
                    self.timers
                        .schedule(deadline_ms.max(now), MonitorTimer::AutoSubmit),
                );
            }
        }
        Ok(())
    }

    /// Detaches every sensor and clears all timers. Late face-inference
    /// results are discarded after this. An armed countdown stays armed;
    /// `start_monitoring` puts it back on the timer queue.
    pub fn stop(&mut self) {
        self.sensors.stop_all();
        self.timers.clear();
        self.auto_submit_timer = None;
        self.pending_requests.clear();
        if self.monitoring {
            log::info!("monitoring stopped for exam {}", self.session.exam_id());
        }
        self.monitoring = false;
    }

    // -------------------- Inputs --------------------

    /// Offers one host event to the sensors. Returns whether the host should
    /// let the event through.
    pub fn handle(&mut self, input: SensorInput) -> InputVerdict {
        if !self.monitoring || self.session.is_submitted() {
            return InputVerdict::Allow;
        }
        let now = self.clock.now_ms();

        if let SensorInput::FullscreenChanged { active: true } = input {
            if self.fullscreen_blocked {
                log::info!("fullscreen restored");
                self.fullscreen_blocked = false;
            }
        }

        let mut signals = Vec::new();
        let verdict = self
            .sensors
            .observe(&input, now, &mut |signal| signals.push(signal));
        self.process_signals(signals, now);
        self.pump_channel();
        verdict
    }

    /// Host answer to a `CaptureFrame` request.
    pub fn complete_face_inference(
        &mut self,
        ticket: InferenceTicket,
        result: Result<Vec<FaceDetection>>,
    ) -> InputVerdict {
        let outcome = match result {
            Ok(faces) => FaceInferenceOutcome::Faces { faces },
            Err(e) => FaceInferenceOutcome::Failed {
                reason: format!("{:#}", e),
            },
        };
        self.handle(SensorInput::FaceInference { ticket, outcome })
    }

    /// Fires every due timer. Returns work the host must perform
    /// (frame captures, clipboard reads).
    pub fn tick(&mut self) -> Vec<HostRequest> {
        let now = self.clock.now_ms();
        while let Some((id, timer)) = self.timers.pop_next_due(now) {
            match timer {
                MonitorTimer::AutoSubmit => {
                    if self.auto_submit_timer == Some(id) {
                        self.auto_submit_timer = None;
                    }
                    self.submit_automatically(SubmitReason::SecurityViolations);
                }
                MonitorTimer::SensorPoll(index) => {
                    let mut signals = Vec::new();
                    let next = self
                        .sensors
                        .poll(index, now, &mut |signal| signals.push(signal));
                    if let Some(interval) = next {
                        self.timers
                            .schedule(now + interval, MonitorTimer::SensorPoll(index));
                    }
                    self.process_signals(signals, now);
                }
            }
        }
        self.pump_channel();
        std::mem::take(&mut self.pending_requests)
    }

    fn process_signals(&mut self, signals: Vec<SensorSignal>, now: u64) {
        for signal in signals {
            match signal {
                SensorSignal::Violation(candidate) => {
                    if candidate.kind == ViolationKind::FullscreenExit
                        && self.config.require_fullscreen
                        && !self.fullscreen_blocked
                    {
                        self.fullscreen_blocked = true;
                        self.callbacks.on_fullscreen_required();
                    }
                    self.accept(candidate, now);
                }
                SensorSignal::Recovered(kind) => {
                    log::debug!("sustained good behaviour from {}", kind.as_str());
                    if self.policy.record_good_behavior(now) {
                        if let Err(e) = self.session.record_escalation(self.policy.progress()) {
                            log::warn!("failed to persist escalation state: {:#}", e);
                        }
                    }
                }
                SensorSignal::Request(request) => self.pending_requests.push(request),
            }
        }
    }

    /// The single entry point for violations, from sensors and from the
    /// host (e.g. `devtools_suspected`). Applies the debounce, records,
    /// notifies, broadcasts and escalates. Returns the stored violation.
    pub fn log_violation(&mut self, candidate: CandidateViolation) -> Option<Violation> {
        if !self.monitoring || self.session.is_submitted() {
            log::debug!("violation {} ignored outside monitoring", candidate.kind);
            return None;
        }
        let now = self.clock.now_ms();
        let accepted = self.accept(candidate, now);
        self.pump_channel();
        accepted
    }

    fn accept(&mut self, candidate: CandidateViolation, now: u64) -> Option<Violation> {
        if self.session.is_submitted() {
            return None;
        }
        let violation = self.ledger.append(candidate, now)?;
        log::warn!(
            "violation {} ({}) from {}",
            violation.kind,
            violation.severity.as_str(),
            violation.source.as_str()
        );
        self.callbacks.on_violation(&violation);

        if let Some(channel) = self.channel.as_mut() {
            if channel.state() == ConnectionState::Connected {
                if let Err(e) = channel.broadcast_violation(&violation) {
                    log::warn!("violation broadcast failed: {:#}", e);
                }
            }
        }
        let actions = self.policy.evaluate(&violation, now);
        if let Err(e) = self
            .session
            .record_violations(self.ledger.snapshot(), self.policy.progress())
        {
            log::warn!("failed to persist violations: {:#}", e);
        }

        for action in actions {
            self.apply_action(action, Some(&violation));
        }
        Some(violation)
    }

    fn apply_action(&mut self, action: PolicyAction, violation: Option<&Violation>) {
        match action {
            PolicyAction::FirstWarning => {
                if let Some(v) = violation {
                    self.callbacks.on_first_warning(v);
                }
            }
            PolicyAction::SecondInfraction(second) => {
                if let Some(v) = violation {
                    self.callbacks.on_second_infraction(v, second);
                }
                if second == SecondInfractionAction::SubmitImmediately {
                    self.submit_automatically(SubmitReason::SecondInfraction);
                }
            }
            PolicyAction::ArmAutoSubmit {
                countdown_ms,
                deadline_ms,
                critical_count,
            } => {
                log::warn!(
                    "{} critical violations; auto-submit in {} ms",
                    critical_count,
                    countdown_ms
                );
                self.callbacks.on_warning(&Warning {
                    message: format!(
                        "{} critical security violations detected. The exam will be submitted automatically in {} seconds.",
                        critical_count,
                        (countdown_ms + 999) / 1_000
                    ),
                    countdown_ms,
                });
                self.auto_submit_timer =
                    Some(self.timers.schedule(deadline_ms, MonitorTimer::AutoSubmit));
            }
        }
    }

    /// Irreversible. Runs at most once per session whichever path triggers
    /// it first.
    fn submit_automatically(&mut self, reason: SubmitReason) -> bool {
        if self.session.is_submitted() || !self.policy.try_fire() {
            return false;
        }
        if let Some(id) = self.auto_submit_timer.take() {
            self.timers.cancel(id);
        }
        if let Err(e) = self.session.submit(reason) {
            log::warn!("failed to persist submission: {:#}", e);
        }
        log::warn!(
            "exam {} auto-submitted: {}",
            self.session.exam_id(),
            reason.as_str()
        );
        let submit = AutoSubmit {
            reason,
            violations: self.ledger.snapshot(),
        };
        self.callbacks.on_auto_submit(&submit);
        self.callbacks.on_stage_change(ExamStage::Submitted);
        self.stop();
        true
    }

    // -------------------- Stage navigation --------------------

    pub fn is_accessible(&self, sub: SubStage) -> bool {
        self.session.is_accessible(sub)
    }

    pub fn select_sub_stage(&mut self, sub: SubStage) -> Result<()> {
        self.session.select_sub_stage(sub)
    }

    /// Completes the current sub-stage. Refused while the fullscreen gate is
    /// up. Completing the last one submits the exam; returns `true` then.
    pub fn complete_sub_stage(
        &mut self,
        sub: SubStage,
        data: Option<serde_json::Value>,
    ) -> Result<bool> {
        if self.fullscreen_blocked {
            return Err(IntegrityError::StageLocked {
                reason: "fullscreen is required to continue".to_string(),
            }
            .into());
        }
        let result = self.session.complete_sub_stage(sub, data);
        self.settle_submission(result)
    }

    /// Candidate-initiated submission. Returns `false` if the exam was
    /// already submitted.
    pub fn submit(&mut self) -> Result<bool> {
        if self.session.is_submitted() {
            return Ok(false);
        }
        self.require_stage(ExamStage::Monitoring, "submit")?;
        let result = self.session.submit(SubmitReason::Manual);
        self.settle_submission(result)
    }

    /// A submission that reached `Submitted` in memory is final even when
    /// persisting it failed; the sensors are shut down either way.
    fn settle_submission(&mut self, result: Result<bool>) -> Result<bool> {
        match result {
            Ok(true) => {
                self.finish();
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => {
                if self.session.is_submitted() {
                    log::warn!(
                        "exam {} submitted but not persisted: {:#}",
                        self.session.exam_id(),
                        e
                    );
                    self.finish();
                }
                Err(e)
            }
        }
    }

    fn finish(&mut self) {
        // Closes the auto-submit path as well.
        self.policy.try_fire();
        self.callbacks.on_stage_change(ExamStage::Submitted);
        self.stop();
    }

    /// Clears persisted progress after the submission was handed off.
    pub fn complete_exam(&mut self) -> Result<()> {
        self.session.complete_exam()
    }

    // -------------------- Secure channel --------------------

    pub fn attach_channel(&mut self, channel: SecureChannelCoordinator) {
        self.channel = Some(channel);
        self.pump_channel();
    }

    pub fn channel(&self) -> Option<&SecureChannelCoordinator> {
        self.channel.as_ref()
    }

    /// Access for call setup. Call `pump_channel` afterwards so state
    /// changes reach the callbacks.
    pub fn channel_mut(&mut self) -> Option<&mut SecureChannelCoordinator> {
        self.channel.as_mut()
    }

    pub fn detach_channel(&mut self) -> Option<SecureChannelCoordinator> {
        self.pump_channel();
        self.channel.take()
    }

    /// Delivers queued channel events to the callbacks. A failed channel is
    /// itself recorded as a violation.
    pub fn pump_channel(&mut self) {
        let events = match self.channel.as_mut() {
            Some(channel) => channel.drain_events(),
            None => return,
        };
        let now = self.clock.now_ms();
        for event in events {
            match event {
                ChannelEvent::StateChanged(state) => {
                    self.callbacks.on_connection_state_change(state);
                    if state == ConnectionState::Failed && self.monitoring {
                        self.accept(
                            CandidateViolation::new(
                                ViolationKind::SecureChannelFailure,
                                SensorKind::SecureChannel,
                            ),
                            now,
                        );
                    }
                }
                ChannelEvent::Alert(alert) => self.callbacks.on_security_alert(&alert),
                ChannelEvent::Message(message) => {
                    log::debug!("channel message: {:?}", message);
                }
            }
        }
    }

    /// Sends a control message on the attached channel.
    pub fn send_control(&mut self, message: &crate::channel::ControlMessage) -> Result<()> {
        let result = match self.channel.as_mut() {
            Some(channel) => channel.send(message),
            None => Err(anyhow!("no secure channel attached")),
        };
        self.pump_channel();
        result
    }
}
