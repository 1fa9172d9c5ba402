//! Escalation policy.
//!
//! Pure decision logic evaluated after every accepted violation. There is a
//! single threshold policy:
//!
//! - the first critical or high violation produces an informational warning;
//! - the second accepted violation of any severity is a "second infraction",
//!   whose consequence (`Notify` or `SubmitImmediately`) is configured per
//!   exam stage;
//! - `max_consecutive_violations` critical violations without intervening
//!   good behaviour arm a countdown that ends in auto-submission. A
//!   good-behaviour signal only counts once no critical violation has been
//!   accepted for `good_behavior_ms`.
//!
//! Auto-submission is irreversible. `try_fire` hands out the permission to
//! submit at most once per session, whichever path asks first.

use serde::{Deserialize, Serialize};

use crate::sensors::DEFAULT_GOOD_BEHAVIOR_MS;
use crate::violation::{Severity, Violation};

pub const DEFAULT_MAX_CONSECUTIVE_VIOLATIONS: u32 = 3;
pub const DEFAULT_AUTO_SUBMIT_COUNTDOWN_MS: u64 = 5_000;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecondInfractionAction {
    #[default]
    Notify,
    SubmitImmediately,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PolicyConfig {
    pub max_consecutive_violations: u32,
    pub countdown_ms: u64,
    pub second_infraction: SecondInfractionAction,
    /// Quiet period after the last critical before a reset is honoured.
    pub good_behavior_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_consecutive_violations: DEFAULT_MAX_CONSECUTIVE_VIOLATIONS,
            countdown_ms: DEFAULT_AUTO_SUBMIT_COUNTDOWN_MS,
            second_infraction: SecondInfractionAction::Notify,
            good_behavior_ms: DEFAULT_GOOD_BEHAVIOR_MS,
        }
    }
}

/// Escalation counters that must survive a reload. Stored with the exam
/// progress.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscalationProgress {
    pub consecutive_critical: u32,
    pub first_warning_sent: bool,
    pub second_infraction_sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_critical_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyAction {
    FirstWarning,
    SecondInfraction(SecondInfractionAction),
    ArmAutoSubmit {
        countdown_ms: u64,
        deadline_ms: u64,
        critical_count: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoSubmitState {
    Idle,
    Armed { deadline_ms: u64 },
    Fired,
}

#[derive(Debug)]
pub struct EscalationPolicy {
    config: PolicyConfig,
    session_critical: u32,
    consecutive_critical: u32,
    infractions: u32,
    first_warning_sent: bool,
    second_infraction_sent: bool,
    last_critical_ms: Option<u64>,
    auto_submit: AutoSubmitState,
}

impl EscalationPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            session_critical: 0,
            consecutive_critical: 0,
            infractions: 0,
            first_warning_sent: false,
            second_infraction_sent: false,
            last_critical_ms: None,
            auto_submit: AutoSubmitState::Idle,
        }
    }

    /// Rebuilds counters from a persisted ledger. When `progress` is present
    /// the consecutive counter and warning flags come from it; otherwise
    /// (progress written before these were stored) every critical in the
    /// ledger counts as consecutive.
    pub fn restore<'a>(
        config: PolicyConfig,
        violations: impl IntoIterator<Item = &'a Violation>,
        progress: Option<&EscalationProgress>,
        already_submitted: bool,
    ) -> Self {
        let mut policy = Self::new(config);
        for v in violations {
            policy.infractions += 1;
            if matches!(v.severity, Severity::Critical | Severity::High) {
                policy.first_warning_sent = true;
            }
            if v.severity == Severity::Critical {
                policy.session_critical += 1;
                policy.consecutive_critical += 1;
                policy.last_critical_ms = Some(v.timestamp_ms);
            }
        }
        policy.second_infraction_sent = policy.infractions >= 2;
        if let Some(progress) = progress {
            policy.consecutive_critical = progress.consecutive_critical;
            policy.first_warning_sent = progress.first_warning_sent;
            policy.second_infraction_sent = progress.second_infraction_sent;
            policy.last_critical_ms = progress.last_critical_ms;
        }
        if already_submitted {
            policy.auto_submit = AutoSubmitState::Fired;
        }
        policy
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn evaluate(&mut self, violation: &Violation, now_ms: u64) -> Vec<PolicyAction> {
        let mut actions = Vec::new();
        if self.auto_submit == AutoSubmitState::Fired {
            return actions;
        }

        self.infractions += 1;
        if violation.severity == Severity::Critical {
            self.session_critical += 1;
            self.consecutive_critical += 1;
            self.last_critical_ms = Some(now_ms);
        }

        if let Some(arm) = self.arm_if_threshold_reached(now_ms) {
            actions.push(arm);
        } else if !self.first_warning_sent
            && matches!(violation.severity, Severity::Critical | Severity::High)
        {
            self.first_warning_sent = true;
            actions.push(PolicyAction::FirstWarning);
        }

        if self.infractions == 2 && !self.second_infraction_sent {
            self.second_infraction_sent = true;
            actions.push(PolicyAction::SecondInfraction(self.config.second_infraction));
        }
        actions
    }

    /// Arms the countdown if the threshold is met and nothing is armed yet.
    /// Violations arriving while armed never restart the countdown.
    pub fn arm_if_threshold_reached(&mut self, now_ms: u64) -> Option<PolicyAction> {
        if self.auto_submit != AutoSubmitState::Idle
            || self.consecutive_critical < self.config.max_consecutive_violations
        {
            return None;
        }
        let deadline_ms = now_ms + self.config.countdown_ms;
        self.auto_submit = AutoSubmitState::Armed { deadline_ms };
        Some(PolicyAction::ArmAutoSubmit {
            countdown_ms: self.config.countdown_ms,
            deadline_ms,
            critical_count: self.session_critical,
        })
    }

    /// Sustained good behaviour resets the consecutive counter, unless a
    /// critical was accepted within the last `good_behavior_ms`. An armed
    /// countdown is not cancelled. Returns whether the counter was reset.
    pub fn record_good_behavior(&mut self, now_ms: u64) -> bool {
        if let Some(last) = self.last_critical_ms {
            let quiet = now_ms.saturating_sub(last);
            if quiet < self.config.good_behavior_ms {
                log::debug!(
                    "good behaviour ignored; last critical violation {} ms ago",
                    quiet
                );
                return false;
            }
        }
        if self.consecutive_critical == 0 {
            return false;
        }
        log::info!(
            "good behaviour observed, resetting {} consecutive critical violations",
            self.consecutive_critical
        );
        self.consecutive_critical = 0;
        true
    }

    pub fn progress(&self) -> EscalationProgress {
        EscalationProgress {
            consecutive_critical: self.consecutive_critical,
            first_warning_sent: self.first_warning_sent,
            second_infraction_sent: self.second_infraction_sent,
            last_critical_ms: self.last_critical_ms,
        }
    }

    /// Grants the single permission to submit. Returns false on every call
    /// after the first.
    pub fn try_fire(&mut self) -> bool {
        if self.auto_submit == AutoSubmitState::Fired {
            return false;
        }
        self.auto_submit = AutoSubmitState::Fired;
        true
    }

    pub fn state(&self) -> AutoSubmitState {
        self.auto_submit
    }

    pub fn session_critical(&self) -> u32 {
        self.session_critical
    }

    pub fn consecutive_critical(&self) -> u32 {
        self.consecutive_critical
    }

    pub fn infractions(&self) -> u32 {
        self.infractions
    }
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::violation::{CandidateViolation, SensorKind, ViolationKind, ViolationLedger};

    fn accept(ledger: &mut ViolationLedger, kind: ViolationKind, now: u64) -> Violation {
        ledger
            .append(CandidateViolation::new(kind, SensorKind::Fullscreen), now)
            .expect("accepted")
    }

    #[test]
    fn third_critical_arms_countdown_once() {
        let mut ledger = ViolationLedger::default();
        let mut policy = EscalationPolicy::default();

        let v1 = accept(&mut ledger, ViolationKind::FullscreenExit, 0);
        assert_eq!(policy.evaluate(&v1, 0), vec![PolicyAction::FirstWarning]);

        let v2 = accept(&mut ledger, ViolationKind::FullscreenExit, 3_000);
        assert_eq!(
            policy.evaluate(&v2, 3_000),
            vec![PolicyAction::SecondInfraction(SecondInfractionAction::Notify)]
        );

        let v3 = accept(&mut ledger, ViolationKind::FullscreenExit, 6_000);
        assert_eq!(
            policy.evaluate(&v3, 6_000),
            vec![PolicyAction::ArmAutoSubmit {
                countdown_ms: 5_000,
                deadline_ms: 11_000,
                critical_count: 3,
            }]
        );

        let v4 = accept(&mut ledger, ViolationKind::MultipleFaces, 7_000);
        assert!(policy.evaluate(&v4, 7_000).is_empty());
        assert_eq!(
            policy.state(),
            AutoSubmitState::Armed {
                deadline_ms: 11_000
            }
        );
    }

    #[test]
    fn try_fire_grants_exactly_once() {
        let mut policy = EscalationPolicy::default();
        assert!(policy.try_fire());
        assert!(!policy.try_fire());
        assert!(!policy.try_fire());
    }

    #[test]
    fn good_behavior_resets_consecutive_counter() {
        let mut ledger = ViolationLedger::default();
        let mut policy = EscalationPolicy::default();
        let v1 = accept(&mut ledger, ViolationKind::FullscreenExit, 0);
        policy.evaluate(&v1, 0);
        let v2 = accept(&mut ledger, ViolationKind::MultipleFaces, 100);
        policy.evaluate(&v2, 100);
        assert!(policy.record_good_behavior(10_100));
        let v3 = accept(&mut ledger, ViolationKind::FaceMismatch, 10_200);
        let actions = policy.evaluate(&v3, 10_200);
        assert!(actions.is_empty());
        assert_eq!(policy.consecutive_critical(), 1);
        assert_eq!(policy.session_critical(), 3);
        assert_eq!(policy.state(), AutoSubmitState::Idle);
    }

    #[test]
    fn warnings_do_not_trigger_first_warning() {
        let mut ledger = ViolationLedger::default();
        let mut policy = EscalationPolicy::default();
        let v = accept(&mut ledger, ViolationKind::NoFace, 0);
        assert!(policy.evaluate(&v, 0).is_empty());
        let v = accept(&mut ledger, ViolationKind::SecureChannelFailure, 10);
        assert_eq!(
            policy.evaluate(&v, 10),
            vec![
                PolicyAction::FirstWarning,
                PolicyAction::SecondInfraction(SecondInfractionAction::Notify)
            ]
        );
    }

    #[test]
    fn restore_rearms_when_threshold_already_met() {
        let mut ledger = ViolationLedger::default();
        for (i, kind) in [
            ViolationKind::FullscreenExit,
            ViolationKind::MultipleFaces,
            ViolationKind::FaceMismatch,
        ]
        .into_iter()
        .enumerate()
        {
            accept(&mut ledger, kind, i as u64);
        }
        let snapshot = ledger.snapshot();
        let mut policy =
            EscalationPolicy::restore(PolicyConfig::default(), &snapshot, None, false);
        assert!(matches!(
            policy.arm_if_threshold_reached(50),
            Some(PolicyAction::ArmAutoSubmit { deadline_ms: 5_050, .. })
        ));

        let mut submitted =
            EscalationPolicy::restore(PolicyConfig::default(), &snapshot, None, true);
        assert!(submitted.arm_if_threshold_reached(50).is_none());
        assert!(!submitted.try_fire());
    }

    #[test]
    fn good_behavior_right_after_a_critical_is_ignored() {
        let mut ledger = ViolationLedger::default();
        let mut policy = EscalationPolicy::default();
        let v1 = accept(&mut ledger, ViolationKind::FullscreenExit, 0);
        policy.evaluate(&v1, 0);
        let v2 = accept(&mut ledger, ViolationKind::ForbiddenKeyCombination, 6_000);
        policy.evaluate(&v2, 6_000);

        assert!(!policy.record_good_behavior(11_000));
        assert_eq!(policy.consecutive_critical(), 2);

        let v3 = accept(&mut ledger, ViolationKind::MultipleFaces, 12_000);
        assert!(matches!(
            policy.evaluate(&v3, 12_000).as_slice(),
            [PolicyAction::ArmAutoSubmit { deadline_ms: 17_000, .. }]
        ));
    }

    #[test]
    fn restore_prefers_persisted_progress() {
        let mut ledger = ViolationLedger::default();
        let mut live = EscalationPolicy::default();
        let v1 = accept(&mut ledger, ViolationKind::FullscreenExit, 0);
        live.evaluate(&v1, 0);
        let v2 = accept(&mut ledger, ViolationKind::MultipleFaces, 100);
        live.evaluate(&v2, 100);
        assert!(live.record_good_behavior(20_000));
        let v3 = accept(&mut ledger, ViolationKind::FaceMismatch, 21_000);
        live.evaluate(&v3, 21_000);
        assert_eq!(live.consecutive_critical(), 1);

        let snapshot = ledger.snapshot();
        let progress = live.progress();
        let mut restored =
            EscalationPolicy::restore(PolicyConfig::default(), &snapshot, Some(&progress), false);
        assert_eq!(restored.consecutive_critical(), 1);
        assert_eq!(restored.session_critical(), 3);
        assert_eq!(restored.progress(), progress);
        assert!(restored.arm_if_threshold_reached(30_000).is_none());
    }
}
