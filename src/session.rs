//! Exam session state machine.
//!
//! `Identity -> Monitoring -> Submitted`. Monitoring walks an ordered list
//! of sub-stages. Every transition is persisted to the progress store under
//! `exam_progress_<exam_id>` so a reload resumes where the candidate was.
//! `Submitted` is terminal.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::IntegrityError;
use crate::policy::EscalationProgress;
use crate::storage::{progress_key, SharedProgressStore};
use crate::violation::Violation;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExamStage {
    Identity,
    Monitoring,
    Submitted,
}

impl ExamStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ExamStage::Identity => "identity",
            ExamStage::Monitoring => "monitoring",
            ExamStage::Submitted => "submitted",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubStage {
    Mcq,
    Coding,
    Feedback,
}

impl SubStage {
    pub const DEFAULT_ORDER: [SubStage; 3] = [SubStage::Mcq, SubStage::Coding, SubStage::Feedback];

    pub fn as_str(self) -> &'static str {
        match self {
            SubStage::Mcq => "mcq",
            SubStage::Coding => "coding",
            SubStage::Feedback => "feedback",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StageProgress {
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmitReason {
    Completed,
    SecurityViolations,
    SecondInfraction,
    Manual,
}

impl SubmitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmitReason::Completed => "completed",
            SubmitReason::SecurityViolations => "security_violations",
            SubmitReason::SecondInfraction => "second_infraction",
            SubmitReason::Manual => "manual",
        }
    }

    pub fn is_automatic(self) -> bool {
        matches!(
            self,
            SubmitReason::SecurityViolations | SubmitReason::SecondInfraction
        )
    }
}

/// Persisted exam progress.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExamSession {
    pub exam_id: String,
    pub stage: ExamStage,
    pub start_time_ms: u64,
    pub sub_stages: Vec<SubStage>,
    pub current_sub_stage: usize,
    #[serde(default)]
    pub stage_progress: BTreeMap<SubStage, StageProgress>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationProgress>,
    #[serde(default)]
    pub auto_submitted: bool,
    #[serde(default)]
    pub submit_reason: Option<SubmitReason>,
}

impl ExamSession {
    pub fn new(exam_id: &str, sub_stages: Vec<SubStage>, now_ms: u64) -> Self {
        Self {
            exam_id: exam_id.to_string(),
            stage: ExamStage::Identity,
            start_time_ms: now_ms,
            sub_stages,
            current_sub_stage: 0,
            stage_progress: BTreeMap::new(),
            violations: Vec::new(),
            escalation: None,
            auto_submitted: false,
            submit_reason: None,
        }
    }

    pub fn current(&self) -> Option<SubStage> {
        self.sub_stages.get(self.current_sub_stage).copied()
    }

    pub fn is_completed(&self, sub: SubStage) -> bool {
        self.stage_progress
            .get(&sub)
            .map(|p| p.completed)
            .unwrap_or(false)
    }

    fn validate(&self, exam_id: &str) -> std::result::Result<(), String> {
        if self.exam_id != exam_id {
            return Err(format!("stored exam id {:?}", self.exam_id));
        }
        if self.sub_stages.is_empty() {
            return Err("no sub-stages".to_string());
        }
        if self.current_sub_stage >= self.sub_stages.len() {
            return Err(format!("sub-stage index {} out of range", self.current_sub_stage));
        }
        Ok(())
    }
}

pub struct ExamSessionStateMachine {
    store: SharedProgressStore,
    session: ExamSession,
}

impl ExamSessionStateMachine {
    /// Resumes the persisted session for `exam_id`, or starts a fresh one.
    /// Corrupt persisted state is logged and replaced.
    pub fn open(
        exam_id: &str,
        sub_stages: Vec<SubStage>,
        store: SharedProgressStore,
        now_ms: u64,
    ) -> Result<Self> {
        let key = progress_key(exam_id);
        let restored = match store.get(&key).context("load exam progress")? {
            None => None,
            Some(raw) => match decode(&raw, exam_id) {
                Ok(session) => Some(session),
                Err(err) => {
                    log::warn!("{}; starting a fresh session", err);
                    None
                }
            },
        };

        let resumed = restored.is_some();
        let session =
            restored.unwrap_or_else(|| ExamSession::new(exam_id, sub_stages, now_ms));
        let machine = Self { store, session };
        if resumed {
            log::info!(
                "exam {} resumed at stage {}",
                exam_id,
                machine.session.stage.as_str()
            );
        } else {
            machine.persist()?;
            log::info!("exam {} started", exam_id);
        }
        Ok(machine)
    }

    pub fn session(&self) -> &ExamSession {
        &self.session
    }

    pub fn exam_id(&self) -> &str {
        &self.session.exam_id
    }

    pub fn stage(&self) -> ExamStage {
        self.session.stage
    }

    pub fn current_sub_stage(&self) -> Option<SubStage> {
        self.session.current()
    }

    pub fn is_submitted(&self) -> bool {
        self.session.stage == ExamStage::Submitted
    }

    fn persist(&self) -> Result<()> {
        let raw = serde_json::to_string(&self.session).context("serialize exam progress")?;
        self.store
            .set(&progress_key(&self.session.exam_id), &raw)
            .context("persist exam progress")
    }

    fn transition(&mut self, to: ExamStage) -> Result<()> {
        let from = self.session.stage;
        let allowed = matches!(
            (from, to),
            (ExamStage::Identity, ExamStage::Monitoring)
                | (ExamStage::Monitoring, ExamStage::Submitted)
        );
        if !allowed {
            return Err(IntegrityError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            }
            .into());
        }
        self.session.stage = to;
        log::info!(
            "exam {}: {} -> {}",
            self.session.exam_id,
            from.as_str(),
            to.as_str()
        );
        Ok(())
    }

    /// Identity verified; enter monitoring at the first sub-stage.
    pub fn complete_identity(&mut self) -> Result<()> {
        self.transition(ExamStage::Monitoring)?;
        self.session.current_sub_stage = 0;
        self.persist()
    }

    /// A sub-stage is reachable if it is not ahead of the current one or it
    /// was already completed.
    pub fn is_accessible(&self, sub: SubStage) -> bool {
        if self.session.stage != ExamStage::Monitoring {
            return false;
        }
        match self.session.sub_stages.iter().position(|s| *s == sub) {
            Some(index) => index <= self.session.current_sub_stage || self.session.is_completed(sub),
            None => false,
        }
    }

    /// Navigates back to an earlier (or the current) sub-stage.
    pub fn select_sub_stage(&mut self, sub: SubStage) -> Result<()> {
        if !self.is_accessible(sub) {
            return Err(IntegrityError::StageLocked {
                reason: format!("sub-stage {} is not accessible", sub.as_str()),
            }
            .into());
        }
        if let Some(index) = self.session.sub_stages.iter().position(|s| *s == sub) {
            self.session.current_sub_stage = index;
        }
        self.persist()
    }

    /// Marks `sub` complete and advances. Completing the last sub-stage
    /// submits the exam; returns `true` in that case.
    pub fn complete_sub_stage(
        &mut self,
        sub: SubStage,
        data: Option<serde_json::Value>,
    ) -> Result<bool> {
        if self.session.stage != ExamStage::Monitoring {
            return Err(IntegrityError::StageLocked {
                reason: format!("exam is in stage {}", self.session.stage.as_str()),
            }
            .into());
        }
        if self.session.current() != Some(sub) {
            return Err(IntegrityError::StageLocked {
                reason: format!("sub-stage {} is not the current sub-stage", sub.as_str()),
            }
            .into());
        }

        self.session
            .stage_progress
            .insert(sub, StageProgress { completed: true, data });

        let next = self
            .session
            .sub_stages
            .iter()
            .position(|s| !self.session.is_completed(*s));
        match next {
            Some(index) => {
                self.session.current_sub_stage = index;
                log::info!(
                    "exam {}: sub-stage {} complete",
                    self.session.exam_id,
                    sub.as_str()
                );
                self.persist()?;
                Ok(false)
            }
            None => {
                self.submit(SubmitReason::Completed)?;
                Ok(true)
            }
        }
    }

    /// Submits the exam. Returns `false` if it was already submitted.
    ///
    /// The transition is applied before it is persisted. A persistence
    /// error leaves the session `Submitted` in memory; callers must treat
    /// the submission as done and surface the error.
    pub fn submit(&mut self, reason: SubmitReason) -> Result<bool> {
        if self.is_submitted() {
            log::debug!(
                "exam {} already submitted; ignoring {}",
                self.session.exam_id,
                reason.as_str()
            );
            return Ok(false);
        }
        self.transition(ExamStage::Submitted)?;
        self.session.auto_submitted = reason.is_automatic();
        self.session.submit_reason = Some(reason);
        self.persist()?;
        Ok(true)
    }

    /// Mirrors the ledger and escalation counters into the persisted session.
    pub fn record_violations(
        &mut self,
        violations: Vec<Violation>,
        escalation: EscalationProgress,
    ) -> Result<()> {
        self.session.violations = violations;
        self.session.escalation = Some(escalation);
        self.persist()
    }

    pub fn record_escalation(&mut self, escalation: EscalationProgress) -> Result<()> {
        self.session.escalation = Some(escalation);
        self.persist()
    }

    /// Discards all progress and starts over at `Identity`.
    pub fn reset(&mut self, now_ms: u64) -> Result<()> {
        let sub_stages = self.session.sub_stages.clone();
        let exam_id = self.session.exam_id.clone();
        self.store
            .delete(&progress_key(&exam_id))
            .context("clear exam progress")?;
        self.session = ExamSession::new(&exam_id, sub_stages, now_ms);
        log::info!("exam {} reset", exam_id);
        self.persist()
    }

    /// Clears persisted progress once the submission has been handed off.
    pub fn complete_exam(&mut self) -> Result<()> {
        if !self.is_submitted() {
            return Err(IntegrityError::InvalidTransition {
                from: self.session.stage.as_str().to_string(),
                to: "complete".to_string(),
            }
            .into());
        }
        self.store
            .delete(&progress_key(&self.session.exam_id))
            .context("clear exam progress")
    }
}

fn decode(raw: &str, exam_id: &str) -> Result<ExamSession> {
    let corrupt = |reason: String| IntegrityError::PersistenceCorrupt {
        key: progress_key(exam_id),
        reason,
    };
    let session: ExamSession =
        serde_json::from_str(raw).map_err(|e| corrupt(e.to_string()))?;
    session.validate(exam_id).map_err(corrupt)?;
    Ok(session)
}
