use anyhow::Result;

use crate::sensors::{InputVerdict, Sensor, SensorInput, SensorSignal, DEFAULT_GOOD_BEHAVIOR_MS};
use crate::violation::{CandidateViolation, SensorKind, ViolationKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FocusSensorConfig {
    /// Two blurs closer than this also fire `frequent_focus_loss`.
    pub frequent_window_ms: u64,
    /// Focus held this long counts as good behaviour.
    pub good_behavior_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for FocusSensorConfig {
    fn default() -> Self {
        Self {
            frequent_window_ms: 5_000,
            good_behavior_ms: DEFAULT_GOOD_BEHAVIOR_MS,
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug)]
pub struct FocusSensor {
    config: FocusSensorConfig,
    active: bool,
    last_blur_ms: Option<u64>,
    focused_since_ms: Option<u64>,
    recovery_pending: bool,
}

impl FocusSensor {
    pub fn new(config: FocusSensorConfig) -> Self {
        Self {
            config,
            active: false,
            last_blur_ms: None,
            focused_since_ms: None,
            recovery_pending: false,
        }
    }
}

impl Sensor for FocusSensor {
    fn kind(&self) -> SensorKind {
        SensorKind::Focus
    }

    fn start(&mut self, now_ms: u64) -> Result<()> {
        self.active = true;
        self.last_blur_ms = None;
        self.focused_since_ms = Some(now_ms);
        self.recovery_pending = false;
        Ok(())
    }

    fn stop(&mut self) {
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn poll_interval_ms(&self) -> Option<u64> {
        Some(self.config.poll_interval_ms)
    }

    fn observe(
        &mut self,
        input: &SensorInput,
        now_ms: u64,
        emit: &mut dyn FnMut(SensorSignal),
    ) -> InputVerdict {
        match input {
            SensorInput::FocusLost => {
                self.focused_since_ms = None;
                self.recovery_pending = true;
                emit(SensorSignal::Violation(CandidateViolation::new(
                    ViolationKind::WindowFocusLost,
                    SensorKind::Focus,
                )));
                if let Some(prev) = self.last_blur_ms {
                    let gap = now_ms.saturating_sub(prev);
                    if gap < self.config.frequent_window_ms {
                        emit(SensorSignal::Violation(
                            CandidateViolation::new(
                                ViolationKind::FrequentFocusLoss,
                                SensorKind::Focus,
                            )
                            .with_detail("gap_ms", gap),
                        ));
                    }
                }
                self.last_blur_ms = Some(now_ms);
            }
            SensorInput::FocusGained => {
                if self.focused_since_ms.is_none() {
                    self.focused_since_ms = Some(now_ms);
                }
            }
            _ => {}
        }
        InputVerdict::Allow
    }

    fn poll(&mut self, now_ms: u64, emit: &mut dyn FnMut(SensorSignal)) {
        if !self.recovery_pending {
            return;
        }
        if let Some(since) = self.focused_since_ms {
            if now_ms.saturating_sub(since) > self.config.good_behavior_ms {
                self.recovery_pending = false;
                emit(SensorSignal::Recovered(SensorKind::Focus));
            }
        }
    }
}
