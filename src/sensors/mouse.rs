use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::sensors::{InputVerdict, Sensor, SensorInput, SensorSignal};
use crate::violation::{CandidateViolation, SensorKind, ViolationKind};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MouseSensorConfig {
    pub history: usize,
    /// A jump longer than this ...
    pub jump_px: f64,
    /// ... completed faster than this is a teleport.
    pub jump_ms: u64,
    /// Teleports above this count fire `suspicious_mouse_activity`.
    pub max_jumps: u32,
    pub line_window: usize,
    pub line_ratio: f64,
    pub line_tolerance_px: f64,
    /// Straight windows above this count fire `automated_mouse_pattern`.
    pub max_straight_windows: u32,
}

impl Default for MouseSensorConfig {
    fn default() -> Self {
        Self {
            history: 50,
            jump_px: 200.0,
            jump_ms: 100,
            max_jumps: 5,
            line_window: 10,
            line_ratio: 0.8,
            line_tolerance_px: 1.5,
            max_straight_windows: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Sample {
    x: f64,
    y: f64,
    at_ms: u64,
}

/// Flags teleporting cursors and machine-straight trajectories.
///
/// Straightness is evaluated once per `line_window` new samples, over the
/// last `line_window` samples, so one long straight drag counts once per
/// window rather than once per sample.
#[derive(Debug)]
pub struct MouseBehaviorSensor {
    config: MouseSensorConfig,
    active: bool,
    samples: VecDeque<Sample>,
    jumps: u32,
    straight_windows: u32,
    since_line_check: usize,
}

impl MouseBehaviorSensor {
    /// A straightness window needs two endpoints and must fit the history.
    pub fn new(config: MouseSensorConfig) -> Result<Self> {
        if config.line_window < 2 {
            return Err(anyhow!(
                "mouse line_window must be at least 2 (got {})",
                config.line_window
            ));
        }
        if config.history < config.line_window {
            return Err(anyhow!(
                "mouse history ({}) is shorter than line_window ({})",
                config.history,
                config.line_window
            ));
        }
        Ok(Self {
            config,
            active: false,
            samples: VecDeque::with_capacity(config.history),
            jumps: 0,
            straight_windows: 0,
            since_line_check: 0,
        })
    }

    fn record(&mut self, sample: Sample, emit: &mut dyn FnMut(SensorSignal)) {
        if let Some(prev) = self.samples.back() {
            let distance = ((sample.x - prev.x).powi(2) + (sample.y - prev.y).powi(2)).sqrt();
            let elapsed = sample.at_ms.saturating_sub(prev.at_ms);
            if distance > self.config.jump_px && elapsed < self.config.jump_ms {
                self.jumps += 1;
                if self.jumps > self.config.max_jumps {
                    emit(SensorSignal::Violation(
                        CandidateViolation::new(
                            ViolationKind::SuspiciousMouseActivity,
                            SensorKind::Mouse,
                        )
                        .with_detail("rapid_jumps", self.jumps),
                    ));
                    self.jumps = 0;
                }
            }
        }

        self.samples.push_back(sample);
        while self.samples.len() > self.config.history {
            self.samples.pop_front();
        }

        self.since_line_check += 1;
        if self.since_line_check >= self.config.line_window
            && self.samples.len() >= self.config.line_window
        {
            self.since_line_check = 0;
            if self.last_window_is_straight() {
                self.straight_windows += 1;
                if self.straight_windows > self.config.max_straight_windows {
                    emit(SensorSignal::Violation(
                        CandidateViolation::new(
                            ViolationKind::AutomatedMousePattern,
                            SensorKind::Mouse,
                        )
                        .with_detail("straight_windows", self.straight_windows),
                    ));
                    self.straight_windows = 0;
                }
            }
        }
    }

    fn last_window_is_straight(&self) -> bool {
        let n = self.config.line_window;
        let window: Vec<&Sample> = self.samples.iter().skip(self.samples.len() - n).collect();
        let (first, last) = (window[0], window[n - 1]);
        let dx = last.x - first.x;
        let dy = last.y - first.y;
        let length = (dx * dx + dy * dy).sqrt();
        if length < f64::EPSILON {
            // A resting cursor is not a trajectory.
            return false;
        }
        let on_line = window
            .iter()
            .filter(|p| {
                let cross = dx * (p.y - first.y) - dy * (p.x - first.x);
                cross.abs() / length <= self.config.line_tolerance_px
            })
            .count();
        on_line as f64 / n as f64 >= self.config.line_ratio
    }
}

impl Sensor for MouseBehaviorSensor {
    fn kind(&self) -> SensorKind {
        SensorKind::Mouse
    }

    fn start(&mut self, _now_ms: u64) -> Result<()> {
        self.active = true;
        self.samples.clear();
        self.jumps = 0;
        self.straight_windows = 0;
        self.since_line_check = 0;
        Ok(())
    }

    fn stop(&mut self) {
        self.active = false;
        self.samples.clear();
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn observe(
        &mut self,
        input: &SensorInput,
        now_ms: u64,
        emit: &mut dyn FnMut(SensorSignal),
    ) -> InputVerdict {
        if let SensorInput::MouseMoved { x, y } = input {
            self.record(
                Sample {
                    x: *x,
                    y: *y,
                    at_ms: now_ms,
                },
                emit,
            );
        }
        InputVerdict::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn move_to(sensor: &mut MouseBehaviorSensor, x: f64, y: f64, at: u64) -> Vec<ViolationKind> {
        let mut out = Vec::new();
        sensor.observe(&SensorInput::MouseMoved { x, y }, at, &mut |s| {
            if let SensorSignal::Violation(c) = s {
                out.push(c.kind);
            }
        });
        out
    }

    #[test]
    fn six_teleports_flag_suspicious_activity() {
        let mut sensor = MouseBehaviorSensor::new(MouseSensorConfig::default()).unwrap();
        sensor.start(0).unwrap();
        let mut fired = Vec::new();
        // Alternate corners every 50 ms; irregular enough to never look straight.
        let corners = [(0.0, 0.0), (500.0, 40.0), (30.0, 480.0), (520.0, 510.0)];
        for i in 0..7u64 {
            let (x, y) = corners[(i % 4) as usize];
            fired.extend(move_to(&mut sensor, x, y, i * 50));
        }
        assert_eq!(fired, vec![ViolationKind::SuspiciousMouseActivity]);
    }

    #[test]
    fn slow_long_moves_are_not_teleports() {
        let mut sensor = MouseBehaviorSensor::new(MouseSensorConfig::default()).unwrap();
        sensor.start(0).unwrap();
        let corners = [(0.0, 0.0), (500.0, 40.0), (30.0, 480.0), (520.0, 510.0)];
        for i in 0..20u64 {
            let (x, y) = corners[(i % 4) as usize];
            assert!(move_to(&mut sensor, x, y, i * 500).is_empty());
        }
    }

    #[test]
    fn repeated_straight_lines_flag_automation() {
        let mut sensor = MouseBehaviorSensor::new(MouseSensorConfig::default()).unwrap();
        sensor.start(0).unwrap();
        let mut fired = Vec::new();
        // 40 samples on a perfect diagonal, 20 ms and ~7 px apart: 4 straight windows.
        for i in 0..40u64 {
            let p = i as f64 * 5.0;
            fired.extend(move_to(&mut sensor, p, p, i * 20));
        }
        assert_eq!(fired, vec![ViolationKind::AutomatedMousePattern]);
    }

    #[test]
    fn resting_cursor_is_not_automation() {
        let mut sensor = MouseBehaviorSensor::new(MouseSensorConfig::default()).unwrap();
        sensor.start(0).unwrap();
        for i in 0..60u64 {
            assert!(move_to(&mut sensor, 10.0, 10.0, i * 20).is_empty());
        }
    }

    #[test]
    fn degenerate_line_window_is_rejected() {
        for line_window in [0, 1] {
            let config = MouseSensorConfig {
                line_window,
                ..MouseSensorConfig::default()
            };
            assert!(MouseBehaviorSensor::new(config).is_err());
        }
        let config = MouseSensorConfig {
            history: 5,
            ..MouseSensorConfig::default()
        };
        assert!(MouseBehaviorSensor::new(config).is_err());
    }
}
