use anyhow::Result;

use crate::sensors::{InputVerdict, Sensor, SensorInput, SensorSignal};
use crate::violation::{CandidateViolation, SensorKind, ViolationKind};

/// Fires `fullscreen_exit` on every true -> false transition.
#[derive(Debug, Default)]
pub struct FullscreenSensor {
    active: bool,
    fullscreen: Option<bool>,
    exits: u32,
}

impl FullscreenSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exits(&self) -> u32 {
        self.exits
    }
}

impl Sensor for FullscreenSensor {
    fn kind(&self) -> SensorKind {
        SensorKind::Fullscreen
    }

    fn start(&mut self, _now_ms: u64) -> Result<()> {
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn observe(
        &mut self,
        input: &SensorInput,
        _now_ms: u64,
        emit: &mut dyn FnMut(SensorSignal),
    ) -> InputVerdict {
        if let SensorInput::FullscreenChanged { active } = input {
            let was = self.fullscreen.replace(*active);
            if was == Some(true) && !*active {
                self.exits += 1;
                emit(SensorSignal::Violation(
                    CandidateViolation::new(ViolationKind::FullscreenExit, SensorKind::Fullscreen)
                        .with_detail("exit_count", self.exits),
                ));
            }
        }
        InputVerdict::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(sensor: &mut FullscreenSensor, active: bool) -> usize {
        let mut n = 0;
        sensor.observe(&SensorInput::FullscreenChanged { active }, 0, &mut |_| n += 1);
        n
    }

    #[test]
    fn fires_only_on_exit_transition() {
        let mut sensor = FullscreenSensor::new();
        sensor.start(0).unwrap();
        assert_eq!(feed(&mut sensor, false), 0, "unknown -> false is not an exit");
        assert_eq!(feed(&mut sensor, true), 0);
        assert_eq!(feed(&mut sensor, false), 1);
        assert_eq!(feed(&mut sensor, false), 0, "repeated false is not a new exit");
        assert_eq!(feed(&mut sensor, true), 0);
        assert_eq!(feed(&mut sensor, false), 1);
        assert_eq!(sensor.exits(), 2);
    }
}
