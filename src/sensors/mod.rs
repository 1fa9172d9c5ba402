//! Integrity sensors.
//!
//! Every detector implements `Sensor` and is driven uniformly through a
//! `SensorSet`: host inputs are offered to every active sensor, and sensors
//! with a polling interval are polled from the coordinator's timer queue.
//! Sensors never touch the ledger. They report through the `emit` callback
//! and the coordinator funnels every candidate into `log_violation`.
//!
//! Sensor-local failures are logged and degrade that sensor only.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::detect::FaceDetection;
use crate::identity::ReferenceHandle;
use crate::storage::SharedProgressStore;
use crate::violation::{CandidateViolation, SensorKind};

pub mod clipboard;
pub mod face;
pub mod focus;
pub mod fullscreen;
pub mod instances;
pub mod keys;
pub mod mouse;
pub mod network;

pub use clipboard::{ClipboardSensor, ClipboardSensorConfig};
pub use face::{FaceSensor, FaceSensorConfig};
pub use focus::{FocusSensor, FocusSensorConfig};
pub use fullscreen::FullscreenSensor;
pub use instances::{MultiInstanceSensor, MultiInstanceSensorConfig};
pub use keys::{KeyChord, KeyCombinationSensor};
pub use mouse::{MouseBehaviorSensor, MouseSensorConfig};
pub use network::{NetworkRequestSensor, NetworkSensorConfig};

pub const DEFAULT_GOOD_BEHAVIOR_MS: u64 = 10_000;

/// Identifies one asynchronous face-inference request. Results carrying a
/// ticket from an earlier sensor epoch are discarded.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InferenceTicket {
    pub epoch: u64,
    pub seq: u64,
    pub issued_at_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FaceInferenceOutcome {
    Faces { faces: Vec<FaceDetection> },
    Failed { reason: String },
}

/// Host events delivered to the sensors.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorInput {
    FullscreenChanged { active: bool },
    FocusLost,
    FocusGained,
    KeyDown { chord: KeyChord },
    /// Result of a clipboard read; `None` when the clipboard is not readable.
    ClipboardRead { content: Option<String> },
    MouseMoved { x: f64, y: f64 },
    OutboundRequest { url: String },
    FaceInference {
        ticket: InferenceTicket,
        outcome: FaceInferenceOutcome,
    },
}

/// Work the host must perform asynchronously on the sensors' behalf.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostRequest {
    CaptureFrame { ticket: InferenceTicket },
    ReadClipboard,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SensorSignal {
    Violation(CandidateViolation),
    /// Sustained good behaviour observed by this sensor.
    Recovered(SensorKind),
    Request(HostRequest),
}

/// Whether the host should let the originating event through.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputVerdict {
    #[default]
    Allow,
    /// Suppress the event (`preventDefault`, cancel the request).
    Block,
}

impl InputVerdict {
    pub fn merge(self, other: InputVerdict) -> InputVerdict {
        if self == InputVerdict::Block || other == InputVerdict::Block {
            InputVerdict::Block
        } else {
            InputVerdict::Allow
        }
    }
}

pub trait Sensor: Send {
    fn kind(&self) -> SensorKind;

    fn start(&mut self, now_ms: u64) -> Result<()>;

    /// Detaches the sensor. No signal may be emitted after `stop` returns.
    fn stop(&mut self);

    fn is_active(&self) -> bool;

    /// Polling interval, for sensors driven by the timer queue.
    fn poll_interval_ms(&self) -> Option<u64> {
        None
    }

    fn observe(
        &mut self,
        _input: &SensorInput,
        _now_ms: u64,
        _emit: &mut dyn FnMut(SensorSignal),
    ) -> InputVerdict {
        InputVerdict::Allow
    }

    fn poll(&mut self, _now_ms: u64, _emit: &mut dyn FnMut(SensorSignal)) {}
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SensorConfig {
    pub focus: FocusSensorConfig,
    pub clipboard: ClipboardSensorConfig,
    pub mouse: MouseSensorConfig,
    pub instances: MultiInstanceSensorConfig,
    pub network: NetworkSensorConfig,
    pub face: FaceSensorConfig,
}

#[derive(Default)]
pub struct SensorSet {
    sensors: Vec<Box<dyn Sensor>>,
}

impl SensorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full detector suite for one exam session.
    pub fn standard(
        config: &SensorConfig,
        store: SharedProgressStore,
        reference: ReferenceHandle,
    ) -> Result<Self> {
        let mut set = Self::new();
        set.push(Box::new(FullscreenSensor::new()));
        set.push(Box::new(FocusSensor::new(config.focus)));
        set.push(Box::new(KeyCombinationSensor::new()));
        set.push(Box::new(ClipboardSensor::new(config.clipboard)));
        set.push(Box::new(MouseBehaviorSensor::new(config.mouse)?));
        set.push(Box::new(MultiInstanceSensor::new(config.instances, store)));
        set.push(Box::new(NetworkRequestSensor::new(&config.network)?));
        set.push(Box::new(FaceSensor::new(config.face, reference)));
        Ok(set)
    }

    pub fn push(&mut self, sensor: Box<dyn Sensor>) {
        self.sensors.push(sensor);
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn kinds(&self) -> Vec<SensorKind> {
        self.sensors.iter().map(|s| s.kind()).collect()
    }

    /// Starts every sensor. Failures degrade the failing sensor and are
    /// returned; the remaining sensors keep running.
    pub fn start_all(&mut self, now_ms: u64) -> Vec<(SensorKind, anyhow::Error)> {
        let mut failures = Vec::new();
        for sensor in &mut self.sensors {
            if let Err(e) = sensor.start(now_ms) {
                log::warn!("sensor {} degraded: {}", sensor.kind().as_str(), e);
                sensor.stop();
                failures.push((sensor.kind(), e));
            }
        }
        failures
    }

    pub fn stop_all(&mut self) {
        for sensor in &mut self.sensors {
            sensor.stop();
        }
    }

    pub fn any_active(&self) -> bool {
        self.sensors.iter().any(|s| s.is_active())
    }

    /// Polling schedule of the active sensors as `(index, interval)`.
    pub fn poll_schedule(&self) -> Vec<(usize, u64)> {
        self.sensors
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_active())
            .filter_map(|(i, s)| s.poll_interval_ms().map(|ms| (i, ms)))
            .collect()
    }

    pub fn observe(
        &mut self,
        input: &SensorInput,
        now_ms: u64,
        emit: &mut dyn FnMut(SensorSignal),
    ) -> InputVerdict {
        let mut verdict = InputVerdict::Allow;
        for sensor in self.sensors.iter_mut().filter(|s| s.is_active()) {
            verdict = verdict.merge(sensor.observe(input, now_ms, emit));
        }
        verdict
    }

    /// Polls one sensor; returns its interval if it is still active.
    pub fn poll(
        &mut self,
        index: usize,
        now_ms: u64,
        emit: &mut dyn FnMut(SensorSignal),
    ) -> Option<u64> {
        let sensor = self.sensors.get_mut(index)?;
        if !sensor.is_active() {
            return None;
        }
        sensor.poll(now_ms, emit);
        if sensor.is_active() {
            sensor.poll_interval_ms()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::new_reference_handle;
    use crate::storage::InMemoryProgressStore;

    #[test]
    fn standard_set_contains_every_detector() {
        let set = SensorSet::standard(
            &SensorConfig::default(),
            InMemoryProgressStore::shared(),
            new_reference_handle(),
        )
        .expect("sensor set");
        assert_eq!(
            set.kinds(),
            vec![
                SensorKind::Fullscreen,
                SensorKind::Focus,
                SensorKind::KeyCombination,
                SensorKind::Clipboard,
                SensorKind::Mouse,
                SensorKind::MultiInstance,
                SensorKind::Network,
                SensorKind::Face,
            ]
        );
        assert!(!set.any_active());
    }

    #[test]
    fn stopped_set_ignores_input() {
        let mut set = SensorSet::standard(
            &SensorConfig::default(),
            InMemoryProgressStore::shared(),
            new_reference_handle(),
        )
        .expect("sensor set");
        assert!(set.start_all(0).is_empty());
        assert!(!set.poll_schedule().is_empty());
        set.stop_all();

        let mut signals = Vec::new();
        let verdict = set.observe(
            &SensorInput::KeyDown {
                chord: KeyChord::key("F12"),
            },
            10,
            &mut |s| signals.push(s),
        );
        assert_eq!(verdict, InputVerdict::Allow);
        assert!(signals.is_empty());
        assert!(set.poll_schedule().is_empty());
    }
}
