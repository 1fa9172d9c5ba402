use anyhow::Result;

use crate::detect::FaceDetection;
use crate::identity::{ReferenceHandle, DEFAULT_MATCH_THRESHOLD};
use crate::sensors::{
    FaceInferenceOutcome, HostRequest, InferenceTicket, InputVerdict, Sensor, SensorInput,
    SensorSignal, DEFAULT_GOOD_BEHAVIOR_MS,
};
use crate::violation::{CandidateViolation, SensorKind, ViolationKind};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FaceSensorConfig {
    pub tick_ms: u64,
    /// Minimum spacing between two `no_face` reports.
    pub no_face_throttle_ms: u64,
    pub looking_away_ratio: f32,
    /// Gaze must stay off-centre this long before `looking_away` fires.
    pub looking_away_sustain_ms: u64,
    pub match_threshold: f32,
    /// An unanswered capture older than this is abandoned.
    pub inference_timeout_ms: u64,
    pub good_behavior_ms: u64,
}

impl Default for FaceSensorConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            no_face_throttle_ms: 3_000,
            looking_away_ratio: 0.3,
            looking_away_sustain_ms: 3_000,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            inference_timeout_ms: 5_000,
            good_behavior_ms: DEFAULT_GOOD_BEHAVIOR_MS,
        }
    }
}

/// Periodic face presence, gaze and identity checks.
///
/// Each tick asks the host for a frame with a fresh `InferenceTicket`; the
/// host runs the model and answers with a `FaceInference` input. At most one
/// request is in flight. `start` and `stop` bump the epoch, so a result
/// that arrives after the sensor was stopped (or restarted) is ignored.
pub struct FaceSensor {
    config: FaceSensorConfig,
    reference: ReferenceHandle,
    active: bool,
    epoch: u64,
    seq: u64,
    in_flight: Option<InferenceTicket>,
    last_no_face_ms: Option<u64>,
    looking_away_since_ms: Option<u64>,
    good_since_ms: Option<u64>,
    recovery_pending: bool,
    failures: u64,
}

impl FaceSensor {
    pub fn new(config: FaceSensorConfig, reference: ReferenceHandle) -> Self {
        Self {
            config,
            reference,
            active: false,
            epoch: 0,
            seq: 0,
            in_flight: None,
            last_no_face_ms: None,
            looking_away_since_ms: None,
            good_since_ms: None,
            recovery_pending: false,
            failures: 0,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn in_flight(&self) -> Option<InferenceTicket> {
        self.in_flight
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    fn reset_tracking(&mut self) {
        self.in_flight = None;
        self.last_no_face_ms = None;
        self.looking_away_since_ms = None;
        self.good_since_ms = None;
        self.recovery_pending = false;
    }

    fn anomaly(&mut self) {
        self.good_since_ms = None;
        self.recovery_pending = true;
    }

    fn process(&mut self, faces: &[FaceDetection], now_ms: u64, emit: &mut dyn FnMut(SensorSignal)) {
        let face = match faces {
            [] => {
                self.looking_away_since_ms = None;
                self.anomaly();
                let throttled = self
                    .last_no_face_ms
                    .map(|last| now_ms.saturating_sub(last) < self.config.no_face_throttle_ms)
                    .unwrap_or(false);
                if !throttled {
                    self.last_no_face_ms = Some(now_ms);
                    emit(SensorSignal::Violation(CandidateViolation::new(
                        ViolationKind::NoFace,
                        SensorKind::Face,
                    )));
                }
                return;
            }
            [face] => face,
            many => {
                self.looking_away_since_ms = None;
                self.anomaly();
                emit(SensorSignal::Violation(
                    CandidateViolation::new(ViolationKind::MultipleFaces, SensorKind::Face)
                        .with_detail("faces", many.len()),
                ));
                return;
            }
        };

        let mut clean = true;

        match face.landmarks.gaze_ratio() {
            Some(ratio) if ratio > self.config.looking_away_ratio => {
                clean = false;
                let since = *self.looking_away_since_ms.get_or_insert(now_ms);
                if now_ms.saturating_sub(since) >= self.config.looking_away_sustain_ms {
                    emit(SensorSignal::Violation(
                        CandidateViolation::new(ViolationKind::LookingAway, SensorKind::Face)
                            .with_detail("gaze_ratio", format!("{:.2}", ratio)),
                    ));
                    // Re-arm: a continued look-away reports again after another sustain period.
                    self.looking_away_since_ms = Some(now_ms);
                }
            }
            _ => self.looking_away_since_ms = None,
        }

        let distance = match self.reference.read() {
            Ok(slot) => slot.as_ref().map(|r| r.distance_to(&face.descriptor)),
            Err(_) => {
                log::warn!("reference identity lock poisoned; skipping identity check");
                None
            }
        };
        if let Some(distance) = distance {
            if distance > self.config.match_threshold {
                clean = false;
                emit(SensorSignal::Violation(
                    CandidateViolation::new(ViolationKind::FaceMismatch, SensorKind::Face)
                        .with_detail("distance", format!("{:.3}", distance)),
                ));
            }
        }

        if !clean {
            self.anomaly();
            return;
        }
        let since = *self.good_since_ms.get_or_insert(now_ms);
        if self.recovery_pending && now_ms.saturating_sub(since) >= self.config.good_behavior_ms {
            self.recovery_pending = false;
            emit(SensorSignal::Recovered(SensorKind::Face));
        }
    }
}

impl Sensor for FaceSensor {
    fn kind(&self) -> SensorKind {
        SensorKind::Face
    }

    fn start(&mut self, _now_ms: u64) -> Result<()> {
        self.epoch += 1;
        self.reset_tracking();
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.epoch += 1;
        self.reset_tracking();
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn poll_interval_ms(&self) -> Option<u64> {
        Some(self.config.tick_ms)
    }

    fn poll(&mut self, now_ms: u64, emit: &mut dyn FnMut(SensorSignal)) {
        if let Some(pending) = self.in_flight {
            if now_ms.saturating_sub(pending.issued_at_ms) < self.config.inference_timeout_ms {
                return;
            }
            log::warn!(
                "face inference {} unanswered after {} ms; abandoning",
                pending.seq,
                now_ms.saturating_sub(pending.issued_at_ms)
            );
            self.failures += 1;
        }
        self.seq += 1;
        let ticket = InferenceTicket {
            epoch: self.epoch,
            seq: self.seq,
            issued_at_ms: now_ms,
        };
        self.in_flight = Some(ticket);
        emit(SensorSignal::Request(HostRequest::CaptureFrame { ticket }));
    }

    fn observe(
        &mut self,
        input: &SensorInput,
        now_ms: u64,
        emit: &mut dyn FnMut(SensorSignal),
    ) -> InputVerdict {
        let SensorInput::FaceInference { ticket, outcome } = input else {
            return InputVerdict::Allow;
        };
        if self.in_flight != Some(*ticket) {
            log::debug!(
                "discarding face inference epoch {} seq {} (current epoch {})",
                ticket.epoch,
                ticket.seq,
                self.epoch
            );
            return InputVerdict::Allow;
        }
        self.in_flight = None;
        match outcome {
            FaceInferenceOutcome::Faces { faces } => self.process(faces, now_ms, emit),
            FaceInferenceOutcome::Failed { reason } => {
                self.failures += 1;
                log::warn!("face inference failed: {}", reason);
            }
        }
        InputVerdict::Allow
    }
}
