//! Identity verification against a reference face descriptor.
//!
//! The reference descriptor is biometric data. It never leaves this module
//! except as a distance, is not `Clone` or `Serialize`, and is zeroized when
//! replaced or dropped.

use anyhow::{anyhow, Result};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::detect::{detect_with_timeout, FaceDetection, SharedFaceDetector};
use crate::error::IntegrityError;
use crate::frame::FaceFrame;

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IdentityConfig {
    /// Descriptors closer than this match.
    pub match_threshold: f32,
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }
}

/// Euclidean distance between two descriptors. Descriptors of different
/// length never match.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ReferenceIdentity {
    descriptor: Vec<f32>,
    #[zeroize(skip)]
    captured_at_ms: u64,
}

impl ReferenceIdentity {
    fn new(descriptor: Vec<f32>, captured_at_ms: u64) -> Self {
        Self {
            descriptor,
            captured_at_ms,
        }
    }

    pub fn captured_at_ms(&self) -> u64 {
        self.captured_at_ms
    }

    pub fn distance_to(&self, descriptor: &[f32]) -> f32 {
        euclidean_distance(&self.descriptor, descriptor)
    }
}

impl std::fmt::Debug for ReferenceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceIdentity")
            .field("len", &self.descriptor.len())
            .field("captured_at_ms", &self.captured_at_ms)
            .finish()
    }
}

/// Reference slot shared between the verifier (writer) and the face
/// sensor (reader).
pub type ReferenceHandle = Arc<RwLock<Option<ReferenceIdentity>>>;

pub fn new_reference_handle() -> ReferenceHandle {
    Arc::new(RwLock::new(None))
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VerificationResult {
    pub matched: bool,
    pub distance: f32,
    pub attempts_used: u32,
}

pub struct IdentityVerifier {
    config: IdentityConfig,
    reference: ReferenceHandle,
    failed_attempts: u32,
    verified: bool,
}

impl IdentityVerifier {
    pub fn new(config: IdentityConfig, reference: ReferenceHandle) -> Self {
        Self {
            config,
            reference,
            failed_attempts: 0,
            verified: false,
        }
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn reference(&self) -> ReferenceHandle {
        self.reference.clone()
    }

    pub fn has_reference(&self) -> bool {
        self.reference.read().map(|r| r.is_some()).unwrap_or(false)
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.config.max_attempts.saturating_sub(self.failed_attempts)
    }

    /// Stores the descriptor of the single face in `faces` as the reference.
    /// Any earlier reference is zeroized. Resets the attempt counter.
    pub fn capture_reference(&mut self, faces: &[FaceDetection], now_ms: u64) -> Result<()> {
        let face = single_face(faces)?;
        let mut slot = self
            .reference
            .write()
            .map_err(|_| anyhow!("reference identity lock poisoned"))?;
        *slot = Some(ReferenceIdentity::new(face.descriptor.clone(), now_ms));
        self.failed_attempts = 0;
        self.verified = false;
        log::info!("reference identity captured ({} dims)", face.descriptor.len());
        Ok(())
    }

    /// Compares the single face in `faces` to the reference.
    ///
    /// A frame without a face is not counted as an attempt. Once
    /// `max_attempts` mismatches have been recorded every further call is
    /// refused with `VerificationExceededAttempts` until `retry`.
    pub fn verify(&mut self, faces: &[FaceDetection], _now_ms: u64) -> Result<VerificationResult> {
        if self.failed_attempts >= self.config.max_attempts {
            return Err(IntegrityError::VerificationExceededAttempts {
                attempts: self.failed_attempts,
            }
            .into());
        }
        let face = single_face(faces)?;
        let distance = {
            let slot = self
                .reference
                .read()
                .map_err(|_| anyhow!("reference identity lock poisoned"))?;
            let reference = slot
                .as_ref()
                .ok_or_else(|| anyhow!("no reference identity captured"))?;
            reference.distance_to(&face.descriptor)
        };

        let matched = distance < self.config.match_threshold;
        if matched {
            self.failed_attempts = 0;
            self.verified = true;
            log::info!("identity verified (distance {:.3})", distance);
            return Ok(VerificationResult {
                matched,
                distance,
                attempts_used: 0,
            });
        }

        self.failed_attempts += 1;
        self.verified = false;
        log::warn!(
            "identity mismatch (distance {:.3}, attempt {}/{})",
            distance,
            self.failed_attempts,
            self.config.max_attempts
        );
        Ok(VerificationResult {
            matched,
            distance,
            attempts_used: self.failed_attempts,
        })
    }

    /// Drops the reference and the attempt counter. The candidate starts
    /// over with a fresh reference capture.
    pub fn retry(&mut self) -> Result<()> {
        let mut slot = self
            .reference
            .write()
            .map_err(|_| anyhow!("reference identity lock poisoned"))?;
        *slot = None;
        self.failed_attempts = 0;
        self.verified = false;
        Ok(())
    }

    pub fn capture_from_frame(
        &mut self,
        detector: &SharedFaceDetector,
        frame: Arc<FaceFrame>,
        now_ms: u64,
    ) -> Result<()> {
        let faces = detect_with_timeout(detector, frame, self.config.timeout)?;
        self.capture_reference(&faces, now_ms)
    }

    pub fn verify_from_frame(
        &mut self,
        detector: &SharedFaceDetector,
        frame: Arc<FaceFrame>,
        now_ms: u64,
    ) -> Result<VerificationResult> {
        let faces = detect_with_timeout(detector, frame, self.config.timeout)?;
        self.verify(&faces, now_ms)
    }
}

fn single_face(faces: &[FaceDetection]) -> Result<&FaceDetection> {
    match faces {
        [face] => Ok(face),
        _ => Err(IntegrityError::NoFaceDetected { faces: faces.len() }.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::integrity_error;

    fn face(descriptor: Vec<f32>) -> Vec<FaceDetection> {
        vec![FaceDetection {
            descriptor,
            score: 0.9,
            ..FaceDetection::default()
        }]
    }

    fn verifier() -> IdentityVerifier {
        let mut v = IdentityVerifier::new(IdentityConfig::default(), new_reference_handle());
        v.capture_reference(&face(vec![0.0; 4]), 0).unwrap();
        v
    }

    #[test]
    fn distance_is_euclidean() {
        assert_eq!(euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]), 5.0);
        assert!(euclidean_distance(&[0.0], &[0.0, 1.0]).is_infinite());
    }

    #[test]
    fn close_descriptor_matches() {
        let mut v = verifier();
        let r = v.verify(&face(vec![0.1, 0.1, 0.1, 0.1]), 10).unwrap();
        assert!(r.matched);
        assert!((r.distance - 0.2).abs() < 1e-6);
        assert!(v.is_verified());
    }

    #[test]
    fn fourth_attempt_after_three_mismatches_is_refused() {
        let mut v = verifier();
        for attempt in 1..=3 {
            let r = v.verify(&face(vec![1.0; 4]), 0).unwrap();
            assert!(!r.matched);
            assert!(r.distance > 0.6);
            assert_eq!(r.attempts_used, attempt);
        }
        // Even a matching face is refused now.
        let err = v.verify(&face(vec![0.0; 4]), 0).unwrap_err();
        let integrity = integrity_error(&err).expect("typed error");
        assert_eq!(integrity.code(), "INTEGRITY_VERIFICATION_EXCEEDED_ATTEMPTS");
        assert!(integrity.is_fatal());

        v.retry().unwrap();
        assert!(!v.has_reference());
        v.capture_reference(&face(vec![0.0; 4]), 5).unwrap();
        assert!(v.verify(&face(vec![0.0; 4]), 6).unwrap().matched);
    }

    #[test]
    fn distance_equal_to_threshold_does_not_match() {
        let mut v = verifier();
        let r = v.verify(&face(vec![0.6, 0.0, 0.0, 0.0]), 0).unwrap();
        assert_eq!(r.distance, 0.6);
        assert!(!r.matched);
    }

    #[test]
    fn success_resets_failed_attempts() {
        let mut v = verifier();
        v.verify(&face(vec![1.0; 4]), 0).unwrap();
        v.verify(&face(vec![1.0; 4]), 0).unwrap();
        v.verify(&face(vec![0.0; 4]), 0).unwrap();
        assert_eq!(v.failed_attempts(), 0);
        assert_eq!(v.attempts_remaining(), 3);
    }

    #[test]
    fn missing_face_is_not_an_attempt() {
        let mut v = verifier();
        let err = v.verify(&[], 0).unwrap_err();
        assert_eq!(integrity_error(&err).map(|e| e.code()), Some("INTEGRITY_NO_FACE"));
        let mut two = face(vec![0.0; 4]);
        two.extend(face(vec![0.0; 4]));
        assert!(v.verify(&two, 0).is_err());
        assert_eq!(v.failed_attempts(), 0);
    }

    #[test]
    fn verify_without_reference_fails() {
        let mut v = IdentityVerifier::new(IdentityConfig::default(), new_reference_handle());
        assert!(v.verify(&face(vec![0.0; 4]), 0).is_err());
        assert!(!v.has_reference());
    }

    #[test]
    fn reference_is_shared_through_handle() {
        let handle = new_reference_handle();
        let mut v = IdentityVerifier::new(IdentityConfig::default(), handle.clone());
        v.capture_reference(&face(vec![1.0, 2.0]), 7).unwrap();
        let slot = handle.read().unwrap();
        let reference = slot.as_ref().unwrap();
        assert_eq!(reference.captured_at_ms(), 7);
        assert_eq!(reference.distance_to(&[1.0, 2.0]), 0.0);
        assert!(!format!("{:?}", reference).contains("1.0"));
    }

    #[test]
    fn frame_paths_run_detector() {
        use crate::detect::{shared, StubFaceBackend};
        let detector = shared(StubFaceBackend::new());
        let frame = Arc::new(FaceFrame::new(vec![9; 12], 2, 2, 0).unwrap());
        let mut v = IdentityVerifier::new(IdentityConfig::default(), new_reference_handle());
        v.capture_from_frame(&detector, frame.clone(), 0).unwrap();
        let r = v.verify_from_frame(&detector, frame, 10).unwrap();
        assert!(r.matched);
        assert_eq!(r.distance, 0.0);

        let blank = Arc::new(FaceFrame::new(vec![0; 12], 2, 2, 0).unwrap());
        assert!(v.verify_from_frame(&detector, blank, 20).is_err());
    }
}
