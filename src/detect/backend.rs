use anyhow::{anyhow, Result};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use crate::detect::result::FaceDetection;
use crate::error::IntegrityError;
use crate::frame::FaceFrame;

/// Face-embedding backend trait.
///
/// # Audit Boundary
///
/// Implementations wrap the external face model. They MUST:
/// - treat the frame pixels as read-only and ephemeral
/// - return zero or more faces, never pixels
///
/// Model loading may be slow or fail on network-dependent asset fetches;
/// callers bound every call with `detect_with_timeout`.
pub trait FaceDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run the model on one frame. An empty vector means no face.
    fn detect(&mut self, frame: &FaceFrame) -> Result<Vec<FaceDetection>>;

    /// Optional model load hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Detectors are shared between the identity flow and the host's frame loop.
pub type SharedFaceDetector = Arc<Mutex<dyn FaceDetector>>;

pub fn shared<D: FaceDetector + 'static>(detector: D) -> SharedFaceDetector {
    Arc::new(Mutex::new(detector))
}

/// Runs a detector on a worker thread and waits at most `timeout`.
///
/// On timeout the worker is abandoned; its late result is dropped. An
/// abandoned worker keeps the detector locked until the model returns, so
/// calls made while it is still running fail fast instead of spawning
/// another thread that would queue behind it.
pub fn detect_with_timeout(
    detector: &SharedFaceDetector,
    frame: Arc<FaceFrame>,
    timeout: Duration,
) -> Result<Vec<FaceDetection>> {
    match detector.try_lock() {
        Ok(_) => {}
        Err(TryLockError::WouldBlock) => {
            return Err(anyhow!("face detector busy with an earlier call"));
        }
        Err(TryLockError::Poisoned(_)) => return Err(anyhow!("face detector lock poisoned")),
    }

    let (tx, rx) = mpsc::channel();
    let detector = Arc::clone(detector);
    std::thread::spawn(move || {
        let result = match detector.lock() {
            Ok(mut guard) => guard.detect(&frame),
            Err(_) => Err(anyhow!("face detector lock poisoned")),
        };
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(IntegrityError::Timeout {
            operation: "face detection".to_string(),
            after_ms: timeout.as_millis() as u64,
        }
        .into()),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(anyhow!("face detector worker exited without a result"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubFaceBackend;
    use crate::error::integrity_error;

    struct SlowBackend;

    impl FaceDetector for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn detect(&mut self, _frame: &FaceFrame) -> Result<Vec<FaceDetection>> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(vec![])
        }
    }

    #[test]
    fn detect_with_timeout_returns_backend_result() {
        let detector = shared(StubFaceBackend::new());
        let frame = Arc::new(FaceFrame::new(vec![9; 48], 4, 4, 0).expect("frame"));
        let faces = detect_with_timeout(&detector, frame, Duration::from_secs(5)).expect("faces");
        assert_eq!(faces.len(), 1);
    }

    #[test]
    fn slow_backend_times_out() {
        let detector = shared(SlowBackend);
        let frame = Arc::new(FaceFrame::new(vec![9; 48], 4, 4, 0).expect("frame"));
        let err = detect_with_timeout(&detector, frame, Duration::from_millis(20)).unwrap_err();
        assert_eq!(
            integrity_error(&err).map(|e| e.code()),
            Some("INTEGRITY_TIMEOUT")
        );
    }

    #[test]
    fn busy_detector_fails_fast() {
        let detector = shared(StubFaceBackend::new());
        let frame = Arc::new(FaceFrame::new(vec![9; 48], 4, 4, 0).expect("frame"));
        let held = detector.lock().unwrap();
        let err = detect_with_timeout(&detector, frame.clone(), Duration::from_secs(5))
            .unwrap_err();
        assert!(err.to_string().contains("busy"));
        drop(held);
        assert_eq!(
            detect_with_timeout(&detector, frame, Duration::from_secs(5))
                .expect("faces")
                .len(),
            1
        );
    }
}
