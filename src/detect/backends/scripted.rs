use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::detect::backend::FaceDetector;
use crate::detect::result::FaceDetection;
use crate::frame::FaceFrame;

/// Replays a queue of canned model outputs, one per `detect` call.
/// An exhausted queue reports no face.
#[derive(Default)]
pub struct ScriptedFaceBackend {
    queue: VecDeque<Result<Vec<FaceDetection>, String>>,
}

impl ScriptedFaceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_faces(&mut self, faces: Vec<FaceDetection>) {
        self.queue.push_back(Ok(faces));
    }

    pub fn push_failure(&mut self, reason: &str) {
        self.queue.push_back(Err(reason.to_string()));
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl FaceDetector for ScriptedFaceBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &FaceFrame) -> Result<Vec<FaceDetection>> {
        match self.queue.pop_front() {
            Some(Ok(faces)) => Ok(faces),
            Some(Err(reason)) => Err(anyhow!("scripted model failure: {}", reason)),
            None => Ok(vec![]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_in_order() {
        let mut backend = ScriptedFaceBackend::new();
        backend.push_faces(vec![FaceDetection::default(), FaceDetection::default()]);
        backend.push_failure("model not loaded");
        let frame = FaceFrame::new(vec![1; 3], 1, 1, 0).unwrap();
        assert_eq!(backend.detect(&frame).unwrap().len(), 2);
        assert!(backend.detect(&frame).is_err());
        assert!(backend.detect(&frame).unwrap().is_empty());
        assert_eq!(backend.remaining(), 0);
    }
}
