use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::FaceDetector;
use crate::detect::result::{BoundingBox, FaceDetection, FaceLandmarks, Point};
use crate::frame::FaceFrame;

pub const STUB_DESCRIPTOR_LEN: usize = 128;

/// Stub backend for testing. Blank frames contain no face; any other frame
/// contains one attentive face whose descriptor is derived from the pixel
/// hash, so identical frames always produce identical descriptors.
#[derive(Default)]
pub struct StubFaceBackend;

impl StubFaceBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn descriptor_for(frame: &FaceFrame) -> Vec<f32> {
        let seed = frame.content_hash();
        let mut out = Vec::with_capacity(STUB_DESCRIPTOR_LEN);
        let mut block = 0u32;
        while out.len() < STUB_DESCRIPTOR_LEN {
            let mut hasher = Sha256::new();
            hasher.update(seed);
            hasher.update(block.to_le_bytes());
            let digest: [u8; 32] = hasher.finalize().into();
            out.extend(digest.iter().map(|b| *b as f32 / 127.5 - 1.0));
            block += 1;
        }
        out.truncate(STUB_DESCRIPTOR_LEN);
        out
    }
}

impl FaceDetector for StubFaceBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &FaceFrame) -> Result<Vec<FaceDetection>> {
        if frame.is_blank() {
            return Ok(vec![]);
        }
        let w = frame.width as f32;
        let h = frame.height as f32;
        Ok(vec![FaceDetection {
            bounding_box: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: w,
                height: h,
            },
            landmarks: FaceLandmarks {
                left_eye: Point::new(w * 0.35, h * 0.4),
                right_eye: Point::new(w * 0.65, h * 0.4),
                nose: Point::new(w * 0.5, h * 0.55),
            },
            descriptor: Self::descriptor_for(frame),
            score: 0.99,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_frames_produce_identical_descriptors() {
        let mut backend = StubFaceBackend::new();
        let a = FaceFrame::new(vec![3; 27], 3, 3, 0).unwrap();
        let b = FaceFrame::new(vec![3; 27], 3, 3, 10).unwrap();
        let c = FaceFrame::new(vec![4; 27], 3, 3, 0).unwrap();
        let fa = backend.detect(&a).unwrap();
        let fb = backend.detect(&b).unwrap();
        let fc = backend.detect(&c).unwrap();
        assert_eq!(fa[0].descriptor, fb[0].descriptor);
        assert_ne!(fa[0].descriptor, fc[0].descriptor);
        assert_eq!(fa[0].descriptor.len(), STUB_DESCRIPTOR_LEN);
    }

    #[test]
    fn blank_frame_has_no_face() {
        let mut backend = StubFaceBackend::new();
        let blank = FaceFrame::new(vec![0; 27], 3, 3, 0).unwrap();
        assert!(backend.detect(&blank).unwrap().is_empty());
    }
}
