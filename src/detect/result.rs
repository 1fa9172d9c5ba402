use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// The landmarks the gaze heuristic needs.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FaceLandmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
}

impl FaceLandmarks {
    /// Horizontal offset of the nose from the eye midpoint, relative to the
    /// eye distance. `None` when the eyes coincide.
    pub fn gaze_ratio(&self) -> Option<f32> {
        let eye_distance = (self.right_eye.x - self.left_eye.x).abs();
        if eye_distance < f32::EPSILON {
            return None;
        }
        let mid_x = (self.left_eye.x + self.right_eye.x) / 2.0;
        Some((self.nose.x - mid_x).abs() / eye_distance)
    }
}

/// One face found by the external embedding model.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FaceDetection {
    pub bounding_box: BoundingBox,
    pub landmarks: FaceLandmarks,
    pub descriptor: Vec<f32>,
    pub score: f32,
}
