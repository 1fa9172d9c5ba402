//! Face-embedding collaborator boundary.
//!
//! The face model is external. The kernel only sees the `FaceDetector`
//! trait: frame in, zero or more `FaceDetection`s out.

mod backend;
pub mod backends;
mod result;

pub use backend::{detect_with_timeout, shared, FaceDetector, SharedFaceDetector};
pub use backends::{ScriptedFaceBackend, StubFaceBackend};
pub use result::{BoundingBox, FaceDetection, FaceLandmarks, Point};
