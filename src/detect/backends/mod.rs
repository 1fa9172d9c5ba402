pub mod scripted;
pub mod stub;

pub use scripted::ScriptedFaceBackend;
pub use stub::StubFaceBackend;
