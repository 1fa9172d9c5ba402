//! Exam Integrity Kernel (EIK)
//!
//! This crate implements the integrity core of a proctored online exam: it
//! watches the candidate's environment while an exam runs, records policy
//! violations, escalates repeated misbehaviour to an automatic submission and
//! persists exam progress so a reload resumes where it left off.
//!
//! # Architecture
//!
//! The kernel holds these invariants by construction:
//!
//! 1. **Exactly-once submission**: an exam is submitted at most once, whatever
//!    mix of countdown expiry, second infraction or manual submit races for it.
//! 2. **Monotonic stages**: `identity -> monitoring -> submitted`, never back.
//! 3. **Quiet when stopped**: sensors that are not running produce nothing,
//!    and late face-inference results from a previous epoch are discarded.
//! 4. **Debounced ledger**: the same violation kind is recorded at most once
//!    per debounce window.
//! 5. **Sealed channel**: proctor control traffic is authenticated and
//!    encrypted with a per-session key; the transport never sees plaintext.
//!
//! # Module Structure
//!
//! - `sensors`: browser and camera signal sources (fullscreen, focus, keys,
//!   clipboard, mouse, network, multi-instance, face)
//! - `violation`: severity table, debounced ledger and risk scoring
//! - `policy`: consecutive-violation escalation and auto-submit countdown
//! - `identity`: reference capture and descriptor matching
//! - `session`: stage state machine with persisted progress
//! - `monitor`: the orchestrator tying the above together
//! - `channel`: secure proctor signalling and control messages

pub mod channel;
pub mod clock;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod identity;
pub mod monitor;
pub mod policy;
pub mod sensors;
pub mod session;
pub mod storage;
pub mod violation;

pub use channel::{
    ChannelEvent, ConnectionState, ControlMessage, MemoryTransport, PeerTransport,
    SecureChannelCoordinator,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::IntegrityConfig;
pub use detect::{FaceDetection, FaceDetector, StubFaceBackend};
pub use error::IntegrityError;
pub use frame::FaceFrame;
pub use identity::{IdentityVerifier, ReferenceIdentity, VerificationResult};
pub use monitor::{
    AutoSubmit, ExamMonitor, MonitorCallbacks, MonitorConfig, MonitorEvent, NoopCallbacks,
    RecordingCallbacks, Warning,
};
pub use policy::{AutoSubmitState, SecondInfractionAction};
pub use sensors::{HostRequest, InputVerdict, SensorInput};
pub use session::{ExamSession, ExamSessionStateMachine, ExamStage, SubStage, SubmitReason};
pub use storage::{InMemoryProgressStore, ProgressStore, SqliteProgressStore};
pub use violation::{RiskLevel, Severity, SensorKind, Violation, ViolationKind};
