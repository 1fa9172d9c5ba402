//! Integrity error taxonomy.
//!
//! Fallible kernel APIs return `anyhow::Result`. Errors that callers are
//! expected to branch on are raised as `IntegrityError` so they can be
//! recovered with `err.downcast_ref::<IntegrityError>()`.

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntegrityError {
    /// A sensor could not start (model or asset load failure). The sensor is
    /// degraded; the others keep running.
    SensorInitFailure { sensor: String, reason: String },
    /// Zero or more than one face in a frame that needed exactly one.
    NoFaceDetected { faces: usize },
    /// Identity verification attempt cap reached. Blocks entry to monitoring.
    VerificationExceededAttempts { attempts: u32 },
    /// The encrypted peer channel failed to connect or to authenticate.
    ChannelConnectionFailure { reason: String },
    /// Persisted exam progress could not be decoded.
    PersistenceCorrupt { key: String, reason: String },
    /// The requested stage transition is not allowed from the current stage.
    InvalidTransition { from: String, to: String },
    /// A sub-stage or action is locked (forward skip or fullscreen gate).
    StageLocked { reason: String },
    /// A caller-imposed deadline elapsed.
    Timeout { operation: String, after_ms: u64 },
}

impl IntegrityError {
    pub fn code(&self) -> &'static str {
        match self {
            IntegrityError::SensorInitFailure { .. } => "INTEGRITY_SENSOR_INIT_FAILURE",
            IntegrityError::NoFaceDetected { .. } => "INTEGRITY_NO_FACE",
            IntegrityError::VerificationExceededAttempts { .. } => {
                "INTEGRITY_VERIFICATION_EXCEEDED_ATTEMPTS"
            }
            IntegrityError::ChannelConnectionFailure { .. } => "INTEGRITY_CHANNEL_FAILURE",
            IntegrityError::PersistenceCorrupt { .. } => "INTEGRITY_PERSISTENCE_CORRUPT",
            IntegrityError::InvalidTransition { .. } => "INTEGRITY_INVALID_TRANSITION",
            IntegrityError::StageLocked { .. } => "INTEGRITY_STAGE_LOCKED",
            IntegrityError::Timeout { .. } => "INTEGRITY_TIMEOUT",
        }
    }

    /// Fatal errors block progression and need a blocking prompt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IntegrityError::VerificationExceededAttempts { .. })
    }
}

impl std::fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityError::SensorInitFailure { sensor, reason } => {
                write!(f, "{}: sensor {} failed to start: {}", self.code(), sensor, reason)
            }
            IntegrityError::NoFaceDetected { faces } => write!(
                f,
                "{}: expected exactly one face, detected {}",
                self.code(),
                faces
            ),
            IntegrityError::VerificationExceededAttempts { attempts } => write!(
                f,
                "{}: identity verification failed {} times",
                self.code(),
                attempts
            ),
            IntegrityError::ChannelConnectionFailure { reason } => {
                write!(f, "{}: {}", self.code(), reason)
            }
            IntegrityError::PersistenceCorrupt { key, reason } => {
                write!(f, "{}: {}: {}", self.code(), key, reason)
            }
            IntegrityError::InvalidTransition { from, to } => {
                write!(f, "{}: {} -> {}", self.code(), from, to)
            }
            IntegrityError::StageLocked { reason } => write!(f, "{}: {}", self.code(), reason),
            IntegrityError::Timeout {
                operation,
                after_ms,
            } => write!(
                f,
                "{}: {} timed out after {} ms",
                self.code(),
                operation,
                after_ms
            ),
        }
    }
}

impl std::error::Error for IntegrityError {}

/// Returns the integrity error carried by `err`, if any.
pub fn integrity_error(err: &anyhow::Error) -> Option<&IntegrityError> {
    err.downcast_ref::<IntegrityError>()
}
