use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::sensors::{HostRequest, InputVerdict, Sensor, SensorInput, SensorSignal};
use crate::violation::{CandidateViolation, SensorKind, ViolationKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClipboardSensorConfig {
    pub poll_interval_ms: u64,
    /// Changes above this count fire `excessive_clipboard_activity`.
    pub max_changes: u32,
}

impl Default for ClipboardSensorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            max_changes: 10,
        }
    }
}

/// Counts clipboard content changes between polls. Only a digest of the
/// last content is kept.
#[derive(Debug)]
pub struct ClipboardSensor {
    config: ClipboardSensorConfig,
    active: bool,
    last_digest: Option<[u8; 32]>,
    changes: u32,
    unreadable_polls: u64,
}

impl ClipboardSensor {
    pub fn new(config: ClipboardSensorConfig) -> Self {
        Self {
            config,
            active: false,
            last_digest: None,
            changes: 0,
            unreadable_polls: 0,
        }
    }

    pub fn changes(&self) -> u32 {
        self.changes
    }
}

impl Sensor for ClipboardSensor {
    fn kind(&self) -> SensorKind {
        SensorKind::Clipboard
    }

    fn start(&mut self, _now_ms: u64) -> Result<()> {
        self.active = true;
        self.last_digest = None;
        self.changes = 0;
        Ok(())
    }

    fn stop(&mut self) {
        self.active = false;
        self.last_digest = None;
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn poll_interval_ms(&self) -> Option<u64> {
        Some(self.config.poll_interval_ms)
    }

    fn poll(&mut self, _now_ms: u64, emit: &mut dyn FnMut(SensorSignal)) {
        emit(SensorSignal::Request(HostRequest::ReadClipboard));
    }

    fn observe(
        &mut self,
        input: &SensorInput,
        _now_ms: u64,
        emit: &mut dyn FnMut(SensorSignal),
    ) -> InputVerdict {
        let SensorInput::ClipboardRead { content } = input else {
            return InputVerdict::Allow;
        };
        let Some(content) = content else {
            self.unreadable_polls += 1;
            log::debug!("clipboard not readable ({} polls)", self.unreadable_polls);
            return InputVerdict::Allow;
        };

        let digest: [u8; 32] = Sha256::digest(content.as_bytes()).into();
        match self.last_digest.replace(digest) {
            Some(prev) if prev != digest => self.changes += 1,
            _ => {}
        }

        if self.changes > self.config.max_changes {
            emit(SensorSignal::Violation(
                CandidateViolation::new(
                    ViolationKind::ExcessiveClipboardActivity,
                    SensorKind::Clipboard,
                )
                .with_detail("changes", self.changes),
            ));
            self.changes = 0;
        }
        InputVerdict::Allow
    }
}
