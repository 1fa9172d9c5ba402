//! Violations and the violation ledger.
//!
//! The ledger is append-only. Violations of the same kind arriving inside
//! the debounce window are dropped rather than stored, and only the most
//! recent `max_records` entries are retained in memory. Session-wide
//! counters keep counting past the retention bound.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

pub const DEFAULT_DEBOUNCE_MS: u64 = 2_000;
pub const DEFAULT_RISK_WINDOW_MS: u64 = 5 * 60 * 1_000;
pub const DEFAULT_MAX_RECORDS: usize = 100;

// -------------------- Severity --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

// -------------------- Violation Kinds --------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    FullscreenExit,
    WindowFocusLost,
    FrequentFocusLoss,
    ForbiddenKeyCombination,
    ExcessiveClipboardActivity,
    SuspiciousMouseActivity,
    AutomatedMousePattern,
    MultipleBrowserInstances,
    SuspiciousNetworkRequest,
    NoFace,
    MultipleFaces,
    LookingAway,
    FaceMismatch,
    SecureChannelFailure,
    DevtoolsSuspected,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 15] = [
        ViolationKind::FullscreenExit,
        ViolationKind::WindowFocusLost,
        ViolationKind::FrequentFocusLoss,
        ViolationKind::ForbiddenKeyCombination,
        ViolationKind::ExcessiveClipboardActivity,
        ViolationKind::SuspiciousMouseActivity,
        ViolationKind::AutomatedMousePattern,
        ViolationKind::MultipleBrowserInstances,
        ViolationKind::SuspiciousNetworkRequest,
        ViolationKind::NoFace,
        ViolationKind::MultipleFaces,
        ViolationKind::LookingAway,
        ViolationKind::FaceMismatch,
        ViolationKind::SecureChannelFailure,
        ViolationKind::DevtoolsSuspected,
    ];

    pub fn severity(self) -> Severity {
        match self {
            ViolationKind::FullscreenExit
            | ViolationKind::ForbiddenKeyCombination
            | ViolationKind::AutomatedMousePattern
            | ViolationKind::MultipleBrowserInstances
            | ViolationKind::SuspiciousNetworkRequest
            | ViolationKind::MultipleFaces
            | ViolationKind::FaceMismatch => Severity::Critical,
            ViolationKind::SecureChannelFailure | ViolationKind::DevtoolsSuspected => {
                Severity::High
            }
            ViolationKind::WindowFocusLost
            | ViolationKind::FrequentFocusLoss
            | ViolationKind::ExcessiveClipboardActivity
            | ViolationKind::SuspiciousMouseActivity
            | ViolationKind::NoFace
            | ViolationKind::LookingAway => Severity::Warning,
        }
    }

    /// Fixed risk weight per subtype.
    pub fn weight(self) -> u8 {
        match self {
            ViolationKind::LookingAway => 2,
            ViolationKind::SuspiciousMouseActivity => 3,
            ViolationKind::WindowFocusLost => 4,
            ViolationKind::ExcessiveClipboardActivity | ViolationKind::NoFace => 5,
            ViolationKind::FrequentFocusLoss | ViolationKind::DevtoolsSuspected => 6,
            ViolationKind::SecureChannelFailure => 7,
            ViolationKind::FullscreenExit | ViolationKind::ForbiddenKeyCombination => 8,
            ViolationKind::AutomatedMousePattern
            | ViolationKind::MultipleBrowserInstances
            | ViolationKind::SuspiciousNetworkRequest
            | ViolationKind::MultipleFaces
            | ViolationKind::FaceMismatch => 9,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::FullscreenExit => "fullscreen_exit",
            ViolationKind::WindowFocusLost => "window_focus_lost",
            ViolationKind::FrequentFocusLoss => "frequent_focus_loss",
            ViolationKind::ForbiddenKeyCombination => "forbidden_key_combination",
            ViolationKind::ExcessiveClipboardActivity => "excessive_clipboard_activity",
            ViolationKind::SuspiciousMouseActivity => "suspicious_mouse_activity",
            ViolationKind::AutomatedMousePattern => "automated_mouse_pattern",
            ViolationKind::MultipleBrowserInstances => "multiple_browser_instances",
            ViolationKind::SuspiciousNetworkRequest => "suspicious_network_request",
            ViolationKind::NoFace => "no_face",
            ViolationKind::MultipleFaces => "multiple_faces",
            ViolationKind::LookingAway => "looking_away",
            ViolationKind::FaceMismatch => "face_mismatch",
            ViolationKind::SecureChannelFailure => "secure_channel_failure",
            ViolationKind::DevtoolsSuspected => "devtools_suspected",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Fullscreen,
    Focus,
    KeyCombination,
    Clipboard,
    Mouse,
    MultiInstance,
    Network,
    Face,
    SecureChannel,
}

impl SensorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Fullscreen => "fullscreen",
            SensorKind::Focus => "focus",
            SensorKind::KeyCombination => "key_combination",
            SensorKind::Clipboard => "clipboard",
            SensorKind::Mouse => "mouse",
            SensorKind::MultiInstance => "multi_instance",
            SensorKind::Network => "network",
            SensorKind::Face => "face",
            SensorKind::SecureChannel => "secure_channel",
        }
    }
}

// -------------------- Violations --------------------

/// Candidate violations are untrusted sensor output. The ledger stamps
/// them with an id, severity and time when (and if) it accepts them.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateViolation {
    pub kind: ViolationKind,
    pub details: BTreeMap<String, String>,
    pub source: SensorKind,
}

impl CandidateViolation {
    pub fn new(kind: ViolationKind, source: SensorKind) -> Self {
        Self {
            kind,
            details: BTreeMap::new(),
            source,
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    pub id: String,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub timestamp_ms: u64,
    pub details: BTreeMap<String, String>,
    pub source: SensorKind,
}

// -------------------- Ledger --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LedgerConfig {
    pub debounce_ms: u64,
    pub risk_window_ms: u64,
    pub max_records: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            risk_window_ms: DEFAULT_RISK_WINDOW_MS,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=24 => RiskLevel::Low,
            25..=49 => RiskLevel::Medium,
            50..=74 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LedgerSummary {
    pub total_accepted: u64,
    pub dropped_duplicates: u64,
    pub critical: u64,
    pub high: u64,
    pub warning: u64,
    pub by_kind: BTreeMap<ViolationKind, u64>,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
}

#[derive(Debug)]
pub struct ViolationLedger {
    config: LedgerConfig,
    records: VecDeque<Violation>,
    last_accepted: HashMap<ViolationKind, u64>,
    by_kind: BTreeMap<ViolationKind, u64>,
    next_seq: u64,
    total_accepted: u64,
    dropped_duplicates: u64,
}

impl ViolationLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            records: VecDeque::new(),
            last_accepted: HashMap::new(),
            by_kind: BTreeMap::new(),
            next_seq: 0,
            total_accepted: 0,
            dropped_duplicates: 0,
        }
    }

    /// Rebuild a ledger from persisted records (oldest first).
    pub fn restore(config: LedgerConfig, records: Vec<Violation>) -> Self {
        let mut ledger = Self::new(config);
        for violation in records {
            ledger.push(violation);
        }
        ledger
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Appends a candidate unless a violation of the same kind was accepted
    /// less than `debounce_ms` ago. Returns the stored violation.
    pub fn append(&mut self, candidate: CandidateViolation, now_ms: u64) -> Option<Violation> {
        if let Some(last) = self.last_accepted.get(&candidate.kind) {
            if now_ms.saturating_sub(*last) < self.config.debounce_ms {
                self.dropped_duplicates += 1;
                log::debug!(
                    "violation {} debounced ({} ms since last)",
                    candidate.kind,
                    now_ms.saturating_sub(*last)
                );
                return None;
            }
        }

        let mut suffix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut suffix);
        let violation = Violation {
            id: format!("v-{:04}-{}", self.next_seq, hex::encode(suffix)),
            kind: candidate.kind,
            severity: candidate.kind.severity(),
            timestamp_ms: now_ms,
            details: candidate.details,
            source: candidate.source,
        };
        self.push(violation.clone());
        Some(violation)
    }

    fn push(&mut self, violation: Violation) {
        self.next_seq += 1;
        self.total_accepted += 1;
        *self.by_kind.entry(violation.kind).or_insert(0) += 1;
        let last = self.last_accepted.entry(violation.kind).or_insert(0);
        *last = (*last).max(violation.timestamp_ms);
        self.records.push_back(violation);
        while self.records.len() > self.config.max_records {
            self.records.pop_front();
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &Violation> {
        self.records.iter()
    }

    pub fn snapshot(&self) -> Vec<Violation> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_accepted(&self) -> u64 {
        self.total_accepted
    }

    pub fn count_by_severity(&self, severity: Severity) -> u64 {
        self.by_kind
            .iter()
            .filter(|(kind, _)| kind.severity() == severity)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Violations whose timestamp lies inside the trailing risk window.
    pub fn recent(&self, now_ms: u64) -> impl Iterator<Item = &Violation> {
        let cutoff = now_ms.saturating_sub(self.config.risk_window_ms);
        self.records
            .iter()
            .filter(move |v| v.timestamp_ms >= cutoff && v.timestamp_ms <= now_ms)
    }

    /// `avg_weight(recent) * min(1 + count / 10, 2) * 10`, clamped to 0..=100.
    pub fn risk_score(&self, now_ms: u64) -> u8 {
        let (count, weight_sum) = self
            .recent(now_ms)
            .fold((0u32, 0u32), |(n, sum), v| (n + 1, sum + v.kind.weight() as u32));
        if count == 0 {
            return 0;
        }
        let avg = weight_sum as f64 / count as f64;
        let frequency = (1.0 + count as f64 / 10.0).min(2.0);
        (avg * frequency * 10.0).round().clamp(0.0, 100.0) as u8
    }

    pub fn risk_level(&self, now_ms: u64) -> RiskLevel {
        RiskLevel::from_score(self.risk_score(now_ms))
    }

    pub fn summary(&self, now_ms: u64) -> LedgerSummary {
        let risk_score = self.risk_score(now_ms);
        LedgerSummary {
            total_accepted: self.total_accepted,
            dropped_duplicates: self.dropped_duplicates,
            critical: self.count_by_severity(Severity::Critical),
            high: self.count_by_severity(Severity::High),
            warning: self.count_by_severity(Severity::Warning),
            by_kind: self.by_kind.clone(),
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
        }
    }
}

impl Default for ViolationLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}
