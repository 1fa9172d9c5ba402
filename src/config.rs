use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::monitor::MonitorConfig;
use crate::policy::SecondInfractionAction;
use crate::session::SubStage;

const DEFAULT_DB_PATH: &str = "exam_progress.db";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct IntegrityConfigFile {
    db_path: Option<String>,
    ledger: Option<LedgerConfigFile>,
    policy: Option<PolicyConfigFile>,
    identity: Option<IdentityConfigFile>,
    face: Option<FaceConfigFile>,
    network: Option<NetworkConfigFile>,
    exam: Option<ExamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct LedgerConfigFile {
    debounce_ms: Option<u64>,
    risk_window_ms: Option<u64>,
    max_records: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct PolicyConfigFile {
    max_consecutive_violations: Option<u32>,
    countdown_ms: Option<u64>,
    second_infraction: Option<SecondInfractionAction>,
}

#[derive(Debug, Deserialize, Default)]
struct IdentityConfigFile {
    match_threshold: Option<f32>,
    max_attempts: Option<u32>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct FaceConfigFile {
    tick_ms: Option<u64>,
    no_face_throttle_ms: Option<u64>,
    looking_away_ratio: Option<f32>,
    looking_away_sustain_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct NetworkConfigFile {
    blocked_domains: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct ExamConfigFile {
    sub_stages: Option<Vec<SubStage>>,
    require_fullscreen: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityConfig {
    /// SQLite file backing the progress store.
    pub db_path: String,
    pub monitor: MonitorConfig,
}

impl IntegrityConfig {
    /// Reads the JSON file named by `EXAM_INTEGRITY_CONFIG` (if set), applies
    /// `EXAM_INTEGRITY_*` overrides and validates the result.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("EXAM_INTEGRITY_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: IntegrityConfigFile) -> Self {
        let mut monitor = MonitorConfig::default();

        if let Some(ledger) = file.ledger {
            monitor.ledger.debounce_ms = ledger.debounce_ms.unwrap_or(monitor.ledger.debounce_ms);
            monitor.ledger.risk_window_ms =
                ledger.risk_window_ms.unwrap_or(monitor.ledger.risk_window_ms);
            monitor.ledger.max_records = ledger.max_records.unwrap_or(monitor.ledger.max_records);
        }
        if let Some(policy) = file.policy {
            monitor.policy.max_consecutive_violations = policy
                .max_consecutive_violations
                .unwrap_or(monitor.policy.max_consecutive_violations);
            monitor.policy.countdown_ms =
                policy.countdown_ms.unwrap_or(monitor.policy.countdown_ms);
            monitor.policy.second_infraction = policy
                .second_infraction
                .unwrap_or(monitor.policy.second_infraction);
        }
        if let Some(identity) = file.identity {
            if let Some(threshold) = identity.match_threshold {
                monitor.identity.match_threshold = threshold;
                monitor.sensors.face.match_threshold = threshold;
            }
            monitor.identity.max_attempts =
                identity.max_attempts.unwrap_or(monitor.identity.max_attempts);
            if let Some(ms) = identity.timeout_ms {
                monitor.identity.timeout = Duration::from_millis(ms);
            }
        }
        if let Some(face) = file.face {
            let sensor = &mut monitor.sensors.face;
            sensor.tick_ms = face.tick_ms.unwrap_or(sensor.tick_ms);
            sensor.no_face_throttle_ms = face.no_face_throttle_ms.unwrap_or(sensor.no_face_throttle_ms);
            sensor.looking_away_ratio = face.looking_away_ratio.unwrap_or(sensor.looking_away_ratio);
            sensor.looking_away_sustain_ms = face
                .looking_away_sustain_ms
                .unwrap_or(sensor.looking_away_sustain_ms);
        }
        if let Some(domains) = file.network.and_then(|n| n.blocked_domains) {
            monitor.sensors.network.blocked_domains = domains;
        }
        if let Some(exam) = file.exam {
            if let Some(sub_stages) = exam.sub_stages {
                monitor.sub_stages = sub_stages;
            }
            monitor.require_fullscreen = exam.require_fullscreen.unwrap_or(monitor.require_fullscreen);
        }

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            monitor,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("EXAM_INTEGRITY_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Some(ms) = env_number::<u64>("EXAM_INTEGRITY_DEBOUNCE_MS")? {
            self.monitor.ledger.debounce_ms = ms;
        }
        if let Some(n) = env_number::<u32>("EXAM_INTEGRITY_MAX_CONSECUTIVE_VIOLATIONS")? {
            self.monitor.policy.max_consecutive_violations = n;
        }
        if let Some(ms) = env_number::<u64>("EXAM_INTEGRITY_COUNTDOWN_MS")? {
            self.monitor.policy.countdown_ms = ms;
        }
        if let Some(threshold) = env_number::<f32>("EXAM_INTEGRITY_MATCH_THRESHOLD")? {
            self.monitor.identity.match_threshold = threshold;
            self.monitor.sensors.face.match_threshold = threshold;
        }
        if let Some(ms) = env_number::<u64>("EXAM_INTEGRITY_FACE_TICK_MS")? {
            self.monitor.sensors.face.tick_ms = ms;
        }
        if let Ok(action) = std::env::var("EXAM_INTEGRITY_SECOND_INFRACTION") {
            self.monitor.policy.second_infraction = match action.trim().to_ascii_lowercase().as_str() {
                "notify" => SecondInfractionAction::Notify,
                "submit_immediately" | "submit" => SecondInfractionAction::SubmitImmediately,
                other => {
                    return Err(anyhow!(
                        "EXAM_INTEGRITY_SECOND_INFRACTION must be notify or submit_immediately, got {}",
                        other
                    ))
                }
            };
        }
        if let Ok(domains) = std::env::var("EXAM_INTEGRITY_BLOCKED_DOMAINS") {
            let parsed = split_csv(&domains);
            if !parsed.is_empty() {
                self.monitor.sensors.network.blocked_domains = parsed;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let m = &mut self.monitor;
        if m.policy.max_consecutive_violations == 0 {
            return Err(anyhow!("max_consecutive_violations must be at least 1"));
        }
        if m.policy.countdown_ms == 0 {
            return Err(anyhow!("auto-submit countdown must be greater than zero"));
        }
        if m.ledger.max_records == 0 {
            return Err(anyhow!("ledger max_records must be greater than zero"));
        }
        if m.ledger.risk_window_ms == 0 {
            return Err(anyhow!("risk window must be greater than zero"));
        }
        let threshold = m.identity.match_threshold;
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(anyhow!("match threshold must be a positive number"));
        }
        if m.identity.max_attempts == 0 {
            return Err(anyhow!("identity max_attempts must be at least 1"));
        }
        if m.sensors.face.tick_ms == 0 {
            return Err(anyhow!("face tick must be greater than zero"));
        }
        let ratio = m.sensors.face.looking_away_ratio;
        if !ratio.is_finite() || ratio <= 0.0 {
            return Err(anyhow!("looking_away_ratio must be a positive number"));
        }
        if m.sub_stages.is_empty() {
            return Err(anyhow!("at least one exam sub-stage is required"));
        }
        let unique: BTreeSet<_> = m.sub_stages.iter().collect();
        if unique.len() != m.sub_stages.len() {
            return Err(anyhow!("exam sub-stages must not repeat"));
        }
        m.sensors.network.blocked_domains = m
            .sensors
            .network
            .blocked_domains
            .iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a number, got {:?}", key, raw)),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<IntegrityConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
