use anyhow::{Context, Result};
use regex::Regex;
use url::Url;

use crate::sensors::{InputVerdict, Sensor, SensorInput, SensorSignal};
use crate::violation::{CandidateViolation, SensorKind, ViolationKind};

pub const DEFAULT_BLOCKED_DOMAINS: &[&str] = &[
    "chegg.com",
    "coursehero.com",
    "brainly.com",
    "quizlet.com",
    "chat.openai.com",
    "chatgpt.com",
    "openai.com",
    "gemini.google.com",
    "bard.google.com",
    "claude.ai",
    "perplexity.ai",
    "copilot.microsoft.com",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkSensorConfig {
    /// Blocked hosts. Subdomains of each entry are blocked too.
    pub blocked_domains: Vec<String>,
}

impl Default for NetworkSensorConfig {
    fn default() -> Self {
        Self {
            blocked_domains: DEFAULT_BLOCKED_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
        }
    }
}

/// Builds `^(?:.*\.)?(?:a\.com|b\.org)$` from the deny list.
fn compile_deny_list(domains: &[String]) -> Result<Option<Regex>> {
    let alternatives: Vec<String> = domains
        .iter()
        .map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase())
        .filter(|d| !d.is_empty())
        .map(|d| regex::escape(&d))
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    let pattern = format!(r"^(?:.*\.)?(?:{})$", alternatives.join("|"));
    Regex::new(&pattern)
        .map(Some)
        .context("compile blocked domain list")
}

pub struct NetworkRequestSensor {
    deny: Option<Regex>,
    active: bool,
}

impl NetworkRequestSensor {
    pub fn new(config: &NetworkSensorConfig) -> Result<Self> {
        Ok(Self {
            deny: compile_deny_list(&config.blocked_domains)?,
            active: false,
        })
    }

    /// Host of `url` if it is on the deny list. Unparseable URLs pass.
    pub fn blocked_host(&self, url: &str) -> Option<String> {
        let deny = self.deny.as_ref()?;
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(e) => {
                log::debug!("outbound request with unparseable url {:?}: {}", url, e);
                return None;
            }
        };
        let host = parsed.host_str()?.trim_end_matches('.').to_ascii_lowercase();
        deny.is_match(&host).then_some(host)
    }
}

impl Sensor for NetworkRequestSensor {
    fn kind(&self) -> SensorKind {
        SensorKind::Network
    }

    fn start(&mut self, _now_ms: u64) -> Result<()> {
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn observe(
        &mut self,
        input: &SensorInput,
        _now_ms: u64,
        emit: &mut dyn FnMut(SensorSignal),
    ) -> InputVerdict {
        let SensorInput::OutboundRequest { url } = input else {
            return InputVerdict::Allow;
        };
        match self.blocked_host(url) {
            Some(host) => {
                emit(SensorSignal::Violation(
                    CandidateViolation::new(
                        ViolationKind::SuspiciousNetworkRequest,
                        SensorKind::Network,
                    )
                    .with_detail("host", host),
                ));
                InputVerdict::Block
            }
            None => InputVerdict::Allow,
        }
    }
}
