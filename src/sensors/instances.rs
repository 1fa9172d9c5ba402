use anyhow::{Context, Result};
use rand::RngCore;
use std::collections::BTreeMap;

use crate::sensors::{InputVerdict, Sensor, SensorInput, SensorSignal};
use crate::storage::{SharedProgressStore, INSTANCES_KEY};
use crate::violation::{CandidateViolation, SensorKind, ViolationKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MultiInstanceSensorConfig {
    pub heartbeat_ms: u64,
    /// Entries not refreshed for this long are pruned.
    pub stale_after_ms: u64,
}

impl Default for MultiInstanceSensorConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 5_000,
            stale_after_ms: 30_000,
        }
    }
}

/// Heartbeat registry shared by every instance of the exam client through
/// the progress store. Stored as a JSON object `{instance_id: last_seen_ms}`.
pub struct MultiInstanceSensor {
    config: MultiInstanceSensorConfig,
    store: SharedProgressStore,
    instance_id: String,
    active: bool,
}

impl MultiInstanceSensor {
    pub fn new(config: MultiInstanceSensorConfig, store: SharedProgressStore) -> Self {
        let mut id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id);
        Self {
            config,
            store,
            instance_id: hex::encode(id),
            active: false,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn load(&self) -> Result<BTreeMap<String, u64>> {
        match self.store.get(INSTANCES_KEY)? {
            None => Ok(BTreeMap::new()),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(map) => Ok(map),
                Err(e) => {
                    log::warn!("instance registry unreadable, starting over: {}", e);
                    Ok(BTreeMap::new())
                }
            },
        }
    }

    fn save(&self, registry: &BTreeMap<String, u64>) -> Result<()> {
        let raw = serde_json::to_string(registry).context("serialize instance registry")?;
        self.store.set(INSTANCES_KEY, &raw)
    }

    /// Refreshes this instance's entry, prunes stale ones and returns the
    /// number of live instances.
    fn heartbeat(&self, now_ms: u64) -> Result<usize> {
        let mut registry = self.load()?;
        registry.insert(self.instance_id.clone(), now_ms);
        let stale_after = self.config.stale_after_ms;
        registry.retain(|_, seen| now_ms.saturating_sub(*seen) <= stale_after);
        self.save(&registry)?;
        Ok(registry.len())
    }

    fn deregister(&self) -> Result<()> {
        let mut registry = self.load()?;
        if registry.remove(&self.instance_id).is_some() {
            self.save(&registry)?;
        }
        Ok(())
    }

    fn check(&self, now_ms: u64, emit: &mut dyn FnMut(SensorSignal)) {
        match self.heartbeat(now_ms) {
            Ok(live) if live > 1 => emit(SensorSignal::Violation(
                CandidateViolation::new(
                    ViolationKind::MultipleBrowserInstances,
                    SensorKind::MultiInstance,
                )
                .with_detail("instances", live),
            )),
            Ok(_) => {}
            Err(e) => log::warn!("instance heartbeat failed: {:#}", e),
        }
    }
}

impl Sensor for MultiInstanceSensor {
    fn kind(&self) -> SensorKind {
        SensorKind::MultiInstance
    }

    fn start(&mut self, now_ms: u64) -> Result<()> {
        self.heartbeat(now_ms)
            .context("register exam client instance")?;
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Err(e) = self.deregister() {
            log::warn!("instance deregistration failed: {:#}", e);
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn poll_interval_ms(&self) -> Option<u64> {
        Some(self.config.heartbeat_ms)
    }

    fn observe(
        &mut self,
        _input: &SensorInput,
        _now_ms: u64,
        _emit: &mut dyn FnMut(SensorSignal),
    ) -> InputVerdict {
        InputVerdict::Allow
    }

    fn poll(&mut self, now_ms: u64, emit: &mut dyn FnMut(SensorSignal)) {
        self.check(now_ms, emit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryProgressStore;

    fn poll(sensor: &mut MultiInstanceSensor, now: u64) -> Vec<SensorSignal> {
        let mut out = Vec::new();
        sensor.poll(now, &mut |s| out.push(s));
        out
    }

    #[test]
    fn second_live_instance_is_reported() {
        let store = InMemoryProgressStore::shared();
        let config = MultiInstanceSensorConfig::default();
        let mut first = MultiInstanceSensor::new(config, store.clone());
        let mut second = MultiInstanceSensor::new(config, store.clone());
        first.start(0).unwrap();
        assert!(poll(&mut first, 5_000).is_empty());

        second.start(6_000).unwrap();
        let signals = poll(&mut first, 10_000);
        match &signals[..] {
            [SensorSignal::Violation(c)] => {
                assert_eq!(c.kind, ViolationKind::MultipleBrowserInstances);
                assert_eq!(c.details.get("instances").map(String::as_str), Some("2"));
            }
            other => panic!("unexpected signals {:?}", other),
        }

        second.stop();
        assert!(poll(&mut first, 15_000).is_empty());
    }

    #[test]
    fn stale_instances_are_pruned() {
        let store = InMemoryProgressStore::shared();
        let config = MultiInstanceSensorConfig::default();
        let mut crashed = MultiInstanceSensor::new(config, store.clone());
        let mut current = MultiInstanceSensor::new(config, store.clone());
        crashed.start(0).unwrap();
        // No stop(): simulates a tab that died without cleaning up.
        current.start(40_000).unwrap();
        assert!(poll(&mut current, 45_000).is_empty());
        let raw = store.get(INSTANCES_KEY).unwrap().unwrap();
        assert!(!raw.contains(crashed.instance_id()));
    }

    #[test]
    fn garbage_registry_is_replaced() {
        let store = InMemoryProgressStore::shared();
        store.set(INSTANCES_KEY, "not json").unwrap();
        let mut sensor = MultiInstanceSensor::new(MultiInstanceSensorConfig::default(), store);
        sensor.start(0).unwrap();
        assert!(poll(&mut sensor, 5_000).is_empty());
    }
}
