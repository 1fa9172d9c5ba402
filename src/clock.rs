//! Time source and timer queue.
//!
//! Every timestamp in the kernel is milliseconds on an injected `Clock`.
//! Debounce windows, countdowns and sensor polling intervals are scheduled
//! on a `TimerQueue` owned by the coordinator, so a `ManualClock` can drive
//! whole sessions in tests without wall-clock waits.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock (milliseconds since the Unix epoch).
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) -> u64 {
        self.now.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Deadline-ordered timers. Timers with equal deadlines fire in scheduling order.
#[derive(Debug)]
pub struct TimerQueue<T> {
    next_id: u64,
    entries: BTreeMap<(u64, u64), T>,
    deadlines: HashMap<u64, u64>,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    pub fn schedule(&mut self, at_ms: u64, payload: T) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert((at_ms, id), payload);
        self.deadlines.insert(id, at_ms);
        TimerId(id)
    }

    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let at = self.deadlines.remove(&id.0)?;
        self.entries.remove(&(at, id.0))
    }

    /// Removes and returns the earliest timer due at `now_ms`.
    pub fn pop_next_due(&mut self, now_ms: u64) -> Option<(TimerId, T)> {
        let key = *self.entries.keys().next()?;
        if key.0 > now_ms {
            return None;
        }
        self.deadlines.remove(&key.1);
        self.entries.remove(&key).map(|payload| (TimerId(key.1), payload))
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id.0)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.schedule(300, "c");
        q.schedule(100, "a");
        q.schedule(100, "b");
        assert_eq!(q.pop_next_due(50), None);
        assert_eq!(q.pop_next_due(200).map(|(_, p)| p), Some("a"));
        assert_eq!(q.pop_next_due(200).map(|(_, p)| p), Some("b"));
        assert_eq!(q.pop_next_due(200), None);
        assert_eq!(q.next_deadline(), Some(300));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut q = TimerQueue::new();
        let id = q.schedule(10, 1u8);
        assert!(q.is_scheduled(id));
        assert_eq!(q.cancel(id), Some(1));
        assert!(!q.is_scheduled(id));
        assert!(q.pop_next_due(1_000).is_none());
        assert!(q.cancel(id).is_none());
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(1_000);
        let handle = clock.clone();
        handle.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(42);
        assert_eq!(handle.now_ms(), 42);
    }
}
