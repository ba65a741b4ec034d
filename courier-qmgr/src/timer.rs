use std::{collections::BTreeMap, hash::Hash, time::Duration};

use ahash::AHashMap;

use crate::{
    connect::AllocId,
    model::{QueueKey, TransportKey},
};

/// Every timer the scheduler arms, by purpose and target.
///
/// At most one timer exists per key: arming an armed key moves its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    TransportUnthrottle(TransportKey),
    QueueUnthrottle(QueueKey),
    QueueResume(QueueKey),
    ConnectWatchdog(AllocId),
    ConnectFailed(AllocId),
    RateDelay(AllocId),
}

/// Deadline-ordered one-shot timers
#[derive(Debug)]
pub struct TimerTable<K> {
    deadlines: BTreeMap<(Duration, u64), K>,
    armed: AHashMap<K, (Duration, u64)>,
    seq: u64,
}

impl<K> Default for TimerTable<K> {
    fn default() -> Self {
        Self {
            deadlines: BTreeMap::new(),
            armed: AHashMap::new(),
            seq: 0,
        }
    }
}

impl<K: Copy + Eq + Hash> TimerTable<K> {
    pub fn arm(&mut self, key: K, at: Duration) {
        let slot = (at, self.seq);
        self.seq += 1;

        if let Some(previous) = self.armed.insert(key, slot) {
            self.deadlines.remove(&previous);
        }
        self.deadlines.insert(slot, key);
    }

    /// Returns whether a timer was armed
    pub fn cancel(&mut self, key: K) -> bool {
        self.armed
            .remove(&key)
            .and_then(|slot| self.deadlines.remove(&slot))
            .is_some()
    }

    pub fn is_armed(&self, key: K) -> bool {
        self.armed.contains_key(&key)
    }

    pub fn deadline(&self, key: K) -> Option<Duration> {
        self.armed.get(&key).map(|(at, _)| *at)
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.deadlines.first_key_value().map(|((at, _), _)| *at)
    }

    /// Disarm and return the earliest timer due at `now`
    pub fn pop_due(&mut self, now: Duration) -> Option<K> {
        let (&slot, _) = self.deadlines.first_key_value()?;
        if slot.0 > now {
            return None;
        }

        let key = self.deadlines.remove(&slot)?;
        self.armed.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
