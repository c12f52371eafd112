//! Ordered timer queue over wrapping ticks.
//!
//! Timers are kept in an ordered map keyed on `(expiry tick, insertion
//! sequence)`. The sequence makes duplicate expiries stable: timers armed
//! for the same tick fire in insertion order. Because ticks wrap, "first
//! expiry" is resolved by signed modular distance from the current date
//! rather than by raw key order; a timer must be serviced within half the
//! tick range (~24.8 days) of being armed, which every timeout in the
//! worker satisfies by a wide margin.

use crate::ticks::{tick_is_expired, tick_isset, Tick, TICK_ETERNITY};
use std::collections::BTreeMap;

/// Handle to an armed timer, used for cancellation and re-arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    tick: Tick,
    seq: u64,
}

impl TimerKey {
    /// The expiry tick this handle was armed for.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }
}

/// A queue of `(expiry, value)` pairs ordered by wrapping expiry tick.
#[derive(Debug)]
pub struct TimerQueue<T> {
    map: BTreeMap<(Tick, u64), T>,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of armed timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when no timer is armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Arms a timer at `tick`. An eternity tick arms nothing.
    pub fn insert(&mut self, tick: Tick, value: T) -> Option<TimerKey> {
        if !tick_isset(tick) {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.map.insert((tick, seq), value);
        Some(TimerKey { tick, seq })
    }

    /// Cancels a timer. Returns its value if it had not fired yet.
    pub fn remove(&mut self, key: TimerKey) -> Option<T> {
        self.map.remove(&(key.tick, key.seq))
    }

    /// The earliest key in signed modular order around `now`.
    ///
    /// Rotating the key space by `now + 2^31` turns signed-distance order
    /// into raw order, so the earliest timer is the first key at or after
    /// the pivot, falling back to the first key below it.
    fn earliest_key(&self, now: Tick) -> Option<(Tick, u64)> {
        let pivot = now.wrapping_add(1 << 31);
        self.map
            .range((pivot, 0)..)
            .next()
            .or_else(|| self.map.range(..(pivot, 0)).next())
            .map(|(k, _)| *k)
    }

    /// The nearest expiry tick, or eternity when the queue is empty.
    #[must_use]
    pub fn next_expiry(&self, now: Tick) -> Tick {
        self.earliest_key(now).map_or(TICK_ETERNITY, |k| k.0)
    }

    /// Removes and returns every timer expired at `now`, earliest first.
    pub fn pop_expired(&mut self, now: Tick) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(key) = self.earliest_key(now) {
            if !tick_is_expired(key.0, now) {
                break;
            }
            if let Some(v) = self.map.remove(&key) {
                out.push(v);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticks::tick_add;

    #[test]
    fn empty_queue_has_no_expiry() {
        let q: TimerQueue<u32> = TimerQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.next_expiry(0), TICK_ETERNITY);
    }

    #[test]
    fn eternity_arms_nothing() {
        let mut q = TimerQueue::new();
        assert!(q.insert(TICK_ETERNITY, 1u32).is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn pops_in_expiry_order() {
        let mut q = TimerQueue::new();
        q.insert(200, "b");
        q.insert(100, "a");
        q.insert(150, "mid");
        assert_eq!(q.next_expiry(50), 100);
        assert_eq!(q.pop_expired(160), vec!["a", "mid"]);
        assert_eq!(q.next_expiry(160), 200);
        assert_eq!(q.pop_expired(99_999), vec!["b"]);
        assert!(q.is_empty());
    }

    #[test]
    fn same_tick_fires_in_insertion_order() {
        let mut q = TimerQueue::new();
        q.insert(100, 1);
        q.insert(100, 2);
        q.insert(100, 3);
        assert_eq!(q.pop_expired(100), vec![1, 2, 3]);
    }

    #[test]
    fn cancel_before_fire() {
        let mut q = TimerQueue::new();
        let k = q.insert(100, "x").unwrap();
        assert_eq!(q.remove(k), Some("x"));
        assert!(q.pop_expired(200).is_empty());
    }

    #[test]
    fn expiry_across_wrap() {
        let mut q = TimerQueue::new();
        let base = u32::MAX - 20;
        let exp = tick_add(base, 50); // raw value wrapped past zero
        q.insert(exp, "wrapped");
        q.insert(base.wrapping_sub(5_000_000), "overdue");
        assert_eq!(q.pop_expired(base), vec!["overdue"]);
        // the wrapped timer is still ahead of `base` despite its small raw key
        assert!(q.pop_expired(base).is_empty());
        assert_eq!(q.next_expiry(base), exp);
        assert_eq!(q.pop_expired(tick_add(base, 60)), vec!["wrapped"]);
    }
}
