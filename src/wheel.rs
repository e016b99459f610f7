//! Timer Wheel
//!
//! Bucketed delay scheduler used for handshake retries. A busy relay can
//! hold tens of thousands of in-flight handshakes, so scheduling and firing
//! must be O(1) amortized regardless of how many timers are outstanding.
//!
//! ## Design
//!
//! - A fixed ring of buckets, one per tick of resolution
//! - Each bucket is a singly-linked list threaded through an entry arena
//!   (slot ids instead of pointers, vacated slots go on a free list)
//! - Delays longer than one lap of the ring carry a "laps remaining"
//!   counter and are skipped until the cursor has passed them that many
//!   more times
//!
//! The wheel is not internally synchronized. Callers sharing one between
//! threads wrap it in a mutex and never hold it across I/O.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Minimum number of buckets in a wheel.
const MIN_BUCKETS: usize = 2;

#[derive(Debug)]
struct Entry<K> {
    /// None when the slot is on the free list.
    key: Option<K>,
    laps: u64,
    next: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default)]
struct Bucket {
    head: Option<usize>,
    tail: Option<usize>,
}

/// Circular timer wheel keyed by `K`.
#[derive(Debug)]
pub struct TimerWheel<K> {
    /// Duration of one bucket.
    tick: Duration,
    buckets: Vec<Bucket>,
    /// Bucket the cursor currently points at.
    current: usize,
    /// Time of the last whole tick processed; None until the first advance.
    last_tick: Option<Instant>,
    entries: Vec<Entry<K>>,
    free: Vec<usize>,
    /// Outstanding entries per key.
    scheduled: HashMap<K, usize>,
}

impl<K: Copy + Eq + Hash> TimerWheel<K> {
    /// Create a wheel with `tick` resolution able to hold `span` without
    /// wrapping. Longer delays are still accepted and use lap counting.
    pub fn new(tick: Duration, span: Duration) -> Self {
        let tick = tick.max(Duration::from_millis(1));
        let buckets = (span.as_nanos() / tick.as_nanos()) as usize + 2;
        let buckets = buckets.max(MIN_BUCKETS);
        Self {
            tick,
            buckets: vec![Bucket::default(); buckets],
            current: 0,
            last_tick: None,
            entries: Vec::new(),
            free: Vec::new(),
            scheduled: HashMap::new(),
        }
    }

    /// Tick resolution.
    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Number of buckets in the ring.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of scheduled entries.
    pub fn len(&self) -> usize {
        self.scheduled.values().sum()
    }

    /// Check if nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Check if at least one entry for `key` is scheduled.
    pub fn contains(&self, key: &K) -> bool {
        self.scheduled.contains_key(key)
    }

    /// Schedule `key` to fire after `delay`.
    ///
    /// Delays shorter than one tick are rounded up to one tick.
    pub fn add(&mut self, key: K, delay: Duration) {
        let n = self.buckets.len() as u64;
        let ticks = ((delay.as_nanos() / self.tick.as_nanos()) as u64).max(1);
        let offset = ticks % n;
        let mut laps = ticks / n;
        if offset == 0 {
            // Landing on the cursor's own bucket: the first pass happens
            // after a full lap, which already counts as one
            laps -= 1;
        }
        let bucket = ((self.current as u64 + offset) % n) as usize;

        let slot = self.alloc(Entry {
            key: Some(key),
            laps,
            next: None,
        });
        let b = &mut self.buckets[bucket];
        match b.tail {
            Some(tail) => self.entries[tail].next = Some(slot),
            None => b.head = Some(slot),
        }
        b.tail = Some(slot);
        *self.scheduled.entry(key).or_insert(0) += 1;
    }

    /// Advance the wheel to `now`, returning every key that came due in
    /// firing order.
    ///
    /// The first call only records the baseline time.
    pub fn advance(&mut self, now: Instant) -> Vec<K> {
        let mut fired = Vec::new();
        let last = match self.last_tick {
            Some(last) => last,
            None => {
                self.last_tick = Some(now);
                return fired;
            }
        };

        let elapsed = now.saturating_duration_since(last);
        let ticks = (elapsed.as_nanos() / self.tick.as_nanos()).min(u128::from(u32::MAX)) as u32;
        for _ in 0..ticks {
            self.current = (self.current + 1) % self.buckets.len();
            self.drain_current(&mut fired);
        }

        // Step by whole ticks so fractional remainders are not lost
        self.last_tick = Some(last + self.tick.saturating_mul(ticks));
        fired
    }

    /// Remove every scheduled entry for `key`.
    ///
    /// Returns how many entries were removed; removing an absent key is a
    /// no-op.
    pub fn remove(&mut self, key: &K) -> usize {
        if !self.scheduled.contains_key(key) {
            return 0;
        }
        let mut removed = 0;
        for bucket in 0..self.buckets.len() {
            removed += self.unlink_where(bucket, |e| e.key.as_ref() == Some(key), &mut Vec::new());
        }
        self.scheduled.remove(key);
        removed
    }

    fn drain_current(&mut self, fired: &mut Vec<K>) {
        let current = self.current;
        let mut due = Vec::new();
        self.unlink_where(
            current,
            |e| {
                if e.laps == 0 {
                    true
                } else {
                    e.laps -= 1;
                    false
                }
            },
            &mut due,
        );
        for key in due {
            self.release_key(&key);
            fired.push(key);
        }
    }

    /// Unlink entries of `bucket` matching `pred`, collecting their keys.
    fn unlink_where<F>(&mut self, bucket: usize, mut pred: F, out: &mut Vec<K>) -> usize
    where
        F: FnMut(&mut Entry<K>) -> bool,
    {
        let mut removed = 0;
        let mut prev: Option<usize> = None;
        let mut cur = self.buckets[bucket].head;

        while let Some(slot) = cur {
            let next = self.entries[slot].next;
            if pred(&mut self.entries[slot]) {
                match prev {
                    Some(p) => self.entries[p].next = next,
                    None => self.buckets[bucket].head = next,
                }
                if self.buckets[bucket].tail == Some(slot) {
                    self.buckets[bucket].tail = prev;
                }
                if let Some(key) = self.entries[slot].key.take() {
                    out.push(key);
                }
                self.entries[slot].next = None;
                self.free.push(slot);
                removed += 1;
            } else {
                prev = Some(slot);
            }
            cur = next;
        }
        removed
    }

    fn alloc(&mut self, entry: Entry<K>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.entries[slot] = entry;
                slot
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        }
    }

    fn release_key(&mut self, key: &K) {
        if let Some(count) = self.scheduled.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.scheduled.remove(key);
            }
        }
    }
}
