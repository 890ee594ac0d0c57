//! Fixed-capacity state cache.
//!
//! [`StateCache`] maps string keys (source paths, title ids) to
//! [`CacheRecord`]s holding bounded attempt counters and an optional payload.
//! Records live in a fixed slot array; lookups go through an open-addressing
//! side index (FNV-1a, linear probing, value = slot + 1, 0 = empty). The index
//! has no tombstones and is rebuilt from the slots whenever one is cleared.
//!
//! When every slot is taken, [`StateCache::get_or_create`] evicts, preferring
//! a record that fails the liveness check, then an idle record, then slot 0.

use tracing::debug;

/// Attempt counters kept per record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Attach + mount attempts of an image.
    Mount,
    /// Install pipeline attempts of a candidate directory.
    Install,
    /// Title registration. On title records its limit flag marks a reported
    /// duplicate.
    Register,
}

impl Counter {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            Counter::Mount => 0,
            Counter::Install => 1,
            Counter::Register => 2,
        }
    }
}

/// One cached key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord<P> {
    key: String,
    counts: [u8; Counter::COUNT],
    limit_logged: [bool; Counter::COUNT],
    pub payload: Option<P>,
}

impl<P> CacheRecord<P> {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            counts: [0; Counter::COUNT],
            limit_logged: [false; Counter::COUNT],
            payload: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Increments `counter`, saturating at `min(ceiling, u8::MAX)`.
    pub fn bump(&mut self, counter: Counter, ceiling: u32) -> u8 {
        let cap = ceiling.min(u8::MAX as u32) as u8;
        let slot = &mut self.counts[counter.index()];
        *slot = slot.saturating_add(1).min(cap);
        *slot
    }

    pub fn count(&self, counter: Counter) -> u8 {
        self.counts[counter.index()]
    }

    /// Returns true once `counter` has reached the ceiling.
    pub fn limit_reached(&self, counter: Counter, ceiling: u32) -> bool {
        u32::from(self.count(counter)) >= ceiling.min(u8::MAX as u32)
    }

    /// Marks the limit of `counter` as reported. Returns true only the first
    /// time, so the caller logs or notifies once.
    pub fn note_limit(&mut self, counter: Counter) -> bool {
        let logged = &mut self.limit_logged[counter.index()];
        !std::mem::replace(logged, true)
    }

    /// Resets `counter` and its reported flag.
    pub fn clear(&mut self, counter: Counter) {
        self.counts[counter.index()] = 0;
        self.limit_logged[counter.index()] = false;
    }

    /// No counters and no payload.
    pub fn is_idle(&self) -> bool {
        self.payload.is_none() && self.counts.iter().all(|&c| c == 0)
    }
}

/// Liveness check deciding whether a record still refers to something real.
pub type Liveness<P> = fn(&CacheRecord<P>) -> bool;

#[derive(Debug)]
pub struct StateCache<P> {
    slots: Vec<Option<CacheRecord<P>>>,
    index: Vec<u32>,
    is_live: Liveness<P>,
}

impl<P> StateCache<P> {
    /// Creates a cache with `capacity` slots (at least one).
    pub fn new(capacity: usize, is_live: Liveness<P>) -> Self {
        let capacity = capacity.max(1);
        let index_len = (capacity * 2).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            index: vec![0; index_len],
            is_live,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheRecord<P>> {
        self.slots.iter().flatten()
    }

    pub fn find(&self, key: &str) -> Option<&CacheRecord<P>> {
        let slot = self.lookup(key)?;
        self.slots[slot].as_ref()
    }

    pub fn find_mut(&mut self, key: &str) -> Option<&mut CacheRecord<P>> {
        let slot = self.lookup(key)?;
        self.slots[slot].as_mut()
    }

    /// Returns the record for `key`, creating it (and evicting if full).
    pub fn get_or_create(&mut self, key: &str) -> &mut CacheRecord<P> {
        let slot = match self.lookup(key) {
            Some(slot) => slot,
            None => self.allocate(key),
        };
        self.slots[slot].get_or_insert_with(|| CacheRecord::new(key))
    }

    /// Drops every record failing the liveness check. Returns how many.
    pub fn prune(&mut self) -> usize {
        let is_live = self.is_live;
        let mut dropped = 0;
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|rec| !is_live(rec)) {
                *slot = None;
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.rebuild();
        }
        dropped
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheRecord<P>> {
        let slot = self.lookup(key)?;
        let record = self.slots[slot].take();
        self.rebuild();
        record
    }

    fn allocate(&mut self, key: &str) -> usize {
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                let victim = self.victim();
                if let Some(evicted) = self.slots[victim].take() {
                    debug!(key = evicted.key(), slot = victim, "evicting cache record");
                }
                self.rebuild();
                victim
            }
        };
        self.slots[slot] = Some(CacheRecord::new(key));
        self.insert_index(key, slot);
        slot
    }

    fn victim(&self) -> usize {
        let records = || {
            self.slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_ref().map(|r| (i, r)))
        };
        records()
            .find(|(_, rec)| !(self.is_live)(rec))
            .or_else(|| records().find(|(_, rec)| rec.is_idle()))
            .map_or(0, |(i, _)| i)
    }

    fn mask(&self) -> usize {
        self.index.len() - 1
    }

    fn lookup(&self, key: &str) -> Option<usize> {
        let mask = self.mask();
        let mut pos = fnv1a(key) as usize & mask;
        for _ in 0..self.index.len() {
            let value = self.index[pos];
            if value == 0 {
                return None;
            }
            let slot = (value - 1) as usize;
            if self.slots[slot].as_ref().is_some_and(|rec| rec.key == key) {
                return Some(slot);
            }
            pos = (pos + 1) & mask;
        }
        None
    }

    fn insert_index(&mut self, key: &str, slot: usize) {
        let mask = self.mask();
        let mut pos = fnv1a(key) as usize & mask;
        while self.index[pos] != 0 {
            pos = (pos + 1) & mask;
        }
        self.index[pos] = slot as u32 + 1;
    }

    fn rebuild(&mut self) {
        self.index.fill(0);
        let keys: Vec<(usize, String)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|r| (i, r.key.clone())))
            .collect();
        for (slot, key) in keys {
            self.insert_index(&key, slot);
        }
    }

    #[cfg(test)]
    fn index_entries(&self) -> usize {
        self.index.iter().filter(|&&v| v != 0).count()
    }
}

fn fnv1a(key: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    key.bytes()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}
