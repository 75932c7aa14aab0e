//! Leased id tables shared by scanner sessions and row locks.
//!
//! Entries are spread over independently locked shards so the expiry sweep
//! never holds more than one shard at a time.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Hands out ids of the form `(start_code_secs << 32) | counter`, so an id is
/// never reused within a process and a restarted server does not repeat ids
/// of an earlier incarnation.
#[derive(Debug)]
pub struct IdAllocator {
    base: u64,
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new(start_code_millis: u64) -> Self {
        let secs = (start_code_millis / 1_000) & 0xFFFF_FFFF;
        Self {
            base: secs << 32,
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        let counter = self.next.fetch_add(1, Ordering::Relaxed) & 0xFFFF_FFFF;
        self.base | counter
    }
}

#[derive(Debug)]
struct LeaseEntry<T> {
    value: T,
    expires_at: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LeaseLookup<T> {
    Live(T),
    /// The lease had run out; the entry has been removed.
    Expired(T),
    Missing,
}

pub struct LeaseTable<T> {
    shards: Vec<Mutex<HashMap<u64, LeaseEntry<T>>>>,
    ttl: Duration,
}

impl<T: Clone> LeaseTable<T> {
    pub fn new(shard_count: usize, ttl: Duration) -> Self {
        let shard_count = shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Mutex::new(HashMap::new()));
        }
        Self { shards, ttl }
    }

    fn shard(&self, id: u64) -> &Mutex<HashMap<u64, LeaseEntry<T>>> {
        &self.shards[(id % self.shards.len() as u64) as usize]
    }

    pub fn insert(&self, id: u64, value: T) {
        let expires_at = Instant::now() + self.ttl;
        self.shard(id)
            .lock()
            .insert(id, LeaseEntry { value, expires_at });
    }

    /// Looks up `id` and pushes its expiry out by one ttl.
    pub fn checkout(&self, id: u64) -> LeaseLookup<T> {
        let now = Instant::now();
        let mut shard = self.shard(id).lock();
        let Some(entry) = shard.get_mut(&id) else {
            return LeaseLookup::Missing;
        };
        if entry.expires_at <= now {
            let entry = shard.remove(&id).map(|e| e.value);
            return entry.map_or(LeaseLookup::Missing, LeaseLookup::Expired);
        }
        entry.expires_at = now + self.ttl;
        LeaseLookup::Live(entry.value.clone())
    }

    pub fn renew(&self, id: u64) -> bool {
        matches!(self.checkout(id), LeaseLookup::Live(_))
    }

    /// Removes `id` if it is live and `accept` agrees. A live entry that
    /// `accept` rejects stays in place and is reported as missing.
    pub fn take_if<F>(&self, id: u64, accept: F) -> LeaseLookup<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let now = Instant::now();
        let mut shard = self.shard(id).lock();
        let Some(entry) = shard.get(&id) else {
            return LeaseLookup::Missing;
        };
        if entry.expires_at <= now {
            let entry = shard.remove(&id).map(|e| e.value);
            return entry.map_or(LeaseLookup::Missing, LeaseLookup::Expired);
        }
        if !accept(&entry.value) {
            return LeaseLookup::Missing;
        }
        shard
            .remove(&id)
            .map_or(LeaseLookup::Missing, |e| LeaseLookup::Live(e.value))
    }

    pub fn take(&self, id: u64) -> LeaseLookup<T> {
        self.take_if(id, |_| true)
    }

    /// Removes every entry whose lease ran out before `now`.
    pub fn sweep(&self, now: Instant) -> Vec<(u64, T)> {
        let mut expired = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.retain(|id, entry| {
                if entry.expires_at <= now {
                    expired.push((*id, entry.value.clone()));
                    false
                } else {
                    true
                }
            });
        }
        expired
    }

    /// Removes every entry matching `pred`, regardless of lease state.
    pub fn drain_matching<F>(&self, mut pred: F) -> Vec<(u64, T)>
    where
        F: FnMut(&T) -> bool,
    {
        let mut drained = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.retain(|id, entry| {
                if pred(&entry.value) {
                    drained.push((*id, entry.value.clone()));
                    false
                } else {
                    true
                }
            });
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
