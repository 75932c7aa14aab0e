//! Per-row exclusion shared by client row locks and internal mutations.
//!
//! A row is held either by a client lock (until released or its lease runs
//! out) or by a scoped guard that lives for one mutation.

pub mod row_lock;

use crate::error::RegionServerError;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    Client(u64),
    Scoped,
}

type RowKey = (String, Vec<u8>);

#[derive(Default)]
struct Shard {
    held: Mutex<HashMap<RowKey, Holder>>,
    cv: Condvar,
}

pub struct RowExclusionTable {
    shards: Vec<Shard>,
}

impl RowExclusionTable {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            shards.push(Shard::default());
        }
        Self { shards }
    }

    fn shard(&self, region: &str, row: &[u8]) -> &Shard {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        let mut h = DefaultHasher::new();
        region.hash(&mut h);
        row.hash(&mut h);
        &self.shards[(h.finish() as usize) % self.shards.len()]
    }

    pub fn holder(&self, region: &str, row: &[u8]) -> Option<Holder> {
        let held = self.shard(region, row).held.lock();
        held.get(&(region.to_string(), row.to_vec())).copied()
    }

    /// Claims the row for a client lock without waiting.
    pub fn try_claim_client(&self, region: &str, row: &[u8], lock_id: u64) -> bool {
        let mut held = self.shard(region, row).held.lock();
        let key = (region.to_string(), row.to_vec());
        if held.contains_key(&key) {
            return false;
        }
        held.insert(key, Holder::Client(lock_id));
        true
    }

    /// Frees the row if `lock_id` still holds it.
    pub fn release_client(&self, region: &str, row: &[u8], lock_id: u64) -> bool {
        let shard = self.shard(region, row);
        let mut held = shard.held.lock();
        let key = (region.to_string(), row.to_vec());
        if held.get(&key) != Some(&Holder::Client(lock_id)) {
            return false;
        }
        held.remove(&key);
        drop(held);
        shard.cv.notify_all();
        true
    }

    /// Waits up to `timeout` for the row, then holds it until the guard drops.
    pub fn lock_scoped(
        &self,
        region: &str,
        row: &[u8],
        timeout: Duration,
    ) -> Result<RowGuard<'_>, RegionServerError> {
        let shard = self.shard(region, row);
        let key = (region.to_string(), row.to_vec());
        let deadline = Instant::now() + timeout;
        let mut held = shard.held.lock();
        while held.contains_key(&key) {
            if shard.cv.wait_until(&mut held, deadline).timed_out() && held.contains_key(&key) {
                return Err(RegionServerError::row_busy(region, row));
            }
        }
        held.insert(key.clone(), Holder::Scoped);
        Ok(RowGuard { table: self, key })
    }

    pub fn held_count(&self) -> usize {
        self.shards.iter().map(|s| s.held.lock().len()).sum()
    }
}

pub struct RowGuard<'a> {
    table: &'a RowExclusionTable,
    key: RowKey,
}

impl Drop for RowGuard<'_> {
    fn drop(&mut self) {
        let shard = self.table.shard(&self.key.0, &self.key.1);
        let mut held = shard.held.lock();
        if held.get(&self.key) == Some(&Holder::Scoped) {
            held.remove(&self.key);
        }
        drop(held);
        shard.cv.notify_all();
    }
}
