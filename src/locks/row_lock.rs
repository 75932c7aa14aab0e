use crate::error::RegionServerError;
use crate::lease::{IdAllocator, LeaseLookup, LeaseTable};
use crate::locks::{Holder, RowExclusionTable};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLock {
    pub id: u64,
    pub region: String,
    pub row: Vec<u8>,
}

/// Client-visible row locks, leased and backed by the shared exclusion table.
pub struct RowLockManager {
    ids: Arc<IdAllocator>,
    leases: LeaseTable<RowLock>,
    exclusion: Arc<RowExclusionTable>,
}

impl RowLockManager {
    pub fn new(
        ids: Arc<IdAllocator>,
        exclusion: Arc<RowExclusionTable>,
        shards: usize,
        lease: Duration,
    ) -> Self {
        Self {
            ids,
            leases: LeaseTable::new(shards, lease),
            exclusion,
        }
    }

    pub fn acquire(&self, region: &str, row: &[u8]) -> Result<u64, RegionServerError> {
        let id = self.ids.next_id();
        if !self.exclusion.try_claim_client(region, row, id) {
            // The holder may be a lock whose lease ran out but was not swept yet.
            let Some(Holder::Client(previous)) = self.exclusion.holder(region, row) else {
                return Err(RegionServerError::row_busy(region, row));
            };
            if let LeaseLookup::Expired(stale) = self.leases.checkout(previous) {
                self.free(&stale);
            }
            if !self.exclusion.try_claim_client(region, row, id) {
                return Err(RegionServerError::row_busy(region, row));
            }
        }
        self.leases.insert(
            id,
            RowLock {
                id,
                region: region.to_string(),
                row: row.to_vec(),
            },
        );
        debug!(lock_id = id, region, row = %hex::encode(row), "row lock acquired");
        Ok(id)
    }

    pub fn release(&self, region: &str, lock_id: u64) -> Result<(), RegionServerError> {
        match self.leases.take_if(lock_id, |lock| lock.region == region) {
            LeaseLookup::Live(lock) => {
                self.free(&lock);
                Ok(())
            }
            LeaseLookup::Expired(lock) => {
                self.expire(&lock);
                Err(RegionServerError::unknown_row_lock(lock_id))
            }
            LeaseLookup::Missing => Err(RegionServerError::unknown_row_lock(lock_id)),
        }
    }

    /// Confirms `lock_id` holds `row` in `region` and renews its lease.
    pub fn validate(&self, region: &str, row: &[u8], lock_id: u64) -> Result<(), RegionServerError> {
        match self.leases.checkout(lock_id) {
            LeaseLookup::Live(lock) if lock.region == region && lock.row == row => Ok(()),
            LeaseLookup::Live(_) | LeaseLookup::Missing => {
                Err(RegionServerError::unknown_row_lock(lock_id))
            }
            LeaseLookup::Expired(lock) => {
                self.expire(&lock);
                Err(RegionServerError::unknown_row_lock(lock_id))
            }
        }
    }

    pub fn sweep_expired(&self) -> usize {
        let expired = self.leases.sweep(Instant::now());
        for (_, lock) in &expired {
            self.expire(lock);
        }
        expired.len()
    }

    /// Drops every lock held on `region`.
    pub fn close_region(&self, region: &str) -> usize {
        let dropped = self.leases.drain_matching(|lock| lock.region == region);
        for (_, lock) in &dropped {
            self.free(lock);
        }
        dropped.len()
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    fn expire(&self, lock: &RowLock) {
        warn!(lock_id = lock.id, region = %lock.region, "row lock lease expired");
        self.free(lock);
    }

    fn free(&self, lock: &RowLock) {
        self.exclusion.release_client(&lock.region, &lock.row, lock.id);
    }
}

#[cfg(test)]
mod tests {
    use super::RowLockManager;
    use crate::error::{RegionServerError, SessionKind};
    use crate::lease::IdAllocator;
    use crate::locks::RowExclusionTable;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn manager(lease_ms: u64) -> (RowLockManager, Arc<RowExclusionTable>) {
        let exclusion = Arc::new(RowExclusionTable::new(4));
        let locks = RowLockManager::new(
            Arc::new(IdAllocator::new(1_700_000_000_000)),
            Arc::clone(&exclusion),
            4,
            Duration::from_millis(lease_ms),
        );
        (locks, exclusion)
    }

    fn is_unknown_lock(err: &RegionServerError) -> bool {
        matches!(
            err,
            RegionServerError::UnknownSession {
                kind: SessionKind::RowLock,
                ..
            }
        )
    }

    #[test]
    fn second_acquire_is_busy_until_release() {
        let (locks, _) = manager(60_000);
        let id = locks.acquire("t,,1", b"r1").expect("acquire");
        let err = locks.acquire("t,,1", b"r1").expect_err("busy");
        assert!(matches!(err, RegionServerError::RowBusy { .. }));
        locks.release("t,,1", id).expect("release");
        locks.acquire("t,,1", b"r1").expect("reacquire");
    }

    #[test]
    fn release_checks_region_and_liveness() {
        let (locks, _) = manager(60_000);
        let id = locks.acquire("t,,1", b"r1").expect("acquire");
        assert!(is_unknown_lock(&locks.release("other,,1", id).expect_err("wrong region")));
        locks.release("t,,1", id).expect("release");
        assert!(is_unknown_lock(&locks.release("t,,1", id).expect_err("double release")));
    }

    #[test]
    fn validate_rejects_other_rows() {
        let (locks, _) = manager(60_000);
        let id = locks.acquire("t,,1", b"r1").expect("acquire");
        locks.validate("t,,1", b"r1", id).expect("valid");
        assert!(is_unknown_lock(&locks.validate("t,,1", b"r2", id).expect_err("row")));
        assert!(is_unknown_lock(&locks.validate("t,,1", b"r1", id + 1000).expect_err("id")));
    }

    #[test]
    fn expired_lock_frees_row_lazily_and_by_sweep() {
        let (locks, exclusion) = manager(20);
        let id = locks.acquire("t,,1", b"r1").expect("acquire");
        thread::sleep(Duration::from_millis(40));
        assert!(is_unknown_lock(&locks.validate("t,,1", b"r1", id).expect_err("expired")));
        assert_eq!(exclusion.holder("t,,1", b"r1"), None);

        locks.acquire("t,,1", b"r2").expect("acquire");
        thread::sleep(Duration::from_millis(40));
        assert_eq!(locks.sweep_expired(), 1);
        assert!(locks.is_empty());
        assert_eq!(exclusion.held_count(), 0);
    }

    #[test]
    fn acquire_reclaims_row_from_unswept_expired_lock() {
        let (locks, _) = manager(20);
        locks.acquire("t,,1", b"r1").expect("acquire");
        thread::sleep(Duration::from_millis(40));
        locks.acquire("t,,1", b"r1").expect("stale lock reclaimed");
    }

    #[test]
    fn close_region_drops_only_that_regions_locks() {
        let (locks, exclusion) = manager(60_000);
        let a = locks.acquire("a,,1", b"r").expect("a");
        locks.acquire("b,,1", b"r").expect("b");
        assert_eq!(locks.close_region("a,,1"), 1);
        assert_eq!(locks.len(), 1);
        assert_eq!(exclusion.holder("a,,1", b"r"), None);
        assert!(is_unknown_lock(&locks.release("a,,1", a).expect_err("gone")));
    }
}
