//! Background lease expiry for scanner sessions and row locks.

use crate::locks::row_lock::RowLockManager;
use crate::scanner::ScannerSessionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanners: usize,
    pub row_locks: usize,
}

/// Runs one expiry pass over both lease tables. Only in-memory state is
/// touched, one shard at a time.
pub fn sweep_leases(scanners: &ScannerSessionManager, row_locks: &RowLockManager) -> SweepReport {
    SweepReport {
        scanners: scanners.sweep_expired(),
        row_locks: row_locks.sweep_expired(),
    }
}

pub(crate) fn spawn_lease_chore(
    runtime: &tokio::runtime::Handle,
    scanners: Arc<ScannerSessionManager>,
    row_locks: Arc<RowLockManager>,
    interval: Duration,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let report = sweep_leases(&scanners, &row_locks);
            if report != SweepReport::default() {
                debug!(
                    scanners = report.scanners,
                    row_locks = report.row_locks,
                    "expired leases swept"
                );
            }
        }
    })
}
