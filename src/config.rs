use crate::error::RegionServerError;
use std::time::Duration;

pub const DEFAULT_REGION_OPEN_AND_INIT_THREADS_MAX: usize = 16;

/// Runtime configuration for a region server.
#[derive(Debug, Clone)]
pub struct RegionServerConfig {
    /// Advertised `host:port`, returned by location lookups.
    pub server_address: String,
    pub scanner_lease_ms: u64,
    pub row_lock_lease_ms: u64,
    /// How long an internal mutation waits for a row held by someone else.
    pub row_lock_wait_ms: u64,
    pub lease_sweep_interval_ms: u64,
    pub lease_table_shards: usize,
    pub row_exclusion_shards: usize,
    pub max_scanner_rows_per_next: usize,
    pub region_open_and_init_threads_max: usize,
    /// Poll interval used while draining region task results, bounds how
    /// quickly an interrupt is observed.
    pub task_poll_interval_ms: u64,
    pub histogram_buckets: usize,
    pub wal_sync_on_append: bool,
}

impl Default for RegionServerConfig {
    fn default() -> Self {
        Self {
            server_address: "localhost:60020".into(),
            scanner_lease_ms: 60_000,
            row_lock_lease_ms: 60_000,
            row_lock_wait_ms: 30_000,
            lease_sweep_interval_ms: 1_000,
            lease_table_shards: 16,
            row_exclusion_shards: 64,
            max_scanner_rows_per_next: 10_000,
            region_open_and_init_threads_max: DEFAULT_REGION_OPEN_AND_INIT_THREADS_MAX,
            task_poll_interval_ms: 50,
            histogram_buckets: 16,
            wal_sync_on_append: true,
        }
    }
}

impl RegionServerConfig {
    /// Short leases and no fsync, for tests and local experiments.
    pub fn development() -> Self {
        Self {
            scanner_lease_ms: 2_000,
            row_lock_lease_ms: 2_000,
            row_lock_wait_ms: 500,
            lease_sweep_interval_ms: 50,
            task_poll_interval_ms: 10,
            wal_sync_on_append: false,
            ..Self::default()
        }
    }

    pub fn with_scanner_lease_ms(mut self, ms: u64) -> Self {
        self.scanner_lease_ms = ms;
        self
    }

    pub fn with_row_lock_lease_ms(mut self, ms: u64) -> Self {
        self.row_lock_lease_ms = ms;
        self
    }

    pub fn with_row_lock_wait_ms(mut self, ms: u64) -> Self {
        self.row_lock_wait_ms = ms;
        self
    }

    pub fn with_region_open_and_init_threads_max(mut self, max: usize) -> Self {
        self.region_open_and_init_threads_max = max;
        self
    }

    pub fn scanner_lease(&self) -> Duration {
        Duration::from_millis(self.scanner_lease_ms)
    }

    pub fn row_lock_lease(&self) -> Duration {
        Duration::from_millis(self.row_lock_lease_ms)
    }

    pub fn row_lock_wait(&self) -> Duration {
        Duration::from_millis(self.row_lock_wait_ms)
    }

    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), RegionServerError> {
        let checks: [(&str, bool); 8] = [
            ("scanner_lease_ms must be > 0", self.scanner_lease_ms > 0),
            ("row_lock_lease_ms must be > 0", self.row_lock_lease_ms > 0),
            (
                "lease_sweep_interval_ms must be > 0",
                self.lease_sweep_interval_ms > 0,
            ),
            ("lease_table_shards must be > 0", self.lease_table_shards > 0),
            (
                "row_exclusion_shards must be > 0",
                self.row_exclusion_shards > 0,
            ),
            (
                "max_scanner_rows_per_next must be > 0",
                self.max_scanner_rows_per_next > 0,
            ),
            (
                "region_open_and_init_threads_max must be > 0",
                self.region_open_and_init_threads_max > 0,
            ),
            ("histogram_buckets must be > 0", self.histogram_buckets > 0),
        ];
        for (message, ok) in checks {
            if !ok {
                return Err(RegionServerError::InvalidConfig {
                    message: message.into(),
                });
            }
        }
        if self.server_address.trim().is_empty() {
            return Err(RegionServerError::InvalidConfig {
                message: "server_address must not be empty".into(),
            });
        }
        Ok(())
    }
}
