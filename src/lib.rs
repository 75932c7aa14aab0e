pub mod batch;
pub mod config;
pub mod error;
pub mod lease;
pub mod locks;
pub mod maintenance;
pub mod mutation;
pub mod region;
pub mod scanner;
pub mod storage;

use crate::batch::{
    Action, ActionOp, ActionResult, ActionTarget, BatchRequestCoordinator, MultiPut,
    MultiPutResponse, MultiResponse,
};
use crate::config::RegionServerConfig;
use crate::error::RegionServerError;
use crate::lease::{IdAllocator, now_millis};
use crate::locks::RowExclusionTable;
use crate::locks::row_lock::RowLockManager;
use crate::maintenance::spawn_lease_chore;
use crate::mutation::{CellCheck, ConditionalMutationExecutor, Increment};
use crate::region::lifecycle::RegionLifecycleOrchestrator;
use crate::region::{RegionInfo, RegionState, TableDescriptor};
use crate::scanner::{Scan, ScanBatch, ScannerSessionManager};
use crate::storage::local::LocalStorageEngine;
use crate::storage::{
    Delete, Get, HistogramBucket, Put, RegionStore, RowMutation, RowMutations, RowResult,
    StorageEngine,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct HostedRegion {
    store: Arc<dyn RegionStore>,
    state: Mutex<RegionState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLocation {
    pub region: RegionInfo,
    pub server_address: String,
}

/// One region server: hosts regions and serves reads, writes, scanners,
/// row locks, batches and bulk region creation against them.
pub struct RegionServer {
    config: RegionServerConfig,
    start_code: u64,
    regions: RwLock<HashMap<String, Arc<HostedRegion>>>,
    scanners: Arc<ScannerSessionManager>,
    row_locks: Arc<RowLockManager>,
    mutations: ConditionalMutationExecutor,
    lifecycle: RegionLifecycleOrchestrator,
    engine: Arc<dyn StorageEngine>,
    /// Sorted region lists per table, rebuilt on miss or explicit reload.
    locations: Mutex<HashMap<String, Vec<RegionInfo>>>,
    stop_reason: Mutex<Option<String>>,
    lease_chore: Mutex<Option<JoinHandle<()>>>,
}

impl RegionServer {
    /// Must be called from inside a tokio runtime; the lease chore is spawned
    /// onto it.
    pub fn open(
        config: RegionServerConfig,
        engine: Arc<dyn StorageEngine>,
    ) -> Result<Arc<Self>, RegionServerError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            RegionServerError::InvalidConfig {
                message: "region server must be opened inside a tokio runtime".into(),
            }
        })?;
        let start_code = now_millis();
        let ids = Arc::new(IdAllocator::new(start_code));
        let exclusion = Arc::new(RowExclusionTable::new(config.row_exclusion_shards));
        let scanners = Arc::new(ScannerSessionManager::new(
            Arc::clone(&ids),
            config.lease_table_shards,
            config.scanner_lease(),
            config.max_scanner_rows_per_next,
        ));
        let row_locks = Arc::new(RowLockManager::new(
            ids,
            Arc::clone(&exclusion),
            config.lease_table_shards,
            config.row_lock_lease(),
        ));
        let mutations = ConditionalMutationExecutor::new(
            exclusion,
            Arc::clone(&row_locks),
            config.row_lock_wait(),
        );
        let lifecycle = RegionLifecycleOrchestrator::new(Arc::clone(&engine), &config);
        let lease_chore = spawn_lease_chore(
            &runtime,
            Arc::clone(&scanners),
            Arc::clone(&row_locks),
            std::time::Duration::from_millis(config.lease_sweep_interval_ms),
        );
        info!(
            address = %config.server_address,
            start_code,
            "region server started"
        );
        Ok(Arc::new(Self {
            config,
            start_code,
            regions: RwLock::new(HashMap::new()),
            scanners,
            row_locks,
            mutations,
            lifecycle,
            engine,
            locations: Mutex::new(HashMap::new()),
            stop_reason: Mutex::new(None),
            lease_chore: Mutex::new(Some(lease_chore)),
        }))
    }

    /// Opens a server over a [`LocalStorageEngine`] rooted at `dir`.
    pub fn open_local(
        dir: &Path,
        config: RegionServerConfig,
    ) -> Result<Arc<Self>, RegionServerError> {
        let engine = LocalStorageEngine::new(dir)?.with_wal_sync(config.wal_sync_on_append);
        Self::open(config, Arc::new(engine))
    }

    pub fn config(&self) -> &RegionServerConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &RegionLifecycleOrchestrator {
        &self.lifecycle
    }

    pub fn start_code(&self) -> u64 {
        self.start_code
    }

    pub fn current_time_millis(&self) -> u64 {
        now_millis()
    }

    fn hosted(&self, region: &str) -> Result<Arc<HostedRegion>, RegionServerError> {
        self.regions
            .read()
            .get(region)
            .cloned()
            .ok_or_else(|| RegionServerError::not_serving(region))
    }

    fn online(&self, region: &str) -> Result<Arc<dyn RegionStore>, RegionServerError> {
        let hosted = self.hosted(region)?;
        if *hosted.state.lock() != RegionState::Online {
            return Err(RegionServerError::not_serving(region));
        }
        Ok(Arc::clone(&hosted.store))
    }

    fn online_for_row(
        &self,
        region: &str,
        row: &[u8],
    ) -> Result<Arc<dyn RegionStore>, RegionServerError> {
        let store = self.online(region)?;
        if !store.info().contains_row(row) {
            return Err(RegionServerError::InvalidRequest(format!(
                "row {} is outside region {region}",
                hex::encode(row)
            )));
        }
        Ok(store)
    }

    pub fn open_region(
        &self,
        table: &TableDescriptor,
        info: &RegionInfo,
    ) -> Result<(), RegionServerError> {
        if self.is_stopped() {
            return Err(RegionServerError::InvalidRequest(
                "region server is stopped".into(),
            ));
        }
        let name = info.region_name();
        if self.regions.read().contains_key(&name) {
            return Err(RegionServerError::InvalidRequest(format!(
                "region {name} is already online"
            )));
        }
        let store = self.engine.open_region(table, info)?;
        let hosted = Arc::new(HostedRegion {
            store,
            state: Mutex::new(RegionState::Opening),
        });
        {
            let mut regions = self.regions.write();
            if regions.contains_key(&name) {
                drop(regions);
                hosted.store.close()?;
                return Err(RegionServerError::InvalidRequest(format!(
                    "region {name} is already online"
                )));
            }
            regions.insert(name.clone(), Arc::clone(&hosted));
        }
        self.locations.lock().remove(&info.table);
        *hosted.state.lock() = RegionState::Online;
        info!(region = %name, "region online");
        Ok(())
    }

    /// Takes the region offline, evicting its scanners and row locks, then
    /// flushes and closes its store.
    pub fn close_region(&self, region: &str) -> Result<(), RegionServerError> {
        let hosted = self
            .regions
            .write()
            .remove(region)
            .ok_or_else(|| RegionServerError::not_serving(region))?;
        self.retire(region, &hosted)
    }

    fn retire(&self, region: &str, hosted: &HostedRegion) -> Result<(), RegionServerError> {
        *hosted.state.lock() = RegionState::Closing;
        self.locations.lock().remove(&hosted.store.info().table);
        let scanners = self.scanners.close_region(region);
        let locks = self.row_locks.close_region(region);
        let closed = hosted.store.close();
        *hosted.state.lock() = RegionState::Closed;
        info!(region, scanners, locks, "region closed");
        closed
    }

    pub fn region_info(&self, region: &str) -> Result<RegionInfo, RegionServerError> {
        Ok(self.hosted(region)?.store.info().clone())
    }

    pub fn online_regions(&self) -> Vec<RegionInfo> {
        let mut out: Vec<RegionInfo> = self
            .regions
            .read()
            .values()
            .filter(|h| *h.state.lock() == RegionState::Online)
            .map(|h| h.store.info().clone())
            .collect();
        out.sort_by(|a, b| {
            (&a.table, &a.start_key, a.region_id).cmp(&(&b.table, &b.start_key, b.region_id))
        });
        out
    }

    /// Finds the online region holding `row`. `reload` bypasses the cached
    /// region list for the table.
    pub fn location(
        &self,
        table: &str,
        row: &[u8],
        reload: bool,
    ) -> Result<RegionLocation, RegionServerError> {
        let mut cache = self.locations.lock();
        if reload || !cache.contains_key(table) {
            let regions: Vec<RegionInfo> = self
                .online_regions()
                .into_iter()
                .filter(|r| r.table == table)
                .collect();
            cache.insert(table.to_string(), regions);
        }
        cache
            .get(table)
            .and_then(|regions| regions.iter().find(|r| r.contains_row(row)))
            .map(|region| RegionLocation {
                region: region.clone(),
                server_address: self.config.server_address.clone(),
            })
            .ok_or_else(|| {
                RegionServerError::not_serving(format!("{table},{}", hex::encode(row)))
            })
    }

    pub fn get(&self, region: &str, get: &Get) -> Result<Option<RowResult>, RegionServerError> {
        self.online_for_row(region, &get.row)?.get(get)
    }

    pub fn get_batch(
        &self,
        region: &str,
        gets: &[Get],
    ) -> Result<Vec<Option<RowResult>>, RegionServerError> {
        gets.iter().map(|get| self.get(region, get)).collect()
    }

    pub fn exists(&self, region: &str, get: &Get) -> Result<bool, RegionServerError> {
        Ok(self.get(region, get)?.is_some())
    }

    pub fn put(&self, region: &str, put: Put) -> Result<(), RegionServerError> {
        let store = self.online(region)?;
        self.mutations.mutate(store.as_ref(), &RowMutation::Put(put))
    }

    /// Returns `-1` when every put applied, otherwise the number that failed.
    pub fn put_batch(&self, region: &str, puts: &[Put]) -> Result<i32, RegionServerError> {
        let store = self.online(region)?;
        let failed = puts
            .iter()
            .filter(|put| {
                let mutation = RowMutation::Put((*put).clone());
                self.mutations.mutate(store.as_ref(), &mutation).is_err()
            })
            .count();
        Ok(failed_or_all_applied(failed))
    }

    pub fn delete(&self, region: &str, delete: Delete) -> Result<(), RegionServerError> {
        let store = self.online(region)?;
        self.mutations
            .mutate(store.as_ref(), &RowMutation::Delete(delete))
    }

    pub fn delete_batch(&self, region: &str, deletes: &[Delete]) -> Result<i32, RegionServerError> {
        let store = self.online(region)?;
        let failed = deletes
            .iter()
            .filter(|delete| {
                let mutation = RowMutation::Delete((*delete).clone());
                self.mutations.mutate(store.as_ref(), &mutation).is_err()
            })
            .count();
        Ok(failed_or_all_applied(failed))
    }

    pub fn check_and_put(
        &self,
        region: &str,
        check: &CellCheck,
        put: Put,
    ) -> Result<bool, RegionServerError> {
        let store = self.online(region)?;
        self.mutations
            .check_and_mutate(store.as_ref(), check, &RowMutation::Put(put))
    }

    pub fn check_and_delete(
        &self,
        region: &str,
        check: &CellCheck,
        delete: Delete,
    ) -> Result<bool, RegionServerError> {
        let store = self.online(region)?;
        self.mutations
            .check_and_mutate(store.as_ref(), check, &RowMutation::Delete(delete))
    }

    pub fn increment_column_value(
        &self,
        region: &str,
        increment: &Increment,
    ) -> Result<i64, RegionServerError> {
        let store = self.online(region)?;
        self.mutations
            .increment_column_value(store.as_ref(), increment)
    }

    pub fn mutate_row(
        &self,
        region: &str,
        mutations: &RowMutations,
    ) -> Result<(), RegionServerError> {
        let store = self.online(region)?;
        self.mutations.mutate_row(store.as_ref(), mutations)
    }

    pub fn open_scanner(&self, region: &str, scan: Scan) -> Result<u64, RegionServerError> {
        let hosted = self.hosted(region)?;
        let state = *hosted.state.lock();
        if state != RegionState::Online {
            return Err(RegionServerError::InvalidRequest(format!(
                "region {region} is {state:?}, not online"
            )));
        }
        let snapshot = hosted.store.snapshot();
        let scanner_id = self.scanners.open(hosted.store.info(), snapshot, scan);
        // A close that evicted before this registration has already left Online.
        if *hosted.state.lock() != RegionState::Online {
            let _ = self.scanners.close(scanner_id);
            return Err(RegionServerError::not_serving(region));
        }
        Ok(scanner_id)
    }

    pub fn scanner_next(&self, scanner_id: u64, max_rows: usize) -> Result<ScanBatch, RegionServerError> {
        self.scanners.next(scanner_id, max_rows)
    }

    pub fn close_scanner(&self, scanner_id: u64) -> Result<(), RegionServerError> {
        self.scanners.close(scanner_id)
    }

    pub fn lock_row(&self, region: &str, row: &[u8]) -> Result<u64, RegionServerError> {
        let hosted = self.hosted(region)?;
        if *hosted.state.lock() != RegionState::Online {
            return Err(RegionServerError::not_serving(region));
        }
        if !hosted.store.info().contains_row(row) {
            return Err(RegionServerError::InvalidRequest(format!(
                "row {} is outside region {region}",
                hex::encode(row)
            )));
        }
        let lock_id = self.row_locks.acquire(region, row)?;
        if *hosted.state.lock() != RegionState::Online {
            let _ = self.row_locks.release(region, lock_id);
            return Err(RegionServerError::not_serving(region));
        }
        Ok(lock_id)
    }

    pub fn unlock_row(&self, region: &str, lock_id: u64) -> Result<(), RegionServerError> {
        self.online(region)?;
        self.row_locks.release(region, lock_id)
    }

    pub async fn multi_action(self: &Arc<Self>, actions: Vec<Action>) -> MultiResponse {
        BatchRequestCoordinator::multi_action(Arc::clone(self), actions).await
    }

    pub async fn multi_put(self: &Arc<Self>, multi: MultiPut) -> MultiPutResponse {
        BatchRequestCoordinator::multi_put(Arc::clone(self), multi).await
    }

    pub fn bulk_load_file(
        &self,
        region: &str,
        path: &Path,
        family: &[u8],
        assign_seq: bool,
    ) -> Result<(), RegionServerError> {
        self.online(region)?.bulk_load(path, family, assign_seq)
    }

    /// Flushes unless `if_older_than` is given and the last flush happened at
    /// or after it. Returns whether a flush ran.
    pub fn flush_region(
        &self,
        region: &str,
        if_older_than: Option<u64>,
    ) -> Result<bool, RegionServerError> {
        let store = self.online(region)?;
        if if_older_than.is_some_and(|threshold| store.last_flush_millis() >= threshold) {
            return Ok(false);
        }
        store.flush()?;
        Ok(true)
    }

    pub fn last_flush_time(&self, region: &str) -> Result<u64, RegionServerError> {
        Ok(self.online(region)?.last_flush_millis())
    }

    pub fn last_flush_times(&self) -> BTreeMap<String, u64> {
        self.regions
            .read()
            .iter()
            .filter(|(_, h)| *h.state.lock() == RegionState::Online)
            .map(|(name, h)| (name.clone(), h.store.last_flush_millis()))
            .collect()
    }

    pub fn store_file_list(
        &self,
        region: &str,
        families: &[Vec<u8>],
    ) -> Result<Vec<String>, RegionServerError> {
        self.online(region)?.store_files(families)
    }

    pub fn histogram(&self, region: &str) -> Result<Vec<HistogramBucket>, RegionServerError> {
        let store = self.online(region)?;
        Ok(store.snapshot().histogram(None, self.config.histogram_buckets))
    }

    pub fn histogram_for_store(
        &self,
        region: &str,
        family: &[u8],
    ) -> Result<Vec<HistogramBucket>, RegionServerError> {
        let store = self.online(region)?;
        if !store.table().has_family(family) {
            return Err(RegionServerError::InvalidRequest(format!(
                "unknown column family '{}'",
                String::from_utf8_lossy(family)
            )));
        }
        Ok(store
            .snapshot()
            .histogram(Some(family), self.config.histogram_buckets))
    }

    /// Closes every hosted region and drops all sessions. Calling it again
    /// keeps the first reason.
    pub fn stop(&self, why: &str) {
        {
            let mut reason = self.stop_reason.lock();
            if reason.is_some() {
                return;
            }
            *reason = Some(why.to_string());
        }
        info!(reason = why, "region server stopping");
        if let Some(chore) = self.lease_chore.lock().take() {
            chore.abort();
        }
        let hosted: Vec<(String, Arc<HostedRegion>)> = self.regions.write().drain().collect();
        for (name, region) in hosted {
            if let Err(e) = self.retire(&name, &region) {
                warn!(region = %name, error = %e, "region close failed during stop");
            }
        }
        self.locations.lock().clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_reason.lock().is_some()
    }

    pub fn stop_reason(&self) -> Option<String> {
        self.stop_reason.lock().clone()
    }
}

fn failed_or_all_applied(failed: usize) -> i32 {
    if failed == 0 {
        -1
    } else {
        i32::try_from(failed).unwrap_or(i32::MAX)
    }
}

impl ActionTarget for RegionServer {
    fn execute_action(
        &self,
        region: &str,
        op: &ActionOp,
    ) -> Result<ActionResult, RegionServerError> {
        match op {
            ActionOp::Get(get) => self.get(region, get).map(ActionResult::Row),
            ActionOp::Exists(get) => self.exists(region, get).map(ActionResult::Exists),
            ActionOp::Put(put) => self
                .put(region, put.clone())
                .map(|()| ActionResult::Applied),
            ActionOp::Delete(delete) => self
                .delete(region, delete.clone())
                .map(|()| ActionResult::Applied),
            ActionOp::CheckAndPut { check, put } => self
                .check_and_put(region, check, put.clone())
                .map(ActionResult::Checked),
            ActionOp::CheckAndDelete { check, delete } => self
                .check_and_delete(region, check, delete.clone())
                .map(ActionResult::Checked),
            ActionOp::Increment(increment) => self
                .increment_column_value(region, increment)
                .map(ActionResult::Counter),
            ActionOp::MutateRow(mutations) => self
                .mutate_row(region, mutations)
                .map(|()| ActionResult::Applied),
        }
    }

    fn apply_puts(&self, region: &str, puts: &[Put]) -> Result<i32, RegionServerError> {
        self.put_batch(region, puts)
    }
}

impl Drop for RegionServer {
    fn drop(&mut self) {
        if let Some(chore) = self.lease_chore.get_mut().take() {
            chore.abort();
        }
    }
}
