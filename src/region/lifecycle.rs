//! Bulk creation and editing of regions on bounded worker pools.
//!
//! Results are drained in completion order. The first failure aborts the
//! wait; on-disk state left by tasks that already finished is not rolled
//! back.

use crate::config::RegionServerConfig;
use crate::error::RegionServerError;
use crate::region::pool::RegionWorkerPool;
use crate::region::{RegionInfo, TableDescriptor};
use crate::storage::{RegionStore, StorageEngine};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{info, warn};

/// Populates a freshly created region before it is closed.
pub type RegionFill = dyn Fn(&dyn RegionStore) -> Result<(), RegionServerError> + Send + Sync;

pub type RegionEdit = dyn Fn(&RegionInfo) -> Result<(), RegionServerError> + Send + Sync;

/// Interrupts the one orchestration call it is passed to. The flag is
/// cleared once that call observes it.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

type TaskOutcome<T> = (String, Result<T, RegionServerError>);

pub struct RegionLifecycleOrchestrator {
    engine: Arc<dyn StorageEngine>,
    threads_max: usize,
    poll: Duration,
}

impl RegionLifecycleOrchestrator {
    pub fn new(engine: Arc<dyn StorageEngine>, config: &RegionServerConfig) -> Self {
        Self {
            engine,
            threads_max: config.region_open_and_init_threads_max.max(1),
            poll: config.task_poll_interval(),
        }
    }

    /// Creates `regions` on a pool of its own, sized
    /// `min(regions.len(), region_open_and_init_threads_max)`. The pool is shut
    /// down before returning, whatever the outcome.
    pub fn create_regions(
        &self,
        table: &TableDescriptor,
        regions: &[RegionInfo],
        fill: Option<Arc<RegionFill>>,
    ) -> Result<Vec<RegionInfo>, RegionServerError> {
        self.create_regions_interruptible(table, regions, fill, &InterruptHandle::new())
    }

    /// [`create_regions`](Self::create_regions) whose wait ends with
    /// `Interrupted` once `interrupt` fires. Queued creations are cancelled.
    pub fn create_regions_interruptible(
        &self,
        table: &TableDescriptor,
        regions: &[RegionInfo],
        fill: Option<Arc<RegionFill>>,
        interrupt: &InterruptHandle,
    ) -> Result<Vec<RegionInfo>, RegionServerError> {
        if regions.is_empty() {
            return Ok(Vec::new());
        }
        let pool = RegionWorkerPool::new(
            format!("RegionOpenAndInitThread-{}", table.name),
            regions.len().min(self.threads_max),
        )?;
        let result = self.create_on(&pool, table, regions, fill, interrupt);
        pool.shutdown_now();
        result
    }

    /// Like [`create_regions`](Self::create_regions) on a caller-owned pool.
    /// On failure this call's outstanding tasks are cancelled but the pool
    /// keeps running.
    pub fn create_regions_with_pool(
        &self,
        pool: &RegionWorkerPool,
        table: &TableDescriptor,
        regions: &[RegionInfo],
        fill: Option<Arc<RegionFill>>,
    ) -> Result<Vec<RegionInfo>, RegionServerError> {
        if regions.is_empty() {
            return Ok(Vec::new());
        }
        self.create_on(pool, table, regions, fill, &InterruptHandle::new())
    }

    /// Runs `edit` once per region. The first failure is returned; tasks
    /// already queued keep running.
    pub fn edit_regions(
        &self,
        pool: &RegionWorkerPool,
        regions: &[RegionInfo],
        edit: Arc<RegionEdit>,
    ) -> Result<(), RegionServerError> {
        self.edit_regions_interruptible(pool, regions, edit, &InterruptHandle::new())
    }

    /// [`edit_regions`](Self::edit_regions) whose wait ends with
    /// `Interrupted` once `interrupt` fires. Queued edits keep running.
    pub fn edit_regions_interruptible(
        &self,
        pool: &RegionWorkerPool,
        regions: &[RegionInfo],
        edit: Arc<RegionEdit>,
        interrupt: &InterruptHandle,
    ) -> Result<(), RegionServerError> {
        let (tx, rx) = std_mpsc::channel::<TaskOutcome<()>>();
        for region in regions {
            let tx = tx.clone();
            let edit = Arc::clone(&edit);
            let region = region.clone();
            pool.submit(Box::new(move || {
                let label = format!("edit {region}");
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| edit(&region)))
                        .unwrap_or_else(|_| Err(panicked(&label)));
                let _ = tx.send((label, outcome));
            }))?;
        }
        drop(tx);
        self.drain(rx, regions.len(), None, interrupt)?;
        Ok(())
    }

    fn create_on(
        &self,
        pool: &RegionWorkerPool,
        table: &TableDescriptor,
        regions: &[RegionInfo],
        fill: Option<Arc<RegionFill>>,
        interrupt: &InterruptHandle,
    ) -> Result<Vec<RegionInfo>, RegionServerError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std_mpsc::channel::<TaskOutcome<RegionInfo>>();
        for region in regions {
            let tx = tx.clone();
            let engine = Arc::clone(&self.engine);
            let table = table.clone();
            let region = region.clone();
            let fill = fill.clone();
            let cancel_task = Arc::clone(&cancel);
            let submitted = pool.submit(Box::new(move || {
                let label = format!("create {region}");
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    create_one(engine.as_ref(), &table, &region, fill.as_deref(), &cancel_task)
                }))
                .unwrap_or_else(|_| Err(panicked(&label)));
                let _ = tx.send((label, outcome));
            }));
            if let Err(e) = submitted {
                cancel.store(true, Ordering::Release);
                return Err(e);
            }
        }
        drop(tx);
        let created = self.drain(rx, regions.len(), Some(&cancel), interrupt)?;
        info!(table = %table.name, regions = created.len(), "regions created");
        Ok(created)
    }

    fn drain<T>(
        &self,
        rx: Receiver<TaskOutcome<T>>,
        expected: usize,
        cancel: Option<&AtomicBool>,
        interrupt: &InterruptHandle,
    ) -> Result<Vec<T>, RegionServerError> {
        let cancel_rest = || {
            if let Some(cancel) = cancel {
                cancel.store(true, Ordering::Release);
            }
        };
        let mut done = Vec::with_capacity(expected);
        while done.len() < expected {
            if interrupt.take() {
                cancel_rest();
                let pending = expected - done.len();
                warn!(pending, "interrupted while waiting for region tasks");
                return Err(RegionServerError::Interrupted(format!(
                    "{pending} of {expected} region tasks still running"
                )));
            }
            match rx.recv_timeout(self.poll) {
                Ok((_, Ok(value))) => done.push(value),
                Ok((task, Err(source))) => {
                    cancel_rest();
                    warn!(task = %task, error = %source, "region task failed");
                    return Err(RegionServerError::ExecutionFailure {
                        task,
                        source: Box::new(source),
                    });
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RegionServerError::ExecutionFailure {
                        task: "region task".into(),
                        source: Box::new(RegionServerError::Cancelled),
                    });
                }
            }
        }
        Ok(done)
    }
}

fn panicked(label: &str) -> RegionServerError {
    RegionServerError::Io(std::io::Error::other(format!("{label} panicked")))
}

fn create_one(
    engine: &dyn StorageEngine,
    table: &TableDescriptor,
    region: &RegionInfo,
    fill: Option<&RegionFill>,
    cancel: &AtomicBool,
) -> Result<RegionInfo, RegionServerError> {
    if cancel.load(Ordering::Acquire) {
        return Err(RegionServerError::Cancelled);
    }
    let store = engine.create_region(table, region)?;
    let filled = if cancel.load(Ordering::Acquire) {
        Err(RegionServerError::Cancelled)
    } else {
        fill.map_or(Ok(()), |fill| fill(store.as_ref()))
    };
    let closed = store.close();
    filled?;
    closed?;
    Ok(region.clone())
}

#[cfg(test)]
mod tests {
    use super::{InterruptHandle, RegionFill, RegionLifecycleOrchestrator};
    use crate::config::RegionServerConfig;
    use crate::error::RegionServerError;
    use crate::region::pool::RegionWorkerPool;
    use crate::region::{RegionInfo, TableDescriptor, derive_region_boundaries};
    use crate::storage::local::LocalStorageEngine;
    use crate::storage::{ColumnKey, Durability, RegionStore, RowEdit};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn setup(
        threads: usize,
    ) -> (
        tempfile::TempDir,
        Arc<LocalStorageEngine>,
        RegionLifecycleOrchestrator,
    ) {
        let dir = tempdir().expect("tempdir");
        let engine = Arc::new(
            LocalStorageEngine::new(dir.path())
                .expect("engine")
                .with_wal_sync(false),
        );
        let config = RegionServerConfig::development().with_region_open_and_init_threads_max(threads);
        let orchestrator = RegionLifecycleOrchestrator::new(engine.clone(), &config);
        (dir, engine, orchestrator)
    }

    fn split_keys(n: usize) -> Vec<Vec<u8>> {
        (1..=n).map(|i| format!("k{i:02}").into_bytes()).collect()
    }

    #[test]
    fn creates_every_region_and_runs_fill() {
        let (dir, _engine, orchestrator) = setup(4);
        let table = TableDescriptor::new("t").with_family("d");
        let regions = derive_region_boundaries(&table, &split_keys(5)).expect("bounds");
        let fill: Arc<RegionFill> = Arc::new(|store: &dyn RegionStore| {
            let row = if store.info().start_key.is_empty() {
                b"a".to_vec()
            } else {
                store.info().start_key.clone()
            };
            store.apply(
                &RowEdit::put_cell(&row, ColumnKey::new("d", "seed"), b"1".to_vec()),
                Durability::SyncWal,
            )
        });
        let created = orchestrator
            .create_regions(&table, &regions, Some(fill))
            .expect("create");
        assert_eq!(created.len(), 6);
        for region in &regions {
            assert!(created.contains(region));
            let region_dir = dir.path().join("t").join(region.encoded_name());
            assert!(region_dir.join(".regioninfo").exists());
        }
    }

    #[test]
    fn first_failure_is_execution_failure_with_cause() {
        let (_dir, _engine, orchestrator) = setup(2);
        let table = TableDescriptor::new("t").with_family("d");
        let regions = derive_region_boundaries(&table, &split_keys(7)).expect("bounds");
        let bad = regions[3].clone();
        let fill: Arc<RegionFill> = Arc::new(move |store: &dyn RegionStore| {
            if store.info() == &bad {
                return Err(RegionServerError::Io(std::io::Error::other("disk full")));
            }
            Ok(())
        });
        let err = orchestrator
            .create_regions(&table, &regions, Some(fill))
            .expect_err("fails");
        let RegionServerError::ExecutionFailure { source, .. } = err else {
            panic!("expected execution failure, got {err:?}");
        };
        assert!(source.to_string().contains("disk full"));
    }

    #[test]
    fn empty_region_list_is_a_no_op() {
        let (_dir, _engine, orchestrator) = setup(2);
        let table = TableDescriptor::new("t").with_family("d");
        assert!(orchestrator
            .create_regions(&table, &[], None)
            .expect("empty")
            .is_empty());
    }

    #[test]
    fn caller_pool_survives_a_failed_create() {
        let (_dir, _engine, orchestrator) = setup(2);
        let pool = RegionWorkerPool::new("shared", 2).expect("pool");
        let table = TableDescriptor::new("t").with_family("d");
        let regions = derive_region_boundaries(&table, &split_keys(2)).expect("bounds");
        let fill: Arc<RegionFill> =
            Arc::new(|_: &dyn RegionStore| Err(RegionServerError::InvalidRequest("no".into())));
        orchestrator
            .create_regions_with_pool(&pool, &table, &regions, Some(fill))
            .expect_err("fails");
        assert!(!pool.is_shutdown());

        let other = TableDescriptor::new("u").with_family("d");
        let more = derive_region_boundaries(&other, &[]).expect("bounds");
        orchestrator
            .create_regions_with_pool(&pool, &other, &more, None)
            .expect("pool still usable");
    }

    #[test]
    fn edit_regions_does_not_cancel_remaining_tasks() {
        let (_dir, _engine, orchestrator) = setup(2);
        let pool = RegionWorkerPool::new("edit", 1).expect("pool");
        let regions: Vec<RegionInfo> = (0u8..4)
            .map(|i| RegionInfo::new("t", vec![i], vec![i + 1], 1))
            .collect();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let result = orchestrator.edit_regions(
            &pool,
            &regions,
            Arc::new(move |region: &RegionInfo| {
                counter.fetch_add(1, Ordering::SeqCst);
                if region.start_key == vec![0] {
                    return Err(RegionServerError::InvalidRequest("first edit fails".into()));
                }
                thread::sleep(Duration::from_millis(5));
                Ok(())
            }),
        );
        assert!(matches!(result, Err(RegionServerError::ExecutionFailure { .. })));
        pool.shutdown();
        pool.join();
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn failed_create_cancels_regions_still_queued() {
        let (dir, _engine, orchestrator) = setup(1);
        let table = TableDescriptor::new("t").with_family("d");
        let regions = derive_region_boundaries(&table, &split_keys(9)).expect("bounds");
        assert_eq!(regions.len(), 10);
        let fills = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fills);
        let fill: Arc<RegionFill> = Arc::new(move |_: &dyn RegionStore| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(RegionServerError::Io(std::io::Error::other("fill failed")))
        });
        let err = orchestrator
            .create_regions(&table, &regions, Some(fill))
            .expect_err("fails");
        assert!(matches!(err, RegionServerError::ExecutionFailure { .. }));
        // A task picked up before the cancel flag was set may still finish.
        thread::sleep(Duration::from_millis(50));
        let fills = fills.load(Ordering::SeqCst);
        let on_disk = regions
            .iter()
            .filter(|r| {
                dir.path()
                    .join("t")
                    .join(r.encoded_name())
                    .join(".regioninfo")
                    .exists()
            })
            .count();
        assert!(fills < regions.len(), "{fills} fills ran");
        assert!(on_disk < regions.len(), "{on_disk} regions on disk");
        assert!(fills <= on_disk);
        let last = regions.last().expect("last");
        assert!(!dir.path().join("t").join(last.encoded_name()).exists());
    }

    #[test]
    fn interrupt_while_waiting_is_reported_as_interrupted() {
        let (_dir, _engine, orchestrator) = setup(1);
        let pool = RegionWorkerPool::new("slow", 1).expect("pool");
        let regions = vec![RegionInfo::new("t", Vec::new(), Vec::new(), 1)];
        let interrupt = InterruptHandle::new();
        let handle = interrupt.clone();
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            handle.interrupt();
        });
        let result = orchestrator.edit_regions_interruptible(
            &pool,
            &regions,
            Arc::new(|_: &RegionInfo| {
                thread::sleep(Duration::from_millis(300));
                Ok::<(), RegionServerError>(())
            }),
            &interrupt,
        );
        interrupter.join().expect("join");
        assert!(matches!(result, Err(RegionServerError::Interrupted(_))));
        assert!(!interrupt.is_interrupted());
    }

    #[test]
    fn interrupt_only_reaches_the_call_it_was_given_to() {
        let (_dir, _engine, orchestrator) = setup(2);
        let orchestrator = Arc::new(orchestrator);
        let pool = Arc::new(RegionWorkerPool::new("pair", 2).expect("pool"));
        let slow: Arc<super::RegionEdit> = Arc::new(|_: &RegionInfo| {
            thread::sleep(Duration::from_millis(150));
            Ok::<(), RegionServerError>(())
        });

        let target = InterruptHandle::new();
        let bystander = {
            let orchestrator = Arc::clone(&orchestrator);
            let pool = Arc::clone(&pool);
            let edit = Arc::clone(&slow);
            thread::spawn(move || {
                let regions = vec![RegionInfo::new("b", Vec::new(), Vec::new(), 1)];
                let own = InterruptHandle::new();
                orchestrator.edit_regions_interruptible(&pool, &regions, edit, &own)
            })
        };
        let handle = target.clone();
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            handle.interrupt();
        });
        let regions = vec![RegionInfo::new("a", Vec::new(), Vec::new(), 1)];
        let interrupted = orchestrator.edit_regions_interruptible(&pool, &regions, slow, &target);
        interrupter.join().expect("join");

        assert!(matches!(interrupted, Err(RegionServerError::Interrupted(_))));
        bystander.join().expect("join").expect("bystander completes");
    }
}
