use crate::error::RegionServerError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, Receiver, Sender};
use std::thread::JoinHandle;
use tracing::{debug, error};

pub type RegionJob = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named worker threads pulling jobs from one shared queue.
pub struct RegionWorkerPool {
    name: String,
    size: usize,
    sender: Mutex<Option<Sender<RegionJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl RegionWorkerPool {
    /// Threads are named `<name>-<n>`, counting from 1.
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self, RegionServerError> {
        let name = name.into();
        let size = size.max(1);
        let (tx, rx) = std_mpsc::channel::<RegionJob>();
        let rx = Arc::new(Mutex::new(rx));
        let stopped = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(size);
        for n in 1..=size {
            let rx = Arc::clone(&rx);
            let stopped = Arc::clone(&stopped);
            let handle = std::thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || run_worker(rx, stopped))?;
            workers.push(handle);
        }
        debug!(pool = %name, size, "region worker pool started");
        Ok(Self {
            name,
            size,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            stopped,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn submit(&self, job: RegionJob) -> Result<(), RegionServerError> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(RegionServerError::InvalidRequest(format!(
                "worker pool '{}' is shut down",
                self.name
            )));
        };
        tx.send(job).map_err(|_| {
            RegionServerError::InvalidRequest(format!("worker pool '{}' is gone", self.name))
        })
    }

    /// Stops accepting jobs; queued jobs still run.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    /// Stops accepting jobs and discards queued ones. Running jobs finish on
    /// their own; this does not wait for them.
    pub fn shutdown_now(&self) {
        self.stopped.store(true, Ordering::Release);
        if self.sender.lock().take().is_some() {
            debug!(pool = %self.name, "region worker pool shut down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Waits for every worker thread to exit. Only returns after a shutdown.
    pub fn join(&self) {
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for RegionWorkerPool {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

fn run_worker(rx: Arc<Mutex<Receiver<RegionJob>>>, stopped: Arc<AtomicBool>) {
    loop {
        let job = {
            let rx = rx.lock();
            rx.recv()
        };
        let Ok(job) = job else {
            break;
        };
        if stopped.load(Ordering::Acquire) {
            continue;
        }
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            error!("region worker job panicked");
        }
    }
}
