//! Scanner sessions: a leased cursor over an immutable region snapshot.

pub mod filter;

use crate::error::RegionServerError;
use crate::lease::{IdAllocator, LeaseLookup, LeaseTable};
use crate::region::RegionInfo;
use crate::scanner::filter::{FilterDecision, ScanFilter};
use crate::storage::{ColumnSelection, RegionSnapshot, RowResult};
use parking_lot::Mutex;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Client description of a scan. Empty start or stop rows are unbounded; the
/// stop row is exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scan {
    pub start_row: Vec<u8>,
    pub stop_row: Vec<u8>,
    pub columns: ColumnSelection,
    pub filter: Option<ScanFilter>,
}

impl Scan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_row(mut self, row: impl Into<Vec<u8>>) -> Self {
        self.start_row = row.into();
        self
    }

    pub fn with_stop_row(mut self, row: impl Into<Vec<u8>>) -> Self {
        self.stop_row = row.into();
        self
    }

    pub fn with_columns(mut self, columns: ColumnSelection) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_filter(mut self, filter: ScanFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanBatch {
    Rows(Vec<RowResult>),
    /// The region's part of the range is consumed; continue with the next region.
    Exhausted,
    /// A filter ended the scan; do not move on to the next region.
    FilterDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Exhausted,
    FilterDone,
}

struct Cursor {
    snapshot: RegionSnapshot,
    resume: Bound<Vec<u8>>,
    stop_row: Vec<u8>,
    columns: ColumnSelection,
    filter: Option<ScanFilter>,
    returned: usize,
    phase: Phase,
}

struct ScannerSession {
    region: String,
    closed: AtomicBool,
    cursor: Mutex<Cursor>,
}

type SessionHandle = Arc<ScannerSession>;

pub struct ScannerSessionManager {
    ids: Arc<IdAllocator>,
    sessions: LeaseTable<SessionHandle>,
    max_rows_per_next: usize,
}

impl ScannerSessionManager {
    pub fn new(ids: Arc<IdAllocator>, shards: usize, lease: Duration, max_rows_per_next: usize) -> Self {
        Self {
            ids,
            sessions: LeaseTable::new(shards, lease),
            max_rows_per_next: max_rows_per_next.max(1),
        }
    }

    pub fn open(&self, region: &RegionInfo, snapshot: RegionSnapshot, scan: Scan) -> u64 {
        let start = if scan.start_row > region.start_key {
            scan.start_row
        } else {
            region.start_key.clone()
        };
        let stop_row = match (scan.stop_row.is_empty(), region.end_key.is_empty()) {
            (true, _) => region.end_key.clone(),
            (false, true) => scan.stop_row,
            (false, false) => scan.stop_row.min(region.end_key.clone()),
        };
        let id = self.ids.next_id();
        let session = ScannerSession {
            region: region.region_name(),
            closed: AtomicBool::new(false),
            cursor: Mutex::new(Cursor {
                snapshot,
                resume: Bound::Included(start),
                stop_row,
                columns: scan.columns,
                filter: scan.filter,
                returned: 0,
                phase: Phase::Active,
            }),
        };
        self.sessions.insert(id, Arc::new(session));
        debug!(scanner_id = id, region = %region, "scanner opened");
        id
    }

    /// Returns up to `max_rows` rows, capped by the configured per-call limit.
    /// Calls on one id are serialised; a call that waited behind a close sees
    /// the scanner as unknown.
    pub fn next(&self, id: u64, max_rows: usize) -> Result<ScanBatch, RegionServerError> {
        if max_rows == 0 {
            return Err(RegionServerError::InvalidRequest(
                "scanner next needs max_rows > 0".into(),
            ));
        }
        let limit = max_rows.min(self.max_rows_per_next);
        let session = match self.sessions.checkout(id) {
            LeaseLookup::Live(session) => session,
            LeaseLookup::Expired(session) => {
                session.closed.store(true, Ordering::Release);
                warn!(scanner_id = id, region = %session.region, "scanner lease expired");
                return Err(RegionServerError::unknown_scanner(id));
            }
            LeaseLookup::Missing => return Err(RegionServerError::unknown_scanner(id)),
        };
        let mut guard = session.cursor.lock();
        if session.closed.load(Ordering::Acquire) {
            return Err(RegionServerError::unknown_scanner(id));
        }
        let batch = advance(&mut guard, limit);
        drop(guard);
        self.sessions.renew(id);
        Ok(batch)
    }

    pub fn close(&self, id: u64) -> Result<(), RegionServerError> {
        match self.sessions.take(id) {
            LeaseLookup::Live(session) => {
                session.closed.store(true, Ordering::Release);
                debug!(scanner_id = id, "scanner closed");
                Ok(())
            }
            LeaseLookup::Expired(session) => {
                session.closed.store(true, Ordering::Release);
                Err(RegionServerError::unknown_scanner(id))
            }
            LeaseLookup::Missing => Err(RegionServerError::unknown_scanner(id)),
        }
    }

    pub fn sweep_expired(&self) -> usize {
        let expired = self.sessions.sweep(Instant::now());
        for (id, session) in &expired {
            session.closed.store(true, Ordering::Release);
            warn!(scanner_id = id, region = %session.region, "scanner lease expired");
        }
        expired.len()
    }

    /// Evicts every scanner of a region that is going away.
    pub fn close_region(&self, region_name: &str) -> usize {
        let evicted = self
            .sessions
            .drain_matching(|session| session.region == region_name);
        for (_, session) in &evicted {
            session.closed.store(true, Ordering::Release);
        }
        evicted.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn advance(cursor: &mut Cursor, limit: usize) -> ScanBatch {
    let Cursor {
        snapshot,
        resume,
        stop_row,
        columns,
        filter,
        returned,
        phase,
    } = cursor;
    match phase {
        Phase::Exhausted => return ScanBatch::Exhausted,
        Phase::FilterDone => return ScanBatch::FilterDone,
        Phase::Active => {}
    }

    let mut rows = Vec::new();
    let mut last_seen: Option<Vec<u8>> = None;
    let mut full = false;
    let from = resume.as_ref().map(|k| k.as_slice());
    for (key, cells) in snapshot.range(from, stop_row.as_slice()) {
        let decision = match filter {
            Some(f) => f.decide(key, cells, *returned),
            None => FilterDecision::Include,
        };
        if decision == FilterDecision::Done {
            *phase = Phase::FilterDone;
            break;
        }
        last_seen = Some(key.clone());
        if decision == FilterDecision::Skip {
            continue;
        }
        if let Some(result) = columns.project(key, cells) {
            rows.push(result);
            *returned += 1;
            if rows.len() >= limit {
                full = true;
                break;
            }
        }
    }
    if let Some(key) = last_seen {
        *resume = Bound::Excluded(key);
    }
    if !full && *phase == Phase::Active {
        *phase = Phase::Exhausted;
    }
    if !rows.is_empty() {
        return ScanBatch::Rows(rows);
    }
    match phase {
        Phase::FilterDone => ScanBatch::FilterDone,
        _ => ScanBatch::Exhausted,
    }
}
