pub mod local;
pub mod wal;

use crate::error::RegionServerError;
use crate::lease::now_millis;
use crate::region::{RegionInfo, TableDescriptor};
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnKey {
    pub family: Vec<u8>,
    pub qualifier: Vec<u8>,
}

impl ColumnKey {
    pub fn new(family: impl Into<Vec<u8>>, qualifier: impl Into<Vec<u8>>) -> Self {
        Self {
            family: family.into(),
            qualifier: qualifier.into(),
        }
    }

    pub fn display(&self) -> String {
        format!(
            "{}:{}",
            String::from_utf8_lossy(&self.family),
            String::from_utf8_lossy(&self.qualifier)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub value: Vec<u8>,
    pub timestamp: u64,
}

pub type RowCells = OrdMap<ColumnKey, Cell>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowResult {
    pub row: Vec<u8>,
    pub cells: Vec<(ColumnKey, Cell)>,
}

impl RowResult {
    pub fn value(&self, family: &[u8], qualifier: &[u8]) -> Option<&[u8]> {
        self.cells
            .iter()
            .find(|(k, _)| k.family == family && k.qualifier == qualifier)
            .map(|(_, c)| c.value.as_slice())
    }
}

/// Column projection. Empty selects every column; a family with no
/// qualifiers selects the whole family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnSelection {
    families: BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>,
}

impl ColumnSelection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_family(mut self, family: impl Into<Vec<u8>>) -> Self {
        self.families.entry(family.into()).or_default();
        self
    }

    pub fn with_column(mut self, family: impl Into<Vec<u8>>, qualifier: impl Into<Vec<u8>>) -> Self {
        self.families
            .entry(family.into())
            .or_default()
            .insert(qualifier.into());
        self
    }

    pub fn is_all(&self) -> bool {
        self.families.is_empty()
    }

    pub fn families(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.families.keys()
    }

    pub fn matches(&self, column: &ColumnKey) -> bool {
        if self.families.is_empty() {
            return true;
        }
        match self.families.get(&column.family) {
            Some(qualifiers) => qualifiers.is_empty() || qualifiers.contains(&column.qualifier),
            None => false,
        }
    }

    pub fn project(&self, row: &[u8], cells: &RowCells) -> Option<RowResult> {
        let cells: Vec<(ColumnKey, Cell)> = cells
            .iter()
            .filter(|(k, _)| self.matches(k))
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect();
        if cells.is_empty() {
            return None;
        }
        Some(RowResult {
            row: row.to_vec(),
            cells,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Get {
    pub row: Vec<u8>,
    pub columns: ColumnSelection,
}

impl Get {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            columns: ColumnSelection::all(),
        }
    }

    pub fn with_columns(mut self, columns: ColumnSelection) -> Self {
        self.columns = columns;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Durability {
    #[default]
    SyncWal,
    SkipWal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Put {
    pub row: Vec<u8>,
    pub cells: Vec<(ColumnKey, Vec<u8>)>,
    pub timestamp: Option<u64>,
    pub lock_id: Option<u64>,
    pub durability: Durability,
}

impl Put {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            cells: Vec::new(),
            timestamp: None,
            lock_id: None,
            durability: Durability::default(),
        }
    }

    pub fn add(
        mut self,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        self.cells
            .push((ColumnKey::new(family, qualifier), value.into()));
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_lock(mut self, lock_id: u64) -> Self {
        self.lock_id = Some(lock_id);
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteTarget {
    Column(ColumnKey),
    Family(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    pub row: Vec<u8>,
    /// Empty deletes the whole row.
    pub targets: Vec<DeleteTarget>,
    pub lock_id: Option<u64>,
    pub durability: Durability,
}

impl Delete {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            targets: Vec::new(),
            lock_id: None,
            durability: Durability::default(),
        }
    }

    pub fn column(mut self, family: impl Into<Vec<u8>>, qualifier: impl Into<Vec<u8>>) -> Self {
        self.targets
            .push(DeleteTarget::Column(ColumnKey::new(family, qualifier)));
        self
    }

    pub fn family(mut self, family: impl Into<Vec<u8>>) -> Self {
        self.targets.push(DeleteTarget::Family(family.into()));
        self
    }

    pub fn with_lock(mut self, lock_id: u64) -> Self {
        self.lock_id = Some(lock_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowMutation {
    Put(Put),
    Delete(Delete),
}

impl RowMutation {
    pub fn row(&self) -> &[u8] {
        match self {
            RowMutation::Put(p) => &p.row,
            RowMutation::Delete(d) => &d.row,
        }
    }

    pub fn lock_id(&self) -> Option<u64> {
        match self {
            RowMutation::Put(p) => p.lock_id,
            RowMutation::Delete(d) => d.lock_id,
        }
    }

    pub fn durability(&self) -> Durability {
        match self {
            RowMutation::Put(p) => p.durability,
            RowMutation::Delete(d) => d.durability,
        }
    }

    fn push_ops(&self, now: u64, ops: &mut Vec<CellOp>) {
        match self {
            RowMutation::Put(p) => {
                let timestamp = p.timestamp.unwrap_or(now);
                for (column, value) in &p.cells {
                    ops.push(CellOp::Put {
                        column: column.clone(),
                        cell: Cell {
                            value: value.clone(),
                            timestamp,
                        },
                    });
                }
            }
            RowMutation::Delete(d) if d.targets.is_empty() => ops.push(CellOp::DeleteRow),
            RowMutation::Delete(d) => {
                for target in &d.targets {
                    ops.push(match target {
                        DeleteTarget::Column(c) => CellOp::DeleteColumn(c.clone()),
                        DeleteTarget::Family(f) => CellOp::DeleteFamily(f.clone()),
                    });
                }
            }
        }
    }
}

/// Several mutations applied to one row as a single atomic edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMutations {
    pub row: Vec<u8>,
    pub mutations: Vec<RowMutation>,
}

impl RowMutations {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            mutations: Vec::new(),
        }
    }

    pub fn add(mut self, mutation: RowMutation) -> Self {
        self.mutations.push(mutation);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellOp {
    Put { column: ColumnKey, cell: Cell },
    DeleteColumn(ColumnKey),
    DeleteFamily(Vec<u8>),
    DeleteRow,
}

/// Resolved, timestamped form of one or more mutations on a single row; the
/// unit written to the log and applied to the memstore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowEdit {
    pub row: Vec<u8>,
    pub ops: Vec<CellOp>,
}

impl RowEdit {
    pub fn from_mutation(mutation: &RowMutation) -> Self {
        let mut ops = Vec::new();
        mutation.push_ops(now_millis(), &mut ops);
        Self {
            row: mutation.row().to_vec(),
            ops,
        }
    }

    pub fn from_mutations(mutations: &RowMutations) -> Self {
        let now = now_millis();
        let mut ops = Vec::new();
        for mutation in &mutations.mutations {
            mutation.push_ops(now, &mut ops);
        }
        Self {
            row: mutations.row.clone(),
            ops,
        }
    }

    pub fn put_cell(row: &[u8], column: ColumnKey, value: Vec<u8>) -> Self {
        Self {
            row: row.to_vec(),
            ops: vec![CellOp::Put {
                column,
                cell: Cell {
                    value,
                    timestamp: now_millis(),
                },
            }],
        }
    }

    pub fn families(&self) -> impl Iterator<Item = &[u8]> {
        self.ops.iter().filter_map(|op| match op {
            CellOp::Put { column, .. } | CellOp::DeleteColumn(column) => {
                Some(column.family.as_slice())
            }
            CellOp::DeleteFamily(f) => Some(f.as_slice()),
            CellOp::DeleteRow => None,
        })
    }
}

pub fn apply_edit(rows: &mut OrdMap<Vec<u8>, RowCells>, edit: &RowEdit) {
    let mut cells = rows.get(&edit.row).cloned().unwrap_or_default();
    for op in &edit.ops {
        match op {
            CellOp::Put { column, cell } => {
                cells.insert(column.clone(), cell.clone());
            }
            CellOp::DeleteColumn(column) => {
                cells.remove(column);
            }
            CellOp::DeleteFamily(family) => {
                let doomed: Vec<ColumnKey> = cells
                    .keys()
                    .filter(|k| &k.family == family)
                    .cloned()
                    .collect();
                for column in doomed {
                    cells.remove(&column);
                }
            }
            CellOp::DeleteRow => cells = RowCells::new(),
        }
    }
    if cells.is_empty() {
        rows.remove(&edit.row);
    } else {
        rows.insert(edit.row.clone(), cells);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub start_row: Vec<u8>,
    pub end_row: Vec<u8>,
    pub count: u64,
}

/// Immutable point-in-time view of a region's rows.
#[derive(Debug, Clone, Default)]
pub struct RegionSnapshot {
    rows: OrdMap<Vec<u8>, RowCells>,
}

impl RegionSnapshot {
    pub fn new(rows: OrdMap<Vec<u8>, RowCells>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, row: &[u8]) -> Option<&RowCells> {
        self.rows.get(row)
    }

    /// Rows in `[from, stop)`; an empty `stop` is unbounded.
    pub fn range<'a>(
        &'a self,
        from: Bound<&'a [u8]>,
        stop: &'a [u8],
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a RowCells)> + 'a {
        let from = match from {
            Bound::Included(k) => Bound::Included(k.to_vec()),
            Bound::Excluded(k) => Bound::Excluded(k.to_vec()),
            Bound::Unbounded => Bound::Unbounded,
        };
        self.rows
            .range((from, Bound::Unbounded))
            .take_while(move |(k, _)| stop.is_empty() || k.as_slice() < stop)
    }

    pub fn histogram(&self, family: Option<&[u8]>, buckets: usize) -> Vec<HistogramBucket> {
        let rows: Vec<&Vec<u8>> = self
            .rows
            .iter()
            .filter(|(_, cells)| match family {
                Some(f) => cells.keys().any(|k| k.family == f),
                None => true,
            })
            .map(|(k, _)| k)
            .collect();
        if rows.is_empty() {
            return Vec::new();
        }
        let buckets = buckets.clamp(1, rows.len());
        let mut out = Vec::with_capacity(buckets);
        for i in 0..buckets {
            let lo = i * rows.len() / buckets;
            let hi = (i + 1) * rows.len() / buckets;
            if lo == hi {
                continue;
            }
            out.push(HistogramBucket {
                start_row: rows[lo].clone(),
                end_row: rows[hi - 1].clone(),
                count: (hi - lo) as u64,
            });
        }
        out
    }
}

/// One region as seen through the storage engine.
pub trait RegionStore: Send + Sync {
    fn info(&self) -> &RegionInfo;

    fn table(&self) -> &TableDescriptor;

    fn get(&self, get: &Get) -> Result<Option<RowResult>, RegionServerError>;

    fn cell(&self, row: &[u8], column: &ColumnKey) -> Result<Option<Cell>, RegionServerError>;

    /// Applies `edit` atomically with respect to readers of the same row.
    fn apply(&self, edit: &RowEdit, durability: Durability) -> Result<(), RegionServerError>;

    fn snapshot(&self) -> RegionSnapshot;

    fn flush(&self) -> Result<(), RegionServerError>;

    fn last_flush_millis(&self) -> u64;

    /// Flushes and releases the region. Closing twice is a no-op.
    fn close(&self) -> Result<(), RegionServerError>;

    fn is_closed(&self) -> bool;

    fn bulk_load(
        &self,
        path: &Path,
        family: &[u8],
        assign_seq: bool,
    ) -> Result<(), RegionServerError>;

    /// Store file names, for the given families or every family when empty.
    fn store_files(&self, families: &[Vec<u8>]) -> Result<Vec<String>, RegionServerError>;
}

pub trait StorageEngine: Send + Sync {
    fn create_region(
        &self,
        table: &TableDescriptor,
        info: &RegionInfo,
    ) -> Result<Arc<dyn RegionStore>, RegionServerError>;

    fn open_region(
        &self,
        table: &TableDescriptor,
        info: &RegionInfo,
    ) -> Result<Arc<dyn RegionStore>, RegionServerError>;
}
