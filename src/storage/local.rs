//! Directory-backed storage engine.
//!
//! Layout under the engine root:
//!
//! ```text
//! <table>/<encoded region name>/.regioninfo        json, written atomically
//! <table>/<encoded region name>/wal.log            framed row edits
//! <table>/<encoded region name>/<family hex>/*.sf  msgpack store files
//! ```
//!
//! All rows are held in memory; store files are full per-family images
//! written on flush, and the log only holds edits newer than the last flush.

use crate::error::RegionServerError;
use crate::lease::now_millis;
use crate::region::{RegionInfo, TableDescriptor};
use crate::storage::wal::{RegionWal, replay};
use crate::storage::{
    Cell, CellOp, ColumnKey, Durability, Get, RegionSnapshot, RegionStore, RowCells, RowEdit,
    RowResult, StorageEngine, apply_edit,
};
use im::OrdMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tempfile::NamedTempFile;
use tracing::{debug, info};

pub const REGION_INFO_FILE: &str = ".regioninfo";
pub const WAL_FILE: &str = "wal.log";
const STORE_FILE_EXT: &str = "sf";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegionInfoFile {
    table: TableDescriptor,
    region: RegionInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCell {
    pub row: Vec<u8>,
    pub qualifier: Vec<u8>,
    pub cell: Cell,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFile {
    pub family: Vec<u8>,
    pub max_seq: u64,
    pub cells: Vec<StoreCell>,
}

pub fn write_store_file(path: &Path, file: &StoreFile) -> Result<(), RegionServerError> {
    let dir = path
        .parent()
        .ok_or_else(|| RegionServerError::InvalidRequest("store file path has no parent".into()))?;
    fs::create_dir_all(dir)?;
    let bytes = rmp_serde::to_vec(file).map_err(|e| RegionServerError::Encode(e.to_string()))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| RegionServerError::Io(e.error))?;
    Ok(())
}

pub fn read_store_file(path: &Path) -> Result<StoreFile, RegionServerError> {
    let bytes = fs::read(path)?;
    rmp_serde::from_slice(&bytes).map_err(|e| RegionServerError::Decode(e.to_string()))
}

/// Builds a store file outside any region, in the format `bulk_load` accepts.
pub fn write_bulk_file(
    path: &Path,
    family: &[u8],
    cells: &[(Vec<u8>, Vec<u8>, Vec<u8>)],
) -> Result<(), RegionServerError> {
    let timestamp = now_millis();
    let file = StoreFile {
        family: family.to_vec(),
        max_seq: 0,
        cells: cells
            .iter()
            .map(|(row, qualifier, value)| StoreCell {
                row: row.clone(),
                qualifier: qualifier.clone(),
                cell: Cell {
                    value: value.clone(),
                    timestamp,
                },
            })
            .collect(),
    };
    write_store_file(path, &file)
}

pub struct LocalStorageEngine {
    root: PathBuf,
    sync_wal: bool,
}

impl LocalStorageEngine {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, RegionServerError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            sync_wal: true,
        })
    }

    pub fn with_wal_sync(mut self, sync_wal: bool) -> Self {
        self.sync_wal = sync_wal;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn region_dir(&self, info: &RegionInfo) -> PathBuf {
        self.root.join(&info.table).join(info.encoded_name())
    }
}

impl StorageEngine for LocalStorageEngine {
    fn create_region(
        &self,
        table: &TableDescriptor,
        info: &RegionInfo,
    ) -> Result<Arc<dyn RegionStore>, RegionServerError> {
        if table.families.is_empty() {
            return Err(RegionServerError::InvalidRequest(format!(
                "table '{}' has no column families",
                table.name
            )));
        }
        if table.name != info.table {
            return Err(RegionServerError::InvalidRequest(format!(
                "region {info} does not belong to table '{}'",
                table.name
            )));
        }
        let dir = self.region_dir(info);
        if dir.join(REGION_INFO_FILE).exists() {
            return Err(RegionServerError::InvalidRequest(format!(
                "region {info} already exists"
            )));
        }
        fs::create_dir_all(&dir)?;
        for family in &table.families {
            fs::create_dir_all(dir.join(hex::encode(family)))?;
        }
        let header = RegionInfoFile {
            table: table.clone(),
            region: info.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&header)
            .map_err(|e| RegionServerError::Encode(e.to_string()))?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(REGION_INFO_FILE))
            .map_err(|e| RegionServerError::Io(e.error))?;
        debug!(region = %info, dir = %dir.display(), "created region directory");
        let region = LocalRegion::load(dir, table.clone(), info.clone(), self.sync_wal)?;
        Ok(Arc::new(region))
    }

    fn open_region(
        &self,
        table: &TableDescriptor,
        info: &RegionInfo,
    ) -> Result<Arc<dyn RegionStore>, RegionServerError> {
        let dir = self.region_dir(info);
        let header_path = dir.join(REGION_INFO_FILE);
        if !header_path.exists() {
            return Err(RegionServerError::InvalidRequest(format!(
                "region {info} has no directory under {}",
                self.root.display()
            )));
        }
        let header: RegionInfoFile = serde_json::from_slice(&fs::read(&header_path)?)
            .map_err(|e| RegionServerError::Decode(e.to_string()))?;
        if &header.region != info {
            return Err(RegionServerError::Corruption(format!(
                "region directory for {info} describes {}",
                header.region
            )));
        }
        let region = LocalRegion::load(dir, table.clone(), info.clone(), self.sync_wal)?;
        Ok(Arc::new(region))
    }
}

struct WriteState {
    wal: Option<RegionWal>,
    next_seq: u64,
    unflushed: usize,
}

pub struct LocalRegion {
    info: RegionInfo,
    table: TableDescriptor,
    dir: PathBuf,
    rows: RwLock<OrdMap<Vec<u8>, RowCells>>,
    write: Mutex<WriteState>,
    last_flush_ms: AtomicU64,
    closed: AtomicBool,
}

impl LocalRegion {
    fn load(
        dir: PathBuf,
        table: TableDescriptor,
        info: RegionInfo,
        sync_wal: bool,
    ) -> Result<Self, RegionServerError> {
        let mut rows = OrdMap::new();
        let mut max_seq = 0u64;
        for family in &table.families {
            for name in list_store_files(&dir.join(hex::encode(family)))? {
                let file = read_store_file(&dir.join(hex::encode(family)).join(&name))?;
                max_seq = max_seq.max(file.max_seq);
                for cell in file.cells {
                    merge_cell(&mut rows, family, cell, true);
                }
            }
        }
        let wal_path = dir.join(WAL_FILE);
        let replayed = replay(&wal_path)?;
        let unflushed = replayed.len();
        for (seq, edit) in &replayed {
            max_seq = max_seq.max(*seq);
            apply_edit(&mut rows, edit);
        }
        if unflushed > 0 {
            info!(region = %info, edits = unflushed, "replayed region wal");
        }
        let wal = RegionWal::open(&wal_path, sync_wal)?;
        Ok(Self {
            info,
            table,
            dir,
            rows: RwLock::new(rows),
            write: Mutex::new(WriteState {
                wal: Some(wal),
                next_seq: max_seq + 1,
                unflushed,
            }),
            last_flush_ms: AtomicU64::new(now_millis()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), RegionServerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegionServerError::not_serving(self.info.region_name()));
        }
        Ok(())
    }

    fn family_dir(&self, family: &[u8]) -> PathBuf {
        self.dir.join(hex::encode(family))
    }

    fn check_family(&self, family: &[u8]) -> Result<(), RegionServerError> {
        if self.table.has_family(family) {
            return Ok(());
        }
        Err(RegionServerError::InvalidRequest(format!(
            "unknown column family '{}' in table '{}'",
            String::from_utf8_lossy(family),
            self.table.name
        )))
    }

    fn flush_locked(&self, state: &mut WriteState) -> Result<(), RegionServerError> {
        let Some(wal) = state.wal.as_mut() else {
            return Err(RegionServerError::not_serving(self.info.region_name()));
        };
        if state.unflushed == 0 {
            self.last_flush_ms.store(now_millis(), Ordering::Release);
            return Ok(());
        }
        let rows = self.rows.read().clone();
        let seq = state.next_seq;
        state.next_seq += 1;
        let file_name = format!("{seq:020}.{STORE_FILE_EXT}");
        for family in &self.table.families {
            let mut cells = Vec::new();
            for (row, row_cells) in rows.iter() {
                for (column, cell) in row_cells.iter() {
                    if &column.family == family {
                        cells.push(StoreCell {
                            row: row.clone(),
                            qualifier: column.qualifier.clone(),
                            cell: cell.clone(),
                        });
                    }
                }
            }
            let family_dir = self.family_dir(family);
            let image = StoreFile {
                family: family.clone(),
                max_seq: seq,
                cells,
            };
            write_store_file(&family_dir.join(&file_name), &image)?;
            for old in list_store_files(&family_dir)? {
                if old != file_name {
                    fs::remove_file(family_dir.join(old))?;
                }
            }
        }
        wal.reset()?;
        let edits = std::mem::take(&mut state.unflushed);
        self.last_flush_ms.store(now_millis(), Ordering::Release);
        debug!(region = %self.info, seq, edits, "flushed region");
        Ok(())
    }
}

impl RegionStore for LocalRegion {
    fn info(&self) -> &RegionInfo {
        &self.info
    }

    fn table(&self) -> &TableDescriptor {
        &self.table
    }

    fn get(&self, get: &Get) -> Result<Option<RowResult>, RegionServerError> {
        self.ensure_open()?;
        let rows = self.rows.read();
        Ok(rows
            .get(&get.row)
            .and_then(|cells| get.columns.project(&get.row, cells)))
    }

    fn cell(&self, row: &[u8], column: &ColumnKey) -> Result<Option<Cell>, RegionServerError> {
        self.ensure_open()?;
        let rows = self.rows.read();
        Ok(rows.get(row).and_then(|cells| cells.get(column).cloned()))
    }

    fn apply(&self, edit: &RowEdit, durability: Durability) -> Result<(), RegionServerError> {
        self.ensure_open()?;
        if !self.info.contains_row(&edit.row) {
            return Err(RegionServerError::InvalidRequest(format!(
                "row {} is outside region {}",
                hex::encode(&edit.row),
                self.info
            )));
        }
        for family in edit.families() {
            self.check_family(family)?;
        }
        let mut state = self.write.lock();
        let seq = state.next_seq;
        let Some(wal) = state.wal.as_mut() else {
            return Err(RegionServerError::not_serving(self.info.region_name()));
        };
        if durability == Durability::SyncWal {
            wal.append(seq, now_millis(), edit)?;
        }
        state.next_seq += 1;
        apply_edit(&mut self.rows.write(), edit);
        state.unflushed += 1;
        Ok(())
    }

    fn snapshot(&self) -> RegionSnapshot {
        RegionSnapshot::new(self.rows.read().clone())
    }

    fn flush(&self) -> Result<(), RegionServerError> {
        self.ensure_open()?;
        let mut state = self.write.lock();
        self.flush_locked(&mut state)
    }

    fn last_flush_millis(&self) -> u64 {
        self.last_flush_ms.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<(), RegionServerError> {
        let mut state = self.write.lock();
        if state.wal.is_none() {
            return Ok(());
        }
        self.flush_locked(&mut state)?;
        if let Some(mut wal) = state.wal.take() {
            wal.sync()?;
        }
        self.closed.store(true, Ordering::Release);
        debug!(region = %self.info, "closed region");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn bulk_load(
        &self,
        path: &Path,
        family: &[u8],
        assign_seq: bool,
    ) -> Result<(), RegionServerError> {
        self.ensure_open()?;
        self.check_family(family)?;
        if !path.is_file() {
            return Err(RegionServerError::InvalidRequest(format!(
                "bulk load file {} not found",
                path.display()
            )));
        }
        let file = read_store_file(path)?;
        if file.family != family {
            return Err(RegionServerError::InvalidRequest(format!(
                "bulk load file {} holds family '{}', not '{}'",
                path.display(),
                String::from_utf8_lossy(&file.family),
                String::from_utf8_lossy(family)
            )));
        }
        if let Some(outside) = file.cells.iter().find(|c| !self.info.contains_row(&c.row)) {
            return Err(RegionServerError::InvalidRequest(format!(
                "bulk load row {} is outside region {}",
                hex::encode(&outside.row),
                self.info
            )));
        }

        let mut state = self.write.lock();
        if state.wal.is_none() {
            return Err(RegionServerError::not_serving(self.info.region_name()));
        }
        let seq = if assign_seq {
            let seq = state.next_seq;
            state.next_seq += 1;
            seq
        } else {
            0
        };
        let target = self
            .family_dir(family)
            .join(format!("{seq:020}-bulk-{}.{STORE_FILE_EXT}", now_millis()));
        let imported = StoreFile {
            max_seq: seq,
            ..file
        };
        write_store_file(&target, &imported)?;
        {
            let mut rows = self.rows.write();
            for cell in imported.cells {
                merge_cell(&mut rows, family, cell, assign_seq);
            }
        }
        state.unflushed += 1;
        info!(region = %self.info, file = %target.display(), assign_seq, "bulk loaded store file");
        Ok(())
    }

    fn store_files(&self, families: &[Vec<u8>]) -> Result<Vec<String>, RegionServerError> {
        self.ensure_open()?;
        let selected: Vec<&Vec<u8>> = if families.is_empty() {
            self.table.families.iter().collect()
        } else {
            for family in families {
                self.check_family(family)?;
            }
            families.iter().collect()
        };
        let mut out = Vec::new();
        for family in selected {
            let family_hex = hex::encode(family);
            for name in list_store_files(&self.family_dir(family))? {
                out.push(format!("{family_hex}/{name}"));
            }
        }
        Ok(out)
    }
}

fn merge_cell(rows: &mut OrdMap<Vec<u8>, RowCells>, family: &[u8], cell: StoreCell, force: bool) {
    let column = ColumnKey::new(family, cell.qualifier);
    let newer = rows
        .get(&cell.row)
        .and_then(|cells| cells.get(&column))
        .is_none_or(|existing| existing.timestamp <= cell.cell.timestamp);
    if force || newer {
        let edit = RowEdit {
            row: cell.row,
            ops: vec![CellOp::Put {
                column,
                cell: cell.cell,
            }],
        };
        apply_edit(rows, &edit);
    }
}

fn list_store_files(dir: &Path) -> Result<Vec<String>, RegionServerError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(STORE_FILE_EXT) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
