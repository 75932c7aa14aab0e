//! Row-atomic mutations: plain puts and deletes, check-and-mutate,
//! increments and multi-mutation row edits.
//!
//! Every mutation runs while the row is held, either by the caller's row lock
//! (validated, not re-acquired) or by a scoped guard taken for the duration
//! of the call.

use crate::error::RegionServerError;
use crate::locks::row_lock::RowLockManager;
use crate::locks::{RowExclusionTable, RowGuard};
use crate::storage::{ColumnKey, Durability, RegionStore, RowEdit, RowMutation, RowMutations};
use std::sync::Arc;
use std::time::Duration;

/// Condition for a check-and-mutate. `expected = None` passes only when the
/// cell is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellCheck {
    pub row: Vec<u8>,
    pub column: ColumnKey,
    pub expected: Option<Vec<u8>>,
}

impl CellCheck {
    pub fn equals(
        row: impl Into<Vec<u8>>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        expected: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            row: row.into(),
            column: ColumnKey::new(family, qualifier),
            expected: Some(expected.into()),
        }
    }

    pub fn absent(
        row: impl Into<Vec<u8>>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            row: row.into(),
            column: ColumnKey::new(family, qualifier),
            expected: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Increment {
    pub row: Vec<u8>,
    pub column: ColumnKey,
    pub amount: i64,
    pub durability: Durability,
    pub lock_id: Option<u64>,
}

impl Increment {
    pub fn new(
        row: impl Into<Vec<u8>>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        amount: i64,
    ) -> Self {
        Self {
            row: row.into(),
            column: ColumnKey::new(family, qualifier),
            amount,
            durability: Durability::default(),
            lock_id: None,
        }
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_lock(mut self, lock_id: u64) -> Self {
        self.lock_id = Some(lock_id);
        self
    }
}

pub struct ConditionalMutationExecutor {
    exclusion: Arc<RowExclusionTable>,
    row_locks: Arc<RowLockManager>,
    row_wait: Duration,
}

impl ConditionalMutationExecutor {
    pub fn new(
        exclusion: Arc<RowExclusionTable>,
        row_locks: Arc<RowLockManager>,
        row_wait: Duration,
    ) -> Self {
        Self {
            exclusion,
            row_locks,
            row_wait,
        }
    }

    /// Holds `row` for the caller. `None` means the caller's own row lock
    /// already holds it.
    fn enter_row(
        &self,
        store: &dyn RegionStore,
        row: &[u8],
        lock_id: Option<u64>,
    ) -> Result<Option<RowGuard<'_>>, RegionServerError> {
        let info = store.info();
        if !info.contains_row(row) {
            return Err(RegionServerError::InvalidRequest(format!(
                "row {} is outside region {info}",
                hex::encode(row)
            )));
        }
        let region = info.region_name();
        match lock_id {
            Some(id) => {
                self.row_locks.validate(&region, row, id)?;
                Ok(None)
            }
            None => self
                .exclusion
                .lock_scoped(&region, row, self.row_wait)
                .map(Some),
        }
    }

    pub fn mutate(
        &self,
        store: &dyn RegionStore,
        mutation: &RowMutation,
    ) -> Result<(), RegionServerError> {
        let _row = self.enter_row(store, mutation.row(), mutation.lock_id())?;
        store.apply(&RowEdit::from_mutation(mutation), mutation.durability())
    }

    /// Applies `mutation` only if `check` holds, atomically with respect to
    /// every other mutation of the row. Returns whether it was applied.
    pub fn check_and_mutate(
        &self,
        store: &dyn RegionStore,
        check: &CellCheck,
        mutation: &RowMutation,
    ) -> Result<bool, RegionServerError> {
        if mutation.row() != check.row.as_slice() {
            return Err(RegionServerError::InvalidRequest(format!(
                "check row {} differs from mutation row {}",
                hex::encode(&check.row),
                hex::encode(mutation.row())
            )));
        }
        let _row = self.enter_row(store, &check.row, mutation.lock_id())?;
        let current = store.cell(&check.row, &check.column)?;
        let passed = match (&check.expected, current) {
            (None, None) => true,
            (Some(expected), Some(cell)) => &cell.value == expected,
            _ => false,
        };
        if !passed {
            return Ok(false);
        }
        store.apply(&RowEdit::from_mutation(mutation), mutation.durability())?;
        Ok(true)
    }

    /// Adds `amount` to an 8-byte big-endian counter; an absent cell counts
    /// as zero. Returns the new value.
    pub fn increment_column_value(
        &self,
        store: &dyn RegionStore,
        increment: &Increment,
    ) -> Result<i64, RegionServerError> {
        let _row = self.enter_row(store, &increment.row, increment.lock_id)?;
        let current = match store.cell(&increment.row, &increment.column)? {
            None => 0,
            Some(cell) => {
                let bytes: [u8; 8] = cell.value.as_slice().try_into().map_err(|_| {
                    RegionServerError::TypeMismatch {
                        row: hex::encode(&increment.row),
                        column: increment.column.display(),
                        expected: 8,
                        actual: cell.value.len(),
                    }
                })?;
                i64::from_be_bytes(bytes)
            }
        };
        let next = current.checked_add(increment.amount).ok_or_else(|| {
            RegionServerError::InvalidRequest(format!(
                "increment of {} by {} overflows",
                increment.column.display(),
                increment.amount
            ))
        })?;
        let edit = RowEdit::put_cell(
            &increment.row,
            increment.column.clone(),
            next.to_be_bytes().to_vec(),
        );
        store.apply(&edit, increment.durability)?;
        Ok(next)
    }

    /// Applies every mutation in `mutations` as one edit.
    pub fn mutate_row(
        &self,
        store: &dyn RegionStore,
        mutations: &RowMutations,
    ) -> Result<(), RegionServerError> {
        if mutations.mutations.is_empty() {
            return Err(RegionServerError::InvalidRequest(
                "mutate_row needs at least one mutation".into(),
            ));
        }
        if let Some(stray) = mutations
            .mutations
            .iter()
            .find(|m| m.row() != mutations.row.as_slice())
        {
            return Err(RegionServerError::InvalidRequest(format!(
                "mutation row {} differs from row {}",
                hex::encode(stray.row()),
                hex::encode(&mutations.row)
            )));
        }
        let mut lock_id = None;
        for id in mutations.mutations.iter().filter_map(RowMutation::lock_id) {
            if lock_id.is_some_and(|held| held != id) {
                return Err(RegionServerError::InvalidRequest(
                    "mutations carry different row locks".into(),
                ));
            }
            lock_id = Some(id);
        }
        let durability = if mutations
            .mutations
            .iter()
            .all(|m| m.durability() == Durability::SkipWal)
        {
            Durability::SkipWal
        } else {
            Durability::SyncWal
        };
        let _row = self.enter_row(store, &mutations.row, lock_id)?;
        store.apply(&RowEdit::from_mutations(mutations), durability)
    }
}

#[cfg(test)]
mod tests {
    use super::{CellCheck, ConditionalMutationExecutor, Increment};
    use crate::error::RegionServerError;
    use crate::lease::IdAllocator;
    use crate::locks::RowExclusionTable;
    use crate::locks::row_lock::RowLockManager;
    use crate::region::{RegionInfo, TableDescriptor};
    use crate::storage::local::LocalStorageEngine;
    use crate::storage::{
        Delete, Get, Put, RegionStore, RowEdit, RowMutation, RowMutations, StorageEngine,
    };
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        store: Arc<dyn RegionStore>,
        locks: Arc<RowLockManager>,
        exec: Arc<ConditionalMutationExecutor>,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().expect("tempdir");
        let engine = LocalStorageEngine::new(dir.path())
            .expect("engine")
            .with_wal_sync(false);
        let table = TableDescriptor::new("t").with_family("d");
        let info = RegionInfo::new("t", Vec::new(), Vec::new(), 1);
        let store = engine.create_region(&table, &info).expect("region");
        let exclusion = Arc::new(RowExclusionTable::new(8));
        let locks = Arc::new(RowLockManager::new(
            Arc::new(IdAllocator::new(1_700_000_000_000)),
            Arc::clone(&exclusion),
            4,
            Duration::from_secs(60),
        ));
        let exec = Arc::new(ConditionalMutationExecutor::new(
            exclusion,
            Arc::clone(&locks),
            Duration::from_millis(50),
        ));
        Fixture {
            _dir: dir,
            store,
            locks,
            exec,
        }
    }

    fn value(store: &dyn RegionStore, row: &str) -> Option<Vec<u8>> {
        store
            .get(&Get::new(row))
            .expect("get")
            .and_then(|r| r.value(b"d", b"q").map(<[u8]>::to_vec))
    }

    #[test]
    fn check_and_put_only_applies_on_match() {
        let f = fixture();
        let put = RowMutation::Put(Put::new("r").add("d", "q", "v1"));
        assert!(f
            .exec
            .check_and_mutate(f.store.as_ref(), &CellCheck::absent("r", "d", "q"), &put)
            .expect("absent check"));
        assert!(!f
            .exec
            .check_and_mutate(f.store.as_ref(), &CellCheck::absent("r", "d", "q"), &put)
            .expect("now present"));

        let swap = RowMutation::Put(Put::new("r").add("d", "q", "v2"));
        assert!(!f
            .exec
            .check_and_mutate(f.store.as_ref(), &CellCheck::equals("r", "d", "q", "nope"), &swap)
            .expect("mismatch"));
        assert!(f
            .exec
            .check_and_mutate(f.store.as_ref(), &CellCheck::equals("r", "d", "q", "v1"), &swap)
            .expect("match"));
        assert_eq!(value(f.store.as_ref(), "r"), Some(b"v2".to_vec()));

        let del = RowMutation::Delete(Delete::new("r"));
        assert!(f
            .exec
            .check_and_mutate(f.store.as_ref(), &CellCheck::equals("r", "d", "q", "v2"), &del)
            .expect("delete"));
        assert_eq!(value(f.store.as_ref(), "r"), None);
    }

    #[test]
    fn check_row_must_match_mutation_row() {
        let f = fixture();
        let put = RowMutation::Put(Put::new("other").add("d", "q", "v"));
        let err = f
            .exec
            .check_and_mutate(f.store.as_ref(), &CellCheck::absent("r", "d", "q"), &put)
            .expect_err("row mismatch");
        assert!(matches!(err, RegionServerError::InvalidRequest(_)));
    }

    #[test]
    fn concurrent_absent_checks_let_exactly_one_writer_win() {
        let f = fixture();
        let mut handles = Vec::new();
        for i in 0..16 {
            let exec = Arc::clone(&f.exec);
            let store = Arc::clone(&f.store);
            handles.push(thread::spawn(move || {
                let put = RowMutation::Put(Put::new("race").add("d", "q", format!("w{i}")));
                exec.check_and_mutate(store.as_ref(), &CellCheck::absent("race", "d", "q"), &put)
            }));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("join").expect("check"))
            .filter(|applied| *applied)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn increments_are_serialised_and_reject_bad_encodings() {
        let f = fixture();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let exec = Arc::clone(&f.exec);
            let store = Arc::clone(&f.store);
            handles.push(thread::spawn(move || {
                for _ in 0..25 {
                    exec.increment_column_value(store.as_ref(), &Increment::new("c", "d", "n", 1))
                        .expect("increment");
                }
            }));
        }
        for h in handles {
            h.join().expect("join");
        }
        let total = f
            .exec
            .increment_column_value(f.store.as_ref(), &Increment::new("c", "d", "n", 0))
            .expect("read");
        assert_eq!(total, 200);

        f.store
            .apply(
                &RowEdit::from_mutation(&RowMutation::Put(Put::new("s").add("d", "q", "abc"))),
                Default::default(),
            )
            .expect("seed");
        let err = f
            .exec
            .increment_column_value(f.store.as_ref(), &Increment::new("s", "d", "q", 1))
            .expect_err("three bytes");
        assert!(matches!(
            err,
            RegionServerError::TypeMismatch {
                expected: 8,
                actual: 3,
                ..
            }
        ));

        f.exec
            .increment_column_value(f.store.as_ref(), &Increment::new("o", "d", "q", i64::MAX))
            .expect("max");
        let err = f
            .exec
            .increment_column_value(f.store.as_ref(), &Increment::new("o", "d", "q", 1))
            .expect_err("overflow");
        assert!(matches!(err, RegionServerError::InvalidRequest(_)));
    }

    #[test]
    fn client_lock_blocks_unlocked_writers_but_admits_its_holder() {
        let f = fixture();
        let region = f.store.info().region_name();
        let lock = f.locks.acquire(&region, b"r").expect("lock");

        let put = RowMutation::Put(Put::new("r").add("d", "q", "x"));
        let err = f.exec.mutate(f.store.as_ref(), &put).expect_err("busy");
        assert!(matches!(err, RegionServerError::RowBusy { .. }));

        let locked = RowMutation::Put(Put::new("r").add("d", "q", "y").with_lock(lock));
        f.exec.mutate(f.store.as_ref(), &locked).expect("holder writes");
        assert_eq!(value(f.store.as_ref(), "r"), Some(b"y".to_vec()));

        f.locks.release(&region, lock).expect("release");
        f.exec.mutate(f.store.as_ref(), &put).expect("free again");
    }

    #[test]
    fn mutate_row_applies_puts_and_deletes_together() {
        let f = fixture();
        let seed = RowMutation::Put(Put::new("r").add("d", "old", "1"));
        f.exec.mutate(f.store.as_ref(), &seed).expect("seed");
        let batch = RowMutations::new("r")
            .add(RowMutation::Put(Put::new("r").add("d", "q", "new")))
            .add(RowMutation::Delete(Delete::new("r").column("d", "old")));
        f.exec.mutate_row(f.store.as_ref(), &batch).expect("mutate row");
        let row = f.store.get(&Get::new("r")).expect("get").expect("row");
        assert_eq!(row.cells.len(), 1);
        assert_eq!(row.value(b"d", b"q"), Some(&b"new"[..]));

        let stray = RowMutations::new("r").add(RowMutation::Put(Put::new("x").add("d", "q", "1")));
        assert!(matches!(
            f.exec.mutate_row(f.store.as_ref(), &stray),
            Err(RegionServerError::InvalidRequest(_))
        ));
    }
}
