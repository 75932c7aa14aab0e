use crate::storage::{ColumnKey, RowCells};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Include,
    Skip,
    /// No later row can pass; the scan is over for every region.
    Done,
}

/// Server-side row filters applied while a scanner walks its snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanFilter {
    Prefix(Vec<u8>),
    /// Stops after this many rows have been returned.
    PageLimit(usize),
    InclusiveStop(Vec<u8>),
    SingleColumnValue {
        family: Vec<u8>,
        qualifier: Vec<u8>,
        value: Vec<u8>,
        filter_if_missing: bool,
    },
    All(Vec<ScanFilter>),
}

impl ScanFilter {
    pub fn single_column_value(
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        ScanFilter::SingleColumnValue {
            family: family.into(),
            qualifier: qualifier.into(),
            value: value.into(),
            filter_if_missing: false,
        }
    }

    /// `returned` counts rows already handed to the client by this scanner.
    pub fn decide(&self, row: &[u8], cells: &RowCells, returned: usize) -> FilterDecision {
        match self {
            ScanFilter::Prefix(prefix) => {
                if row.starts_with(prefix) {
                    FilterDecision::Include
                } else if row > prefix.as_slice() {
                    FilterDecision::Done
                } else {
                    FilterDecision::Skip
                }
            }
            ScanFilter::PageLimit(limit) if returned >= *limit => FilterDecision::Done,
            ScanFilter::PageLimit(_) => FilterDecision::Include,
            ScanFilter::InclusiveStop(stop) if row > stop.as_slice() => FilterDecision::Done,
            ScanFilter::InclusiveStop(_) => FilterDecision::Include,
            ScanFilter::SingleColumnValue {
                family,
                qualifier,
                value,
                filter_if_missing,
            } => {
                let column = ColumnKey::new(family.clone(), qualifier.clone());
                match cells.get(&column) {
                    Some(cell) if &cell.value == value => FilterDecision::Include,
                    Some(_) => FilterDecision::Skip,
                    None if *filter_if_missing => FilterDecision::Skip,
                    None => FilterDecision::Include,
                }
            }
            ScanFilter::All(filters) => {
                let mut decision = FilterDecision::Include;
                for filter in filters {
                    match filter.decide(row, cells, returned) {
                        FilterDecision::Done => return FilterDecision::Done,
                        FilterDecision::Skip => decision = FilterDecision::Skip,
                        FilterDecision::Include => {}
                    }
                }
                decision
            }
        }
    }
}
