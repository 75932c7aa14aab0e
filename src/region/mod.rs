pub mod lifecycle;
pub mod pool;

use crate::error::RegionServerError;
use crate::lease::now_millis;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub families: Vec<Vec<u8>>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            families: Vec::new(),
        }
    }

    pub fn with_family(mut self, family: impl Into<Vec<u8>>) -> Self {
        self.families.push(family.into());
        self
    }

    pub fn has_family(&self, family: &[u8]) -> bool {
        self.families.iter().any(|f| f.as_slice() == family)
    }
}

/// Identity of one region. An empty start or end key is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionInfo {
    pub table: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub region_id: u64,
}

impl RegionInfo {
    pub fn new(
        table: impl Into<String>,
        start_key: impl Into<Vec<u8>>,
        end_key: impl Into<Vec<u8>>,
        region_id: u64,
    ) -> Self {
        Self {
            table: table.into(),
            start_key: start_key.into(),
            end_key: end_key.into(),
            region_id,
        }
    }

    /// `<table>,<hex start key>,<region id>`
    pub fn region_name(&self) -> String {
        format!(
            "{},{},{}",
            self.table,
            hex::encode(&self.start_key),
            self.region_id
        )
    }

    /// Stable short hash of the region name, used as the directory name.
    pub fn encoded_name(&self) -> String {
        let digest = blake3::hash(self.region_name().as_bytes());
        digest.to_hex()[..16].to_string()
    }

    pub fn contains_row(&self, row: &[u8]) -> bool {
        row >= self.start_key.as_slice()
            && (self.end_key.is_empty() || row < self.end_key.as_slice())
    }

    pub fn is_first(&self) -> bool {
        self.start_key.is_empty()
    }

    pub fn is_last(&self) -> bool {
        self.end_key.is_empty()
    }
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.region_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Opening,
    Online,
    Closing,
    Closed,
}

/// Splits a table's keyspace at `split_keys`, producing `split_keys.len() + 1`
/// contiguous regions that share one creation-epoch region id.
pub fn derive_region_boundaries(
    table: &TableDescriptor,
    split_keys: &[Vec<u8>],
) -> Result<Vec<RegionInfo>, RegionServerError> {
    derive_region_boundaries_at(table, split_keys, now_millis())
}

pub fn derive_region_boundaries_at(
    table: &TableDescriptor,
    split_keys: &[Vec<u8>],
    region_id: u64,
) -> Result<Vec<RegionInfo>, RegionServerError> {
    if split_keys.iter().any(|k| k.is_empty()) {
        return Err(RegionServerError::InvalidRequest(
            "split keys must not be empty".into(),
        ));
    }
    if split_keys.windows(2).any(|w| w[0] >= w[1]) {
        return Err(RegionServerError::InvalidRequest(
            "split keys must be strictly increasing".into(),
        ));
    }
    let mut regions = Vec::with_capacity(split_keys.len() + 1);
    let mut start_key = Vec::new();
    for i in 0..=split_keys.len() {
        let end_key = split_keys.get(i).cloned().unwrap_or_default();
        regions.push(RegionInfo::new(
            table.name.clone(),
            start_key,
            end_key.clone(),
            region_id,
        ));
        start_key = end_key;
    }
    Ok(regions)
}
