//! Heterogeneous batch requests fanned out across regions.
//!
//! Items are grouped by region and each group runs on a blocking task.
//! One item's failure never affects another item's slot.

use crate::error::RegionServerError;
use crate::mutation::{CellCheck, Increment};
use crate::storage::{Delete, Get, Put, RowMutations, RowResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOp {
    Get(Get),
    Exists(Get),
    Put(Put),
    Delete(Delete),
    CheckAndPut { check: CellCheck, put: Put },
    CheckAndDelete { check: CellCheck, delete: Delete },
    Increment(Increment),
    MutateRow(RowMutations),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub region: String,
    pub op: ActionOp,
}

impl Action {
    pub fn new(region: impl Into<String>, op: ActionOp) -> Self {
        Self {
            region: region.into(),
            op,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    Row(Option<RowResult>),
    Exists(bool),
    Applied,
    Checked(bool),
    Counter(i64),
}

/// One slot per submitted action, in submission order.
#[derive(Debug)]
pub struct MultiResponse {
    results: Vec<Result<ActionResult, RegionServerError>>,
}

impl MultiResponse {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Result<ActionResult, RegionServerError>> {
        self.results.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Result<ActionResult, RegionServerError>> {
        self.results.iter()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_err()).count()
    }

    pub fn into_results(self) -> Vec<Result<ActionResult, RegionServerError>> {
        self.results
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiPut {
    pub regions: BTreeMap<String, Vec<Put>>,
}

impl MultiPut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, region: impl Into<String>, put: Put) -> Self {
        self.regions.entry(region.into()).or_default().push(put);
        self
    }
}

/// Per region: `Ok(-1)` when every put applied, `Ok(n)` when `n` puts failed,
/// `Err` when the region could not be reached at all.
#[derive(Debug, Default)]
pub struct MultiPutResponse {
    pub answers: BTreeMap<String, Result<i32, RegionServerError>>,
}

impl MultiPutResponse {
    pub fn answer(&self, region: &str) -> Option<&Result<i32, RegionServerError>> {
        self.answers.get(region)
    }
}

/// Executes single items on behalf of the coordinator.
pub trait ActionTarget: Send + Sync + 'static {
    fn execute_action(&self, region: &str, op: &ActionOp) -> Result<ActionResult, RegionServerError>;

    fn apply_puts(&self, region: &str, puts: &[Put]) -> Result<i32, RegionServerError>;
}

fn panic_error(what: &str, err: tokio::task::JoinError) -> RegionServerError {
    error!(task = what, error = %err, "batch task failed");
    RegionServerError::Io(std::io::Error::other(format!("{what} task failed: {err}")))
}

/// Runs one item so that a panic becomes that item's own error.
fn isolated<F>(index: usize, run: F) -> Result<ActionResult, RegionServerError>
where
    F: FnOnce() -> Result<ActionResult, RegionServerError>,
{
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(run)).unwrap_or_else(|_| {
        error!(action = index, "multi action item panicked");
        Err(RegionServerError::Io(std::io::Error::other(format!(
            "action {index} panicked"
        ))))
    })
}

pub struct BatchRequestCoordinator;

impl BatchRequestCoordinator {
    pub async fn multi_action<T: ActionTarget>(target: Arc<T>, actions: Vec<Action>) -> MultiResponse {
        let total = actions.len();
        let mut groups: BTreeMap<String, Vec<(usize, ActionOp)>> = BTreeMap::new();
        for (index, action) in actions.into_iter().enumerate() {
            groups
                .entry(action.region)
                .or_default()
                .push((index, action.op));
        }
        debug!(actions = total, regions = groups.len(), "multi action");

        let mut tasks = Vec::with_capacity(groups.len());
        for (region, items) in groups {
            let indices: Vec<usize> = items.iter().map(|(i, _)| *i).collect();
            let target = Arc::clone(&target);
            let handle = tokio::task::spawn_blocking(move || {
                items
                    .into_iter()
                    .map(|(index, op)| {
                        (index, isolated(index, || target.execute_action(&region, &op)))
                    })
                    .collect::<Vec<_>>()
            });
            tasks.push((indices, handle));
        }

        let mut slots: Vec<Option<Result<ActionResult, RegionServerError>>> =
            (0..total).map(|_| None).collect();
        for (indices, handle) in tasks {
            match handle.await {
                Ok(results) => {
                    for (index, result) in results {
                        slots[index] = Some(result);
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    error!(error = %message, "multi action group failed");
                    for index in indices {
                        slots[index] = Some(Err(RegionServerError::Io(std::io::Error::other(
                            format!("multi action task failed: {message}"),
                        ))));
                    }
                }
            }
        }
        MultiResponse {
            results: slots
                .into_iter()
                .map(|slot| {
                    slot.unwrap_or_else(|| {
                        Err(RegionServerError::Io(std::io::Error::other(
                            "multi action produced no result",
                        )))
                    })
                })
                .collect(),
        }
    }

    pub async fn multi_put<T: ActionTarget>(target: Arc<T>, multi: MultiPut) -> MultiPutResponse {
        let mut tasks = Vec::with_capacity(multi.regions.len());
        for (region, puts) in multi.regions {
            let target = Arc::clone(&target);
            let name = region.clone();
            let handle = tokio::task::spawn_blocking(move || {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    target.apply_puts(&name, &puts)
                }))
                .unwrap_or_else(|_| {
                    error!(region = %name, "multi put panicked");
                    Err(RegionServerError::Io(std::io::Error::other(format!(
                        "multi put on {name} panicked"
                    ))))
                })
            });
            tasks.push((region, handle));
        }
        let mut response = MultiPutResponse::default();
        for (region, handle) in tasks {
            let answer = match handle.await {
                Ok(answer) => answer,
                Err(err) => Err(panic_error("multi put", err)),
            };
            response.answers.insert(region, answer);
        }
        response
    }
}
