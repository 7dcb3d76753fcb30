//! Moving a task one slot up or down within its list.
//!
//! A move is two independent writes: the task takes its neighbour's `order`
//! and the neighbour takes the task's. Both are issued concurrently and
//! neither is rolled back if the other fails; the next list refresh shows
//! whatever the store persisted.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};

use crate::error::{BackendError, BackendResult};
use crate::types::{TaskPatch, TaskSnapshot};

/// Anything that can apply a partial update to a single task.
pub trait TaskUpdater: Send + Sync {
    fn update_task(
        &self,
        task_id: &str,
        patch: TaskPatch,
    ) -> impl Future<Output = BackendResult<TaskSnapshot>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
}

impl MoveDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            MoveDirection::Up => "up",
            MoveDirection::Down => "down",
        }
    }
}

impl FromStr for MoveDirection {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(MoveDirection::Up),
            "down" => Ok(MoveDirection::Down),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MoveDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ReorderError {
    #[error("task {0} is not in this list")]
    TaskNotFound(String),
}

/// One write of a swap that the store rejected.
#[derive(Debug)]
pub struct FailedUpdate {
    pub task_id: String,
    pub error: BackendError,
}

#[derive(Debug)]
pub enum MoveOutcome {
    /// Already first (up) or last (down); nothing was sent.
    Unchanged,
    Swapped { task_id: String, partner_id: String },
    /// At least one of the two writes failed. Successful writes stay applied.
    PartiallyApplied {
        task_id: String,
        partner_id: String,
        failed: Vec<FailedUpdate>,
    },
}

impl MoveOutcome {
    pub fn is_complete(&self) -> bool {
        !matches!(self, MoveOutcome::PartiallyApplied { .. })
    }
}

/// Swaps `task_id` with its neighbour in `ordered_tasks` (sorted by `order`).
pub async fn move_task<U: TaskUpdater>(
    updater: &U,
    task_id: &str,
    direction: MoveDirection,
    ordered_tasks: &[TaskSnapshot],
) -> Result<MoveOutcome, ReorderError> {
    let index = ordered_tasks
        .iter()
        .position(|task| task.id == task_id)
        .ok_or_else(|| ReorderError::TaskNotFound(task_id.to_string()))?;

    let partner_index = match direction {
        MoveDirection::Up if index > 0 => index - 1,
        MoveDirection::Down if index + 1 < ordered_tasks.len() => index + 1,
        _ => return Ok(MoveOutcome::Unchanged),
    };

    let task = &ordered_tasks[index];
    let partner = &ordered_tasks[partner_index];

    let (task_result, partner_result) = tokio::join!(
        updater.update_task(&task.id, TaskPatch::order(partner.order)),
        updater.update_task(&partner.id, TaskPatch::order(task.order)),
    );

    let failed: Vec<FailedUpdate> = [(task, task_result), (partner, partner_result)]
        .into_iter()
        .filter_map(|(snapshot, result)| {
            result.err().map(|error| FailedUpdate {
                task_id: snapshot.id.clone(),
                error,
            })
        })
        .collect();

    if failed.is_empty() {
        info!(
            task_id = %task.id,
            partner_id = %partner.id,
            direction = %direction,
            "swapped task order"
        );
        return Ok(MoveOutcome::Swapped {
            task_id: task.id.clone(),
            partner_id: partner.id.clone(),
        });
    }

    for failure in &failed {
        warn!(
            task_id = %failure.task_id,
            error = %failure.error,
            direction = %direction,
            "order update failed; swap left partially applied"
        );
    }

    Ok(MoveOutcome::PartiallyApplied {
        task_id: task.id.clone(),
        partner_id: partner.id.clone(),
        failed,
    })
}
