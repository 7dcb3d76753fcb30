//! A single task's edit session with undo/redo of saved states.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use crate::error::BackendResult;
use crate::history::History;
use crate::reorder::TaskUpdater;
use crate::types::{TaskPatch, TaskSnapshot, TaskStatus, parse_day};

/// The editable fields of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDraft {
    pub title: String,
    pub status: TaskStatus,
    pub deadline: Option<NaiveDate>,
}

impl TaskDraft {
    pub fn from_snapshot(task: &TaskSnapshot) -> Self {
        Self {
            title: task.title.clone(),
            status: task.status,
            deadline: task.deadline.as_deref().and_then(parse_day),
        }
    }

    /// Full replacement patch: a missing deadline is sent as an explicit clear.
    pub fn to_patch(&self) -> TaskPatch {
        TaskPatch {
            title: Some(self.title.clone()),
            status: Some(self.status),
            deadline: Some(self.deadline.map(|day| day.format("%Y-%m-%d").to_string())),
            order: None,
        }
    }
}

/// Working copy of a task plus the history of states the store accepted.
///
/// The history only ever holds saved states: `undo` and `redo` rehydrate the
/// working fields, and a later `save` persists them.
#[derive(Debug)]
pub struct TaskEditor {
    task_id: String,
    history: History<TaskDraft>,
    working: TaskDraft,
}

impl TaskEditor {
    pub fn new(task: &TaskSnapshot) -> Self {
        let draft = TaskDraft::from_snapshot(task);
        Self {
            task_id: task.id.clone(),
            history: History::new(draft.clone()),
            working: draft,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn working(&self) -> &TaskDraft {
        &self.working
    }

    pub fn saved(&self) -> &TaskDraft {
        self.history.present()
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.working.title = title.into();
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.working.status = status;
    }

    pub fn set_deadline(&mut self, deadline: Option<NaiveDate>) {
        self.working.deadline = deadline;
    }

    pub fn is_dirty(&self) -> bool {
        self.working != *self.history.present()
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Steps back one saved state. Unsaved working edits are discarded.
    pub fn undo(&mut self) -> bool {
        let moved = self.history.undo();
        if moved {
            self.working = self.history.present().clone();
        }
        moved
    }

    pub fn redo(&mut self) -> bool {
        let moved = self.history.redo();
        if moved {
            self.working = self.history.present().clone();
        }
        moved
    }

    /// Persists the working fields. History only advances once the store
    /// accepted the write; a failed save leaves it untouched.
    pub async fn save<U: TaskUpdater>(&mut self, updater: &U) -> BackendResult<TaskSnapshot> {
        let saved = updater.update_task(&self.task_id, self.working.to_patch()).await?;
        self.history.set(self.working.clone());
        debug!(
            task_id = %self.task_id,
            undo_depth = self.history.undo_depth(),
            "task edit saved"
        );
        Ok(saved)
    }
}
