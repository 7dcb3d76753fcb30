//! The task-list service as seen by the CLI and the watch loop.
//!
//! Two implementations exist: [`crate::api::ApiClient`] talks to the HTTP
//! service and [`crate::db::LocalBackend`] runs against a local SQLite store
//! as a fixed user. Callers receive one explicitly; there is no global client.

use std::future::Future;

use crate::error::BackendResult;
use crate::reorder::TaskUpdater;
use crate::types::{AuthUser, CollaboratorRef, NewTask, TaskListSnapshot, TaskSnapshot};

pub trait TaskBackend: TaskUpdater {
    /// The user every call acts as.
    fn current_user(&self) -> impl Future<Output = BackendResult<AuthUser>> + Send;

    /// Lists the user owns or collaborates on, with owner, collaborators and
    /// ordered tasks, most recently updated first.
    fn list_task_lists(&self) -> impl Future<Output = BackendResult<Vec<TaskListSnapshot>>> + Send;

    fn get_task_list(&self, list_id: &str) -> impl Future<Output = BackendResult<TaskListSnapshot>> + Send;

    fn create_task_list(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> impl Future<Output = BackendResult<TaskListSnapshot>> + Send;

    /// `None` fields are left unchanged.
    fn update_task_list(
        &self,
        list_id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> impl Future<Output = BackendResult<TaskListSnapshot>> + Send;

    /// Owner only. Soft-deletes the list together with its tasks.
    fn delete_task_list(&self, list_id: &str) -> impl Future<Output = BackendResult<()>> + Send;

    /// Owner only. The invitee must already have an account.
    fn invite_collaborator(
        &self,
        list_id: &str,
        email: &str,
    ) -> impl Future<Output = BackendResult<CollaboratorRef>> + Send;

    /// The list's tasks rendered as CSV.
    fn export_csv(&self, list_id: &str) -> impl Future<Output = BackendResult<String>> + Send;

    /// Appends the task after the list's current last task.
    fn create_task(&self, task: NewTask) -> impl Future<Output = BackendResult<TaskSnapshot>> + Send;

    fn delete_task(&self, task_id: &str) -> impl Future<Output = BackendResult<()>> + Send;
}
