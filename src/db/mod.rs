use std::{fs, path::Path, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::backend::TaskBackend;
use crate::error::{BackendError, BackendResult};
use crate::export::render_csv;
use crate::reorder::TaskUpdater;
use crate::types::{
    AuthUser, CollaboratorRef, NewTask, TaskListSnapshot, TaskPatch, TaskSnapshot, TaskStatus,
    UserRef, parse_day,
};

const LIST_COLUMNS: &str =
    "l.id, l.name, l.description, l.owner_id, l.created_at, l.updated_at, l.updated_by";
const TASK_COLUMNS: &str =
    "id, title, status, deadline, position, task_list_id, created_by_id, created_at, updated_at";

/// SQLite-backed store for users, task lists, collaborators and tasks.
///
/// Every list and task operation takes the acting user's id and enforces the
/// sharing rules: members (owner or collaborator) may read a list, rename it
/// and manage its tasks; only the owner may delete it or invite.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let in_memory = path_ref == Path::new(":memory:");

        if !in_memory && let Some(parent) = path_ref.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create parent directories for {}",
                    path_ref.display()
                )
            })?;
        }

        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(path_ref)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5))
        }
        .foreign_keys(true);

        // An in-memory database lives and dies with its single connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open sqlite db at {}", path_ref.display()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn create_user(&self, email: &str, name: Option<&str>) -> BackendResult<UserRef> {
        let email = email.trim();
        if email.is_empty() {
            return Err(BackendError::Validation("Email is required".to_string()));
        }
        if self.find_user_by_email(email).await?.is_some() {
            return Err(BackendError::Conflict("Email already registered".to_string()));
        }

        let user = UserRef {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            name: name.map(str::trim).filter(|name| !name.is_empty()).map(str::to_string),
        };

        sqlx::query("INSERT INTO users (id, email, name, created_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(&user.id)
            .bind(&user.email)
            .bind(&user.name)
            .bind(now_iso())
            .execute(&self.pool)
            .await?;

        debug!(user_id = %user.id, "created local user");
        Ok(user)
    }

    pub async fn find_user_by_email(&self, email: &str) -> BackendResult<Option<UserRef>> {
        let row = sqlx::query("SELECT id, email, name FROM users WHERE email = ?1")
            .bind(email.trim())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_user_row).transpose().map_err(Into::into)
    }

    pub async fn list_users(&self) -> BackendResult<Vec<UserRef>> {
        let rows = sqlx::query("SELECT id, email, name FROM users ORDER BY created_at ASC, email ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(map_user_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }

    async fn get_user(&self, user_id: &str) -> BackendResult<UserRef> {
        let row = sqlx::query("SELECT id, email, name FROM users WHERE id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("user {user_id}")))?;
        Ok(map_user_row(&row)?)
    }

    /// Lists the user can access, most recently updated first.
    pub async fn list_task_lists(&self, user_id: &str) -> BackendResult<Vec<TaskListSnapshot>> {
        let sql = format!(
            "SELECT {LIST_COLUMNS} FROM task_lists l WHERE {} \
             ORDER BY l.updated_at DESC, l.created_at DESC",
            member_clause("?1")
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        let mut lists = Vec::with_capacity(rows.len());
        for row in &rows {
            lists.push(self.load_snapshot(row).await?);
        }
        Ok(lists)
    }

    pub async fn get_task_list(&self, user_id: &str, list_id: &str) -> BackendResult<TaskListSnapshot> {
        let sql = format!(
            "SELECT {LIST_COLUMNS} FROM task_lists l WHERE l.id = ?1 AND {}",
            member_clause("?2")
        );
        let row = sqlx::query(&sql)
            .bind(list_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BackendError::NotFound("Task list not found".to_string()))?;
        self.load_snapshot(&row).await
    }

    pub async fn create_task_list(
        &self,
        user_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> BackendResult<TaskListSnapshot> {
        let name = name.trim();
        if name.is_empty() {
            return Err(BackendError::Validation("Name is required".to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        sqlx::query(
            "INSERT INTO task_lists (id, name, description, owner_id, created_at, updated_at, updated_by) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?4)",
        )
        .bind(&id)
        .bind(name)
        .bind(normalize_description(description))
        .bind(user_id)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        debug!(task_list_id = %id, owner_id = %user_id, "created task list");
        self.get_task_list(user_id, &id).await
    }

    /// Blank names are ignored; a blank description clears it.
    pub async fn update_task_list(
        &self,
        user_id: &str,
        list_id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> BackendResult<TaskListSnapshot> {
        self.require_member(user_id, list_id).await?;

        let mut tx = self.pool.begin().await?;
        if let Some(name) = name.map(str::trim).filter(|name| !name.is_empty()) {
            sqlx::query("UPDATE task_lists SET name = ?1 WHERE id = ?2")
                .bind(name)
                .bind(list_id)
                .execute(&mut *tx)
                .await?;
        }
        if description.is_some() {
            sqlx::query("UPDATE task_lists SET description = ?1 WHERE id = ?2")
                .bind(normalize_description(description))
                .bind(list_id)
                .execute(&mut *tx)
                .await?;
        }
        touch_list(&mut tx, list_id, user_id).await?;
        tx.commit().await?;

        self.get_task_list(user_id, list_id).await
    }

    /// Owner only. The list and all of its tasks are soft-deleted together.
    pub async fn delete_task_list(&self, user_id: &str, list_id: &str) -> BackendResult<()> {
        self.require_owner(user_id, list_id).await?;

        let now = now_iso();
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE tasks SET deleted_at = ?1 WHERE task_list_id = ?2 AND deleted_at IS NULL")
            .bind(&now)
            .bind(list_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE task_lists SET deleted_at = ?1, updated_at = ?1, updated_by = ?2 WHERE id = ?3")
            .bind(&now)
            .bind(user_id)
            .bind(list_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(task_list_id = %list_id, "soft-deleted task list and its tasks");
        Ok(())
    }

    pub async fn invite_collaborator(
        &self,
        user_id: &str,
        list_id: &str,
        email: &str,
    ) -> BackendResult<CollaboratorRef> {
        if email.trim().is_empty() {
            return Err(BackendError::Validation("Email is required".to_string()));
        }
        self.require_owner(user_id, list_id).await?;

        let invitee = self
            .find_user_by_email(email)
            .await?
            .ok_or_else(|| BackendError::NotFound("User not found".to_string()))?;
        if invitee.id == user_id {
            return Err(BackendError::Validation(
                "You already own this task list".to_string(),
            ));
        }

        let existing = sqlx::query("SELECT 1 FROM collaborators WHERE task_list_id = ?1 AND user_id = ?2")
            .bind(list_id)
            .bind(&invitee.id)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(BackendError::Validation(
                "User is already a collaborator".to_string(),
            ));
        }

        let collaborator = CollaboratorRef {
            id: Uuid::new_v4().to_string(),
            user_id: invitee.id.clone(),
            user: Some(invitee),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO collaborators (id, task_list_id, user_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&collaborator.id)
        .bind(list_id)
        .bind(&collaborator.user_id)
        .bind(now_iso())
        .execute(&mut *tx)
        .await?;
        touch_list(&mut tx, list_id, user_id).await?;
        tx.commit().await?;

        debug!(task_list_id = %list_id, collaborator_id = %collaborator.user_id, "added collaborator");
        Ok(collaborator)
    }

    /// Appends after the list's last live task. Gaps left by deletions are
    /// never compacted.
    pub async fn create_task(&self, user_id: &str, task: &NewTask) -> BackendResult<TaskSnapshot> {
        let title = task.title.trim();
        if title.is_empty() {
            return Err(BackendError::Validation("Title is required".to_string()));
        }
        if task.task_list_id.trim().is_empty() {
            return Err(BackendError::Validation("Task list ID is required".to_string()));
        }
        let deadline = normalize_deadline(task.deadline.as_deref())?;
        self.require_member(user_id, &task.task_list_id).await?;

        let id = Uuid::new_v4().to_string();
        let now = now_iso();
        let mut tx = self.pool.begin().await?;
        let position: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM tasks WHERE task_list_id = ?1 AND deleted_at IS NULL",
        )
        .bind(&task.task_list_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO tasks (id, title, status, deadline, position, task_list_id, created_by_id, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        )
        .bind(&id)
        .bind(title)
        .bind(task.status.unwrap_or_default().as_str())
        .bind(deadline)
        .bind(position)
        .bind(&task.task_list_id)
        .bind(user_id)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        touch_list(&mut tx, &task.task_list_id, user_id).await?;
        tx.commit().await?;

        self.get_task(&id).await
    }

    pub async fn update_task(&self, user_id: &str, task_id: &str, patch: &TaskPatch) -> BackendResult<TaskSnapshot> {
        let list_id = self.require_task_access(user_id, task_id, "update").await?;
        let title = match patch.title.as_deref().map(str::trim) {
            Some("") => return Err(BackendError::Validation("Title is required".to_string())),
            other => other,
        };
        let deadline = match &patch.deadline {
            Some(raw) => Some(normalize_deadline(raw.as_deref())?),
            None => None,
        };

        let mut tx = self.pool.begin().await?;
        if let Some(title) = title {
            sqlx::query("UPDATE tasks SET title = ?1 WHERE id = ?2")
                .bind(title)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(status) = patch.status {
            sqlx::query("UPDATE tasks SET status = ?1 WHERE id = ?2")
                .bind(status.as_str())
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(deadline) = deadline {
            sqlx::query("UPDATE tasks SET deadline = ?1 WHERE id = ?2")
                .bind(deadline)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(order) = patch.order {
            sqlx::query("UPDATE tasks SET position = ?1 WHERE id = ?2")
                .bind(order)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("UPDATE tasks SET updated_at = ?1 WHERE id = ?2")
            .bind(now_iso())
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        touch_list(&mut tx, &list_id, user_id).await?;
        tx.commit().await?;

        self.get_task(task_id).await
    }

    pub async fn delete_task(&self, user_id: &str, task_id: &str) -> BackendResult<()> {
        let list_id = self.require_task_access(user_id, task_id, "delete").await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE tasks SET deleted_at = ?1 WHERE id = ?2")
            .bind(now_iso())
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        touch_list(&mut tx, &list_id, user_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> BackendResult<TaskSnapshot> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1 AND deleted_at IS NULL");
        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BackendError::NotFound("Task not found".to_string()))?;
        Ok(map_task_row(&row)?)
    }

    async fn load_snapshot(&self, row: &SqliteRow) -> BackendResult<TaskListSnapshot> {
        let id: String = row.try_get("id")?;
        let owner_id: String = row.try_get("owner_id")?;
        let owner = self.get_user(&owner_id).await?;

        let collaborator_rows = sqlx::query(
            "SELECT c.id AS collaborator_id, u.id, u.email, u.name \
             FROM collaborators c JOIN users u ON u.id = c.user_id \
             WHERE c.task_list_id = ?1 ORDER BY c.created_at ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;
        let collaborators = collaborator_rows
            .iter()
            .map(|row| -> Result<CollaboratorRef, sqlx::Error> {
                let user = map_user_row(row)?;
                Ok(CollaboratorRef {
                    id: row.try_get("collaborator_id")?,
                    user_id: user.id.clone(),
                    user: Some(user),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_list_id = ?1 AND deleted_at IS NULL \
             ORDER BY position ASC, created_at ASC"
        );
        let tasks = sqlx::query(&sql)
            .bind(&id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(map_task_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TaskListSnapshot {
            id,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            owner_id,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            updated_by: row.try_get("updated_by")?,
            owner,
            collaborators,
            tasks,
        })
    }

    async fn require_member(&self, user_id: &str, list_id: &str) -> BackendResult<()> {
        let sql = format!("SELECT 1 FROM task_lists l WHERE l.id = ?1 AND {}", member_clause("?2"));
        sqlx::query(&sql)
            .bind(list_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound("Task list not found".to_string()))
    }

    async fn require_owner(&self, user_id: &str, list_id: &str) -> BackendResult<()> {
        sqlx::query("SELECT 1 FROM task_lists WHERE id = ?1 AND owner_id = ?2 AND deleted_at IS NULL")
            .bind(list_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|_| ())
            .ok_or_else(|| {
                BackendError::NotFound("Task list not found or you do not have permission".to_string())
            })
    }

    /// Returns the owning list id of a live task the user may modify.
    async fn require_task_access(&self, user_id: &str, task_id: &str, action: &str) -> BackendResult<String> {
        let row = sqlx::query(
            "SELECT t.task_list_id, l.owner_id, \
                    EXISTS (SELECT 1 FROM collaborators c WHERE c.task_list_id = l.id AND c.user_id = ?2) AS is_collaborator \
             FROM tasks t JOIN task_lists l ON l.id = t.task_list_id \
             WHERE t.id = ?1 AND t.deleted_at IS NULL AND l.deleted_at IS NULL",
        )
        .bind(task_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BackendError::NotFound("Task not found".to_string()))?;

        let owner_id: String = row.try_get("owner_id")?;
        let is_collaborator: i64 = row.try_get("is_collaborator")?;
        if owner_id != user_id && is_collaborator == 0 {
            return Err(BackendError::Forbidden(format!(
                "You do not have permission to {action} this task"
            )));
        }
        Ok(row.try_get("task_list_id")?)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_lists (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                owner_id TEXT NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                updated_by TEXT REFERENCES users(id),
                deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS collaborators (
                id TEXT PRIMARY KEY,
                task_list_id TEXT NOT NULL REFERENCES task_lists(id),
                user_id TEXT NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL,
                UNIQUE(task_list_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'TODO',
                deadline TEXT,
                position INTEGER NOT NULL,
                task_list_id TEXT NOT NULL REFERENCES task_lists(id),
                created_by_id TEXT NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_list_position ON tasks(task_list_id, position);",
        )
        .execute(&self.pool)
        .await
        .context("failed to run sqlite migrations")?;

        Ok(())
    }
}

/// A [`Database`] acting as one fixed user.
#[derive(Clone)]
pub struct LocalBackend {
    db: Database,
    user: AuthUser,
}

impl LocalBackend {
    pub fn new(db: Database, user: AuthUser) -> Self {
        Self { db, user }
    }

    /// Acts as the user registered under `email`.
    pub async fn for_email(db: Database, email: &str) -> BackendResult<Self> {
        let user = db
            .find_user_by_email(email)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("no local user with email {}", email.trim())))?;
        Ok(Self::new(
            db,
            AuthUser {
                user_id: user.id,
                email: user.email,
            },
        ))
    }

    pub fn user(&self) -> &AuthUser {
        &self.user
    }
}

impl TaskUpdater for LocalBackend {
    async fn update_task(&self, task_id: &str, patch: TaskPatch) -> BackendResult<TaskSnapshot> {
        self.db.update_task(&self.user.user_id, task_id, &patch).await
    }
}

impl TaskBackend for LocalBackend {
    async fn current_user(&self) -> BackendResult<AuthUser> {
        Ok(self.user.clone())
    }

    async fn list_task_lists(&self) -> BackendResult<Vec<TaskListSnapshot>> {
        self.db.list_task_lists(&self.user.user_id).await
    }

    async fn get_task_list(&self, list_id: &str) -> BackendResult<TaskListSnapshot> {
        self.db.get_task_list(&self.user.user_id, list_id).await
    }

    async fn create_task_list(&self, name: &str, description: Option<&str>) -> BackendResult<TaskListSnapshot> {
        self.db.create_task_list(&self.user.user_id, name, description).await
    }

    async fn update_task_list(
        &self,
        list_id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> BackendResult<TaskListSnapshot> {
        self.db
            .update_task_list(&self.user.user_id, list_id, name, description)
            .await
    }

    async fn delete_task_list(&self, list_id: &str) -> BackendResult<()> {
        self.db.delete_task_list(&self.user.user_id, list_id).await
    }

    async fn invite_collaborator(&self, list_id: &str, email: &str) -> BackendResult<CollaboratorRef> {
        self.db
            .invite_collaborator(&self.user.user_id, list_id, email)
            .await
    }

    async fn export_csv(&self, list_id: &str) -> BackendResult<String> {
        let list = self.db.get_task_list(&self.user.user_id, list_id).await?;
        Ok(render_csv(&list.tasks))
    }

    async fn create_task(&self, task: NewTask) -> BackendResult<TaskSnapshot> {
        self.db.create_task(&self.user.user_id, &task).await
    }

    async fn delete_task(&self, task_id: &str) -> BackendResult<()> {
        self.db.delete_task(&self.user.user_id, task_id).await
    }
}

/// Live lists where the user bound at `param` is the owner or a collaborator.
fn member_clause(param: &str) -> String {
    format!(
        "l.deleted_at IS NULL AND (l.owner_id = {param} OR EXISTS (\
         SELECT 1 FROM collaborators c WHERE c.task_list_id = l.id AND c.user_id = {param}))"
    )
}

async fn touch_list(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    list_id: &str,
    user_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE task_lists SET updated_at = ?1, updated_by = ?2 WHERE id = ?3")
        .bind(now_iso())
        .bind(user_id)
        .bind(list_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn map_user_row(row: &SqliteRow) -> Result<UserRef, sqlx::Error> {
    Ok(UserRef {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
    })
}

fn map_task_row(row: &SqliteRow) -> Result<TaskSnapshot, sqlx::Error> {
    let raw_status: String = row.try_get("status")?;
    let status = TaskStatus::from_str(&raw_status).map_err(|_| sqlx::Error::ColumnDecode {
        index: "status".to_string(),
        source: format!("unknown task status {raw_status:?}").into(),
    })?;

    Ok(TaskSnapshot {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        status,
        deadline: row.try_get("deadline")?,
        order: row.try_get("position")?,
        task_list_id: row.try_get("task_list_id")?,
        created_by_id: row.try_get("created_by_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn normalize_description(description: Option<&str>) -> Option<String> {
    description
        .map(str::trim)
        .filter(|description| !description.is_empty())
        .map(str::to_string)
}

/// Stores deadlines as `YYYY-MM-DD`; a blank value clears the deadline.
fn normalize_deadline(raw: Option<&str>) -> BackendResult<Option<String>> {
    match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
        None => Ok(None),
        Some(raw) => parse_day(raw)
            .map(|day| Some(day.format("%Y-%m-%d").to_string()))
            .ok_or_else(|| BackendError::Validation(format!("invalid deadline {raw:?}, expected YYYY-MM-DD"))),
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::TempDir;

    use super::*;

    struct Fixture {
        db: Database,
        alice: UserRef,
        bob: UserRef,
    }

    async fn fixture() -> Result<Fixture> {
        let db = Database::open(":memory:").await?;
        let alice = db.create_user("alice@example.com", Some("Alice")).await?;
        let bob = db.create_user("bob@example.com", None).await?;
        Ok(Fixture { db, alice, bob })
    }

    fn new_task(list_id: &str, title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            status: None,
            deadline: None,
            task_list_id: list_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_open_creates_database_file() -> Result<()> {
        let dir = TempDir::new()?;
        let db_path = dir.path().join("nested").join("collab.sqlite");
        let db = Database::open(&db_path).await?;
        db.create_user("alice@example.com", None).await?;

        assert!(db_path.exists());
        let reopened = Database::open(&db_path).await?;
        assert_eq!(reopened.list_users().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_email_is_conflict() -> Result<()> {
        let fx = fixture().await?;
        let err = fx.db.create_user(" alice@example.com ", None).await.expect_err("duplicate");
        assert!(matches!(err, BackendError::Conflict(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_tasks_append_without_gap_compaction() -> Result<()> {
        let fx = fixture().await?;
        let list = fx.db.create_task_list(&fx.alice.id, " Groceries ", Some("  ")).await?;
        assert_eq!(list.name, "Groceries");
        assert_eq!(list.description, None);

        let first = fx.db.create_task(&fx.alice.id, &new_task(&list.id, "Milk")).await?;
        let second = fx.db.create_task(&fx.alice.id, &new_task(&list.id, "Bread")).await?;
        let third = fx.db.create_task(&fx.alice.id, &new_task(&list.id, "Eggs")).await?;
        assert_eq!((first.order, second.order, third.order), (0, 1, 2));
        assert_eq!(first.status, TaskStatus::Todo);

        fx.db.delete_task(&fx.alice.id, &third.id).await?;
        fx.db.delete_task(&fx.alice.id, &first.id).await?;
        let fourth = fx.db.create_task(&fx.alice.id, &new_task(&list.id, "Butter")).await?;
        assert_eq!(fourth.order, 2);

        let reloaded = fx.db.get_task_list(&fx.alice.id, &list.id).await?;
        let orders: Vec<i64> = reloaded.tasks.iter().map(|task| task.order).collect();
        assert_eq!(orders, [1, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn test_non_members_cannot_see_or_touch_list() -> Result<()> {
        let fx = fixture().await?;
        let list = fx.db.create_task_list(&fx.alice.id, "Private", None).await?;
        let task = fx.db.create_task(&fx.alice.id, &new_task(&list.id, "Secret")).await?;

        assert!(fx.db.list_task_lists(&fx.bob.id).await?.is_empty());
        assert!(matches!(
            fx.db.get_task_list(&fx.bob.id, &list.id).await,
            Err(BackendError::NotFound(_))
        ));
        assert!(matches!(
            fx.db.create_task(&fx.bob.id, &new_task(&list.id, "Sneaky")).await,
            Err(BackendError::NotFound(_))
        ));
        assert!(matches!(
            fx.db.update_task(&fx.bob.id, &task.id, &TaskPatch::order(9)).await,
            Err(BackendError::Forbidden(_))
        ));
        assert!(matches!(
            fx.db.delete_task(&fx.bob.id, &task.id).await,
            Err(BackendError::Forbidden(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_collaborator_can_edit_but_not_delete_or_invite() -> Result<()> {
        let fx = fixture().await?;
        let carol = fx.db.create_user("carol@example.com", None).await?;
        let list = fx.db.create_task_list(&fx.alice.id, "Shared", None).await?;
        let task = fx.db.create_task(&fx.alice.id, &new_task(&list.id, "Plan")).await?;

        let collaborator = fx.db.invite_collaborator(&fx.alice.id, &list.id, "bob@example.com").await?;
        assert_eq!(collaborator.user_id, fx.bob.id);

        let visible = fx.db.list_task_lists(&fx.bob.id).await?;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].member_email(&fx.bob.id), Some("bob@example.com"));

        let patch = TaskPatch {
            status: Some(TaskStatus::Done),
            ..TaskPatch::default()
        };
        let updated = fx.db.update_task(&fx.bob.id, &task.id, &patch).await?;
        assert_eq!(updated.status, TaskStatus::Done);

        let renamed = fx.db.update_task_list(&fx.bob.id, &list.id, Some("Shared plans"), None).await?;
        assert_eq!(renamed.name, "Shared plans");

        assert!(matches!(
            fx.db.delete_task_list(&fx.bob.id, &list.id).await,
            Err(BackendError::NotFound(_))
        ));
        assert!(matches!(
            fx.db.invite_collaborator(&fx.bob.id, &list.id, &carol.email).await,
            Err(BackendError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_invite_rejections() -> Result<()> {
        let fx = fixture().await?;
        let list = fx.db.create_task_list(&fx.alice.id, "Shared", None).await?;

        assert!(matches!(
            fx.db.invite_collaborator(&fx.alice.id, &list.id, "nobody@example.com").await,
            Err(BackendError::NotFound(ref msg)) if msg == "User not found"
        ));
        assert!(matches!(
            fx.db.invite_collaborator(&fx.alice.id, &list.id, "alice@example.com").await,
            Err(BackendError::Validation(_))
        ));

        fx.db.invite_collaborator(&fx.alice.id, &list.id, "bob@example.com").await?;
        assert!(matches!(
            fx.db.invite_collaborator(&fx.alice.id, &list.id, "bob@example.com").await,
            Err(BackendError::Validation(ref msg)) if msg == "User is already a collaborator"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_list_soft_deletes_tasks() -> Result<()> {
        let fx = fixture().await?;
        let list = fx.db.create_task_list(&fx.alice.id, "Doomed", None).await?;
        let task = fx.db.create_task(&fx.alice.id, &new_task(&list.id, "One")).await?;

        fx.db.delete_task_list(&fx.alice.id, &list.id).await?;

        assert!(fx.db.list_task_lists(&fx.alice.id).await?.is_empty());
        assert!(matches!(
            fx.db.update_task(&fx.alice.id, &task.id, &TaskPatch::order(1)).await,
            Err(BackendError::NotFound(_))
        ));
        let live: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE deleted_at IS NULL")
            .fetch_one(&fx.db.pool)
            .await?;
        let kept: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&fx.db.pool)
            .await?;
        assert_eq!((live, kept), (0, 1));
        Ok(())
    }

    #[tokio::test]
    async fn test_writes_record_author_and_bump_updated_at() -> Result<()> {
        let fx = fixture().await?;
        let list = fx.db.create_task_list(&fx.alice.id, "Shared", None).await?;
        assert_eq!(list.updated_by.as_deref(), Some(fx.alice.id.as_str()));
        fx.db.invite_collaborator(&fx.alice.id, &list.id, "bob@example.com").await?;
        let before = fx.db.get_task_list(&fx.alice.id, &list.id).await?;

        fx.db.create_task(&fx.bob.id, &new_task(&list.id, "From bob")).await?;

        let after = fx.db.get_task_list(&fx.alice.id, &list.id).await?;
        assert_eq!(after.updated_by.as_deref(), Some(fx.bob.id.as_str()));
        assert!(after.updated_at >= before.updated_at);
        assert_eq!(after.tasks[0].created_by_id, fx.bob.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_task_deadline_set_and_clear() -> Result<()> {
        let fx = fixture().await?;
        let list = fx.db.create_task_list(&fx.alice.id, "Dates", None).await?;
        let task = fx.db.create_task(&fx.alice.id, &new_task(&list.id, "Ship")).await?;

        let set = TaskPatch {
            deadline: Some(Some("2026-06-01T00:00:00.000Z".to_string())),
            ..TaskPatch::default()
        };
        let updated = fx.db.update_task(&fx.alice.id, &task.id, &set).await?;
        assert_eq!(updated.deadline.as_deref(), Some("2026-06-01"));

        let clear = TaskPatch {
            deadline: Some(None),
            ..TaskPatch::default()
        };
        let cleared = fx.db.update_task(&fx.alice.id, &task.id, &clear).await?;
        assert_eq!(cleared.deadline, None);

        let bad = TaskPatch {
            deadline: Some(Some("next week".to_string())),
            ..TaskPatch::default()
        };
        assert!(matches!(
            fx.db.update_task(&fx.alice.id, &task.id, &bad).await,
            Err(BackendError::Validation(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_lists_are_most_recently_updated_first() -> Result<()> {
        let fx = fixture().await?;
        let older = fx.db.create_task_list(&fx.alice.id, "Older", None).await?;
        let newer = fx.db.create_task_list(&fx.alice.id, "Newer", None).await?;
        fx.db.create_task(&fx.alice.id, &new_task(&older.id, "bump")).await?;

        let lists = fx.db.list_task_lists(&fx.alice.id).await?;
        let names: Vec<&str> = lists.iter().map(|list| list.name.as_str()).collect();
        assert_eq!(names, ["Older", "Newer"]);
        assert_eq!(lists[1].id, newer.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_local_backend_acts_as_resolved_user() -> Result<()> {
        let fx = fixture().await?;
        let backend = LocalBackend::for_email(fx.db.clone(), "bob@example.com").await?;
        assert_eq!(backend.current_user().await?.user_id, fx.bob.id);

        let list = backend.create_task_list("Bob's", None).await?;
        assert_eq!(list.owner_id, fx.bob.id);
        assert_eq!(list.owner.email, "bob@example.com");

        backend.create_task(new_task(&list.id, "Csv \"row\"")).await?;
        let csv = backend.export_csv(&list.id).await?;
        assert!(csv.starts_with("Title,Status,Deadline,Created At\n\"Csv \"\"row\"\"\",\"TODO\",\"-\","));

        assert!(matches!(
            LocalBackend::for_email(fx.db.clone(), "ghost@example.com").await,
            Err(BackendError::NotFound(_))
        ));
        Ok(())
    }
}
