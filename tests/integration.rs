use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use collab_tasks::api::ApiClient;
use collab_tasks::backend::TaskBackend;
use collab_tasks::db::{Database, LocalBackend};
use collab_tasks::editor::TaskEditor;
use collab_tasks::error::BackendResult;
use collab_tasks::notification::{NotificationBackend, NotificationCenter};
use collab_tasks::reorder::{MoveDirection, MoveOutcome, TaskUpdater, move_task};
use collab_tasks::session::{Session, SessionStore};
use collab_tasks::types::{
    AuthUser, CollaboratorRef, NewTask, TaskListSnapshot, TaskPatch, TaskSnapshot, TaskStatus,
};
use collab_tasks::watch::{WatchOptions, watch_task_lists};

struct SharedStore {
    _temp: TempDir,
    alice: LocalBackend,
    bob: LocalBackend,
}

async fn shared_store() -> Result<SharedStore> {
    let temp = TempDir::new()?;
    let db = Database::open(temp.path().join("tasks.db")).await?;
    db.create_user("alice@example.com", Some("Alice")).await?;
    db.create_user("bob@example.com", Some("Bob")).await?;

    let alice = LocalBackend::for_email(db.clone(), "alice@example.com").await?;
    let bob = LocalBackend::for_email(db, "bob@example.com").await?;
    Ok(SharedStore {
        _temp: temp,
        alice,
        bob,
    })
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
async fn collaborators_are_notified_of_each_others_updates() -> Result<()> {
    let store = shared_store().await?;
    let list = store.alice.create_task_list("Groceries", None).await?;
    store
        .alice
        .invite_collaborator(&list.id, "bob@example.com")
        .await?;

    let mut bob_center = NotificationCenter::new(store.bob.user().user_id.clone(), Utc::now());
    let mut alice_center = NotificationCenter::new(store.alice.user().user_id.clone(), Utc::now());
    tokio::time::sleep(Duration::from_millis(5)).await;

    store.alice.create_task(new_task(&list.id, "Milk")).await?;

    let fresh = bob_center.evaluate(&store.bob.list_task_lists().await?, Utc::now());
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].task_list_name, "Groceries");
    assert_eq!(fresh[0].updated_by_label, "alice@example.com");
    assert_eq!(bob_center.badge_label().as_deref(), Some("1"));

    let own = alice_center.evaluate(&store.alice.list_task_lists().await?, Utc::now());
    assert!(own.is_empty(), "authors are not notified of their own writes");

    // Nothing changed since the last evaluation.
    let again = bob_center.evaluate(&store.bob.list_task_lists().await?, Utc::now());
    assert!(again.is_empty());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let milk = store.bob.get_task_list(&list.id).await?.tasks[0].clone();
    store
        .bob
        .update_task(
            &milk.id,
            TaskPatch {
                status: Some(TaskStatus::Done),
                ..TaskPatch::default()
            },
        )
        .await?;

    let from_bob = alice_center.evaluate(&store.alice.list_task_lists().await?, Utc::now());
    assert_eq!(from_bob.len(), 1);
    assert_eq!(from_bob[0].updated_by, store.bob.user().user_id);
    assert_eq!(from_bob[0].updated_by_label, "bob@example.com");

    bob_center.mark_read();
    assert_eq!(bob_center.unread(), 0);
    assert_eq!(bob_center.len(), 1);
    Ok(())
}

#[tokio::test]
async fn reorder_swaps_persisted_order_for_collaborator() -> Result<()> {
    let store = shared_store().await?;
    let list = store.alice.create_task_list("Week", None).await?;
    store
        .alice
        .invite_collaborator(&list.id, "bob@example.com")
        .await?;
    for title in ["one", "two", "three"] {
        store.alice.create_task(new_task(&list.id, title)).await?;
    }

    let ordered = store.bob.get_task_list(&list.id).await?.ordered_tasks();
    let outcome = move_task(&store.bob, &ordered[1].id, MoveDirection::Up, &ordered).await?;
    assert!(matches!(outcome, MoveOutcome::Swapped { .. }));

    let titles = store
        .alice
        .get_task_list(&list.id)
        .await?
        .ordered_tasks()
        .into_iter()
        .map(|task| (task.title, task.order))
        .collect::<Vec<_>>();
    assert_eq!(
        titles,
        vec![
            ("two".to_string(), 0),
            ("one".to_string(), 1),
            ("three".to_string(), 2)
        ]
    );

    let reordered = store.bob.get_task_list(&list.id).await?.ordered_tasks();
    let last = reordered.last().context("list has tasks")?;
    let unchanged = move_task(&store.bob, &last.id, MoveDirection::Down, &reordered).await?;
    assert!(matches!(unchanged, MoveOutcome::Unchanged));
    Ok(())
}

#[tokio::test]
async fn edit_session_undo_restores_stored_task() -> Result<()> {
    let store = shared_store().await?;
    let list = store.alice.create_task_list("Errands", None).await?;
    let task = store
        .alice
        .create_task(NewTask {
            deadline: Some("2026-05-01".to_string()),
            ..new_task(&list.id, "Post letter")
        })
        .await?;

    let mut editor = TaskEditor::new(&task);
    editor.set_title("Post parcel");
    editor.set_deadline(None);
    let saved = editor.save(&store.alice).await?;
    assert_eq!(saved.title, "Post parcel");
    assert_eq!(saved.deadline, None);

    assert!(editor.undo());
    assert!(!editor.is_dirty());
    let restored = editor.save(&store.alice).await?;
    assert_eq!(restored.title, "Post letter");
    assert_eq!(restored.deadline_date(), chrono::NaiveDate::from_ymd_opt(2026, 5, 1));

    let stored = store.alice.get_task_list(&list.id).await?;
    assert_eq!(stored.tasks[0].title, "Post letter");
    Ok(())
}

#[tokio::test]
async fn deleting_a_list_hides_it_from_every_member() -> Result<()> {
    let store = shared_store().await?;
    let list = store.alice.create_task_list("Trip", Some("Packing")).await?;
    store
        .alice
        .invite_collaborator(&list.id, "bob@example.com")
        .await?;
    let task = store.bob.create_task(new_task(&list.id, "Passport")).await?;

    assert!(store.bob.delete_task_list(&list.id).await.is_err());
    store.alice.delete_task_list(&list.id).await?;

    assert!(store.bob.list_task_lists().await?.is_empty());
    assert!(store.alice.list_task_lists().await?.is_empty());
    assert!(store.bob.delete_task(&task.id).await.is_err());
    Ok(())
}

/// Bob's view of the store. The fetch numbered `write_on_fetch` first commits
/// Alice's pending task and only then reads, so the write always lands
/// between two snapshots.
///
/// A write that commits while a fetch is reading is missed: evaluating that
/// stale snapshot advances `last_check` past the write's `updated_at`.
#[derive(Clone)]
struct ScriptedView {
    bob: LocalBackend,
    alice: LocalBackend,
    pending: Arc<Mutex<Option<NewTask>>>,
    fetches: Arc<AtomicUsize>,
    write_on_fetch: usize,
}

impl TaskUpdater for ScriptedView {
    async fn update_task(&self, task_id: &str, patch: TaskPatch) -> BackendResult<TaskSnapshot> {
        self.bob.update_task(task_id, patch).await
    }
}

impl TaskBackend for ScriptedView {
    async fn current_user(&self) -> BackendResult<AuthUser> {
        self.bob.current_user().await
    }

    async fn list_task_lists(&self) -> BackendResult<Vec<TaskListSnapshot>> {
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if fetch == self.write_on_fetch {
            let pending = self.pending.lock().expect("pending lock").take();
            if let Some(task) = pending {
                self.alice.create_task(task).await?;
            }
        }
        self.bob.list_task_lists().await
    }

    async fn get_task_list(&self, list_id: &str) -> BackendResult<TaskListSnapshot> {
        self.bob.get_task_list(list_id).await
    }

    async fn create_task_list(&self, name: &str, description: Option<&str>) -> BackendResult<TaskListSnapshot> {
        self.bob.create_task_list(name, description).await
    }

    async fn update_task_list(
        &self,
        list_id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> BackendResult<TaskListSnapshot> {
        self.bob.update_task_list(list_id, name, description).await
    }

    async fn delete_task_list(&self, list_id: &str) -> BackendResult<()> {
        self.bob.delete_task_list(list_id).await
    }

    async fn invite_collaborator(&self, list_id: &str, email: &str) -> BackendResult<CollaboratorRef> {
        self.bob.invite_collaborator(list_id, email).await
    }

    async fn export_csv(&self, list_id: &str) -> BackendResult<String> {
        self.bob.export_csv(list_id).await
    }

    async fn create_task(&self, task: NewTask) -> BackendResult<TaskSnapshot> {
        self.bob.create_task(task).await
    }

    async fn delete_task(&self, task_id: &str) -> BackendResult<()> {
        self.bob.delete_task(task_id).await
    }
}

#[tokio::test]
async fn watch_reports_collaborator_update_from_local_store() -> Result<()> {
    let store = shared_store().await?;
    let list = store.alice.create_task_list("Chores", None).await?;
    store
        .alice
        .invite_collaborator(&list.id, "bob@example.com")
        .await?;

    let view = ScriptedView {
        bob: store.bob.clone(),
        alice: store.alice.clone(),
        pending: Arc::new(Mutex::new(Some(new_task(&list.id, "Vacuum")))),
        fetches: Arc::new(AtomicUsize::new(0)),
        write_on_fetch: 3,
    };
    let fetches = Arc::clone(&view.fetches);
    let pending = Arc::clone(&view.pending);

    let mut batches = Vec::new();
    let summary = watch_task_lists(
        view,
        WatchOptions {
            interval: Duration::from_millis(100),
            notification_backend: NotificationBackend::None,
            notification_display_duration_ms: 0,
        },
        tokio::time::sleep(Duration::from_millis(550)),
        |batch, _| batches.extend(batch.iter().map(|entry| entry.updated_by_label.clone())),
    )
    .await?;

    assert!(pending.lock().expect("pending lock").is_none(), "write never ran");
    assert!(fetches.load(Ordering::SeqCst) >= 4);
    assert_eq!(batches, vec!["alice@example.com".to_string()]);
    assert_eq!(summary.notifications, 1);
    assert_eq!(summary.unread, 1);
    assert!(summary.snapshots > 1);
    Ok(())
}

fn list_json(updated_at: &str, updated_by: &str) -> serde_json::Value {
    json!({
        "id": "l-1",
        "name": "Groceries",
        "description": null,
        "ownerId": "alice",
        "createdAt": "2026-01-01T00:00:00.000Z",
        "updatedAt": updated_at,
        "updatedBy": updated_by,
        "owner": { "id": "alice", "email": "alice@example.com", "name": "Alice" },
        "collaborators": [
            { "id": "c-1", "userId": "bob", "user": { "id": "bob", "email": "bob@example.com", "name": null } }
        ],
        "tasks": [
            {
                "id": "t-1", "title": "Milk", "status": "TODO", "deadline": null, "order": 0,
                "taskListId": "l-1", "createdById": "alice",
                "createdAt": "2026-01-01T00:00:00.000Z", "updatedAt": "2026-01-01T00:00:00.000Z"
            },
            {
                "id": "t-2", "title": "Bread", "status": "DONE", "deadline": "2026-05-01T00:00:00.000Z", "order": 1,
                "taskListId": "l-1", "createdById": "bob",
                "createdAt": "2026-01-01T00:00:00.000Z", "updatedAt": "2026-01-01T00:00:00.000Z"
            }
        ]
    })
}

#[tokio::test]
async fn service_login_session_and_reorder_flow() -> Result<()> {
    let server = MockServer::start().await;
    let base_url = format!("{}/api", server.uri());

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_json(json!({ "email": "bob@example.com", "password": "hunter22" })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "token=jwt-bob; Path=/; HttpOnly")
                .set_body_json(json!({
                    "data": { "id": "bob", "email": "bob@example.com", "name": "Bob" },
                    "message": "Login successful"
                })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let updated_at = (Utc::now() + chrono::Duration::seconds(30)).to_rfc3339();
    Mock::given(method("GET"))
        .and(path("/api/task-lists"))
        .and(header("cookie", "token=jwt-bob"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [list_json(&updated_at, "alice")]
        })))
        .mount(&server)
        .await;

    for (task_id, order) in [("t-2", 0), ("t-1", 1)] {
        Mock::given(method("PATCH"))
            .and(path(format!("/api/tasks/{task_id}")))
            .and(header("cookie", "token=jwt-bob"))
            .and(body_json(json!({ "order": order })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "id": task_id, "title": "x", "status": "TODO", "deadline": null, "order": order,
                    "taskListId": "l-1", "createdById": "alice",
                    "createdAt": "2026-01-01T00:00:00.000Z", "updatedAt": "2026-01-01T00:00:00.000Z"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;
    }

    let anonymous = ApiClient::new(&base_url)?;
    let login = anonymous.login("bob@example.com", "hunter22").await?;
    assert_eq!(login.token, "jwt-bob");

    let temp = TempDir::new()?;
    let sessions = SessionStore::new(temp.path().join("session.json"));
    sessions.save(&Session {
        token: login.token.clone(),
        user_id: login.user.id.clone(),
        email: login.user.email.clone(),
        server_url: base_url.clone(),
    })?;
    let session = sessions.load().context("session stored")?;
    assert_eq!(sessions.require_auth(), Some(login.auth_user()));

    let client = ApiClient::new(&session.server_url)?.with_session(session.token.clone(), session.auth_user());
    let lists = client.list_task_lists().await?;
    assert_eq!(lists.len(), 1);
    assert_eq!(lists[0].stats().done, 1);

    let mut center = NotificationCenter::new("bob", Utc::now());
    let fresh = center.evaluate(&lists, Utc::now());
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].headline(), "Groceries has been updated");

    let ordered = lists[0].ordered_tasks();
    let outcome = move_task(&client, "t-2", MoveDirection::Up, &ordered).await?;
    assert!(outcome.is_complete());

    assert!(sessions.clear()?);
    assert_eq!(sessions.require_auth(), None);
    Ok(())
}
