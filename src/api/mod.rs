//! HTTP client for the task-list service.
//!
//! Every endpoint answers with the `{ data, error, message }` envelope (see
//! [`ApiResponse`]); authentication rides on the `token` cookie issued by
//! `auth/login` and `auth/register`.

use std::time::Duration;

use reqwest::header::{COOKIE, HeaderMap, SET_COOKIE};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::backend::TaskBackend;
use crate::error::{BackendError, BackendResult};
use crate::reorder::TaskUpdater;
use crate::types::{
    ApiResponse, AuthUser, CollaboratorRef, NewTask, TaskListSnapshot, TaskPatch, TaskSnapshot,
    UserRef,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:3000/api";

/// Shortest password the service accepts on registration.
pub const MIN_PASSWORD_LEN: usize = 6;

const TOKEN_COOKIE: &str = "token";
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Result of a successful login or registration.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: UserRef,
    pub token: String,
}

impl LoginOutcome {
    pub fn auth_user(&self) -> AuthUser {
        AuthUser {
            user_id: self.user.id.clone(),
            email: self.user.email.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    user: Option<AuthUser>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            user: None,
        })
    }

    /// Attaches a stored session; subsequent calls send its token.
    pub fn with_session(mut self, token: impl Into<String>, user: AuthUser) -> Self {
        self.token = Some(token.into());
        self.user = Some(user);
        self
    }

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> BackendResult<LoginOutcome> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(BackendError::Validation(format!(
                "Password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        self.authenticate(
            "auth/register",
            json!({ "email": email, "password": password, "name": name }),
        )
        .await
    }

    pub async fn login(&self, email: &str, password: &str) -> BackendResult<LoginOutcome> {
        self.authenticate("auth/login", json!({ "email": email, "password": password }))
            .await
    }

    /// Asks the service to expire the cookie. Works without a session.
    pub async fn logout(&self) -> BackendResult<()> {
        let mut builder = self.client.post(self.url("auth/logout"));
        if let Some(token) = &self.token {
            builder = builder.header(COOKIE, format!("{TOKEN_COOKIE}={token}"));
        }
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body));
        }
        Ok(())
    }

    async fn authenticate(&self, path: &str, body: Value) -> BackendResult<LoginOutcome> {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let token = token_from_headers(response.headers());
        let text = response.text().await?;

        if !status.is_success() {
            return Err(error_for_status(status, &text));
        }

        let user: UserRef = parse_envelope(path, &text)?;
        let token = token.ok_or_else(|| {
            BackendError::InvalidResponse(format!("{path} did not set a {TOKEN_COOKIE} cookie"))
        })?;

        debug!(user_id = %user.id, endpoint = path, "authenticated against service");
        Ok(LoginOutcome { user, token })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authed(&self, method: Method, path: &str) -> BackendResult<RequestBuilder> {
        let token = self.token.as_deref().ok_or(BackendError::Unauthorized)?;
        Ok(self
            .client
            .request(method, self.url(path))
            .header(COOKIE, format!("{TOKEN_COOKIE}={token}")))
    }

    async fn send_text(&self, path: &str, builder: RequestBuilder) -> BackendResult<String> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            Ok(body)
        } else {
            let err = error_for_status(status, &body);
            warn!(endpoint = path, status = status.as_u16(), error = %err, "service rejected request");
            Err(err)
        }
    }

    async fn send_data<T: DeserializeOwned>(&self, path: &str, builder: RequestBuilder) -> BackendResult<T> {
        let body = self.send_text(path, builder).await?;
        parse_envelope(path, &body)
    }
}

impl TaskUpdater for ApiClient {
    async fn update_task(&self, task_id: &str, patch: TaskPatch) -> BackendResult<TaskSnapshot> {
        let path = format!("tasks/{}", urlencoding::encode(task_id));
        let builder = self.authed(Method::PATCH, &path)?.json(&patch);
        self.send_data(&path, builder).await
    }
}

impl TaskBackend for ApiClient {
    async fn current_user(&self) -> BackendResult<AuthUser> {
        #[derive(Deserialize)]
        struct Me {
            id: String,
        }

        let builder = self.authed(Method::GET, "auth/me")?;
        let me: Me = self.send_data("auth/me", builder).await?;
        let email = self
            .user
            .as_ref()
            .filter(|user| user.user_id == me.id)
            .map(|user| user.email.clone())
            .unwrap_or_default();

        Ok(AuthUser {
            user_id: me.id,
            email,
        })
    }

    async fn list_task_lists(&self) -> BackendResult<Vec<TaskListSnapshot>> {
        let builder = self.authed(Method::GET, "task-lists")?;
        self.send_data("task-lists", builder).await
    }

    async fn get_task_list(&self, list_id: &str) -> BackendResult<TaskListSnapshot> {
        let path = list_path(list_id);
        let builder = self.authed(Method::GET, &path)?;
        self.send_data(&path, builder).await
    }

    async fn create_task_list(&self, name: &str, description: Option<&str>) -> BackendResult<TaskListSnapshot> {
        let builder = self
            .authed(Method::POST, "task-lists")?
            .json(&json!({ "name": name, "description": description }));
        self.send_data("task-lists", builder).await
    }

    async fn update_task_list(
        &self,
        list_id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> BackendResult<TaskListSnapshot> {
        let mut body = Map::new();
        if let Some(name) = name {
            body.insert("name".to_string(), Value::from(name));
        }
        if let Some(description) = description {
            body.insert("description".to_string(), Value::from(description));
        }

        let path = list_path(list_id);
        let builder = self.authed(Method::PATCH, &path)?.json(&body);
        self.send_data(&path, builder).await
    }

    async fn delete_task_list(&self, list_id: &str) -> BackendResult<()> {
        let path = list_path(list_id);
        let builder = self.authed(Method::DELETE, &path)?;
        self.send_text(&path, builder).await.map(|_| ())
    }

    async fn invite_collaborator(&self, list_id: &str, email: &str) -> BackendResult<CollaboratorRef> {
        let path = format!("{}/invite", list_path(list_id));
        let builder = self
            .authed(Method::POST, &path)?
            .json(&json!({ "email": email }));
        let body = self.send_text(&path, builder).await?;

        // The invite endpoint answers `{ success, collaborator }` rather than
        // the usual envelope.
        let collaborator = match serde_json::from_str::<Value>(&body)? {
            Value::Object(mut fields) => fields
                .remove("collaborator")
                .or_else(|| fields.remove("data"))
                .filter(|value| !value.is_null()),
            _ => None,
        }
        .ok_or_else(|| BackendError::InvalidResponse(format!("{path} returned no collaborator")))?;
        Ok(serde_json::from_value(collaborator)?)
    }

    async fn export_csv(&self, list_id: &str) -> BackendResult<String> {
        let path = format!("{}/export", list_path(list_id));
        let builder = self.authed(Method::GET, &path)?;
        self.send_text(&path, builder).await
    }

    async fn create_task(&self, task: NewTask) -> BackendResult<TaskSnapshot> {
        let builder = self.authed(Method::POST, "tasks")?.json(&task);
        self.send_data("tasks", builder).await
    }

    async fn delete_task(&self, task_id: &str) -> BackendResult<()> {
        let path = format!("tasks/{}", urlencoding::encode(task_id));
        let builder = self.authed(Method::DELETE, &path)?;
        self.send_text(&path, builder).await.map(|_| ())
    }
}

fn list_path(list_id: &str) -> String {
    format!("task-lists/{}", urlencoding::encode(list_id))
}

fn parse_envelope<T: DeserializeOwned>(path: &str, body: &str) -> BackendResult<T> {
    let envelope: ApiResponse<T> = serde_json::from_str(body)?;
    envelope
        .data
        .ok_or_else(|| BackendError::InvalidResponse(format!("{path} returned no data")))
}

/// Maps a non-success status to a [`BackendError`], preferring the
/// envelope's `error` text and falling back to the raw body.
fn error_for_status(status: StatusCode, body: &str) -> BackendError {
    let message = serde_json::from_str::<ApiResponse<Value>>(body)
        .ok()
        .and_then(|envelope| envelope.error.or(envelope.message))
        .unwrap_or_else(|| body.trim().to_string());
    let message = if message.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        message
    };

    match status {
        StatusCode::UNAUTHORIZED => BackendError::Unauthorized,
        StatusCode::FORBIDDEN => BackendError::Forbidden(message),
        StatusCode::NOT_FOUND => BackendError::NotFound(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => BackendError::Validation(message),
        StatusCode::CONFLICT => BackendError::Conflict(message),
        other => BackendError::Server {
            status: other.as_u16(),
            message,
        },
    }
}

fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|cookie| {
            let pair = cookie.split(';').next()?.trim();
            let (name, value) = pair.split_once('=')?;
            (name.trim() == TOKEN_COOKIE && !value.is_empty()).then(|| value.to_string())
        })
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::types::TaskStatus;

    fn bob() -> AuthUser {
        AuthUser {
            user_id: "bob".to_string(),
            email: "bob@example.com".to_string(),
        }
    }

    async fn client_for(server: &MockServer) -> ApiClient {
        ApiClient::new(&format!("{}/api/", server.uri()))
            .expect("client builds")
            .with_session("tok-123", bob())
    }

    fn task_json(id: &str, order: i64) -> Value {
        json!({
            "id": id,
            "title": "Milk",
            "status": "TODO",
            "deadline": null,
            "order": order,
            "taskListId": "l-1",
            "createdById": "bob",
            "createdAt": "2026-01-01T00:00:00.000Z",
            "updatedAt": "2026-01-01T00:00:00.000Z",
            "deletedAt": null
        })
    }

    #[tokio::test]
    async fn test_login_reads_token_cookie() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .and(body_json(json!({ "email": "bob@example.com", "password": "secret1" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "token=jwt-abc; Path=/; HttpOnly; SameSite=lax")
                    .set_body_json(json!({
                        "data": { "id": "bob", "email": "bob@example.com", "name": "Bob" },
                        "message": "Login successful"
                    })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(&format!("{}/api", server.uri())).expect("client builds");
        let outcome = client.login("bob@example.com", "secret1").await.expect("login succeeds");

        assert_eq!(outcome.token, "jwt-abc");
        assert_eq!(outcome.auth_user(), bob());
        assert_eq!(outcome.user.name.as_deref(), Some("Bob"));
    }

    #[tokio::test]
    async fn test_invalid_credentials_map_to_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": "Invalid credentials" })))
            .mount(&server)
            .await;

        let client = ApiClient::new(&format!("{}/api", server.uri())).expect("client builds");
        let err = client.login("bob@example.com", "wrong-pass").await.expect_err("login fails");
        assert!(matches!(err, BackendError::Unauthorized));
    }

    #[tokio::test]
    async fn test_register_rejects_short_password_locally() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/register"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let client = ApiClient::new(&format!("{}/api", server.uri())).expect("client builds");
        let err = client
            .register("new@example.com", "12345", None)
            .await
            .expect_err("password too short");
        assert!(matches!(err, BackendError::Validation(_)));
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/register"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "error": "Email already registered" })))
            .mount(&server)
            .await;

        let client = ApiClient::new(&format!("{}/api", server.uri())).expect("client builds");
        let err = client
            .register("bob@example.com", "secret1", Some("Bob"))
            .await
            .expect_err("duplicate email");
        assert!(matches!(err, BackendError::Conflict(ref msg) if msg == "Email already registered"));
    }

    #[tokio::test]
    async fn test_list_task_lists_sends_session_cookie() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/task-lists"))
            .and(header("cookie", "token=tok-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "id": "l-1",
                    "name": "Groceries",
                    "description": null,
                    "ownerId": "alice",
                    "createdAt": "2026-01-01T00:00:00.000Z",
                    "updatedAt": "2026-01-02T00:00:00.000Z",
                    "owner": { "id": "alice", "email": "alice@example.com", "name": null },
                    "collaborators": [],
                    "tasks": [task_json("t-1", 0)]
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let lists = client.list_task_lists().await.expect("lists load");

        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].owner.email, "alice@example.com");
        assert_eq!(lists[0].tasks[0].status, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn test_calls_without_session_fail_before_sending() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = ApiClient::new(&format!("{}/api", server.uri())).expect("client builds");
        let err = client.list_task_lists().await.expect_err("no session");
        assert!(matches!(err, BackendError::Unauthorized));
    }

    #[tokio::test]
    async fn test_update_task_sends_only_patched_fields() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/tasks/t-1"))
            .and(body_json(json!({ "order": 2 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": task_json("t-1", 2),
                "message": "Task updated successfully"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let updated = client.update_task("t-1", TaskPatch::order(2)).await.expect("update succeeds");
        assert_eq!(updated.order, 2);
    }

    #[tokio::test]
    async fn test_forbidden_and_not_found_carry_service_message() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/tasks/t-9"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": "You do not have permission to delete this task"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/task-lists/missing/export"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not found"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;

        let err = client.delete_task("t-9").await.expect_err("forbidden");
        assert!(matches!(err, BackendError::Forbidden(ref msg) if msg.contains("permission")));

        let err = client.export_csv("missing").await.expect_err("not found");
        assert!(matches!(err, BackendError::NotFound(ref msg) if msg == "Not found"));
    }

    #[tokio::test]
    async fn test_server_error_keeps_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/task-lists/l-1"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "error": "Internal server error" })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.get_task_list("l-1").await.expect_err("server error");
        assert!(matches!(err, BackendError::Server { status: 500, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_invite_reads_collaborator_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/task-lists/l-1/invite"))
            .and(body_json(json!({ "email": "carol@example.com" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "collaborator": { "id": "c-7", "taskListId": "l-1", "userId": "carol" }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let collaborator = client
            .invite_collaborator("l-1", "carol@example.com")
            .await
            .expect("invite succeeds");
        assert_eq!(collaborator.user_id, "carol");
        assert_eq!(collaborator.id, "c-7");
    }

    #[tokio::test]
    async fn test_update_task_list_omits_missing_fields() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/task-lists/l-1"))
            .and(body_json(json!({ "name": "Weekend" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "id": "l-1",
                    "name": "Weekend",
                    "ownerId": "bob",
                    "updatedAt": "2026-01-03T00:00:00.000Z"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let list = client
            .update_task_list("l-1", Some("Weekend"), None)
            .await
            .expect("rename succeeds");
        assert_eq!(list.name, "Weekend");
    }

    #[tokio::test]
    async fn test_current_user_uses_session_email() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/auth/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": { "id": "bob" } })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert_eq!(client.current_user().await.expect("me succeeds"), bob());
    }

    #[test]
    fn test_token_from_headers_ignores_other_cookies() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, "theme=dark; Path=/".parse().expect("header"));
        headers.append(SET_COOKIE, "token=; Expires=Thu, 01 Jan 1970 00:00:00 GMT".parse().expect("header"));
        assert_eq!(token_from_headers(&headers), None);

        headers.append(SET_COOKIE, "token=abc.def; HttpOnly".parse().expect("header"));
        assert_eq!(token_from_headers(&headers).as_deref(), Some("abc.def"));
    }
}
