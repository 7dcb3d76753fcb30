mod edit;

use std::{
    collections::HashSet,
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

use clap::{Args, Subcommand};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::{
    api::{ApiClient, MIN_PASSWORD_LEN},
    backend::TaskBackend,
    db::{Database, LocalBackend},
    error::BackendError,
    export::export_file_name,
    notification::NotificationBackend,
    reorder::{MoveDirection, MoveOutcome, ReorderError, move_task},
    session::{Session, SessionStore},
    settings::Settings,
    types::{AuthUser, NewTask, TaskListSnapshot, TaskPatch, TaskSnapshot, TaskStatus, parse_day},
    watch::{WatchOptions, watch_task_lists},
};

const SCHEMA_VERSION: &str = "cli.v1";

#[derive(Debug, Clone, Subcommand)]
pub enum RootCommand {
    /// Sign in to the task-list service
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
    /// Manage task lists
    List {
        #[command(subcommand)]
        command: ListCommand,
    },
    /// Manage tasks inside a list
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Manage users of a local store (requires --local)
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Poll for updates made by collaborators until interrupted
    Watch(WatchArgs),
    /// Show or change settings.toml
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum AuthCommand {
    Register(RegisterArgs),
    Login(LoginArgs),
    Logout,
    Whoami(WhoamiArgs),
}

#[derive(Debug, Clone, Subcommand)]
pub enum ListCommand {
    Ls,
    Show(ListSelectorArgs),
    Create(ListCreateArgs),
    Rename(ListRenameArgs),
    Delete(ListSelectorArgs),
    Invite(ListInviteArgs),
    Export(ListExportArgs),
}

#[derive(Debug, Clone, Subcommand)]
pub enum TaskCommand {
    Add(TaskAddArgs),
    Update(TaskUpdateArgs),
    Delete(TaskSelectorArgs),
    Move(TaskMoveArgs),
    Edit(TaskSelectorArgs),
}

#[derive(Debug, Clone, Subcommand)]
pub enum UserCommand {
    Add(UserAddArgs),
    Ls,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConfigCommand {
    Show,
    Set(ConfigSetArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ConfigSetArgs {
    /// server_url, poll_interval_ms, notification_backend or
    /// notification_display_duration_ms
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Args)]
pub struct RegisterArgs {
    pub email: String,
    /// Prompted for on stdin when omitted
    #[arg(long)]
    pub password: Option<String>,
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct LoginArgs {
    pub email: String,
    /// Prompted for on stdin when omitted
    #[arg(long)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct WhoamiArgs {
    /// Confirm the stored session with the service
    #[arg(long)]
    pub verify: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ListSelectorArgs {
    /// List id, unique id prefix, or exact name
    pub list: String,
}

#[derive(Debug, Clone, Args)]
pub struct ListCreateArgs {
    pub name: String,
    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ListRenameArgs {
    pub list: String,
    pub name: Option<String>,
    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ListInviteArgs {
    pub list: String,
    pub email: String,
}

#[derive(Debug, Clone, Args)]
pub struct ListExportArgs {
    pub list: String,
    /// Defaults to the list name with a .csv extension
    #[arg(long, short = 'o', value_name = "PATH", conflicts_with = "stdout")]
    pub output: Option<PathBuf>,
    #[arg(long)]
    pub stdout: bool,
}

#[derive(Debug, Clone, Args)]
pub struct TaskAddArgs {
    pub list: String,
    pub title: String,
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub deadline: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct TaskUpdateArgs {
    /// Task id or unique id prefix
    pub task: String,
    #[arg(long)]
    pub title: Option<String>,
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long, value_name = "YYYY-MM-DD", conflicts_with = "clear_deadline")]
    pub deadline: Option<String>,
    #[arg(long)]
    pub clear_deadline: bool,
}

#[derive(Debug, Clone, Args)]
pub struct TaskSelectorArgs {
    /// Task id or unique id prefix
    pub task: String,
}

#[derive(Debug, Clone, Args)]
pub struct TaskMoveArgs {
    pub task: String,
    /// up or down
    pub direction: String,
}

#[derive(Debug, Clone, Args)]
pub struct UserAddArgs {
    pub email: String,
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct WatchArgs {
    /// Overrides poll_interval_ms from settings
    #[arg(long, value_name = "MS")]
    pub interval_ms: Option<u64>,
    /// none, terminal, system or both; overrides settings
    #[arg(long, value_name = "BACKEND")]
    pub notify: Option<String>,
}

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    /// Run against this SQLite store instead of the service.
    pub local: Option<PathBuf>,
    /// Acting user's email for `local`.
    pub acting_as: Option<String>,
    /// Overrides the configured server URL.
    pub server: Option<String>,
    pub json: bool,
    pub quiet: bool,
}

pub async fn run(options: GlobalOptions, command: RootCommand) -> i32 {
    match execute(&options, command).await {
        Ok(output) => {
            print_success(output, options.json, options.quiet);
            0
        }
        Err(err) => {
            print_error(&err, options.json);
            err.exit_code
        }
    }
}

#[derive(Debug)]
struct CommandOutput {
    command: &'static str,
    target: String,
    data: Value,
    text: String,
}

#[derive(Debug)]
struct CliError {
    exit_code: i32,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

type CliResult<T> = Result<T, CliError>;

async fn execute(options: &GlobalOptions, command: RootCommand) -> CliResult<CommandOutput> {
    let command = match command {
        RootCommand::Config { command } => {
            let path = Settings::config_path()
                .ok_or_else(|| runtime_error("unable to determine config path"))?;
            return execute_config_command(&path, command);
        }
        other => other,
    };

    let mut settings = Settings::load();
    if let Some(server) = &options.server {
        settings.server_url = server.clone();
        settings.validate();
    }

    match &options.local {
        Some(db_path) => execute_local(options, db_path, &settings, command).await,
        None => execute_remote(options, &settings, command).await,
    }
}

async fn execute_local(
    options: &GlobalOptions,
    db_path: &Path,
    settings: &Settings,
    command: RootCommand,
) -> CliResult<CommandOutput> {
    let db = Database::open(db_path)
        .await
        .map_err(|err| runtime_error(format_anyhow_error_chain(&err)))?;
    let target = format!("local:{}", db_path.display());

    match command {
        RootCommand::User { command } => execute_user_command(&db, &target, command).await,
        RootCommand::Auth { .. } => Err(usage_error(
            "AUTH_UNAVAILABLE",
            "auth commands talk to the service; drop --local (use --as <EMAIL> instead)",
        )),
        other => {
            let email = options.acting_as.as_deref().ok_or_else(|| {
                usage_error("ACTING_USER_REQUIRED", "--local needs --as <EMAIL>")
            })?;
            let backend = LocalBackend::for_email(db, email)
                .await
                .map_err(backend_error)?;
            execute_with_backend(backend, &target, settings, options, other).await
        }
    }
}

async fn execute_remote(
    options: &GlobalOptions,
    settings: &Settings,
    command: RootCommand,
) -> CliResult<CommandOutput> {
    let store = SessionStore::open_default().map_err(|err| runtime_error(format_anyhow_error_chain(&err)))?;
    let target = settings.server_url.clone();

    match command {
        RootCommand::Auth { command } => execute_auth_command(settings, &store, command).await,
        RootCommand::User { .. } => Err(usage_error(
            "LOCAL_ONLY",
            "user management is only available with --local <DB>",
        )),
        other => {
            let session = store.load().ok_or_else(not_signed_in_error)?;
            if !session.server_url.is_empty() && session.server_url != settings.server_url {
                warn!(
                    session_server = %session.server_url,
                    server = %settings.server_url,
                    "stored session was issued by a different server"
                );
            }
            let client = ApiClient::new(&settings.server_url)
                .map_err(backend_error)?
                .with_session(session.token.clone(), session.auth_user());
            execute_with_backend(client, &target, settings, options, other).await
        }
    }
}

async fn execute_with_backend<B>(
    backend: B,
    target: &str,
    settings: &Settings,
    options: &GlobalOptions,
    command: RootCommand,
) -> CliResult<CommandOutput>
where
    B: TaskBackend + Clone + 'static,
{
    let output = match command {
        RootCommand::List { command } => execute_list_command(&backend, command).await?,
        RootCommand::Task { command } => execute_task_command(&backend, command).await?,
        RootCommand::Watch(args) => watch(backend, settings, options, args).await?,
        RootCommand::Auth { .. } | RootCommand::User { .. } | RootCommand::Config { .. } => {
            return Err(usage_error("UNSUPPORTED_COMMAND", "command not available for this backend"));
        }
    };

    Ok(CommandOutput {
        target: target.to_string(),
        ..output
    })
}

fn output(command: &'static str, data: Value, text: String) -> CommandOutput {
    CommandOutput {
        command,
        target: String::new(),
        data,
        text,
    }
}

async fn execute_auth_command(
    settings: &Settings,
    store: &SessionStore,
    command: AuthCommand,
) -> CliResult<CommandOutput> {
    let client = ApiClient::new(&settings.server_url).map_err(backend_error)?;
    let target = settings.server_url.clone();

    let result = match command {
        AuthCommand::Register(args) => {
            let password = resolve_password(args.password).await?;
            if password.chars().count() < MIN_PASSWORD_LEN {
                return Err(usage_error(
                    "PASSWORD_TOO_SHORT",
                    format!("password must be at least {MIN_PASSWORD_LEN} characters"),
                ));
            }
            let outcome = client
                .register(&args.email, &password, args.name.as_deref())
                .await
                .map_err(backend_error)?;
            store_session(store, settings, &outcome.token, outcome.auth_user())?;
            output(
                "auth.register",
                json!({ "user": outcome.user }),
                format!("registered and signed in as {}", outcome.user.email),
            )
        }
        AuthCommand::Login(args) => {
            let password = resolve_password(args.password).await?;
            let outcome = client
                .login(&args.email, &password)
                .await
                .map_err(backend_error)?;
            store_session(store, settings, &outcome.token, outcome.auth_user())?;
            output(
                "auth.login",
                json!({ "user": outcome.user }),
                format!("signed in as {}", outcome.user.email),
            )
        }
        AuthCommand::Logout => {
            let session = store.load();
            let client = match &session {
                Some(session) => client.with_session(session.token.clone(), session.auth_user()),
                None => client,
            };
            if let Err(err) = client.logout().await {
                warn!(error = %err, "service logout failed; clearing local session anyway");
            }
            let cleared = store
                .clear()
                .map_err(|err| runtime_error(format_anyhow_error_chain(&err)))?;
            let text = if cleared { "signed out" } else { "not signed in" };
            output("auth.logout", json!({ "cleared": cleared }), text.to_string())
        }
        AuthCommand::Whoami(args) => {
            let user = store.require_auth().ok_or_else(not_signed_in_error)?;
            if args.verify {
                let session = store.load().ok_or_else(not_signed_in_error)?;
                let verified = client
                    .with_session(session.token.clone(), user.clone())
                    .current_user()
                    .await
                    .map_err(backend_error)?;
                if verified.user_id != user.user_id {
                    return Err(conflict_error(
                        "SESSION_MISMATCH",
                        "stored session belongs to a different user; sign in again",
                        Some(json!({ "stored": user.user_id, "service": verified.user_id })),
                    ));
                }
            }
            output(
                "auth.whoami",
                json!({
                    "user_id": user.user_id,
                    "email": user.email,
                    "verified": args.verify
                }),
                format!("{} ({})", user.email, user.user_id),
            )
        }
    };

    Ok(CommandOutput { target, ..result })
}

fn store_session(
    store: &SessionStore,
    settings: &Settings,
    token: &str,
    user: AuthUser,
) -> CliResult<()> {
    let session = Session {
        token: token.to_string(),
        user_id: user.user_id,
        email: user.email,
        server_url: settings.server_url.clone(),
    };
    store
        .save(&session)
        .map_err(|err| runtime_error(format_anyhow_error_chain(&err)))?;
    info!(user_id = %session.user_id, "signed in");
    Ok(())
}

async fn resolve_password(password: Option<String>) -> CliResult<String> {
    if let Some(password) = password {
        return Ok(password);
    }

    eprint!("password: ");
    io::stderr().flush().map_err(runtime_error)?;
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).map(|_| line)
    })
    .await
    .map_err(runtime_error)?
    .map_err(runtime_error)?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        return Err(usage_error("PASSWORD_REQUIRED", "password cannot be empty"));
    }
    Ok(password)
}

async fn execute_user_command(db: &Database, target: &str, command: UserCommand) -> CliResult<CommandOutput> {
    let result = match command {
        UserCommand::Add(args) => {
            let user = db
                .create_user(&args.email, args.name.as_deref())
                .await
                .map_err(backend_error)?;
            output(
                "user.add",
                json!({ "user": user }),
                format!("created user {} ({})", user.email, short_id(&user.id)),
            )
        }
        UserCommand::Ls => {
            let users = db.list_users().await.map_err(backend_error)?;
            let rows = users
                .iter()
                .map(|user| {
                    vec![
                        short_id(&user.id),
                        user.email.clone(),
                        user.name.clone().unwrap_or_default(),
                    ]
                })
                .collect::<Vec<_>>();
            output(
                "user.ls",
                json!({ "users": users }),
                render_text_table(&["ID", "EMAIL", "NAME"], &rows),
            )
        }
    };

    Ok(CommandOutput {
        target: target.to_string(),
        ..result
    })
}

async fn execute_list_command<B: TaskBackend>(backend: &B, command: ListCommand) -> CliResult<CommandOutput> {
    match command {
        ListCommand::Ls => list_ls(backend).await,
        ListCommand::Show(args) => list_show(backend, &args.list).await,
        ListCommand::Create(args) => list_create(backend, args).await,
        ListCommand::Rename(args) => list_rename(backend, args).await,
        ListCommand::Delete(args) => list_delete(backend, &args.list).await,
        ListCommand::Invite(args) => list_invite(backend, args).await,
        ListCommand::Export(args) => list_export(backend, args).await,
    }
}

async fn execute_task_command<B: TaskBackend>(backend: &B, command: TaskCommand) -> CliResult<CommandOutput> {
    match command {
        TaskCommand::Add(args) => task_add(backend, args).await,
        TaskCommand::Update(args) => task_update(backend, args).await,
        TaskCommand::Delete(args) => task_delete(backend, &args.task).await,
        TaskCommand::Move(args) => task_move(backend, args).await,
        TaskCommand::Edit(args) => task_edit(backend, &args.task).await,
    }
}

async fn list_ls<B: TaskBackend>(backend: &B) -> CliResult<CommandOutput> {
    let user = backend.current_user().await.map_err(backend_error)?;
    let lists = backend.list_task_lists().await.map_err(backend_error)?;

    let rows = lists
        .iter()
        .map(|list| {
            let stats = list.stats();
            let role = if list.is_owner(&user.user_id) { "owner" } else { "collaborator" };
            vec![
                short_id(&list.id),
                list.name.replace('\n', " "),
                list.owner.email.clone(),
                role.to_string(),
                format!("{}/{}", stats.done, stats.total),
                list.updated_at.clone(),
            ]
        })
        .collect::<Vec<_>>();

    let text = if rows.is_empty() {
        "no task lists".to_string()
    } else {
        render_text_table(&["ID", "NAME", "OWNER", "ROLE", "DONE", "UPDATED"], &rows)
    };

    Ok(output("list.ls", json!({ "task_lists": lists }), text))
}

async fn list_show<B: TaskBackend>(backend: &B, selector: &str) -> CliResult<CommandOutput> {
    let lists = backend.list_task_lists().await.map_err(backend_error)?;
    let list_id = resolve_list_selector(&lists, selector)?.id.clone();
    let list = backend.get_task_list(&list_id).await.map_err(backend_error)?;
    let text = render_list_detail(&list);
    Ok(output("list.show", json!({ "task_list": list }), text))
}

async fn list_create<B: TaskBackend>(backend: &B, args: ListCreateArgs) -> CliResult<CommandOutput> {
    if args.name.trim().is_empty() {
        return Err(usage_error("LIST_NAME_REQUIRED", "list name cannot be empty"));
    }
    let list = backend
        .create_task_list(args.name.trim(), args.description.as_deref())
        .await
        .map_err(backend_error)?;
    let text = format!("created list {} ({})", list.name, short_id(&list.id));
    Ok(output("list.create", json!({ "task_list": list }), text))
}

async fn list_rename<B: TaskBackend>(backend: &B, args: ListRenameArgs) -> CliResult<CommandOutput> {
    if args.name.is_none() && args.description.is_none() {
        return Err(usage_error(
            "NOTHING_TO_UPDATE",
            "provide a new name and/or --description",
        ));
    }
    if args.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
        return Err(usage_error("LIST_NAME_REQUIRED", "list name cannot be empty"));
    }

    let lists = backend.list_task_lists().await.map_err(backend_error)?;
    let list_id = resolve_list_selector(&lists, &args.list)?.id.clone();
    let list = backend
        .update_task_list(&list_id, args.name.as_deref().map(str::trim), args.description.as_deref())
        .await
        .map_err(backend_error)?;
    let text = format!("updated list {} ({})", list.name, short_id(&list.id));
    Ok(output("list.rename", json!({ "task_list": list }), text))
}

async fn list_delete<B: TaskBackend>(backend: &B, selector: &str) -> CliResult<CommandOutput> {
    let lists = backend.list_task_lists().await.map_err(backend_error)?;
    let list = resolve_list_selector(&lists, selector)?;
    backend.delete_task_list(&list.id).await.map_err(backend_error)?;
    Ok(output(
        "list.delete",
        json!({ "id": list.id, "deleted": true }),
        format!("deleted list {} ({})", list.name, short_id(&list.id)),
    ))
}

async fn list_invite<B: TaskBackend>(backend: &B, args: ListInviteArgs) -> CliResult<CommandOutput> {
    let email = args.email.trim();
    if email.is_empty() {
        return Err(usage_error("EMAIL_REQUIRED", "collaborator email cannot be empty"));
    }

    let lists = backend.list_task_lists().await.map_err(backend_error)?;
    let list = resolve_list_selector(&lists, &args.list)?;
    let collaborator = backend
        .invite_collaborator(&list.id, email)
        .await
        .map_err(backend_error)?;
    Ok(output(
        "list.invite",
        json!({ "task_list_id": list.id, "collaborator": collaborator }),
        format!("invited {} to {}", email, list.name),
    ))
}

async fn list_export<B: TaskBackend>(backend: &B, args: ListExportArgs) -> CliResult<CommandOutput> {
    let lists = backend.list_task_lists().await.map_err(backend_error)?;
    let list = resolve_list_selector(&lists, &args.list)?;
    let csv = backend.export_csv(&list.id).await.map_err(backend_error)?;

    if args.stdout {
        return Ok(output(
            "list.export",
            json!({ "task_list_id": list.id, "csv": csv }),
            csv,
        ));
    }

    let path = args
        .output
        .unwrap_or_else(|| PathBuf::from(export_file_name(&list.name)));
    fs::write(&path, csv.as_bytes())
        .map_err(|err| runtime_error(format!("failed to write '{}': {err}", path.display())))?;
    info!(task_list_id = %list.id, path = %path.display(), "exported task list");

    Ok(output(
        "list.export",
        json!({
            "task_list_id": list.id,
            "path": path.display().to_string(),
            "bytes": csv.len()
        }),
        format!("exported {} to {}", list.name, path.display()),
    ))
}

async fn task_add<B: TaskBackend>(backend: &B, args: TaskAddArgs) -> CliResult<CommandOutput> {
    let title = args.title.trim();
    if title.is_empty() {
        return Err(usage_error("TASK_TITLE_REQUIRED", "task title cannot be empty"));
    }
    let status = args.status.as_deref().map(parse_status).transpose()?;
    let deadline = args.deadline.as_deref().map(parse_deadline).transpose()?;

    let lists = backend.list_task_lists().await.map_err(backend_error)?;
    let list = resolve_list_selector(&lists, &args.list)?;
    let task = backend
        .create_task(NewTask {
            title: title.to_string(),
            status,
            deadline,
            task_list_id: list.id.clone(),
        })
        .await
        .map_err(backend_error)?;

    let text = format!("added {} to {} ({})", task.title, list.name, short_id(&task.id));
    Ok(output("task.add", json!({ "task": task }), text))
}

async fn task_update<B: TaskBackend>(backend: &B, args: TaskUpdateArgs) -> CliResult<CommandOutput> {
    let patch = TaskPatch {
        title: match args.title.as_deref().map(str::trim) {
            Some("") => return Err(usage_error("TASK_TITLE_REQUIRED", "task title cannot be empty")),
            other => other.map(str::to_string),
        },
        status: args.status.as_deref().map(parse_status).transpose()?,
        deadline: if args.clear_deadline {
            Some(None)
        } else {
            args.deadline.as_deref().map(parse_deadline).transpose()?.map(Some)
        },
        order: None,
    };
    if patch.is_empty() {
        return Err(usage_error(
            "NOTHING_TO_UPDATE",
            "provide at least one of --title, --status, --deadline or --clear-deadline",
        ));
    }

    let lists = backend.list_task_lists().await.map_err(backend_error)?;
    let (_, task) = resolve_task_selector(&lists, &args.task)?;
    let updated = backend.update_task(&task.id, patch).await.map_err(backend_error)?;
    let text = render_task_line(&updated);
    Ok(output("task.update", json!({ "task": updated }), text))
}

async fn task_delete<B: TaskBackend>(backend: &B, selector: &str) -> CliResult<CommandOutput> {
    let lists = backend.list_task_lists().await.map_err(backend_error)?;
    let (_, task) = resolve_task_selector(&lists, selector)?;
    backend.delete_task(&task.id).await.map_err(backend_error)?;
    Ok(output(
        "task.delete",
        json!({ "id": task.id, "deleted": true }),
        format!("deleted task {} ({})", task.title, short_id(&task.id)),
    ))
}

async fn task_move<B: TaskBackend>(backend: &B, args: TaskMoveArgs) -> CliResult<CommandOutput> {
    let direction = args.direction.parse::<MoveDirection>().map_err(|_| {
        usage_error(
            "INVALID_DIRECTION",
            format!("unknown direction '{}'; use up or down", args.direction),
        )
    })?;

    let lists = backend.list_task_lists().await.map_err(backend_error)?;
    let (list, task) = resolve_task_selector(&lists, &args.task)?;
    let ordered = list.ordered_tasks();

    let outcome = move_task(backend, &task.id, direction, &ordered)
        .await
        .map_err(|err| match err {
            ReorderError::TaskNotFound(id) => not_found_error("TASK_NOT_FOUND", format!("task {id} not found")),
        })?;

    match outcome {
        MoveOutcome::Unchanged => Ok(output(
            "task.move",
            json!({ "id": task.id, "moved": false }),
            format!("{} is already at the {}", task.title, if direction == MoveDirection::Up { "top" } else { "bottom" }),
        )),
        MoveOutcome::Swapped { task_id, partner_id } => {
            let refreshed = refreshed_order(backend, &list.id).await;
            let mut text = format!("moved {} {}", task.title, direction);
            if let Some(tasks) = &refreshed {
                for (position, entry) in tasks.iter().enumerate() {
                    text.push_str(&format!("\n{:>3}. {}", position + 1, entry.title));
                }
            }
            Ok(output(
                "task.move",
                json!({
                    "id": task_id,
                    "moved": true,
                    "partner_id": partner_id,
                    "direction": direction.as_str(),
                    "order": refreshed.as_deref().map(order_json)
                }),
                text,
            ))
        }
        MoveOutcome::PartiallyApplied { task_id, partner_id, failed } => {
            let refreshed = refreshed_order(backend, &list.id).await;
            Err(CliError {
                exit_code: 5,
                code: "MOVE_PARTIALLY_APPLIED",
                message: format!(
                    "move of {} left {} of 2 order updates unapplied; the details hold the stored order",
                    short_id(&task_id),
                    failed.len()
                ),
                details: Some(json!({
                    "task_id": task_id,
                    "partner_id": partner_id,
                    "failed": failed
                        .iter()
                        .map(|failure| json!({ "task_id": failure.task_id, "code": failure.error.code(), "message": failure.error.to_string() }))
                        .collect::<Vec<_>>(),
                    "order": refreshed.as_deref().map(order_json)
                })),
            })
        }
    }
}

/// The list's stored order after a move, or `None` when the refresh fails.
async fn refreshed_order<B: TaskBackend>(backend: &B, list_id: &str) -> Option<Vec<TaskSnapshot>> {
    match backend.get_task_list(list_id).await {
        Ok(list) => Some(list.ordered_tasks()),
        Err(err) => {
            warn!(task_list_id = %list_id, error = %err, "failed to refresh list after move");
            None
        }
    }
}

fn order_json(tasks: &[TaskSnapshot]) -> Value {
    tasks
        .iter()
        .map(|task| json!({ "id": task.id, "title": task.title, "order": task.order }))
        .collect()
}

fn execute_config_command(path: &Path, command: ConfigCommand) -> CliResult<CommandOutput> {
    let mut settings = Settings::load_from_path(path);
    let result = match command {
        ConfigCommand::Show => output(
            "config.show",
            json!({ "settings": settings }),
            render_settings(&settings),
        ),
        ConfigCommand::Set(args) => {
            settings
                .set_value(&args.key, &args.value)
                .map_err(|err| usage_error("INVALID_SETTING", format_anyhow_error_chain(&err)))?;
            settings
                .save_to_path(path)
                .map_err(|err| runtime_error(format_anyhow_error_chain(&err)))?;
            info!(key = %args.key, path = %path.display(), "setting saved");
            output(
                "config.set",
                json!({ "key": args.key, "settings": settings }),
                format!("saved {}\n{}", path.display(), render_settings(&settings)),
            )
        }
    };

    Ok(CommandOutput {
        target: format!("config:{}", path.display()),
        ..result
    })
}

fn render_settings(settings: &Settings) -> String {
    format!(
        "server_url = {}\npoll_interval_ms = {}\nnotification_backend = {}\nnotification_display_duration_ms = {}",
        settings.server_url,
        settings.poll_interval_ms,
        settings.notification_backend,
        settings.notification_display_duration_ms
    )
}

async fn task_edit<B: TaskBackend>(backend: &B, selector: &str) -> CliResult<CommandOutput> {
    let lists = backend.list_task_lists().await.map_err(backend_error)?;
    let (_, task) = resolve_task_selector(&lists, selector)?;

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = io::stdout();
    let summary = edit::run_edit_session(backend, &task, stdin, &mut stdout)
        .await
        .map_err(|err| runtime_error(format_anyhow_error_chain(&err)))?;

    let text = match (summary.saves, summary.discarded_changes) {
        (0, true) => "left without saving; unsaved changes were discarded".to_string(),
        (0, false) => "no changes saved".to_string(),
        (saves, _) => format!("saved {saves} time(s)"),
    };
    Ok(output(
        "task.edit",
        json!({
            "id": task.id,
            "saves": summary.saves,
            "discarded_changes": summary.discarded_changes,
            "task": summary.last_saved,
            "draft": summary.final_draft
        }),
        text,
    ))
}

async fn watch<B>(
    backend: B,
    settings: &Settings,
    options: &GlobalOptions,
    args: WatchArgs,
) -> CliResult<CommandOutput>
where
    B: TaskBackend + Clone + 'static,
{
    let mut effective = settings.clone();
    if let Some(interval_ms) = args.interval_ms {
        effective.poll_interval_ms = interval_ms;
    }
    if let Some(raw) = &args.notify {
        let backend = raw.parse::<NotificationBackend>().map_err(|_| {
            usage_error(
                "INVALID_NOTIFICATION_BACKEND",
                format!("unknown notification backend '{raw}'; use none, terminal, system or both"),
            )
        })?;
        effective.notification_backend = backend.as_str().to_string();
    }
    effective.validate();

    let watch_options = WatchOptions {
        interval: effective.poll_interval(),
        notification_backend: effective.notification_backend(),
        notification_display_duration_ms: effective.notification_display_duration_ms,
    };

    if !options.quiet && !options.json {
        eprintln!(
            "watching every {} ms; press Ctrl-C to stop",
            effective.poll_interval_ms
        );
    }

    let json_output = options.json;
    let quiet = options.quiet;
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let summary = watch_task_lists(backend, watch_options, shutdown, |batch, center| {
        if quiet {
            return;
        }
        for entry in batch {
            if json_output {
                match serde_json::to_string(entry) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(error = %err, "failed to encode notification"),
                }
            } else {
                println!(
                    "[{}] {} by {}",
                    entry.updated_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.headline(),
                    entry.updated_by_label
                );
            }
        }
        if !json_output && let Some(badge) = center.badge_label() {
            println!("  unread: {badge}");
        }
    })
    .await
    .map_err(|err| match err.downcast::<BackendError>() {
        Ok(backend_err) => backend_error(backend_err),
        Err(other) => runtime_error(format_anyhow_error_chain(&other)),
    })?;

    Ok(output(
        "watch",
        json!({
            "snapshots": summary.snapshots,
            "notifications": summary.notifications,
            "unread": summary.unread
        }),
        format!(
            "stopped after {} snapshot(s); {} notification(s)",
            summary.snapshots, summary.notifications
        ),
    ))
}

fn render_list_detail(list: &TaskListSnapshot) -> String {
    let stats = list.stats();
    let mut lines = vec![
        format!("{} ({})", list.name, list.id),
        format!("owner: {}", list.owner.email),
    ];
    if let Some(description) = list.description.as_deref().filter(|text| !text.is_empty()) {
        lines.push(format!("description: {description}"));
    }
    let collaborators = list
        .collaborators
        .iter()
        .map(|collaborator| {
            collaborator
                .user
                .as_ref()
                .map(|user| user.email.clone())
                .unwrap_or_else(|| collaborator.user_id.clone())
        })
        .collect::<Vec<_>>();
    if !collaborators.is_empty() {
        lines.push(format!("collaborators: {}", collaborators.join(", ")));
    }
    lines.push(format!(
        "tasks: {} total, {} to do, {} in progress, {} done",
        stats.total, stats.todo, stats.in_progress, stats.done
    ));

    let rows = list
        .ordered_tasks()
        .iter()
        .map(|task| {
            vec![
                task.order.to_string(),
                short_id(&task.id),
                task.title.replace('\n', " "),
                task.status.label().to_string(),
                task.deadline_date()
                    .map(|day| day.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect::<Vec<_>>();
    if !rows.is_empty() {
        lines.push(render_text_table(&["#", "ID", "TITLE", "STATUS", "DEADLINE"], &rows));
    }

    lines.join("\n")
}

fn render_task_line(task: &TaskSnapshot) -> String {
    let deadline = task
        .deadline_date()
        .map(|day| format!(", due {}", day.format("%Y-%m-%d")))
        .unwrap_or_default();
    format!(
        "{} {} [{}{}]",
        short_id(&task.id),
        task.title,
        task.status.label(),
        deadline
    )
}

fn render_text_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths = headers
        .iter()
        .map(|header| header.chars().count())
        .collect::<Vec<_>>();

    for row in rows {
        for (index, cell) in row.iter().enumerate() {
            let width = cell.chars().count();
            if width > widths[index] {
                widths[index] = width;
            }
        }
    }

    let border = format!(
        "+{}+",
        widths
            .iter()
            .map(|width| "-".repeat(*width + 2))
            .collect::<Vec<_>>()
            .join("+")
    );
    let render_row = |cells: Vec<&str>| {
        format!(
            "| {} |",
            cells
                .iter()
                .enumerate()
                .map(|(index, cell)| format!("{cell:<width$}", width = widths[index]))
                .collect::<Vec<_>>()
                .join(" | ")
        )
    };

    let mut lines = vec![border.clone(), render_row(headers.to_vec()), border.clone()];
    for row in rows {
        lines.push(render_row(row.iter().map(String::as_str).collect()));
    }
    lines.push(border);
    lines.join("\n")
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn parse_status(raw: &str) -> CliResult<TaskStatus> {
    raw.parse::<TaskStatus>().map_err(|_| {
        usage_error(
            "INVALID_STATUS",
            format!("unknown status '{raw}'; use todo, in_progress or done"),
        )
    })
}

fn parse_deadline(raw: &str) -> CliResult<String> {
    parse_day(raw)
        .map(|day| day.format("%Y-%m-%d").to_string())
        .ok_or_else(|| usage_error("INVALID_DEADLINE", format!("invalid deadline '{raw}'; use YYYY-MM-DD")))
}

/// Resolves a full id, a unique id prefix, or an exact (case-insensitive) name.
fn resolve_list_selector<'a>(lists: &'a [TaskListSnapshot], selector: &str) -> CliResult<&'a TaskListSnapshot> {
    let trimmed = selector.trim();
    if trimmed.is_empty() {
        return Err(usage_error("LIST_REQUIRED", "list id or name cannot be empty"));
    }

    if let Some(exact) = lists.iter().find(|list| list.id == trimmed) {
        return Ok(exact);
    }

    let needle = trimmed.to_ascii_lowercase();
    let by_prefix = lists
        .iter()
        .filter(|list| list.id.to_ascii_lowercase().starts_with(&needle))
        .collect::<Vec<_>>();
    let matches = if by_prefix.is_empty() {
        lists
            .iter()
            .filter(|list| list.name.trim().eq_ignore_ascii_case(trimmed))
            .collect::<Vec<_>>()
    } else {
        by_prefix
    };

    match matches.as_slice() {
        [single] => Ok(*single),
        [] => Err(not_found_error(
            "LIST_NOT_FOUND",
            format!("task list '{selector}' not found"),
        )),
        many => Err(conflict_error(
            "LIST_AMBIGUOUS",
            format!(
                "'{}' matches {} task lists; use a longer id",
                selector,
                many.len()
            ),
            Some(json!({
                "matches": many.iter().map(|list| list.id.clone()).collect::<Vec<_>>()
            })),
        )),
    }
}

/// Finds a task by full id or unique id prefix across every visible list.
fn resolve_task_selector(
    lists: &[TaskListSnapshot],
    selector: &str,
) -> CliResult<(TaskListSnapshot, TaskSnapshot)> {
    let trimmed = selector.trim();
    if trimmed.is_empty() {
        return Err(usage_error("TASK_ID_REQUIRED", "task id cannot be empty"));
    }

    let needle = trimmed.to_ascii_lowercase();
    let mut seen = HashSet::new();
    let mut matches = Vec::new();
    for list in lists {
        for task in &list.tasks {
            let id = task.id.to_ascii_lowercase();
            if id == needle {
                return Ok((list.clone(), task.clone()));
            }
            if id.starts_with(&needle) && seen.insert(task.id.clone()) {
                matches.push((list, task));
            }
        }
    }

    match matches.as_slice() {
        [(list, task)] => Ok(((*list).clone(), (*task).clone())),
        [] => Err(not_found_error(
            "TASK_NOT_FOUND",
            format!("task '{selector}' not found"),
        )),
        many => Err(conflict_error(
            "TASK_ID_AMBIGUOUS",
            format!(
                "task id prefix '{}' matches {} tasks; use a longer id",
                selector,
                many.len()
            ),
            Some(json!({
                "matches": many.iter().map(|(_, task)| task.id.clone()).collect::<Vec<_>>()
            })),
        )),
    }
}

fn usage_error(code: &'static str, message: impl Into<String>) -> CliError {
    CliError {
        exit_code: 2,
        code,
        message: message.into(),
        details: None,
    }
}

fn not_found_error(code: &'static str, message: impl Into<String>) -> CliError {
    CliError {
        exit_code: 3,
        code,
        message: message.into(),
        details: None,
    }
}

fn conflict_error(
    code: &'static str,
    message: impl Into<String>,
    details: Option<Value>,
) -> CliError {
    CliError {
        exit_code: 4,
        code,
        message: message.into(),
        details,
    }
}

fn runtime_error(err: impl std::fmt::Display) -> CliError {
    CliError {
        exit_code: 5,
        code: "RUNTIME_ERROR",
        message: err.to_string(),
        details: None,
    }
}

fn not_signed_in_error() -> CliError {
    CliError {
        exit_code: 6,
        code: "UNAUTHORIZED",
        message: "not signed in; run `collab-tasks auth login <EMAIL>`".to_string(),
        details: None,
    }
}

fn backend_error(err: BackendError) -> CliError {
    match err {
        BackendError::Unauthorized => CliError {
            message: "session rejected by the service; run `collab-tasks auth login <EMAIL>`".to_string(),
            ..not_signed_in_error()
        },
        BackendError::Forbidden(message) => conflict_error("FORBIDDEN", message, None),
        BackendError::NotFound(message) => not_found_error("NOT_FOUND", message),
        BackendError::Validation(message) => usage_error("VALIDATION", message),
        BackendError::Conflict(message) => conflict_error("CONFLICT", message, None),
        other => CliError {
            code: other.code(),
            details: other
                .is_transient()
                .then(|| json!({ "transient": true })),
            ..runtime_error(&other)
        },
    }
}

fn print_success(output: CommandOutput, json_output: bool, quiet: bool) {
    if json_output {
        let payload = json!({
            "schema_version": SCHEMA_VERSION,
            "command": output.command,
            "target": output.target,
            "data": output.data
        });
        match serde_json::to_string_pretty(&payload) {
            Ok(value) => println!("{value}"),
            Err(_) => println!("{}", payload),
        }
        return;
    }

    if quiet {
        return;
    }

    if output.text.is_empty() {
        println!("ok");
    } else {
        println!("{}", output.text);
    }
}

fn print_error(err: &CliError, json_output: bool) {
    error!(
        code = err.code,
        message = %err.message,
        details = ?err.details,
        "cli command failed"
    );

    if json_output {
        let payload = json!({
            "schema_version": SCHEMA_VERSION,
            "error": {
                "code": err.code,
                "message": err.message,
                "details": err.details
            }
        });
        match serde_json::to_string_pretty(&payload) {
            Ok(value) => eprintln!("{value}"),
            Err(_) => eprintln!("{}", payload),
        }
        return;
    }

    eprintln!("error[{}]: {}", err.code, err.message);
}

fn format_anyhow_error_chain(err: &anyhow::Error) -> String {
    let mut seen = HashSet::new();
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        if seen.contains(&text) {
            continue;
        }
        seen.insert(text.clone());
        parts.push(text);
    }

    parts.join(": ")
}
