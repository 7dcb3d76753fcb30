//! Line-oriented edit session for a single task (`task edit`).

use std::io::Write;

use anyhow::Context;
use chrono::NaiveDate;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::editor::{TaskDraft, TaskEditor};
use crate::reorder::TaskUpdater;
use crate::types::{TaskSnapshot, TaskStatus, parse_day};

const HELP: &str = "\
commands:
  title <TEXT>         set the title
  status <STATUS>      todo | in_progress | done
  deadline <DATE|none> YYYY-MM-DD, or none to clear
  show                 print the working copy
  save                 persist the working copy
  undo / redo          step through saved states
  quit                 leave (quit! drops unsaved changes)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EditCommand {
    Title(String),
    Status(TaskStatus),
    Deadline(Option<NaiveDate>),
    Show,
    Save,
    Undo,
    Redo,
    Help,
    Quit { force: bool },
}

pub(crate) fn parse_edit_command(line: &str) -> Result<EditCommand, String> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    match verb.to_ascii_lowercase().as_str() {
        "title" if rest.is_empty() => Err("title cannot be empty".to_string()),
        "title" => Ok(EditCommand::Title(rest.to_string())),
        "status" => rest
            .parse::<TaskStatus>()
            .map(EditCommand::Status)
            .map_err(|_| format!("unknown status '{rest}'; use todo, in_progress or done")),
        "deadline" => match rest.to_ascii_lowercase().as_str() {
            "" | "none" | "-" => Ok(EditCommand::Deadline(None)),
            _ => parse_day(rest)
                .map(|day| EditCommand::Deadline(Some(day)))
                .ok_or_else(|| format!("invalid date '{rest}'; use YYYY-MM-DD")),
        },
        "show" | "s" => Ok(EditCommand::Show),
        "save" | "w" => Ok(EditCommand::Save),
        "undo" | "u" => Ok(EditCommand::Undo),
        "redo" | "r" => Ok(EditCommand::Redo),
        "help" | "?" => Ok(EditCommand::Help),
        "quit" | "q" | "exit" => Ok(EditCommand::Quit { force: false }),
        "quit!" | "q!" => Ok(EditCommand::Quit { force: true }),
        "" => Err("empty command; type help".to_string()),
        other => Err(format!("unknown command '{other}'; type help")),
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EditSummary {
    pub saves: usize,
    pub last_saved: Option<TaskSnapshot>,
    pub discarded_changes: bool,
    pub final_draft: TaskDraft,
}

pub(crate) fn render_draft(editor: &TaskEditor, persisted: &TaskDraft) -> String {
    let draft = editor.working();
    let deadline = draft
        .deadline
        .map(|day| day.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".to_string());
    let mut state = Vec::new();
    if draft != persisted {
        state.push("unsaved changes".to_string());
    }
    if editor.can_undo() {
        state.push("undo available".to_string());
    }
    if editor.can_redo() {
        state.push("redo available".to_string());
    }

    let mut text = format!(
        "title:    {}\nstatus:   {}\ndeadline: {}",
        draft.title,
        draft.status.label(),
        deadline
    );
    if !state.is_empty() {
        text.push_str(&format!("\n[{}]", state.join(", ")));
    }
    text
}

/// Reads commands from `input` until `quit` or end of input. Save failures
/// are reported and the session continues. Waiting for input yields to the
/// runtime.
pub(crate) async fn run_edit_session<U, R, W>(
    updater: &U,
    task: &TaskSnapshot,
    input: R,
    output: &mut W,
) -> anyhow::Result<EditSummary>
where
    U: TaskUpdater,
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut editor = TaskEditor::new(task);
    // Undo and redo move the working copy away from what the store holds
    // without making the editor dirty, so track the stored state here.
    let mut persisted = editor.saved().clone();
    let mut saves = 0;
    let mut last_saved = None;

    writeln!(output, "{}", render_draft(&editor, &persisted)).context("failed to write prompt")?;
    writeln!(output, "type help for commands").context("failed to write prompt")?;

    let mut lines = input.lines();
    loop {
        write!(output, "edit> ").context("failed to write prompt")?;
        output.flush().context("failed to flush prompt")?;

        let Some(line) = lines.next_line().await.context("failed to read command")? else {
            writeln!(output).context("failed to write output")?;
            break;
        };

        let command = match parse_edit_command(&line) {
            Ok(command) => command,
            Err(message) => {
                writeln!(output, "{message}").context("failed to write output")?;
                continue;
            }
        };

        let reply = match command {
            EditCommand::Title(title) => {
                editor.set_title(title);
                render_draft(&editor, &persisted)
            }
            EditCommand::Status(status) => {
                editor.set_status(status);
                render_draft(&editor, &persisted)
            }
            EditCommand::Deadline(deadline) => {
                editor.set_deadline(deadline);
                render_draft(&editor, &persisted)
            }
            EditCommand::Show => render_draft(&editor, &persisted),
            EditCommand::Help => HELP.to_string(),
            EditCommand::Save if *editor.working() == persisted => "nothing to save".to_string(),
            EditCommand::Save => match editor.save(updater).await {
                Ok(saved) => {
                    persisted = editor.saved().clone();
                    saves += 1;
                    last_saved = Some(saved);
                    format!("saved\n{}", render_draft(&editor, &persisted))
                }
                Err(err) => format!("save failed: {err}"),
            },
            EditCommand::Undo => {
                if editor.undo() {
                    format!("reverted to the previous saved state; save to apply\n{}", render_draft(&editor, &persisted))
                } else {
                    "nothing to undo".to_string()
                }
            }
            EditCommand::Redo => {
                if editor.redo() {
                    format!("restored the next saved state; save to apply\n{}", render_draft(&editor, &persisted))
                } else {
                    "nothing to redo".to_string()
                }
            }
            EditCommand::Quit { force: false } if *editor.working() != persisted => {
                "unsaved changes; save first or use quit! to discard them".to_string()
            }
            EditCommand::Quit { .. } => break,
        };
        writeln!(output, "{reply}").context("failed to write output")?;
    }

    Ok(EditSummary {
        saves,
        last_saved,
        discarded_changes: *editor.working() != persisted,
        final_draft: editor.working().clone(),
    })
}
