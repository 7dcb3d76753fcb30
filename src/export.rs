//! CSV export of a task list.

use crate::types::TaskSnapshot;

pub const CSV_HEADER: &str = "Title,Status,Deadline,Created At";

/// Renders tasks in `order` as CSV lines joined by `\n`, without a trailing
/// newline. Every field is quoted; a missing deadline is written as `-`.
pub fn render_csv(tasks: &[TaskSnapshot]) -> String {
    let mut ordered: Vec<&TaskSnapshot> = tasks.iter().collect();
    ordered.sort_by_key(|task| task.order);

    let mut lines = Vec::with_capacity(ordered.len() + 1);
    lines.push(CSV_HEADER.to_string());
    for task in ordered {
        lines.push(
            [
                task.title.as_str(),
                task.status.as_str(),
                task.deadline.as_deref().unwrap_or("-"),
                task.created_at.as_str(),
            ]
            .into_iter()
            .map(quote_field)
            .collect::<Vec<_>>()
            .join(","),
        );
    }
    lines.join("\n")
}

/// `Groceries (home)` -> `Groceries__home_.csv`
pub fn export_file_name(list_name: &str) -> String {
    let stem: String = list_name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    format!("{stem}.csv")
}

fn quote_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}
