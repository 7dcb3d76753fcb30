//! "List updated by someone else" notifications.
//!
//! [`diff_updates`] compares a fresh snapshot of task lists against the last
//! evaluation instant; [`NotificationCenter`] keeps the bounded queue and the
//! unread counter; [`delivery`] raises the toast through the configured
//! backend.

pub mod delivery;

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use crate::types::TaskListSnapshot;

pub use delivery::{NotificationBackend, deliver_update_toast};

/// Maximum number of entries kept in the queue.
pub const MAX_NOTIFICATIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEntry {
    pub task_list_id: String,
    pub task_list_name: String,
    pub updated_at: DateTime<Utc>,
    /// Id of the user who made the change.
    pub updated_by: String,
    /// Email of that user when the list knows it, else the raw id.
    pub updated_by_label: String,
}

impl NotificationEntry {
    pub fn headline(&self) -> String {
        format!("{} has been updated", self.task_list_name)
    }
}

/// Entries for lists changed by another user after `last_check`, newest first.
///
/// Lists whose `updated_at` is not RFC 3339 are skipped. A list id seen twice
/// in one snapshot only counts once.
pub fn diff_updates(
    last_check: DateTime<Utc>,
    current_user_id: &str,
    lists: &[TaskListSnapshot],
) -> Vec<NotificationEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for list in lists {
        if !seen.insert(list.id.as_str()) {
            continue;
        }

        let updated_at = match DateTime::parse_from_rfc3339(&list.updated_at) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(_) => {
                trace!(task_list_id = %list.id, updated_at = %list.updated_at, "skipping list with unparsable timestamp");
                continue;
            }
        };

        let author = list.updated_by.as_deref().unwrap_or(&list.owner_id);
        if author == current_user_id || updated_at <= last_check {
            continue;
        }

        entries.push(NotificationEntry {
            task_list_id: list.id.clone(),
            task_list_name: list.name.clone(),
            updated_at,
            updated_by: author.to_string(),
            updated_by_label: list.member_email(author).unwrap_or(author).to_string(),
        });
    }

    entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    entries
}

/// Per-user notification state: queue, unread counter and the last
/// evaluation instant.
#[derive(Debug, Clone)]
pub struct NotificationCenter {
    user_id: String,
    last_check: DateTime<Utc>,
    entries: VecDeque<NotificationEntry>,
    unread: usize,
}

impl NotificationCenter {
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            last_check: now,
            entries: VecDeque::with_capacity(MAX_NOTIFICATIONS),
            unread: 0,
        }
    }

    /// Diffs `lists` against the previous evaluation and queues the result.
    ///
    /// `last_check` moves to `now` even when nothing was produced, so an
    /// update made between the fetch and `now` is never reported.
    pub fn evaluate(&mut self, lists: &[TaskListSnapshot], now: DateTime<Utc>) -> Vec<NotificationEntry> {
        let fresh = diff_updates(self.last_check, &self.user_id, lists);

        for entry in fresh.iter().rev() {
            self.entries.push_front(entry.clone());
        }
        self.entries.truncate(MAX_NOTIFICATIONS);
        self.unread += fresh.len();
        self.last_check = now;

        debug!(
            user_id = %self.user_id,
            new_entries = fresh.len(),
            queued = self.entries.len(),
            unread = self.unread,
            "evaluated task list snapshot"
        );

        fresh
    }

    pub fn entries(&self) -> impl Iterator<Item = &NotificationEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unread(&self) -> usize {
        self.unread
    }

    pub fn last_check(&self) -> DateTime<Utc> {
        self.last_check
    }

    pub fn mark_read(&mut self) {
        self.unread = 0;
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.unread = 0;
    }

    /// Unread count for a compact badge; `None` when nothing is unread.
    pub fn badge_label(&self) -> Option<String> {
        match self.unread {
            0 => None,
            n if n > 9 => Some("9+".to_string()),
            n => Some(n.to_string()),
        }
    }
}
