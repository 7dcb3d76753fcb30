//! Toast delivery for terminal and desktop notifications.

use std::io::Write;
use std::str::FromStr;

use tracing::{debug, warn};

use super::NotificationEntry;

const TOAST_SUMMARY: &str = "New Update";

/// Notification backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationBackend {
    /// No toasts
    None,
    /// A highlighted line on stderr
    #[default]
    Terminal,
    /// Desktop notifications only (via notify-rust)
    System,
    /// Both terminal and desktop notifications
    Both,
}

impl NotificationBackend {
    /// Parse backend from settings value (case-insensitive)
    pub fn from_settings_value(s: &str) -> Option<Self> {
        Self::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Terminal => "terminal",
            Self::System => "system",
            Self::Both => "both",
        }
    }
}

impl FromStr for NotificationBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "terminal" | "term" => Ok(Self::Terminal),
            "system" | "desktop" => Ok(Self::System),
            "both" => Ok(Self::Both),
            _ => Err(()),
        }
    }
}

/// Raises one toast for the newest entry of a batch. Empty batches are a
/// no-op. The body mentions how many other lists changed in the same pass.
pub fn deliver_update_toast(
    batch: &[NotificationEntry],
    backend: NotificationBackend,
    notification_display_duration_ms: u64,
) {
    let Some(newest) = batch.first() else {
        return;
    };

    let (send_terminal, send_system) = backend_targets(backend);
    if !send_terminal && !send_system {
        debug!(task_list_id = %newest.task_list_id, "toast skipped (backend is none)");
        return;
    }

    let body = toast_body(batch);

    if send_terminal {
        send_terminal_toast(&body);
    }

    if send_system {
        send_system_notification(newest, &body, notification_display_duration_ms);
    }
}

fn toast_body(batch: &[NotificationEntry]) -> String {
    let headline = batch.first().map(NotificationEntry::headline).unwrap_or_default();
    match batch.len() {
        0 | 1 => headline,
        2 => format!("{headline} (and 1 other list)"),
        n => format!("{headline} (and {} other lists)", n - 1),
    }
}

fn backend_targets(backend: NotificationBackend) -> (bool, bool) {
    match backend {
        NotificationBackend::None => (false, false),
        NotificationBackend::Terminal => (true, false),
        NotificationBackend::System => (false, true),
        NotificationBackend::Both => (true, true),
    }
}

fn send_terminal_toast(body: &str) {
    let mut stderr = std::io::stderr().lock();
    if let Err(err) = writeln!(stderr, "\u{7}[{TOAST_SUMMARY}] {body}") {
        warn!(error = %err, "failed to write terminal toast");
    }
}

fn send_system_notification(newest: &NotificationEntry, body: &str, notification_display_duration_ms: u64) {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        let timeout_ms = notification_display_duration_ms.min(u32::MAX as u64) as u32;
        debug!(
            task_list_id = %newest.task_list_id,
            body = %body,
            timeout_ms,
            "sending system notification"
        );

        let notification_result = notify_rust::Notification::new()
            .summary(TOAST_SUMMARY)
            .body(body)
            .icon("dialog-information")
            .timeout(notify_rust::Timeout::Milliseconds(timeout_ms))
            .show();

        match notification_result {
            Ok(_) => {
                debug!(task_list_id = %newest.task_list_id, "system notification sent");
            }
            Err(err) => {
                warn!(error = %err, "failed to send system notification");
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = (body, notification_display_duration_ms);
        debug!(
            task_list_id = %newest.task_list_id,
            "system notifications not supported on this OS"
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn entry(name: &str) -> NotificationEntry {
        NotificationEntry {
            task_list_id: format!("id-{name}"),
            task_list_name: name.to_string(),
            updated_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid time"),
            updated_by: "alice".to_string(),
            updated_by_label: "alice@example.com".to_string(),
        }
    }

    #[test]
    fn test_notification_backend_from_str() {
        assert_eq!(
            NotificationBackend::from_settings_value("Terminal"),
            Some(NotificationBackend::Terminal)
        );
        assert_eq!(
            NotificationBackend::from_settings_value("SYSTEM"),
            Some(NotificationBackend::System)
        );
        assert_eq!(
            NotificationBackend::from_settings_value("desktop"),
            Some(NotificationBackend::System)
        );
        assert_eq!(
            NotificationBackend::from_settings_value(" both "),
            Some(NotificationBackend::Both)
        );
        assert_eq!(
            NotificationBackend::from_settings_value("None"),
            Some(NotificationBackend::None)
        );
        assert_eq!(NotificationBackend::from_settings_value("pager"), None);
        assert_eq!(NotificationBackend::from_settings_value(""), None);
    }

    #[test]
    fn test_as_str_parses_back() {
        for backend in [
            NotificationBackend::None,
            NotificationBackend::Terminal,
            NotificationBackend::System,
            NotificationBackend::Both,
        ] {
            assert_eq!(NotificationBackend::from_settings_value(backend.as_str()), Some(backend));
        }
    }

    #[test]
    fn test_backend_targets() {
        assert_eq!(backend_targets(NotificationBackend::None), (false, false));
        assert_eq!(backend_targets(NotificationBackend::Terminal), (true, false));
        assert_eq!(backend_targets(NotificationBackend::System), (false, true));
        assert_eq!(backend_targets(NotificationBackend::Both), (true, true));
    }

    #[test]
    fn test_toast_body_mentions_other_lists() {
        assert_eq!(toast_body(&[entry("Groceries")]), "Groceries has been updated");
        assert_eq!(
            toast_body(&[entry("Groceries"), entry("Chores")]),
            "Groceries has been updated (and 1 other list)"
        );
        assert_eq!(
            toast_body(&[entry("Groceries"), entry("Chores"), entry("Trip")]),
            "Groceries has been updated (and 2 other lists)"
        );
    }

    #[test]
    fn test_empty_batch_is_noop() {
        deliver_update_toast(&[], NotificationBackend::Both, 1_000);
    }
}
