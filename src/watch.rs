//! Poll the task lists, diff each fresh snapshot, and raise notifications.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, info};

use crate::backend::TaskBackend;
use crate::notification::{
    NotificationBackend, NotificationCenter, NotificationEntry, deliver_update_toast,
};
use crate::polling::Poller;
use crate::types::TaskListSnapshot;

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub interval: Duration,
    pub notification_backend: NotificationBackend,
    pub notification_display_duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSummary {
    /// Snapshots that were diffed.
    pub snapshots: u64,
    /// Notifications produced across all snapshots.
    pub notifications: usize,
    /// Unread count when the watch ended.
    pub unread: usize,
}

/// Runs until `shutdown` resolves. `on_batch` sees every non-empty batch
/// after the toast for it was raised.
///
/// Failed polls keep the previous snapshot and are retried at the next tick;
/// the poller logs them.
pub async fn watch_task_lists<B, S, F>(
    backend: B,
    options: WatchOptions,
    shutdown: S,
    mut on_batch: F,
) -> anyhow::Result<WatchSummary>
where
    B: TaskBackend + Clone + 'static,
    S: Future<Output = ()>,
    F: FnMut(&[NotificationEntry], &NotificationCenter),
{
    let user = backend
        .current_user()
        .await
        .context("failed to resolve the signed-in user")?;
    let mut center = NotificationCenter::new(user.user_id.clone(), Utc::now());

    let fetch_backend = backend.clone();
    let mut poller = Poller::new(
        move || {
            let backend = fetch_backend.clone();
            async move { backend.list_task_lists().await }
        },
        options.interval,
    );
    let mut updates = poller.subscribe();
    poller.set_enabled(true);

    info!(
        user_id = %user.user_id,
        interval_ms = poller.interval().as_millis() as u64,
        backend = options.notification_backend.as_str(),
        "watching task lists"
    );

    let mut summary = WatchSummary::default();
    let mut seen_version = 0;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }

                let lists: Vec<TaskListSnapshot> = {
                    let result = updates.borrow_and_update();
                    if result.data_version == seen_version {
                        continue;
                    }
                    seen_version = result.data_version;
                    match &result.data {
                        Some(lists) => lists.clone(),
                        None => continue,
                    }
                };

                let fresh = center.evaluate(&lists, Utc::now());
                summary.snapshots += 1;
                if fresh.is_empty() {
                    continue;
                }

                summary.notifications += fresh.len();
                deliver_update_toast(
                    &fresh,
                    options.notification_backend,
                    options.notification_display_duration_ms,
                );
                on_batch(&fresh, &center);
            }
        }
    }

    poller.set_enabled(false);
    summary.unread = center.unread();
    debug!(
        snapshots = summary.snapshots,
        notifications = summary.notifications,
        "watch stopped"
    );
    Ok(summary)
}
