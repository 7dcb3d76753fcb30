use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::DEFAULT_BASE_URL;
use crate::notification::NotificationBackend;

const MIN_POLL_INTERVAL_MS: u64 = 1_000;
const MAX_POLL_INTERVAL_MS: u64 = 300_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;
const DEFAULT_NOTIFICATION_DISPLAY_DURATION_MS: u64 = 5_000;
const MAX_NOTIFICATION_DISPLAY_DURATION_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the task-list service, including the `/api` prefix.
    pub server_url: String,
    pub poll_interval_ms: u64,
    pub notification_backend: String,
    pub notification_display_duration_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_BASE_URL.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            notification_backend: NotificationBackend::default().as_str().to_string(),
            notification_display_duration_ms: DEFAULT_NOTIFICATION_DISPLAY_DURATION_MS,
        }
    }
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        let mut path = dirs::config_dir()?;
        path.push("collab-tasks");
        path.push("settings.toml");
        Some(path)
    }

    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Self>(&contents) {
                Ok(mut settings) => {
                    settings.validate();
                    settings
                }
                Err(error) => {
                    warn!(
                        "failed to parse settings config '{}': {}",
                        path.display(),
                        error
                    );
                    Self::default()
                }
            },
            Err(error) => {
                warn!(
                    "failed to read settings config '{}': {}",
                    path.display(),
                    error
                );
                Self::default()
            }
        }
    }

    pub fn save_to_path(&self, path: &Path) -> anyhow::Result<()> {
        let mut validated = self.clone();
        validated.validate();
        let contents =
            toml::to_string_pretty(&validated).context("failed to serialize settings to TOML")?;
        write_atomically(path, contents.as_bytes())
    }

    /// Sets one field by its TOML key (dashes accepted) and re-validates.
    pub fn set_value(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let value = value.trim();
        match key.trim().replace('-', "_").as_str() {
            "server_url" => self.server_url = value.to_string(),
            "poll_interval_ms" => {
                self.poll_interval_ms = value
                    .parse()
                    .with_context(|| format!("poll_interval_ms must be a number of milliseconds, got '{value}'"))?;
            }
            "notification_backend" => {
                let backend = NotificationBackend::from_settings_value(value)
                    .ok_or_else(|| anyhow!("unknown notification backend '{value}'; use none, terminal, system or both"))?;
                self.notification_backend = backend.as_str().to_string();
            }
            "notification_display_duration_ms" => {
                self.notification_display_duration_ms = value.parse().with_context(|| {
                    format!("notification_display_duration_ms must be a number of milliseconds, got '{value}'")
                })?;
            }
            other => bail!(
                "unknown setting '{other}'; use server_url, poll_interval_ms, notification_backend or notification_display_duration_ms"
            ),
        }
        self.validate();
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn notification_backend(&self) -> NotificationBackend {
        NotificationBackend::from_settings_value(&self.notification_backend).unwrap_or_default()
    }

    pub fn validate(&mut self) {
        self.poll_interval_ms = self
            .poll_interval_ms
            .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS);
        self.notification_display_duration_ms = self
            .notification_display_duration_ms
            .min(MAX_NOTIFICATION_DISPLAY_DURATION_MS);

        let trimmed = self.server_url.trim().trim_end_matches('/');
        self.server_url = if trimmed.is_empty() {
            warn!("empty server_url in settings config; falling back to {DEFAULT_BASE_URL}");
            DEFAULT_BASE_URL.to_string()
        } else {
            trimmed.to_string()
        };

        self.notification_backend =
            match NotificationBackend::from_settings_value(&self.notification_backend) {
                Some(backend) => backend.as_str().to_string(),
                None => {
                    let fallback = NotificationBackend::default();
                    warn!(
                        "invalid notification_backend '{}' in settings config; falling back to {}",
                        self.notification_backend,
                        fallback.as_str()
                    );
                    fallback.as_str().to_string()
                }
            };
    }
}

/// Writes through a sibling temp file and a rename, so readers never see a
/// half-written file.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("invalid config path '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create config directory '{}'", parent.display()))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("invalid config file name '{}'", path.display()))?
        .to_string_lossy()
        .to_string();
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    fs::write(&tmp_path, contents).with_context(|| {
        format!(
            "failed to write temporary file '{}'",
            tmp_path.display()
        )
    })?;
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to atomically rename '{}' to '{}'",
            tmp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
