//! The signed-in user, persisted between invocations.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::settings::write_atomically;
use crate::types::AuthUser;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub email: String,
    /// Service the token was issued by.
    #[serde(default)]
    pub server_url: String,
}

impl Session {
    pub fn auth_user(&self) -> AuthUser {
        AuthUser {
            user_id: self.user_id.clone(),
            email: self.email.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Option<PathBuf> {
        let mut path = dirs::data_local_dir()?;
        path.push("collab-tasks");
        path.push("session.json");
        Some(path)
    }

    pub fn open_default() -> anyhow::Result<Self> {
        Self::default_path()
            .map(Self::new)
            .ok_or_else(|| anyhow!("unable to determine session path"))
    }

    pub fn load(&self) -> Option<Session> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("failed to read session '{}': {}", self.path.display(), err);
                return None;
            }
        };

        match serde_json::from_str::<Session>(&contents) {
            Ok(session) if !session.token.is_empty() => Some(session),
            Ok(_) => None,
            Err(err) => {
                warn!("ignoring malformed session '{}': {}", self.path.display(), err);
                None
            }
        }
    }

    /// The stored user, or `None` when nobody is signed in. Never fails.
    pub fn require_auth(&self) -> Option<AuthUser> {
        self.load().map(|session| session.auth_user())
    }

    pub fn save(&self, session: &Session) -> anyhow::Result<()> {
        let contents = serde_json::to_vec_pretty(session).context("failed to serialize session")?;
        write_atomically(&self.path, &contents)?;
        debug!(user_id = %session.user_id, "session saved");
        Ok(())
    }

    /// Returns whether a session existed.
    pub fn clear(&self) -> anyhow::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("failed to remove session '{}'", self.path.display())),
        }
    }
}
