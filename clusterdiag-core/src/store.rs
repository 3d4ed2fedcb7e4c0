//! File-backed session persistence
//!
//! Each [`Session`] lives in exactly one lifecycle directory under the shared
//! root:
//!
//! ```text
//! <root>/
//! ├── active/
//! │   ├── 20261018_101500123.json
//! │   └── 20261018_101500123.json.lock   (only inside a critical section)
//! └── completed/
//!     └── 20261017_093012001.json
//! ```
//!
//! Writes always replace the whole record. The store does no locking of its
//! own; callers must hold the session's lock before calling [`SessionStore::save`]
//! or [`SessionStore::move_to_completed`].

use crate::error::Result;
use crate::types::Session;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Which lifecycle directory a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Active,
    Completed,
}

impl SessionPhase {
    pub fn dir_name(&self) -> &'static str {
        match self {
            SessionPhase::Active => "active",
            SessionPhase::Completed => "completed",
        }
    }
}

/// Session records on the shared file system.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for a lifecycle phase.
    pub fn phase_dir(&self, phase: SessionPhase) -> PathBuf {
        self.root.join(phase.dir_name())
    }

    /// Path of a session record in the given phase.
    pub fn session_path(&self, phase: SessionPhase, session_id: &str) -> PathBuf {
        self.phase_dir(phase).join(Session::file_name(session_id))
    }

    /// List all readable records in one phase, sorted by session id.
    ///
    /// Unreadable or corrupt records are logged and skipped.
    pub async fn list(&self, phase: SessionPhase) -> Result<Vec<Session>> {
        let dir = self.phase_dir(phase);
        if !fs::try_exists(&dir).await? {
            return Ok(vec![]);
        }

        let pattern = format!(
            "{}/*.json",
            glob::Pattern::escape(&dir.to_string_lossy())
        );
        let entries = glob::glob(&pattern)
            .map_err(|e| crate::error::Error::Config(format!("invalid store path: {}", e)))?;

        let mut sessions = Vec::new();
        for path in entries.flatten() {
            match read_session(&path).await {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable session record"
                    );
                }
            }
        }

        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    /// Load one record, `None` if it is not in that phase.
    pub async fn load(&self, phase: SessionPhase, session_id: &str) -> Result<Option<Session>> {
        let path = self.session_path(phase, session_id);
        match read_session(&path).await {
            Ok(session) => Ok(Some(session)),
            Err(crate::error::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Write the full record, replacing any previous version.
    ///
    /// The record is written to a temporary sibling and renamed into place.
    pub async fn save(&self, phase: SessionPhase, session: &Session) -> Result<()> {
        let dir = self.phase_dir(phase);
        fs::create_dir_all(&dir).await?;

        let path = self.session_path(phase, &session.session_id);
        let tmp = dir.join(format!(
            ".{}.{}.tmp",
            Session::file_name(&session.session_id),
            uuid::Uuid::new_v4().simple()
        ));

        let bytes = serde_json::to_vec_pretty(session)?;
        fs::write(&tmp, &bytes).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Relocate a record from the active to the completed store.
    ///
    /// The final record is first rewritten in place, then moved with a single
    /// rename. Both directories share a file system, so at every instant the
    /// record is in exactly one store.
    pub async fn move_to_completed(&self, session: &Session) -> Result<()> {
        self.save(SessionPhase::Active, session).await?;

        fs::create_dir_all(self.phase_dir(SessionPhase::Completed)).await?;
        fs::rename(
            self.session_path(SessionPhase::Active, &session.session_id),
            self.session_path(SessionPhase::Completed, &session.session_id),
        )
        .await?;
        Ok(())
    }
}

async fn read_session(path: &Path) -> Result<Session> {
    let bytes = fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
