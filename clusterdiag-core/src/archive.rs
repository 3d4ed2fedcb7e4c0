//! Permanent storage for captured artifacts.
//!
//! Artifacts are moved out of instance-local scratch space into
//! `<root>/<SessionId>/<short>_<name>` and exposed through the virtual file
//! system as `https://<host>/api/vfs/<vfs_path>/<SessionId>/<short>_<name>`.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::LogFile;
use std::path::PathBuf;
use tokio::fs;

const VFS_PREFIX: &str = "api/vfs";

#[derive(Debug, Clone)]
pub struct ArtifactArchiver {
    root: PathBuf,
    host: String,
    vfs_path: String,
}

impl ArtifactArchiver {
    pub fn new(root: impl Into<PathBuf>, host: impl Into<String>, vfs_path: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            host: host.into(),
            vfs_path: vfs_path.into().trim_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.archive.root(&config.storage.root()),
            config.archive.host.clone(),
            config.archive.vfs_path.clone(),
        )
    }

    /// Directory holding one session's archived artifacts.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Externally reachable path for an archived file.
    pub fn reachable_path(&self, session_id: &str, archived_name: &str) -> String {
        let mut path = format!("https://{}/{}", self.host, VFS_PREFIX);
        if !self.vfs_path.is_empty() {
            path.push('/');
            path.push_str(&self.vfs_path);
        }
        format!("{}/{}/{}", path, session_id, archived_name)
    }

    /// Stamp, copy, and delete the scratch source of one artifact.
    ///
    /// The source is only removed after the copy succeeded.
    pub async fn archive(
        &self,
        session_id: &str,
        instance_short_id: &str,
        mut log: LogFile,
    ) -> Result<LogFile> {
        let name = log
            .file_name()
            .map(|n| n.to_string())
            .ok_or_else(|| {
                Error::Tool(format!("artifact has no file name: {}", log.full_path.display()))
            })?;

        let metadata = fs::metadata(&log.full_path).await?;
        log.size = metadata.len();
        log.name = name.clone();

        let archived_name = format!("{}_{}", instance_short_id, name);
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;
        fs::copy(&log.full_path, dir.join(&archived_name)).await?;

        if let Err(e) = fs::remove_file(&log.full_path).await {
            tracing::warn!(
                path = %log.full_path.display(),
                error = %e,
                "Archived artifact but could not delete scratch copy"
            );
        }

        log.relative_path = Some(self.reachable_path(session_id, &archived_name));
        tracing::debug!(
            session_id,
            artifact = %archived_name,
            size = log.size,
            "Artifact archived"
        );
        Ok(log)
    }
}
