//! Optional on-disk archive of a request's attempt history.
//!
//! At request end the orchestrator can persist an [`AttemptArchive`] to
//! `<dir>/<request_id>.json` so that every artifact and finding of the loop
//! can be inspected after the fact.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use pipewright_types::{Attempt, ContextSignature, Dialect, Result, TerminalStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptArchive {
    pub request_id: String,
    pub signature: ContextSignature,
    pub dialect: Dialect,
    pub status: TerminalStatus,
    pub template_ids: Vec<String>,
    pub attempts: Vec<Attempt>,
    /// RFC 3339 timestamp of when the archive was written.
    pub archived_at: String,
}

impl AttemptArchive {
    pub fn new(
        request_id: String,
        signature: ContextSignature,
        dialect: Dialect,
        status: TerminalStatus,
        template_ids: Vec<String>,
        attempts: Vec<Attempt>,
    ) -> Self {
        Self {
            request_id,
            signature,
            dialect,
            status,
            template_ids,
            attempts,
            archived_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn archive_path(dir: &Path, request_id: &str) -> PathBuf {
    dir.join(format!("{request_id}.json"))
}

/// Write `archive` under `dir`, creating the directory when needed.
pub async fn save_archive(archive: &AttemptArchive, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = archive_path(dir, &archive.request_id);
    let json = serde_json::to_string_pretty(archive)?;
    tokio::fs::write(&path, json).await?;
    tracing::debug!(path = %path.display(), "Attempt archive saved");
    Ok(path)
}

/// Load the archive for `request_id`; `Ok(None)` when none was written.
pub async fn load_archive(dir: &Path, request_id: &str) -> Result<Option<AttemptArchive>> {
    let path = archive_path(dir, request_id);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    Ok(Some(serde_json::from_str(&json)?))
}
