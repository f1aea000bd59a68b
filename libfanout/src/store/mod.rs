//! Collaborator interfaces the engine consumes
//!
//! The engine never owns submission data, settings or the audit trail. It
//! talks to them through the three traits here:
//!
//! - [`SubmissionStore`]: the queue and the submissions in it
//! - [`KeyValueStore`]: rate-limit timestamps and boolean settings
//! - [`FailureLogger`]: the persisted failure report
//!
//! [`crate::db::Database`] implements all three on SQLite and
//! [`memory::MemoryStore`] implements them in memory.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::{DestinationError, FanoutError, Result};
use crate::types::{AttemptRecord, Submission};

pub mod memory;

/// Log channel used for failed destination attempts
pub const REPORT_CHANNEL: &str = "post-report";

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Submissions currently in the queue, head first
    async fn current_queue(&self) -> Result<Vec<Submission>>;

    /// Look up a submission whether or not it is queued
    async fn get(&self, id: &str) -> Result<Option<Submission>>;

    /// Insert the submission (or update it) and append it to the queue tail
    async fn enqueue(&self, submission: &Submission) -> Result<()>;

    /// Make sure everything the submission needs to be posted is loadable
    async fn prepare_assets(&self, submission: &Submission) -> Result<()>;

    /// Write back status and pending destinations
    async fn save(&self, submission: &Submission) -> Result<()>;

    /// Remove one submission from the queue. Returns false if it was not queued.
    async fn dequeue(&self, id: &str) -> Result<bool>;

    /// Remove every submission from the queue, returning how many were removed
    async fn dequeue_all(&self) -> Result<usize>;

    /// Append the attempt log of one posting pass
    async fn record_attempts(&self, id: &str, attempts: &[AttemptRecord]) -> Result<()>;

    /// Attempt history of a submission, oldest first
    async fn attempts(&self, id: &str) -> Result<Vec<AttemptRecord>>;

    /// Put submissions left in `posting` by an interrupted process back to `queued`
    async fn recover_interrupted(&self) -> Result<usize>;

    /// Revision counter bumped on every queue mutation made through this handle
    fn queue_changes(&self) -> watch::Receiver<u64>;
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

#[async_trait]
pub trait FailureLogger: Send + Sync {
    /// Record a failure. `persist = false` only traces it.
    async fn error(
        &self,
        channel: &str,
        payload: &DestinationError,
        message: &str,
        persist: bool,
    ) -> Result<()>;
}

/// A persisted failure log entry
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FailureLogEntry {
    pub channel: String,
    pub message: String,
    pub payload: DestinationError,
    pub created_at: i64,
}

/// Check that every asset of a submission exists and is a readable file
pub async fn verify_assets(submission: &Submission) -> Result<()> {
    for asset in &submission.assets {
        let path = shellexpand::tilde(asset).to_string();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| FanoutError::Assets(format!("{}: {}", asset, e)))?;
        if !metadata.is_file() {
            return Err(FanoutError::Assets(format!("{}: not a regular file", asset)));
        }
        // Opening catches permission problems that metadata does not
        tokio::fs::File::open(&path)
            .await
            .map_err(|e| FanoutError::Assets(format!("{}: {}", asset, e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_verify_assets_accepts_existing_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("art.png");
        std::fs::write(&path, b"png").unwrap();

        let submission = Submission::new("x", vec!["a".to_string()])
            .with_assets(vec![path.to_string_lossy().to_string()]);
        assert!(verify_assets(&submission).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_assets_rejects_missing_file() {
        let submission = Submission::new("x", vec!["a".to_string()])
            .with_assets(vec!["/definitely/not/here.png".to_string()]);
        let err = verify_assets(&submission).await.unwrap_err();
        assert!(matches!(err, FanoutError::Assets(_)));
        assert!(err.to_string().contains("/definitely/not/here.png"));
    }

    #[tokio::test]
    async fn test_verify_assets_rejects_directory() {
        let dir = TempDir::new().unwrap();
        let submission = Submission::new("x", vec!["a".to_string()])
            .with_assets(vec![dir.path().to_string_lossy().to_string()]);
        let err = verify_assets(&submission).await.unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }
}
