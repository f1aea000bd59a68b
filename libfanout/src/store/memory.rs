//! In-memory implementation of the store traits
//!
//! Used by the engine tests and by anything that wants to embed the
//! orchestrator without SQLite. State lives for as long as the store does.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{watch, Mutex};

use super::{verify_assets, FailureLogEntry, FailureLogger, KeyValueStore, SubmissionStore};
use crate::error::{DestinationError, Result};
use crate::types::{AttemptRecord, Submission, SubmissionStatus};

#[derive(Default)]
struct Inner {
    submissions: HashMap<String, Submission>,
    queue: Vec<String>,
    attempts: HashMap<String, Vec<AttemptRecord>>,
    kv: HashMap<String, String>,
    logs: Vec<FailureLogEntry>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    revision: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            revision,
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Persisted failure log entries, oldest first
    pub async fn failure_logs(&self) -> Vec<FailureLogEntry> {
        self.inner.lock().await.logs.clone()
    }

    /// Snapshot of every raw key-value pair
    pub async fn kv_snapshot(&self) -> HashMap<String, String> {
        self.inner.lock().await.kv.clone()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn current_queue(&self) -> Result<Vec<Submission>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queue
            .iter()
            .filter_map(|id| inner.submissions.get(id).cloned())
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Submission>> {
        Ok(self.inner.lock().await.submissions.get(id).cloned())
    }

    async fn enqueue(&self, submission: &Submission) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            inner
                .submissions
                .insert(submission.id.clone(), submission.clone());
            if !inner.queue.contains(&submission.id) {
                inner.queue.push(submission.id.clone());
            }
        }
        self.bump();
        Ok(())
    }

    async fn prepare_assets(&self, submission: &Submission) -> Result<()> {
        verify_assets(submission).await
    }

    async fn save(&self, submission: &Submission) -> Result<()> {
        self.inner
            .lock()
            .await
            .submissions
            .insert(submission.id.clone(), submission.clone());
        self.bump();
        Ok(())
    }

    async fn dequeue(&self, id: &str) -> Result<bool> {
        let removed = {
            let mut inner = self.inner.lock().await;
            let before = inner.queue.len();
            inner.queue.retain(|queued| queued != id);
            inner.queue.len() != before
        };
        if removed {
            self.bump();
        }
        Ok(removed)
    }

    async fn dequeue_all(&self) -> Result<usize> {
        let removed = std::mem::take(&mut self.inner.lock().await.queue).len();
        if removed > 0 {
            self.bump();
        }
        Ok(removed)
    }

    async fn record_attempts(&self, id: &str, attempts: &[AttemptRecord]) -> Result<()> {
        self.inner
            .lock()
            .await
            .attempts
            .entry(id.to_string())
            .or_default()
            .extend_from_slice(attempts);
        Ok(())
    }

    async fn attempts(&self, id: &str) -> Result<Vec<AttemptRecord>> {
        Ok(self
            .inner
            .lock()
            .await
            .attempts
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn recover_interrupted(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let mut recovered = 0;
        for submission in inner.submissions.values_mut() {
            if submission.status == SubmissionStatus::Posting {
                submission.status = SubmissionStatus::Queued;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    fn queue_changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().await.kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .await
            .kv
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl FailureLogger for MemoryStore {
    async fn error(
        &self,
        channel: &str,
        payload: &DestinationError,
        message: &str,
        persist: bool,
    ) -> Result<()> {
        tracing::error!(channel, destination = %payload.destination, cause = %payload.cause, "{}", message);
        if persist {
            self.inner.lock().await.logs.push(FailureLogEntry {
                channel: channel.to_string(),
                message: message.to_string(),
                payload: payload.clone(),
                created_at: chrono::Utc::now().timestamp(),
            });
        }
        Ok(())
    }
}
