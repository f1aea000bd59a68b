//! SQLite-backed store for Fanout

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{DbError, DestinationError, Result};
use crate::store::{
    verify_assets, FailureLogEntry, FailureLogger, KeyValueStore, SubmissionStore,
};
use crate::types::{AttemptRecord, Submission, SubmissionStatus};

const SUBMISSION_COLUMNS: &str =
    "id, content, assets, pending_destinations, status, created_at, queue_position";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    revision: Arc<watch::Sender<u64>>,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes work for SQLite URLs on every platform; mode=rwc creates the file
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));
        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        let (revision, _) = watch::channel(0);
        Ok(Self {
            pool,
            revision: Arc::new(revision),
        })
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Every stored submission, newest first, queued or not
    pub async fn list_submissions(&self, limit: usize) -> Result<Vec<Submission>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM submissions ORDER BY created_at DESC, rowid DESC LIMIT ?",
            SUBMISSION_COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_submission).collect()
    }

    /// Key-value entries whose key starts with `prefix`, sorted by key
    pub async fn kv_entries(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query(
            r#"
            SELECT key, value FROM kv
            WHERE key LIKE ? ESCAPE '\'
            ORDER BY key
            "#,
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| (r.get("key"), r.get("value")))
            .collect())
    }

    /// Most recent persisted failure logs, oldest first
    pub async fn failure_logs(&self, limit: usize) -> Result<Vec<FailureLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT channel, message, payload, created_at FROM (
                SELECT id, channel, message, payload, created_at
                FROM failure_logs ORDER BY id DESC LIMIT ?
            ) ORDER BY id ASC
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                Ok(FailureLogEntry {
                    channel: r.get("channel"),
                    message: r.get("message"),
                    payload: serde_json::from_str(&r.get::<String, _>("payload"))
                        .map_err(DbError::Decode)?,
                    created_at: r.get("created_at"),
                })
            })
            .collect()
    }
}

fn row_to_submission(row: &SqliteRow) -> Result<Submission> {
    let assets: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("assets")).map_err(DbError::Decode)?;
    let pending: Vec<String> = serde_json::from_str(&row.get::<String, _>("pending_destinations"))
        .map_err(DbError::Decode)?;
    let status: SubmissionStatus = row.get::<String, _>("status").parse()?;

    Ok(Submission {
        id: row.get("id"),
        content: row.get("content"),
        assets,
        pending_destinations: pending,
        status,
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl SubmissionStore for Database {
    async fn current_queue(&self) -> Result<Vec<Submission>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM submissions WHERE queue_position IS NOT NULL ORDER BY queue_position ASC",
            SUBMISSION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_submission).collect()
    }

    async fn get(&self, id: &str) -> Result<Option<Submission>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM submissions WHERE id = ?",
            SUBMISSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_submission).transpose()
    }

    async fn enqueue(&self, submission: &Submission) -> Result<()> {
        let assets = serde_json::to_string(&submission.assets).map_err(DbError::Decode)?;
        let pending =
            serde_json::to_string(&submission.pending_destinations).map_err(DbError::Decode)?;

        // An already queued submission keeps its position
        sqlx::query(
            r#"
            INSERT INTO submissions
                (id, content, assets, pending_destinations, status, created_at, queue_position)
            VALUES (?, ?, ?, ?, ?, ?,
                (SELECT COALESCE(MAX(queue_position), 0) + 1 FROM submissions))
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                assets = excluded.assets,
                pending_destinations = excluded.pending_destinations,
                status = excluded.status,
                queue_position = COALESCE(submissions.queue_position, excluded.queue_position)
            "#,
        )
        .bind(&submission.id)
        .bind(&submission.content)
        .bind(assets)
        .bind(pending)
        .bind(submission.status.as_str())
        .bind(submission.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        self.bump();
        Ok(())
    }

    async fn prepare_assets(&self, submission: &Submission) -> Result<()> {
        verify_assets(submission).await
    }

    async fn save(&self, submission: &Submission) -> Result<()> {
        let assets = serde_json::to_string(&submission.assets).map_err(DbError::Decode)?;
        let pending =
            serde_json::to_string(&submission.pending_destinations).map_err(DbError::Decode)?;

        sqlx::query(
            r#"
            INSERT INTO submissions
                (id, content, assets, pending_destinations, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                assets = excluded.assets,
                pending_destinations = excluded.pending_destinations,
                status = excluded.status
            "#,
        )
        .bind(&submission.id)
        .bind(&submission.content)
        .bind(assets)
        .bind(pending)
        .bind(submission.status.as_str())
        .bind(submission.created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        self.bump();
        Ok(())
    }

    async fn dequeue(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE submissions SET queue_position = NULL WHERE id = ? AND queue_position IS NOT NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let removed = result.rows_affected() > 0;
        if removed {
            self.bump();
        }
        Ok(removed)
    }

    async fn dequeue_all(&self) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE submissions SET queue_position = NULL WHERE queue_position IS NOT NULL",
        )
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        let removed = result.rows_affected() as usize;
        if removed > 0 {
            self.bump();
        }
        Ok(removed)
    }

    async fn record_attempts(&self, id: &str, attempts: &[AttemptRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        for attempt in attempts {
            let error = attempt
                .error
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(DbError::Decode)?;

            sqlx::query(
                r#"
                INSERT INTO attempt_records
                    (submission_id, destination, success, remote_id, error, attempted_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(&attempt.destination)
            .bind(attempt.success)
            .bind(&attempt.remote_id)
            .bind(error)
            .bind(attempt.attempted_at)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;
        }

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    async fn attempts(&self, id: &str) -> Result<Vec<AttemptRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT destination, success, remote_id, error, attempted_at
            FROM attempt_records
            WHERE submission_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter()
            .map(|r| {
                let error = r
                    .get::<Option<String>, _>("error")
                    .map(|raw| serde_json::from_str::<DestinationError>(&raw))
                    .transpose()
                    .map_err(DbError::Decode)?;
                Ok(AttemptRecord {
                    destination: r.get("destination"),
                    success: r.get("success"),
                    remote_id: r.get("remote_id"),
                    error,
                    attempted_at: r.get("attempted_at"),
                })
            })
            .collect()
    }

    async fn recover_interrupted(&self) -> Result<usize> {
        let result = sqlx::query("UPDATE submissions SET status = 'queued' WHERE status = 'posting'")
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() as usize)
    }

    fn queue_changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[async_trait]
impl KeyValueStore for Database {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }
}

#[async_trait]
impl FailureLogger for Database {
    async fn error(
        &self,
        channel: &str,
        payload: &DestinationError,
        message: &str,
        persist: bool,
    ) -> Result<()> {
        tracing::error!(
            channel,
            destination = %payload.destination,
            cause = %payload.cause,
            "{}",
            message
        );
        if !persist {
            return Ok(());
        }

        let json = serde_json::to_string(payload).map_err(DbError::Decode)?;
        sqlx::query(
            r#"
            INSERT INTO failure_logs (channel, message, payload, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(channel)
        .bind(message)
        .bind(json)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }
}
