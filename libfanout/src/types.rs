//! Core types for Fanout

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{DestinationError, FanoutError};

/// A unit of content to be delivered to a set of destinations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub content: String,
    /// Files that must be readable before any destination is attempted
    pub assets: Vec<String>,
    /// Destinations not yet successfully posted to
    pub pending_destinations: Vec<String>,
    pub status: SubmissionStatus,
    pub created_at: i64,
}

impl Submission {
    pub fn new(content: impl Into<String>, destinations: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            assets: Vec::new(),
            pending_destinations: normalize_destinations(destinations),
            status: SubmissionStatus::Queued,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_assets(mut self, assets: Vec<String>) -> Self {
        self.assets = assets;
        self
    }
}

/// Sort and deduplicate destination names so posting order is reproducible
pub fn normalize_destinations(mut destinations: Vec<String>) -> Vec<String> {
    destinations.retain(|d| !d.trim().is_empty());
    destinations.sort();
    destinations.dedup();
    destinations
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Queued,
    Posting,
    Posted,
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Queued => "queued",
            SubmissionStatus::Posting => "posting",
            SubmissionStatus::Posted => "posted",
            SubmissionStatus::Failed => "failed",
        }
    }
}

impl FromStr for SubmissionStatus {
    type Err = FanoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(SubmissionStatus::Queued),
            "posting" => Ok(SubmissionStatus::Posting),
            "posted" => Ok(SubmissionStatus::Posted),
            "failed" => Ok(SubmissionStatus::Failed),
            other => Err(FanoutError::InvalidInput(format!(
                "Unknown submission status: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one attempt against one destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub destination: String,
    pub success: bool,
    /// Identifier the destination assigned to the post, if it reported one
    pub remote_id: Option<String>,
    pub error: Option<DestinationError>,
    /// Milliseconds since the Unix epoch
    pub attempted_at: i64,
}

impl AttemptRecord {
    pub fn success(destination: impl Into<String>, remote_id: String, attempted_at: i64) -> Self {
        Self {
            destination: destination.into(),
            success: true,
            remote_id: Some(remote_id).filter(|id| !id.is_empty()),
            error: None,
            attempted_at,
        }
    }

    pub fn failure(error: DestinationError, attempted_at: i64) -> Self {
        Self {
            destination: error.destination.clone(),
            success: false,
            remote_id: None,
            error: Some(error),
            attempted_at,
        }
    }
}

/// Final outcome of one posting pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Every attempted destination succeeded
    Posted,
    /// At least one destination produced a failure record
    Failed,
    /// The pass was stopped before it finished; nothing unattempted is failed
    Stopped,
    /// Asset preparation failed, no destination was attempted
    Aborted,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Disposition::Posted => "posted",
            Disposition::Failed => "failed",
            Disposition::Stopped => "stopped",
            Disposition::Aborted => "aborted",
        };
        f.write_str(s)
    }
}
