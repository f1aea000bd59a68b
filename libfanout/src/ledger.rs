//! Rate limiting for destination attempts
//!
//! Every attempt against a destination, successful or not, stamps the
//! ledger. The next attempt against the same destination waits until the
//! destination's minimum interval has elapsed since that stamp.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;
use crate::store::KeyValueStore;

/// Key prefix for ledger entries in the key-value store
pub const LEDGER_PREFIX: &str = "lastPosted:";

pub const HALT_QUEUE_ON_FAILURE: &str = "haltQueueOnFailure";
pub const GENERATE_LOG_ON_FAILURE: &str = "generateLogOnFailure";

pub const DEFAULT_INTERVAL_MS: u64 = 500;
pub const FLOOR_DELAY_MS: u64 = 100;
pub const LONG_WAIT_THRESHOLD_MS: u64 = 60_000;

/// Destinations known to throttle aggressively
const BUILTIN_INTERVALS: &[(&str, u64)] = &[
    ("deviantart", 6_000),
    ("furaffinity", 20_500),
    ("pixiv", 10 * 60 * 1000),
];

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Minimum spacing between attempts, per destination
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalTable {
    default_ms: u64,
    floor_ms: u64,
    long_wait_ms: u64,
    overrides: HashMap<String, u64>,
}

impl Default for IntervalTable {
    fn default() -> Self {
        let overrides = BUILTIN_INTERVALS
            .iter()
            .map(|(name, ms)| (name.to_string(), *ms))
            .collect();
        Self {
            default_ms: DEFAULT_INTERVAL_MS,
            floor_ms: FLOOR_DELAY_MS,
            long_wait_ms: LONG_WAIT_THRESHOLD_MS,
            overrides,
        }
    }
}

impl IntervalTable {
    /// A table with no per-destination overrides
    pub fn uniform(default_ms: u64) -> Self {
        Self {
            default_ms,
            overrides: HashMap::new(),
            ..Self::default()
        }
    }

    /// Interval for destinations without an override
    pub fn with_default(mut self, default_ms: u64) -> Self {
        self.default_ms = default_ms;
        self
    }

    pub fn with_interval(mut self, destination: impl Into<String>, ms: u64) -> Self {
        self.overrides.insert(destination.into(), ms);
        self
    }

    pub fn with_floor(mut self, floor_ms: u64) -> Self {
        self.floor_ms = floor_ms;
        self
    }

    pub fn with_long_wait_threshold(mut self, ms: u64) -> Self {
        self.long_wait_ms = ms;
        self
    }

    pub fn min_interval(&self, destination: &str) -> u64 {
        self.overrides
            .get(destination)
            .copied()
            .unwrap_or(self.default_ms)
    }

    pub fn floor(&self) -> Duration {
        Duration::from_millis(self.floor_ms)
    }

    /// Waits at or above this are surfaced to observers as a resume time
    pub fn long_wait_threshold(&self) -> Duration {
        Duration::from_millis(self.long_wait_ms)
    }

    /// How long to wait before attempting `destination` at `now`.
    ///
    /// Never shorter than the floor delay, so an immediately-due destination
    /// still yields to the scheduler once.
    pub fn wait_for(&self, destination: &str, last_attempt: Option<i64>, now: i64) -> Duration {
        let Some(last) = last_attempt else {
            return self.floor();
        };
        let due = last.saturating_add(self.min_interval(destination) as i64);
        let remaining = due.saturating_sub(now);
        if remaining <= 0 {
            self.floor()
        } else {
            Duration::from_millis(remaining as u64).max(self.floor())
        }
    }
}

/// Persistent last-attempt timestamps, keyed by destination
#[derive(Clone)]
pub struct RateLimitLedger {
    kv: Arc<dyn KeyValueStore>,
}

impl RateLimitLedger {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(destination: &str) -> String {
        format!("{}{}", LEDGER_PREFIX, destination)
    }

    /// Timestamp of the most recent attempt, if any was ever recorded
    pub async fn last_attempt(&self, destination: &str) -> Result<Option<i64>> {
        let Some(raw) = self.kv.get(&Self::key(destination)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<i64>(&raw) {
            Ok(ts) => Ok(Some(ts)),
            Err(e) => {
                warn!(destination, value = %raw, "Ignoring unreadable ledger entry: {}", e);
                Ok(None)
            }
        }
    }

    /// Stamp an attempt. The stored value never moves backwards; the value
    /// actually stored is returned.
    pub async fn record(&self, destination: &str, at: i64) -> Result<i64> {
        let stamp = match self.last_attempt(destination).await? {
            Some(existing) if existing >= at => return Ok(existing),
            _ => at,
        };
        self.kv
            .set(&Self::key(destination), &stamp.to_string())
            .await?;
        Ok(stamp)
    }
}

/// Snapshot of the boolean settings the engine reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Clear the whole queue when a submission ends with a failed destination
    pub halt_queue_on_failure: bool,
    /// Persist a failure log entry for each failed attempt
    pub generate_log_on_failure: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            halt_queue_on_failure: true,
            generate_log_on_failure: true,
        }
    }
}

impl Settings {
    /// Read the settings. Absent or unreadable values count as enabled.
    pub async fn load(kv: &dyn KeyValueStore) -> Result<Self> {
        Ok(Self {
            halt_queue_on_failure: read_flag(kv, HALT_QUEUE_ON_FAILURE).await?,
            generate_log_on_failure: read_flag(kv, GENERATE_LOG_ON_FAILURE).await?,
        })
    }

    pub async fn set_flag(kv: &dyn KeyValueStore, key: &str, value: bool) -> Result<()> {
        kv.set(key, &value.to_string()).await
    }
}

async fn read_flag(kv: &dyn KeyValueStore, key: &str) -> Result<bool> {
    let Some(raw) = kv.get(key).await? else {
        return Ok(true);
    };
    match serde_json::from_str::<bool>(&raw) {
        Ok(value) => Ok(value),
        Err(_) => {
            warn!(key, value = %raw, "Unreadable setting, treating as enabled");
            Ok(true)
        }
    }
}
