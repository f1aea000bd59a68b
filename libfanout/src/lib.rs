//! Fanout - sequential multi-destination publishing
//!
//! This library provides the scheduling and delivery engine that posts one
//! submission at a time to many destinations, spacing attempts per
//! destination and deciding what happens to the queue when a post fails.

pub mod config;
pub mod db;
pub mod destinations;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use engine::{EngineContext, PostDriver, QueueOrchestrator};
pub use error::{DestinationError, FanoutError, Result};
pub use ledger::{IntervalTable, RateLimitLedger, Settings};
pub use types::{AttemptRecord, Disposition, Submission, SubmissionStatus};
