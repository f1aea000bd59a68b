//! Post scheduling and delivery engine
//!
//! The engine decides what gets posted next, when, and what happens when a
//! destination fails. It is built from two pieces:
//!
//! - [`PostDriver`]: walks one submission through its pending destinations,
//!   one attempt at a time, spacing attempts with the rate-limit ledger.
//! - [`QueueOrchestrator`]: watches the queue, keeps at most one driver
//!   alive, stops it when its submission leaves the queue, and applies the
//!   halt-on-failure policy before advancing.
//!
//! Both receive their collaborators through an [`EngineContext`] rather than
//! reaching for globals.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use libfanout::destinations::DestinationRegistry;
//! use libfanout::engine::{EngineContext, QueueOrchestrator};
//! use libfanout::store::memory::MemoryStore;
//! use libfanout::IntervalTable;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> libfanout::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let ctx = EngineContext::builder(store.clone(), store.clone(), store.clone())
//!     .intervals(IntervalTable::default())
//!     .registry(DestinationRegistry::new())
//!     .build();
//!
//! let orchestrator = QueueOrchestrator::new(ctx);
//! let shutdown = CancellationToken::new();
//! orchestrator.run(shutdown, Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tracing::warn;

use crate::destinations::DestinationRegistry;
use crate::ledger::{IntervalTable, RateLimitLedger, Settings};
use crate::store::{FailureLogger, KeyValueStore, SubmissionStore};

pub mod driver;
pub mod events;
pub mod orchestrator;

pub use driver::{DriverHandle, DriverOutcome, DriverPhase, DriverProgress, PostDriver};
pub use events::{Event, EventBus, EventReceiver};
pub use orchestrator::QueueOrchestrator;

/// Everything the engine needs from the outside world
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn SubmissionStore>,
    pub kv: Arc<dyn KeyValueStore>,
    pub logger: Arc<dyn FailureLogger>,
    pub ledger: RateLimitLedger,
    pub intervals: Arc<IntervalTable>,
    pub registry: Arc<DestinationRegistry>,
    pub events: EventBus,
}

impl EngineContext {
    pub fn builder(
        store: Arc<dyn SubmissionStore>,
        kv: Arc<dyn KeyValueStore>,
        logger: Arc<dyn FailureLogger>,
    ) -> EngineContextBuilder {
        EngineContextBuilder {
            store,
            kv,
            logger,
            intervals: IntervalTable::default(),
            registry: DestinationRegistry::new(),
            events: None,
        }
    }

    /// Fresh settings snapshot. A store failure falls back to the defaults.
    pub async fn settings(&self) -> Settings {
        match Settings::load(self.kv.as_ref()).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to read settings, using defaults: {}", e);
                Settings::default()
            }
        }
    }
}

pub struct EngineContextBuilder {
    store: Arc<dyn SubmissionStore>,
    kv: Arc<dyn KeyValueStore>,
    logger: Arc<dyn FailureLogger>,
    intervals: IntervalTable,
    registry: DestinationRegistry,
    events: Option<EventBus>,
}

impl EngineContextBuilder {
    pub fn intervals(mut self, intervals: IntervalTable) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn registry(mut self, registry: DestinationRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> EngineContext {
        EngineContext {
            ledger: RateLimitLedger::new(Arc::clone(&self.kv)),
            store: self.store,
            kv: self.kv,
            logger: self.logger,
            intervals: Arc::new(self.intervals),
            registry: Arc::new(self.registry),
            events: self.events.unwrap_or_else(|| EventBus::new(100)),
        }
    }
}
