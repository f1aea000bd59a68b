//! Queue orchestrator
//!
//! Owns the single active-driver slot. The slot is filled from the head of
//! the queue, emptied by the completion handler, and refilled only after the
//! finished submission has been written back, so two drivers never overlap.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::driver::{DriverHandle, DriverOutcome, PostDriver};
use super::events::{Event, EventReceiver};
use super::EngineContext;
use crate::error::Result;
use crate::ledger::Settings;
use crate::types::{Disposition, Submission, SubmissionStatus};

/// Why the orchestrator stopped the active driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    /// The submission left the queue
    Removed,
    /// The process is shutting down; the submission stays queued
    Shutdown,
}

struct ActiveDriver {
    handle: DriverHandle,
    /// The submission as it was before being marked posting
    submission: Submission,
    settings: Settings,
    task: JoinHandle<DriverOutcome>,
    stop_reason: Option<StopReason>,
}

enum Wake {
    Shutdown,
    Finished(std::result::Result<DriverOutcome, JoinError>),
    QueueChanged,
    ChangesClosed,
    Tick,
}

pub struct QueueOrchestrator {
    ctx: EngineContext,
    queue: VecDeque<Submission>,
    active: Option<ActiveDriver>,
    active_tx: watch::Sender<Option<DriverHandle>>,
}

impl QueueOrchestrator {
    pub fn new(ctx: EngineContext) -> Self {
        let (active_tx, _) = watch::channel(None);
        Self {
            ctx,
            queue: VecDeque::new(),
            active: None,
            active_tx,
        }
    }

    /// Stream of the active driver; fires on every advance and release
    pub fn subscribe_active(&self) -> watch::Receiver<Option<DriverHandle>> {
        self.active_tx.subscribe()
    }

    pub fn active(&self) -> Option<DriverHandle> {
        self.active.as_ref().map(|active| active.handle.clone())
    }

    /// Engine events
    pub fn subscribe(&self) -> EventReceiver {
        self.ctx.events.subscribe()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    /// React to a new view of the queue.
    ///
    /// With no active driver the head is started. An active driver whose
    /// submission is no longer queued is stopped; cleanup happens when it
    /// completes.
    pub async fn on_queue_changed(&mut self, current: Vec<Submission>) {
        let active_id = self
            .active
            .as_ref()
            .map(|active| active.submission.id.clone());

        if let Some(id) = &active_id {
            if !current.iter().any(|s| &s.id == id) {
                self.stop_active(StopReason::Removed);
            }
        }

        self.queue = current
            .into_iter()
            .filter(|s| Some(&s.id) != active_id.as_ref())
            .collect();

        if self.active.is_none() {
            self.begin_next().await;
        }
    }

    /// Start a driver for the queue head. Returns false when the slot is
    /// taken or the queue is empty.
    pub async fn begin_next(&mut self) -> bool {
        if self.active.is_some() {
            return false;
        }
        let Some(submission) = self.queue.pop_front() else {
            return false;
        };

        let settings = self.ctx.settings().await;

        let mut posting = submission.clone();
        posting.status = SubmissionStatus::Posting;
        if let Err(e) = self.ctx.store.save(&posting).await {
            warn!(submission = %submission.id, "Failed to mark submission as posting: {}", e);
        }

        let driver = PostDriver::new(submission.clone(), self.ctx.clone(), settings);
        let destinations = driver.pending_destinations();

        info!(
            submission = %submission.id,
            destinations = destinations.len(),
            "Beginning submission"
        );
        self.ctx.events.emit(Event::SubmissionStarted {
            submission_id: submission.id.clone(),
            destinations,
        });

        let handle = driver.handle();
        let task = tokio::spawn(driver.run());

        self.active = Some(ActiveDriver {
            handle: handle.clone(),
            submission,
            settings,
            task,
            stop_reason: None,
        });
        self.active_tx.send_replace(Some(handle));
        true
    }

    /// Re-read the queue from the store
    pub async fn refresh(&mut self) {
        match self.ctx.store.current_queue().await {
            Ok(current) => self.on_queue_changed(current).await,
            Err(e) => warn!("Failed to read queue: {}", e),
        }
    }

    /// Process the queue until shutdown is requested.
    ///
    /// Queue changes made through the same store are picked up immediately;
    /// `poll` bounds how long changes made elsewhere (another process on the
    /// same database) go unnoticed.
    pub async fn run(mut self, shutdown: CancellationToken, poll: Duration) -> Result<()> {
        self.drive(shutdown, poll, false).await
    }

    /// Process the queue until it is empty or shutdown is requested
    pub async fn run_until_idle(&mut self, shutdown: CancellationToken, poll: Duration) -> Result<()> {
        self.drive(shutdown, poll, true).await
    }

    async fn drive(&mut self, shutdown: CancellationToken, poll: Duration, until_idle: bool) -> Result<()> {
        let mut changes = self.ctx.store.queue_changes();
        changes.borrow_and_update();
        let mut changes_open = true;

        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut stopping = false;
        if !shutdown.is_cancelled() {
            self.refresh().await;
        }

        loop {
            if self.active.is_none() && (stopping || shutdown.is_cancelled() || until_idle) {
                break;
            }

            let wake = tokio::select! {
                biased;
                _ = shutdown.cancelled(), if !stopping => Wake::Shutdown,
                result = join_active(&mut self.active) => Wake::Finished(result),
                changed = changes.changed(), if changes_open && !stopping => match changed {
                    Ok(()) => Wake::QueueChanged,
                    Err(_) => Wake::ChangesClosed,
                },
                _ = ticker.tick(), if !stopping => Wake::Tick,
            };

            match wake {
                Wake::Shutdown => {
                    info!("Shutdown requested, stopping active driver");
                    stopping = true;
                    self.stop_active(StopReason::Shutdown);
                }
                Wake::Finished(result) => {
                    self.complete(result).await;
                    if !stopping {
                        self.refresh().await;
                    }
                }
                Wake::QueueChanged => {
                    changes.borrow_and_update();
                    debug!("Queue changed");
                    self.refresh().await;
                }
                Wake::ChangesClosed => {
                    changes_open = false;
                }
                Wake::Tick => self.refresh().await,
            }
        }

        self.queue.clear();
        Ok(())
    }

    fn stop_active(&mut self, reason: StopReason) {
        if let Some(active) = self.active.as_mut() {
            if active.stop_reason.is_none() {
                info!(submission = %active.submission.id, ?reason, "Stopping active driver");
                active.stop_reason = Some(reason);
            }
            active.handle.stop();
        }
    }

    /// Completion handler. Persists the pass, applies the halt policy and
    /// releases the slot.
    async fn complete(&mut self, result: std::result::Result<DriverOutcome, JoinError>) {
        let Some(active) = self.active.take() else {
            return;
        };
        let id = active.submission.id.clone();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(submission = %id, "Driver task failed: {}", e);
                // Put the submission back the way it was and skip it
                self.persist(&active.submission).await;
                self.dequeue(&id).await;
                self.active_tx.send_replace(None);
                return;
            }
        };

        if !outcome.attempts.is_empty() {
            if let Err(e) = self.ctx.store.record_attempts(&id, &outcome.attempts).await {
                warn!(submission = %id, "Failed to record attempts: {}", e);
            }
        }

        self.persist(&outcome.submission).await;

        match (outcome.disposition, active.stop_reason) {
            (Disposition::Stopped, Some(StopReason::Shutdown)) => {
                debug!(submission = %id, "Left in queue for the next run");
            }
            (Disposition::Aborted, _) => {
                warn!(
                    submission = %id,
                    "Skipping submission, assets could not be loaded: {}",
                    outcome.asset_error.as_deref().unwrap_or("unknown error")
                );
                self.dequeue(&id).await;
            }
            (Disposition::Failed, _) if active.settings.halt_queue_on_failure => {
                self.dequeue(&id).await;
                self.halt_queue(&id).await;
            }
            _ => {
                self.dequeue(&id).await;
            }
        }

        self.ctx.events.emit(Event::SubmissionCompleted {
            submission_id: id,
            disposition: outcome.disposition,
            attempts: outcome.attempts,
            pending: outcome.submission.pending_destinations,
        });

        self.active_tx.send_replace(None);
    }

    async fn halt_queue(&mut self, failed_id: &str) {
        let cleared = match self.ctx.store.dequeue_all().await {
            Ok(cleared) => cleared,
            Err(e) => {
                warn!("Failed to clear queue: {}", e);
                0
            }
        };
        self.queue.clear();
        warn!(submission = %failed_id, cleared, "Post failed, queue halted");
        self.ctx.events.emit(Event::QueueHalted {
            submission_id: failed_id.to_string(),
            cleared,
        });
    }

    async fn persist(&self, submission: &Submission) {
        if let Err(e) = self.ctx.store.save(submission).await {
            warn!(submission = %submission.id, "Failed to save submission: {}", e);
        }
    }

    async fn dequeue(&self, id: &str) {
        if let Err(e) = self.ctx.store.dequeue(id).await {
            warn!(submission = %id, "Failed to remove submission from queue: {}", e);
        }
    }
}

/// Resolves when the active driver finishes; pends forever when idle
async fn join_active(
    active: &mut Option<ActiveDriver>,
) -> std::result::Result<DriverOutcome, JoinError> {
    match active {
        Some(active) => (&mut active.task).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destinations::mock::MockDestination;
    use crate::destinations::DestinationRegistry;
    use crate::ledger::{now_millis, IntervalTable, HALT_QUEUE_ON_FAILURE};
    use crate::store::memory::MemoryStore;
    use crate::store::{KeyValueStore, SubmissionStore};
    use std::sync::Arc;

    const POLL: Duration = Duration::from_secs(60);

    fn context(store: &Arc<MemoryStore>, adapters: Vec<MockDestination>) -> EngineContext {
        let mut registry = DestinationRegistry::new();
        for adapter in adapters {
            registry.register(Arc::new(adapter));
        }
        EngineContext::builder(store.clone(), store.clone(), store.clone())
            .intervals(
                IntervalTable::uniform(20)
                    .with_interval("slow", 60_000)
                    .with_floor(5),
            )
            .registry(registry)
            .build()
    }

    async fn enqueue(store: &MemoryStore, destinations: &[&str]) -> Submission {
        let submission = Submission::new(
            "content",
            destinations.iter().map(|d| d.to_string()).collect(),
        );
        store.enqueue(&submission).await.unwrap();
        submission
    }

    async fn stored(store: &MemoryStore, id: &str) -> Submission {
        SubmissionStore::get(store, id).await.unwrap().unwrap()
    }

    async fn wait_for_event<F>(events: &mut EventReceiver, mut matches: F) -> Event
    where
        F: FnMut(&Event) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_drains_queue_in_order() {
        let store = Arc::new(MemoryStore::new());
        let a = MockDestination::success("a");
        let first = enqueue(&store, &["a"]).await;
        let second = enqueue(&store, &["a"]).await;

        let mut orchestrator = QueueOrchestrator::new(context(&store, vec![a.clone()]));
        orchestrator
            .run_until_idle(CancellationToken::new(), POLL)
            .await
            .unwrap();

        let order: Vec<_> = a.calls().into_iter().map(|c| c.submission_id).collect();
        assert_eq!(order, vec![first.id.clone(), second.id.clone()]);
        assert!(store.current_queue().await.unwrap().is_empty());
        assert_eq!(stored(&store, &first.id).await.status, SubmissionStatus::Posted);
        assert_eq!(stored(&store, &second.id).await.status, SubmissionStatus::Posted);
        assert_eq!(store.attempts(&first.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_started_event_lists_destinations_in_attempt_order() {
        let store = Arc::new(MemoryStore::new());
        let mut submission = Submission::new("content", vec![]);
        submission.pending_destinations =
            vec!["b".to_string(), "a".to_string(), "b".to_string()];
        store.enqueue(&submission).await.unwrap();

        let mut orchestrator = QueueOrchestrator::new(context(
            &store,
            vec![MockDestination::success("a"), MockDestination::success("b")],
        ));
        let mut events = orchestrator.subscribe();
        orchestrator
            .run_until_idle(CancellationToken::new(), POLL)
            .await
            .unwrap();

        let started = wait_for_event(&mut events, |e| matches!(e, Event::SubmissionStarted { .. })).await;
        let Event::SubmissionStarted { destinations, .. } = started else {
            unreachable!()
        };
        assert_eq!(destinations, vec!["a", "b"]);

        let attempted: Vec<_> = store
            .attempts(&submission.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.destination)
            .collect();
        assert_eq!(attempted, destinations);
    }

    #[tokio::test]
    async fn test_failure_with_halt_clears_queue() {
        let store = Arc::new(MemoryStore::new());
        let first = enqueue(&store, &["a", "b"]).await;
        let second = enqueue(&store, &["a"]).await;

        let mut orchestrator = QueueOrchestrator::new(context(
            &store,
            vec![
                MockDestination::success("a"),
                MockDestination::failure("b", "HTTP 500"),
            ],
        ));
        let mut events = orchestrator.subscribe();
        orchestrator
            .run_until_idle(CancellationToken::new(), POLL)
            .await
            .unwrap();

        let failed = stored(&store, &first.id).await;
        assert_eq!(failed.status, SubmissionStatus::Failed);
        assert_eq!(failed.pending_destinations, vec!["b"]);
        assert!(store.current_queue().await.unwrap().is_empty());
        assert_eq!(stored(&store, &second.id).await.status, SubmissionStatus::Queued);

        let halted = wait_for_event(&mut events, |e| matches!(e, Event::QueueHalted { .. })).await;
        assert_eq!(
            halted,
            Event::QueueHalted {
                submission_id: first.id.clone(),
                cleared: 1
            }
        );
    }

    #[tokio::test]
    async fn test_failure_without_halt_continues() {
        let store = Arc::new(MemoryStore::new());
        store.set(HALT_QUEUE_ON_FAILURE, "false").await.unwrap();
        let first = enqueue(&store, &["b"]).await;
        let second = enqueue(&store, &["a"]).await;

        let mut orchestrator = QueueOrchestrator::new(context(
            &store,
            vec![
                MockDestination::success("a"),
                MockDestination::failure("b", "HTTP 500"),
            ],
        ));
        orchestrator
            .run_until_idle(CancellationToken::new(), POLL)
            .await
            .unwrap();

        assert_eq!(stored(&store, &first.id).await.status, SubmissionStatus::Failed);
        assert_eq!(stored(&store, &second.id).await.status, SubmissionStatus::Posted);
    }

    #[tokio::test]
    async fn test_asset_failure_skips_submission() {
        let store = Arc::new(MemoryStore::new());
        let broken = Submission::new("content", vec!["a".to_string()])
            .with_assets(vec!["/missing/art.png".to_string()]);
        store.enqueue(&broken).await.unwrap();
        let next = enqueue(&store, &["a"]).await;

        let a = MockDestination::success("a");
        let mut orchestrator = QueueOrchestrator::new(context(&store, vec![a.clone()]));
        orchestrator
            .run_until_idle(CancellationToken::new(), POLL)
            .await
            .unwrap();

        let skipped = stored(&store, &broken.id).await;
        assert_eq!(skipped.status, SubmissionStatus::Queued);
        assert_eq!(skipped.pending_destinations, vec!["a"]);
        assert!(store.attempts(&broken.id).await.unwrap().is_empty());
        assert_eq!(stored(&store, &next.id).await.status, SubmissionStatus::Posted);
        assert_eq!(a.call_count(), 1);
    }

    #[tokio::test]
    async fn test_removal_mid_post_stops_driver() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(&store, vec![MockDestination::success("a")]);
        ctx.ledger.record("slow", now_millis()).await.unwrap();
        let submission = enqueue(&store, &["a", "slow"]).await;
        let second = enqueue(&store, &["a"]).await;

        let orchestrator = QueueOrchestrator::new(ctx);
        let mut events = orchestrator.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(orchestrator.run(shutdown.clone(), POLL));

        wait_for_event(&mut events, |e| {
            matches!(e, Event::DestinationScheduled { destination, .. } if destination == "slow")
        })
        .await;
        assert_eq!(stored(&store, &submission.id).await.status, SubmissionStatus::Posting);
        store.dequeue(&submission.id).await.unwrap();

        let completed = wait_for_event(&mut events, |e| {
            matches!(e, Event::SubmissionCompleted { submission_id, .. } if submission_id == &submission.id)
        })
        .await;
        let Event::SubmissionCompleted { disposition, attempts, pending, .. } = completed else {
            unreachable!()
        };
        assert_eq!(disposition, Disposition::Stopped);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].destination, "a");
        assert_eq!(pending, vec!["slow"]);

        // The rest of the queue still runs
        wait_for_event(&mut events, |e| {
            matches!(e, Event::SubmissionCompleted { submission_id, .. } if submission_id == &second.id)
        })
        .await;

        shutdown.cancel();
        task.await.unwrap().unwrap();

        let stopped = stored(&store, &submission.id).await;
        assert_eq!(stopped.status, SubmissionStatus::Queued);
        assert_eq!(stopped.pending_destinations, vec!["slow"]);
    }

    #[tokio::test]
    async fn test_removal_after_failure_keeps_failure_state() {
        let store = Arc::new(MemoryStore::new());
        store.set(HALT_QUEUE_ON_FAILURE, "false").await.unwrap();
        let ctx = context(
            &store,
            vec![
                MockDestination::failure("a", "HTTP 500"),
                MockDestination::success("b"),
            ],
        );
        ctx.ledger.record("slow", now_millis()).await.unwrap();
        let submission = enqueue(&store, &["tumblr", "slow", "a"]).await;
        let later = enqueue(&store, &["b"]).await;

        let orchestrator = QueueOrchestrator::new(ctx);
        let mut events = orchestrator.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(orchestrator.run(shutdown.clone(), POLL));

        wait_for_event(&mut events, |e| {
            matches!(e, Event::DestinationScheduled { destination, .. } if destination == "slow")
        })
        .await;
        store.dequeue(&submission.id).await.unwrap();

        let mut halted = false;
        wait_for_event(&mut events, |e| {
            halted |= matches!(e, Event::QueueHalted { .. });
            matches!(e, Event::SubmissionCompleted { submission_id, .. } if submission_id == &later.id)
        })
        .await;

        shutdown.cancel();
        task.await.unwrap().unwrap();

        assert!(!halted);
        let removed = stored(&store, &submission.id).await;
        assert_eq!(removed.status, SubmissionStatus::Failed);
        assert_eq!(removed.pending_destinations, vec!["a", "slow", "tumblr"]);
        let attempts = store.attempts(&submission.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].destination, "a");
        assert_eq!(stored(&store, &later.id).await.status, SubmissionStatus::Posted);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_submission_queued() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(&store, vec![]);
        ctx.ledger.record("slow", now_millis()).await.unwrap();
        let submission = enqueue(&store, &["slow"]).await;

        let orchestrator = QueueOrchestrator::new(ctx);
        let mut events = orchestrator.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(orchestrator.run(shutdown.clone(), POLL));

        wait_for_event(&mut events, |e| matches!(e, Event::DestinationScheduled { .. })).await;
        shutdown.cancel();
        task.await.unwrap().unwrap();

        let queue = store.current_queue().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id, submission.id);
        assert_eq!(queue[0].status, SubmissionStatus::Queued);
        assert_eq!(queue[0].pending_destinations, vec!["slow"]);
    }

    #[tokio::test]
    async fn test_active_stream_publishes_advance_and_release() {
        let store = Arc::new(MemoryStore::new());
        let submission = enqueue(&store, &["a"]).await;

        let mut orchestrator =
            QueueOrchestrator::new(context(&store, vec![MockDestination::success("a")]));
        let mut active = orchestrator.subscribe_active();
        assert!(active.borrow_and_update().is_none());

        orchestrator.refresh().await;
        assert!(active.has_changed().unwrap());
        let handle = active.borrow_and_update().clone().unwrap();
        assert_eq!(handle.submission_id(), submission.id);
        assert!(!orchestrator.begin_next().await);

        orchestrator
            .run_until_idle(CancellationToken::new(), POLL)
            .await
            .unwrap();
        assert!(orchestrator.is_idle());
        assert!(active.borrow_and_update().is_none());
    }

    #[tokio::test]
    async fn test_picks_up_submissions_added_while_running() {
        let store = Arc::new(MemoryStore::new());
        let orchestrator =
            QueueOrchestrator::new(context(&store, vec![MockDestination::success("a")]));
        let mut events = orchestrator.subscribe();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(orchestrator.run(shutdown.clone(), POLL));

        let submission = enqueue(&store, &["a"]).await;
        wait_for_event(&mut events, |e| matches!(e, Event::SubmissionCompleted { .. })).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(stored(&store, &submission.id).await.status, SubmissionStatus::Posted);
    }
}
