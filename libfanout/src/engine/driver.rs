//! Post attempt driver
//!
//! Drives one submission through its pending destinations:
//!
//! ```text
//! LoadingAssets -> Scheduling -> Waiting -> Attempting -> Scheduling | Complete
//! ```
//!
//! Every transition goes through [`PostDriver::step`], which checks the stop
//! token first. Stopping is cooperative: a pending wake-up is cancelled, an
//! in-flight adapter call is allowed to finish, and nothing that was not
//! attempted is ever counted as failed.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::Event;
use super::EngineContext;
use crate::destinations::Destination;
use crate::error::DestinationError;
use crate::ledger::{now_millis, Settings};
use crate::store::REPORT_CHANNEL;
use crate::types::{
    normalize_destinations, AttemptRecord, Disposition, Submission, SubmissionStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverPhase {
    #[default]
    LoadingAssets,
    Scheduling,
    Waiting,
    Attempting,
    Complete,
}

/// What observers can see of a running driver
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DriverProgress {
    pub phase: DriverPhase,
    /// Destination being waited on or attempted
    pub current_destination: Option<String>,
    /// Only set while waiting at least the long-wait threshold
    pub resume_at: Option<DateTime<Utc>>,
    /// 0.0 to 100.0
    pub percent: f64,
}

/// Cheap handle to a driver, for stopping it and watching its progress
#[derive(Debug, Clone)]
pub struct DriverHandle {
    submission_id: String,
    stop: CancellationToken,
    progress: watch::Receiver<DriverProgress>,
}

impl DriverHandle {
    pub fn submission_id(&self) -> &str {
        &self.submission_id
    }

    /// Request a cooperative stop
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Latest progress snapshot
    pub fn progress(&self) -> DriverProgress {
        self.progress.borrow().clone()
    }

    /// Progress stream; fires on every state transition
    pub fn subscribe_progress(&self) -> watch::Receiver<DriverProgress> {
        self.progress.clone()
    }
}

/// Result of one posting pass
#[derive(Debug, Clone)]
pub struct DriverOutcome {
    /// The submission with `pending_destinations` rebuilt as failed ++ unattempted
    pub submission: Submission,
    pub attempts: Vec<AttemptRecord>,
    pub disposition: Disposition,
    /// Why asset preparation failed, for `Disposition::Aborted`
    pub asset_error: Option<String>,
}

enum State {
    LoadingAssets,
    Scheduling,
    Waiting { destination: String, wait: Duration },
    Attempting(String),
    Complete,
}

impl State {
    fn phase(&self) -> DriverPhase {
        match self {
            State::LoadingAssets => DriverPhase::LoadingAssets,
            State::Scheduling => DriverPhase::Scheduling,
            State::Waiting { .. } => DriverPhase::Waiting,
            State::Attempting(_) => DriverPhase::Attempting,
            State::Complete => DriverPhase::Complete,
        }
    }
}

pub struct PostDriver {
    ctx: EngineContext,
    settings: Settings,
    submission: Submission,
    adapters: BTreeMap<String, Option<Arc<dyn Destination>>>,
    pending: VecDeque<String>,
    original_count: usize,
    failed: Vec<String>,
    attempts: Vec<AttemptRecord>,
    state: State,
    current: Option<String>,
    resume_at: Option<DateTime<Utc>>,
    asset_error: Option<String>,
    stop: CancellationToken,
    progress: watch::Sender<DriverProgress>,
}

impl PostDriver {
    /// Build a driver for `submission`.
    ///
    /// The submission's status is taken as the status to fall back to if the
    /// pass is stopped or aborted. Destinations are sorted here and adapters
    /// resolved once.
    pub fn new(submission: Submission, ctx: EngineContext, settings: Settings) -> Self {
        let destinations = normalize_destinations(submission.pending_destinations.clone());
        let adapters = ctx.registry.resolve(&destinations);
        let original_count = destinations.len();
        let (progress, _) = watch::channel(DriverProgress::default());

        Self {
            ctx,
            settings,
            submission,
            adapters,
            pending: destinations.into(),
            original_count,
            failed: Vec::new(),
            attempts: Vec::new(),
            state: State::LoadingAssets,
            current: None,
            resume_at: None,
            asset_error: None,
            stop: CancellationToken::new(),
            progress,
        }
    }

    pub fn handle(&self) -> DriverHandle {
        DriverHandle {
            submission_id: self.submission.id.clone(),
            stop: self.stop.clone(),
            progress: self.progress.subscribe(),
        }
    }

    pub fn submission_id(&self) -> &str {
        &self.submission.id
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn phase(&self) -> DriverPhase {
        self.state.phase()
    }

    pub fn current_destination(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Destinations still to be attempted, in attempt order
    pub fn pending_destinations(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    pub fn percent_done(&self) -> f64 {
        if self.original_count == 0 {
            return 100.0;
        }
        (1.0 - self.pending.len() as f64 / self.original_count as f64) * 100.0
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    /// Run the pass to completion
    pub async fn run(mut self) -> DriverOutcome {
        info!(
            submission = %self.submission.id,
            destinations = self.original_count,
            "Starting posting pass"
        );
        while self.phase() != DriverPhase::Complete {
            self.step().await;
        }
        self.finish()
    }

    /// Perform exactly one state transition
    pub async fn step(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Complete);
        self.state = match state {
            State::LoadingAssets => self.load_assets().await,
            State::Scheduling => self.schedule_next().await,
            State::Waiting { destination, wait } => self.wait(destination, wait).await,
            State::Attempting(destination) => self.attempt(destination).await,
            State::Complete => State::Complete,
        };
        if matches!(self.state, State::Complete) {
            self.current = None;
            self.resume_at = None;
        }
        self.publish_progress(self.phase());
    }

    async fn load_assets(&mut self) -> State {
        if self.is_stopped() {
            return State::Complete;
        }
        match self.ctx.store.prepare_assets(&self.submission).await {
            Ok(()) => State::Scheduling,
            Err(e) => {
                warn!(submission = %self.submission.id, "Asset preparation failed: {}", e);
                self.asset_error = Some(e.to_string());
                State::Complete
            }
        }
    }

    async fn schedule_next(&mut self) -> State {
        if self.is_stopped() {
            return State::Complete;
        }
        let Some(destination) = self.pending.pop_front() else {
            return State::Complete;
        };

        let last = match self.ctx.ledger.last_attempt(&destination).await {
            Ok(last) => last,
            Err(e) => {
                warn!(%destination, "Failed to read rate-limit ledger: {}", e);
                None
            }
        };
        let now = now_millis();
        let wait = self.ctx.intervals.wait_for(&destination, last, now);

        self.resume_at = if wait >= self.ctx.intervals.long_wait_threshold() {
            chrono::Duration::from_std(wait)
                .ok()
                .map(|wait| Utc::now() + wait)
        } else {
            None
        };
        self.current = Some(destination.clone());

        debug!(
            submission = %self.submission.id,
            %destination,
            wait_ms = wait.as_millis() as u64,
            "Scheduled next attempt"
        );
        self.ctx.events.emit(Event::DestinationScheduled {
            submission_id: self.submission.id.clone(),
            destination: destination.clone(),
            wait_ms: wait.as_millis() as u64,
            resume_at: self.resume_at.map(|at| at.timestamp_millis()),
        });

        State::Waiting { destination, wait }
    }

    async fn wait(&mut self, destination: String, wait: Duration) -> State {
        let stop = self.stop.clone();
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!(submission = %self.submission.id, %destination, "Stopped while waiting");
                self.pending.push_front(destination);
                State::Complete
            }
            _ = sleep(wait) => State::Attempting(destination),
        }
    }

    async fn attempt(&mut self, destination: String) -> State {
        if self.is_stopped() {
            self.pending.push_front(destination);
            return State::Complete;
        }
        self.resume_at = None;
        self.publish_progress(DriverPhase::Attempting);

        let adapter = self.adapters.get(&destination).cloned().flatten();
        let result = match adapter {
            Some(adapter) => adapter.post(&self.submission).await,
            None => Err(DestinationError::new(
                &destination,
                "no adapter registered for this destination",
            )
            .with_user_message(format!("{} is not configured", destination))),
        };

        let at = now_millis();
        if let Err(e) = self.ctx.ledger.record(&destination, at).await {
            warn!(%destination, "Failed to update rate-limit ledger: {}", e);
        }

        let record = match result {
            Ok(remote_id) => {
                info!(submission = %self.submission.id, %destination, "Posted");
                AttemptRecord::success(&destination, remote_id, at)
            }
            Err(error) => {
                warn!(submission = %self.submission.id, %destination, "Post failed: {}", error.cause);
                self.failed.push(destination.clone());
                self.log_failure(&error).await;
                AttemptRecord::failure(error, at)
            }
        };
        let succeeded = record.success;
        self.attempts.push(record.clone());
        self.ctx.events.emit(Event::DestinationAttempted {
            submission_id: self.submission.id.clone(),
            record,
        });

        if succeeded {
            return State::Scheduling;
        }
        if self.is_stopped() || self.settings.halt_queue_on_failure {
            State::Complete
        } else {
            State::Scheduling
        }
    }

    async fn log_failure(&self, error: &DestinationError) {
        let persist = self.settings.generate_log_on_failure && !error.skip_log;
        let message = format!("Post failed for {}", error.destination);
        if let Err(e) = self
            .ctx
            .logger
            .error(REPORT_CHANNEL, error, &message, persist)
            .await
        {
            warn!("Failed to write failure log: {}", e);
        }
    }

    fn publish_progress(&self, phase: DriverPhase) {
        self.progress.send_replace(DriverProgress {
            phase,
            current_destination: self.current.clone(),
            resume_at: self.resume_at,
            percent: self.percent_done(),
        });
    }

    /// Rebuild the submission and decide the disposition
    fn finish(self) -> DriverOutcome {
        let mut submission = self.submission;
        let prior_status = submission.status;

        let mut pending = self.failed.clone();
        pending.extend(self.pending);
        submission.pending_destinations = pending;

        // A stop that lands during the last successful attempt left nothing undone
        let delivered = submission.pending_destinations.is_empty();
        let disposition = if self.asset_error.is_some() {
            Disposition::Aborted
        } else if self.stop.is_cancelled() && !delivered {
            Disposition::Stopped
        } else if self.failed.is_empty() {
            Disposition::Posted
        } else {
            Disposition::Failed
        };

        submission.status = match disposition {
            Disposition::Posted => SubmissionStatus::Posted,
            Disposition::Failed => SubmissionStatus::Failed,
            Disposition::Stopped if !self.failed.is_empty() => SubmissionStatus::Failed,
            Disposition::Stopped | Disposition::Aborted => prior_status,
        };

        info!(
            submission = %submission.id,
            %disposition,
            attempts = self.attempts.len(),
            remaining = submission.pending_destinations.len(),
            "Posting pass finished"
        );

        DriverOutcome {
            submission,
            attempts: self.attempts,
            disposition,
            asset_error: self.asset_error,
        }
    }
}
