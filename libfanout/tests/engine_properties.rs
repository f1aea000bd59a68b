//! Behavioural tests for the posting engine against the in-memory store

use std::sync::Arc;
use std::time::{Duration, Instant};

use libfanout::destinations::mock::MockDestination;
use libfanout::destinations::DestinationRegistry;
use libfanout::engine::{DriverPhase, EngineContext, Event, PostDriver, QueueOrchestrator};
use libfanout::ledger::{now_millis, HALT_QUEUE_ON_FAILURE};
use libfanout::store::memory::MemoryStore;
use libfanout::store::{KeyValueStore, SubmissionStore};
use libfanout::{Disposition, IntervalTable, Settings, Submission, SubmissionStatus};
use tokio_util::sync::CancellationToken;

const FLOOR_MS: u64 = 5;

fn context(
    store: &Arc<MemoryStore>,
    intervals: IntervalTable,
    adapters: &[MockDestination],
) -> EngineContext {
    let mut registry = DestinationRegistry::new();
    for adapter in adapters {
        registry.register(Arc::new(adapter.clone()));
    }
    EngineContext::builder(store.clone(), store.clone(), store.clone())
        .intervals(intervals.with_floor(FLOOR_MS))
        .registry(registry)
        .build()
}

fn submission(destinations: &[&str]) -> Submission {
    Submission::new(
        "A new painting",
        destinations.iter().map(|d| d.to_string()).collect(),
    )
}

fn no_halt() -> Settings {
    Settings {
        halt_queue_on_failure: false,
        generate_log_on_failure: true,
    }
}

#[tokio::test]
async fn every_pending_destination_is_attempted_exactly_once() -> anyhow::Result<()> {
    let names = ["a", "b", "c", "d"];
    let adapters = [
        MockDestination::success("a"),
        MockDestination::failure("b", "HTTP 500"),
        MockDestination::success("c"),
        MockDestination::failure("d", "timeout"),
    ];

    for n in 0..=names.len() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(&store, IntervalTable::uniform(1), &adapters);
        let outcome = PostDriver::new(submission(&names[..n]), ctx, no_halt())
            .run()
            .await;

        assert_eq!(outcome.attempts.len(), n, "with {} destinations", n);
        let mut attempted: Vec<_> = outcome
            .attempts
            .iter()
            .map(|r| r.destination.clone())
            .collect();
        attempted.dedup();
        assert_eq!(attempted.len(), n);

        let failed: Vec<_> = outcome
            .attempts
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.destination.clone())
            .collect();
        assert_eq!(outcome.submission.pending_destinations, failed);
    }
    Ok(())
}

#[tokio::test]
async fn empty_submission_is_posted_with_empty_log() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let empty = submission(&[]);
    store.enqueue(&empty).await?;

    let mut orchestrator = QueueOrchestrator::new(context(&store, IntervalTable::uniform(1), &[]));
    let mut events = orchestrator.subscribe();
    orchestrator
        .run_until_idle(CancellationToken::new(), Duration::from_secs(60))
        .await?;

    let stored = SubmissionStore::get(store.as_ref(), &empty.id).await?.unwrap();
    assert_eq!(stored.status, SubmissionStatus::Posted);
    assert!(store.attempts(&empty.id).await?.is_empty());

    loop {
        if let Event::SubmissionCompleted {
            disposition,
            attempts,
            ..
        } = events.recv().await?
        {
            assert_eq!(disposition, Disposition::Posted);
            assert!(attempts.is_empty());
            break;
        }
    }
    Ok(())
}

#[tokio::test]
async fn consecutive_attempts_respect_minimum_interval() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let weasyl = MockDestination::success("weasyl");
    let intervals = IntervalTable::uniform(1).with_interval("weasyl", 200);

    for _ in 0..3 {
        store.enqueue(&submission(&["weasyl"])).await?;
    }
    let mut orchestrator = QueueOrchestrator::new(context(&store, intervals, &[weasyl.clone()]));
    orchestrator
        .run_until_idle(CancellationToken::new(), Duration::from_secs(60))
        .await?;

    let calls = weasyl.calls();
    assert_eq!(calls.len(), 3);
    for pair in calls.windows(2) {
        let gap = pair[1].at - pair[0].at;
        assert!(gap >= 200 - FLOOR_MS as i64, "attempts only {}ms apart", gap);
    }
    Ok(())
}

#[tokio::test]
async fn failed_attempts_consume_the_rate_limit_window() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.set(HALT_QUEUE_ON_FAILURE, "false").await?;
    let flaky = MockDestination::scripted("flaky", vec![Some("HTTP 429")]);
    let intervals = IntervalTable::uniform(1).with_interval("flaky", 150);

    store.enqueue(&submission(&["flaky"])).await?;
    store.enqueue(&submission(&["flaky"])).await?;
    let mut orchestrator = QueueOrchestrator::new(context(&store, intervals, &[flaky.clone()]));
    orchestrator
        .run_until_idle(CancellationToken::new(), Duration::from_secs(60))
        .await?;

    let calls = flaky.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].at - calls[0].at >= 150 - FLOOR_MS as i64);
    Ok(())
}

#[tokio::test]
async fn destination_inside_its_window_is_deferred_by_the_remainder() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let a = MockDestination::success("a");
    let b = MockDestination::success("b");
    let intervals = IntervalTable::uniform(1).with_interval("b", 1_000);
    let ctx = context(&store, intervals, &[a.clone(), b.clone()]);

    let start = now_millis();
    let b_stamp = start - (1_000 - 50);
    ctx.ledger.record("b", b_stamp).await?;

    let outcome = PostDriver::new(submission(&["a", "b"]), ctx, no_halt())
        .run()
        .await;
    assert_eq!(outcome.disposition, Disposition::Posted);

    let a_at = a.calls()[0].at;
    let b_at = b.calls()[0].at;
    assert!(a_at - start < 40, "a should go almost immediately, took {}ms", a_at - start);
    assert!(b_at - b_stamp >= 1_000 - FLOOR_MS as i64, "b went {}ms early", 1_000 - (b_at - b_stamp));
    assert!(b_at - start < 500, "b deferred far too long: {}ms", b_at - start);
    Ok(())
}

#[tokio::test]
async fn stopping_between_attempts_keeps_the_rest_pending() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let a = MockDestination::success("a");
    let b = MockDestination::success("b");
    let ctx = context(&store, IntervalTable::uniform(1), &[a.clone(), b.clone()]);

    let mut driver = PostDriver::new(submission(&["a", "b"]), ctx, Settings::default());
    while a.call_count() == 0 {
        driver.step().await;
    }
    assert_eq!(driver.phase(), DriverPhase::Scheduling);

    driver.stop();
    let outcome = driver.run().await;

    assert_eq!(outcome.disposition, Disposition::Stopped);
    assert_eq!(outcome.submission.status, SubmissionStatus::Queued);
    assert_eq!(outcome.submission.pending_destinations, vec!["b"]);
    assert_eq!(outcome.attempts.len(), 1);
    assert_eq!(outcome.attempts[0].destination, "a");
    assert_eq!(b.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn in_flight_attempt_finishes_after_stop() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let slow = MockDestination::with_delay("slow", Duration::from_millis(150));
    let later = MockDestination::success("later");
    let ctx = context(&store, IntervalTable::uniform(1), &[slow.clone(), later.clone()]);

    let driver = PostDriver::new(submission(&["later", "slow"]), ctx, Settings::default());
    let handle = driver.handle();
    let task = tokio::spawn(driver.run());

    let mut progress = handle.subscribe_progress();
    progress
        .wait_for(|p| p.phase == DriverPhase::Attempting && p.current_destination.as_deref() == Some("slow"))
        .await?;
    // "later" sorts before "slow", so it is already done; stop mid-call
    let stopped_at = Instant::now();
    handle.stop();
    let outcome = task.await?;

    assert!(stopped_at.elapsed() >= Duration::from_millis(100));
    // Every destination went through, so the late stop changes nothing
    assert_eq!(outcome.disposition, Disposition::Posted);
    assert_eq!(outcome.submission.status, SubmissionStatus::Posted);
    assert_eq!(outcome.attempts.len(), 2);
    assert!(outcome.attempts.iter().all(|r| r.success));
    assert!(outcome.submission.pending_destinations.is_empty());
    Ok(())
}

#[tokio::test]
async fn removal_during_last_attempt_still_marks_posted() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let slow = MockDestination::with_delay("slow", Duration::from_millis(150));
    let queued = submission(&["slow"]);
    store.enqueue(&queued).await?;

    let orchestrator =
        QueueOrchestrator::new(context(&store, IntervalTable::uniform(1), &[slow.clone()]));
    let mut active = orchestrator.subscribe_active();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(orchestrator.run(shutdown.clone(), Duration::from_secs(60)));

    active.wait_for(|a| a.is_some()).await?;
    let handle = active.borrow().clone().unwrap();
    handle
        .subscribe_progress()
        .wait_for(|p| p.phase == DriverPhase::Attempting)
        .await?;
    store.dequeue(&queued.id).await?;

    active.wait_for(|a| a.is_none()).await?;
    shutdown.cancel();
    task.await??;

    let stored = SubmissionStore::get(store.as_ref(), &queued.id).await?.unwrap();
    assert_eq!(stored.status, SubmissionStatus::Posted);
    assert!(stored.pending_destinations.is_empty());
    assert!(store.current_queue().await?.is_empty());
    assert_eq!(slow.call_count(), 1);
    Ok(())
}

#[tokio::test]
async fn halt_policy_clears_later_submissions() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let adapters = [
        MockDestination::success("a"),
        MockDestination::failure("b", "HTTP 500"),
    ];
    let failing = submission(&["a", "b"]);
    let later = submission(&["a"]);
    store.enqueue(&failing).await?;
    store.enqueue(&later).await?;
    store.enqueue(&submission(&["a"])).await?;

    let mut orchestrator =
        QueueOrchestrator::new(context(&store, IntervalTable::uniform(1), &adapters));
    orchestrator
        .run_until_idle(CancellationToken::new(), Duration::from_secs(60))
        .await?;

    let stored = SubmissionStore::get(store.as_ref(), &failing.id).await?.unwrap();
    assert_eq!(stored.status, SubmissionStatus::Failed);
    assert!(store.current_queue().await?.is_empty());
    assert!(store.attempts(&later.id).await?.is_empty());
    assert_eq!(adapters[0].call_count(), 1);
    Ok(())
}

#[tokio::test]
async fn without_halt_policy_next_submission_starts() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.set(HALT_QUEUE_ON_FAILURE, "false").await?;
    let adapters = [
        MockDestination::success("a"),
        MockDestination::failure("b", "HTTP 500"),
    ];
    let failing = submission(&["a", "b"]);
    let later = submission(&["a"]);
    store.enqueue(&failing).await?;
    store.enqueue(&later).await?;

    let mut orchestrator =
        QueueOrchestrator::new(context(&store, IntervalTable::uniform(1), &adapters));
    orchestrator
        .run_until_idle(CancellationToken::new(), Duration::from_secs(60))
        .await?;

    let stored = SubmissionStore::get(store.as_ref(), &later.id).await?.unwrap();
    assert_eq!(stored.status, SubmissionStatus::Posted);
    assert_eq!(adapters[0].call_count(), 2);
    Ok(())
}

#[tokio::test]
async fn at_most_one_submission_is_posting() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let slow = MockDestination::with_delay("slow", Duration::from_millis(20));
    let mut ids = Vec::new();
    for _ in 0..3 {
        let queued = submission(&["slow"]);
        store.enqueue(&queued).await?;
        ids.push(queued.id);
    }

    let orchestrator = QueueOrchestrator::new(context(&store, IntervalTable::uniform(1), &[slow]));
    let mut active = orchestrator.subscribe_active();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(orchestrator.run(shutdown.clone(), Duration::from_millis(50)));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            active.changed().await?;
            active.borrow_and_update();

            let mut posting = 0;
            let mut posted = 0;
            for id in &ids {
                let stored = SubmissionStore::get(store.as_ref(), id).await?.unwrap();
                match stored.status {
                    SubmissionStatus::Posting => posting += 1,
                    SubmissionStatus::Posted => posted += 1,
                    _ => {}
                }
            }
            assert!(posting <= 1, "{} submissions posting at once", posting);
            if posted == ids.len() {
                return anyhow::Ok(());
            }
        }
    })
    .await??;

    shutdown.cancel();
    task.await??;
    Ok(())
}
