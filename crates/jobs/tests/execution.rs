use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use dropqueue_jobs::{
    BackoffStrategy, Clock, HandlerRegistry, InMemoryMirror, Job, JobId, JobQueueManager, JobSpec,
    JobStatus, ManagerConfig, ManualClock, ProgressUpdate, PromotionPolicy, QueueConfig, QueueError,
};

fn init_tracing() {
    dropqueue_observability::tracing::init(dropqueue_observability::LogFormat::Pretty);
}

fn wait_until(manager: &JobQueueManager, id: JobId, done: impl Fn(&Job) -> bool) -> Job {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let job = manager.get_job(id).expect("job should still be tracked");
        if done(&job) {
            return job;
        }
        assert!(Instant::now() < deadline, "timed out waiting on job {id}: {job:?}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn wait_terminal(manager: &JobQueueManager, id: JobId) -> Job {
    wait_until(manager, id, |job| job.status.is_terminal())
}

fn build(handlers: HandlerRegistry, queues: Vec<QueueConfig>) -> (JobQueueManager, ManualClock, Arc<InMemoryMirror>) {
    init_tracing();
    let clock = ManualClock::starting_now();
    let mirror = InMemoryMirror::arc();
    let mut builder = JobQueueManager::builder()
        .config(ManagerConfig {
            auto_start: false,
            promotion: PromotionPolicy::FillAvailable,
            ..Default::default()
        })
        .clock(clock.clone())
        .mirror(mirror.clone())
        .handlers(handlers);
    for queue in queues {
        builder = builder.queue(queue);
    }
    (builder.build().unwrap(), clock, mirror)
}

#[test]
fn handler_reports_progress_and_completes() {
    let handlers = HandlerRegistry::new().with("import", |ctx| {
        let total = ctx.job().total_items;
        for done in (10..=total).step_by(10) {
            let pct = (done * 100 / total) as u8;
            ctx.report_progress(ProgressUpdate::new(pct).items(done, done, 0))?;
        }
        Ok(())
    });
    let (manager, _, mirror) = build(handlers, vec![QueueConfig::new("imports", 1)]);

    let id = manager
        .submit("imports", JobSpec::new("import").total_items(40))
        .unwrap();
    manager.tick();
    let job = wait_terminal(&manager, id);

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.processed_items, 40);
    assert_eq!(job.success_count, 40);

    let history = mirror.status_history(id);
    assert_eq!(history.first(), Some(&JobStatus::Queued));
    assert_eq!(history.last(), Some(&JobStatus::Completed));
    assert_eq!(history.len(), 2 + 4 + 1);
}

#[test]
fn failing_job_does_not_disturb_others() {
    let release = Arc::new(AtomicBool::new(false));
    let gate = release.clone();

    let handlers = HandlerRegistry::new()
        .with("slow", move |ctx| {
            ctx.report_progress(ProgressUpdate::new(10).items(1, 1, 0))?;
            let deadline = Instant::now() + Duration::from_secs(5);
            while !gate.load(Ordering::SeqCst) {
                anyhow::ensure!(Instant::now() < deadline, "never released");
                thread::sleep(Duration::from_millis(2));
            }
            ctx.report_progress(ProgressUpdate::new(100).items(10, 10, 0))?;
            Ok(())
        })
        .with("broken", |_ctx| anyhow::bail!("supplier feed unreachable"))
        .with("sync", |_ctx| Ok(()));
    let (manager, _, _) = build(
        handlers,
        vec![
            QueueConfig::new("imports", 2).with_retry(0, Duration::from_secs(60)),
            QueueConfig::new("sync", 1),
        ],
    );

    let y = manager
        .submit("imports", JobSpec::new("slow").total_items(10))
        .unwrap();
    let x = manager.submit("imports", JobSpec::new("broken")).unwrap();
    let z = manager.submit("sync", JobSpec::new("sync")).unwrap();

    assert_eq!(manager.tick().promoted.len(), 3);

    let failed = wait_terminal(&manager, x);
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.errors, vec!["attempt 1: supplier feed unreachable".to_string()]);
    assert_eq!((failed.processed_items, failed.error_count), (0, 0));

    let running = wait_until(&manager, y, |job| job.processed_items == 1);
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(wait_terminal(&manager, z).status, JobStatus::Completed);

    release.store(true, Ordering::SeqCst);
    let finished = wait_terminal(&manager, y);
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.processed_items, 10);
}

#[test]
fn panicking_handler_fails_only_its_job() {
    let handlers = HandlerRegistry::new()
        .with("ai.*", |ctx| {
            if ctx.metadata()["explode"] == true {
                panic!("model returned garbage");
            }
            Ok(())
        });
    let (manager, _, _) = build(
        handlers,
        vec![QueueConfig::new("ai", 2).with_retry(0, Duration::from_secs(60))],
    );

    let bad = manager
        .submit(
            "ai",
            JobSpec::new("ai.enrich").metadata(serde_json::json!({ "explode": true })),
        )
        .unwrap();
    let good = manager.submit("ai", JobSpec::new("ai.pricing")).unwrap();
    manager.tick();

    let bad = wait_terminal(&manager, bad);
    assert_eq!(bad.status, JobStatus::Failed);
    assert!(bad.errors[0].contains("job handler panicked: model returned garbage"));
    assert_eq!(wait_terminal(&manager, good).status, JobStatus::Completed);
}

#[test]
fn unknown_job_type_fails_the_job() {
    let (manager, _, _) = build(
        HandlerRegistry::new().with("import", |_ctx| Ok(())),
        vec![QueueConfig::new("imports", 1).with_retry(0, Duration::from_secs(60))],
    );

    let id = manager.submit("imports", JobSpec::new("export")).unwrap();
    manager.tick();
    let job = wait_terminal(&manager, id);

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.errors, vec!["attempt 1: no handler for job type: export".to_string()]);
}

#[test]
fn failed_attempt_is_retried_after_backoff() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let handlers = HandlerRegistry::new().with("sync", move |_ctx| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("rate limited");
        }
        Ok(())
    });
    let (manager, clock, _) = build(
        handlers,
        vec![
            QueueConfig::new("sync", 1)
                .with_retry(2, Duration::from_secs(90))
                .with_backoff(BackoffStrategy::Fixed),
        ],
    );

    let id = manager.submit("sync", JobSpec::new("sync")).unwrap();
    let started = clock.now();
    manager.tick();

    let requeued = wait_until(&manager, id, |job| job.status == JobStatus::Queued);
    assert_eq!(requeued.scheduled_at, started + ChronoDuration::seconds(90));
    assert!(manager.tick().promoted.is_empty());

    clock.advance(ChronoDuration::seconds(90));
    assert_eq!(manager.tick().promoted, vec![id]);
    let job = wait_terminal(&manager, id);

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.errors, vec!["attempt 1: rate limited".to_string()]);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

fn wait_for_flag(flag: &AtomicBool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !flag.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "timed out waiting on flag");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn superseded_handler_cannot_touch_the_retry() {
    let first_gate = Arc::new(AtomicBool::new(false));
    let second_gate = Arc::new(AtomicBool::new(false));
    let stale_finished = Arc::new(AtomicBool::new(false));
    let stale_rejected = Arc::new(AtomicBool::new(false));

    let handlers = {
        let (first_gate, second_gate) = (first_gate.clone(), second_gate.clone());
        let (stale_finished, stale_rejected) = (stale_finished.clone(), stale_rejected.clone());
        HandlerRegistry::new().with("sync", move |ctx| {
            if ctx.attempt() == 1 {
                wait_for_flag(&first_gate);
                let late = ctx.report_progress(ProgressUpdate::new(90).items(9, 9, 0));
                stale_rejected.store(
                    matches!(late, Err(QueueError::InvalidTransition { .. })),
                    Ordering::SeqCst,
                );
                stale_finished.store(true, Ordering::SeqCst);
                return Ok(());
            }
            ctx.report_progress(ProgressUpdate::new(20).items(2, 2, 0))?;
            wait_for_flag(&second_gate);
            Ok(())
        })
    };
    let (manager, clock, _) = build(
        handlers,
        vec![
            QueueConfig::new("sync", 1)
                .with_retry(1, Duration::from_secs(30))
                .with_backoff(BackoffStrategy::Fixed),
        ],
    );

    let id = manager
        .submit("sync", JobSpec::new("sync").total_items(10))
        .unwrap();
    manager.tick();

    // Attempt 1 hangs; it is failed externally and retried.
    manager.fail_attempt(id, "heartbeat lost").unwrap();
    clock.advance(ChronoDuration::seconds(30));
    assert_eq!(manager.tick().promoted, vec![id]);
    wait_until(&manager, id, |job| job.processed_items == 2);

    first_gate.store(true, Ordering::SeqCst);
    wait_for_flag(&stale_finished);
    assert!(stale_rejected.load(Ordering::SeqCst));
    // Room for the stale attempt's completion writeback.
    thread::sleep(Duration::from_millis(50));

    let job = manager.get_job(id).unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.processed_items, 2);

    second_gate.store(true, Ordering::SeqCst);
    let job = wait_terminal(&manager, id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.processed_items, 2);
    assert_eq!(job.errors, vec!["attempt 1: heartbeat lost".to_string()]);
}

#[test]
fn background_dispatcher_runs_submitted_jobs() {
    init_tracing();
    let done = Arc::new(AtomicUsize::new(0));
    let counter = done.clone();
    let manager = JobQueueManager::builder()
        .config(ManagerConfig {
            tick_interval_ms: 5,
            ..Default::default()
        })
        .queue(QueueConfig::new("scraping", 2))
        .handlers(HandlerRegistry::new().with("*", move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .build()
        .unwrap();

    let ids: Vec<_> = (0..4)
        .map(|_| manager.submit("scraping", JobSpec::new("scrape")).unwrap())
        .collect();
    for id in ids {
        assert_eq!(wait_terminal(&manager, id).status, JobStatus::Completed);
    }

    manager.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 4);
    assert!(!manager.is_dispatching());
}
