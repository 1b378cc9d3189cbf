//! WorkerPool Tests
//!
//! Tests for:
//! - Admission bounds and worker concurrency
//! - Duration-bounded loops
//! - Transient vs fatal failure handling
//! - Graceful and immediate shutdown
//! - Panicking operations

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use wl_engine::{
    EngineError, ExitReason, MetricsRegistry, PoolSizing, StoreError, Task, WorkerPool,
};

/// Mock operation that tracks calls and concurrency and can fail on a schedule
struct MockOperation {
    calls: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    delay: Duration,
    /// Fail every nth call with this store error
    failure: Option<(u32, StoreError)>,
}

impl MockOperation {
    fn with_delay(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            delay: Duration::from_millis(delay_ms),
            failure: None,
        })
    }

    fn failing_every(delay_ms: u64, every: u32, error: StoreError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            delay: Duration::from_millis(delay_ms),
            failure: Some((every, error)),
        })
    }

    async fn call(&self) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match &self.failure {
            Some((every, error)) if call % every == 0 => Err(error.clone().into()),
            _ => Ok(()),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn task(self: &Arc<Self>, label: &str, duration: Duration) -> Task {
        let op = Arc::clone(self);
        Task::new(label, duration, move || {
            let op = Arc::clone(&op);
            async move { op.call().await }
        })
    }
}

fn pool(core: u32, queue: u32) -> (Arc<WorkerPool>, Arc<MetricsRegistry>) {
    let registry = Arc::new(MetricsRegistry::new());
    let pool = WorkerPool::new(PoolSizing::new(core, queue).unwrap(), Arc::clone(&registry));
    (Arc::new(pool), registry)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_outstanding_tasks_never_exceed_capacity() {
    let (pool, _registry) = pool(2, 3);
    let op = MockOperation::with_delay(5);

    let mut submitters = Vec::new();
    for i in 0..8 {
        let pool = Arc::clone(&pool);
        let task = op.task(&format!("label-{}", i % 2), Duration::from_millis(30));
        submitters.push(tokio::spawn(async move { pool.submit(task).await }));
    }

    let deadline = Instant::now() + Duration::from_millis(300);
    while Instant::now() < deadline {
        let stats = pool.stats();
        assert!(pool.outstanding() <= 3);
        assert!(stats.active_workers <= 2);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    for submitter in submitters {
        let handle = submitter.await.unwrap().unwrap();
        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.exit, ExitReason::DurationElapsed);
    }

    assert!(op.max_in_flight() <= 2);
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(pool.gate().available_permits(), 3);
}

#[tokio::test]
async fn test_loop_stops_within_one_iteration_of_duration() {
    let (pool, _registry) = pool(1, 1);
    let op = MockOperation::with_delay(20);

    let started = Instant::now();
    let handle = pool.submit(op.task("bounded", Duration::from_millis(100))).await.unwrap();
    let outcome = handle.join().await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.exit, ExitReason::DurationElapsed);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(100 + 20 + 200), "took {:?}", elapsed);
    assert_eq!(outcome.iterations, op.calls() as u64);
}

#[tokio::test]
async fn test_transient_failures_keep_loop_running() {
    let (pool, registry) = pool(1, 1);
    let op = MockOperation::failing_every(2, 2, StoreError::serialization_failure("restart transaction"));

    let handle = pool.submit(op.task("contended", Duration::from_millis(60))).await.unwrap();
    let counter = registry.get("contended").unwrap();
    let outcome = handle.join().await.unwrap();

    assert_eq!(outcome.exit, ExitReason::DurationElapsed);
    assert!(outcome.failures > 0);
    assert!(outcome.successes >= outcome.failures);
    assert_eq!(counter.success_count(), outcome.successes);
    assert_eq!(counter.failure_count(), outcome.failures);
    assert_eq!(counter.retained() as u64, outcome.iterations);
}

#[tokio::test]
async fn test_fatal_failure_stops_loop_early() {
    let (pool, registry) = pool(1, 1);
    let op = MockOperation::failing_every(1, 3, StoreError::new("23505", "duplicate key value"));

    let handle = pool.submit(op.task("inserts", Duration::from_secs(10))).await.unwrap();
    let counter = registry.get("inserts").unwrap();
    let outcome = handle.join().await.unwrap();

    assert!(matches!(outcome.exit, ExitReason::Fatal(ref msg) if msg.contains("23505")));
    assert_eq!(outcome.iterations, 3);
    assert_eq!(outcome.successes, 2);
    assert_eq!(outcome.failures, 1);
    assert_eq!(counter.failure_count(), 1);
    assert!(outcome.elapsed < Duration::from_secs(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_third_submitter_waits_for_a_slot() {
    let (pool, _registry) = pool(2, 2);
    let op = MockOperation::with_delay(10);
    let duration = Duration::from_millis(200);

    let started = Instant::now();
    let mut handles = Vec::new();
    let mut admitted_at = Vec::new();
    for _ in 0..4 {
        handles.push(pool.submit(op.task("scenario", duration)).await.unwrap());
        admitted_at.push(started.elapsed());
    }

    assert!(admitted_at[1] < Duration::from_millis(100));
    assert!(admitted_at[2] >= Duration::from_millis(180), "admitted at {:?}", admitted_at[2]);

    for handle in handles {
        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.exit, ExitReason::DurationElapsed);
    }
    assert!(started.elapsed() >= Duration::from_millis(380));
    assert!(op.max_in_flight() <= 2);
}

#[tokio::test]
async fn test_try_submit_rejected_when_saturated() {
    let (pool, _registry) = pool(1, 1);
    let op = MockOperation::with_delay(10);

    let handle = pool.try_submit(op.task("first", Duration::from_millis(50))).unwrap();
    let rejected = pool.try_submit(op.task("second", Duration::from_millis(50)));
    assert!(matches!(rejected, Err(EngineError::AdmissionRejected(_))));

    handle.join().await.unwrap();
    assert!(pool.try_submit(op.task("third", Duration::ZERO)).is_ok());
}

#[tokio::test]
async fn test_shutdown_now_interrupts_running_call() {
    let (pool, registry) = pool(1, 2);
    let op = MockOperation::with_delay(5_000);

    let running = pool.submit(op.task("slow", Duration::from_secs(60))).await.unwrap();
    let queued = pool.submit(op.task("slow", Duration::from_secs(60))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.stats().queued_tasks, 1);

    let counter = registry.get("slow").unwrap();
    let started = Instant::now();
    pool.shutdown_now();

    let running = running.join().await.unwrap();
    let queued = queued.join().await.unwrap();
    assert_eq!(running.exit, ExitReason::Interrupted);
    assert_eq!(queued.exit, ExitReason::Interrupted);
    assert_eq!(queued.iterations, 0);
    assert!(started.elapsed() < Duration::from_secs(1));

    // An interrupted call leaves no sample behind
    assert_eq!(counter.retained(), 0);
    assert!(pool.is_terminated());
}

#[tokio::test]
async fn test_graceful_shutdown_finishes_current_call() {
    let (pool, _registry) = pool(1, 1);
    let op = MockOperation::with_delay(50);

    let handle = pool.submit(op.task("steady", Duration::from_secs(60))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    pool.shutdown();

    let outcome = handle.join().await.unwrap();
    assert_eq!(outcome.exit, ExitReason::Shutdown);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.successes, 1);
}

#[tokio::test]
async fn test_panicking_operation_releases_slot() {
    let (pool, registry) = pool(1, 1);

    let task = Task::new("explodes", Duration::from_secs(1), || async {
        let explode = true;
        if explode {
            panic!("operation blew up");
        }
        Ok(())
    });
    let handle = pool.submit(task).await.unwrap();

    let result = handle.join().await;
    assert!(matches!(result, Err(EngineError::TaskPanicked(ref label)) if label == "explodes"));
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(pool.stats().active_workers, 0);
    assert_eq!(pool.gate().available_permits(), 1);
    assert!(registry.get("explodes").is_none());
}
