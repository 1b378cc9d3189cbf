//! WorkerPool - Duration-bounded task loops on a fixed number of workers
//!
//! Every admitted task holds a gate slot until its loop exits. The loop:
//! - Waits for one of `core_size` worker permits (the pool's queue)
//! - Runs its operation repeatedly until the duration elapses
//! - Records each completed call under the task's label
//! - Keeps going on transient failures, stops on the first fatal one
//! - Races every wait against the pool's interrupt signal

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wl_common::{available_cpus, ErrorClass, PoolState, PoolStats};

use crate::error::EngineError;
use crate::gate::{AdmissionGate, GateSlot};
use crate::metrics::{CounterLease, MetricsRegistry};
use crate::retry::classify_failure;
use crate::Result;

pub type Operation = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Worker count and admission capacity of a pool generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    pub core_size: u32,
    pub queue_capacity: u32,
}

impl PoolSizing {
    pub fn new(core_size: u32, queue_capacity: u32) -> Result<Self> {
        let sizing = Self { core_size, queue_capacity };
        sizing.validate()?;
        Ok(sizing)
    }

    /// Sizing for an operator-requested resize.
    ///
    /// A negative thread count means 2x the available CPUs and a negative
    /// queue size 2x the thread count. The queue must fit every thread.
    pub fn for_resize(threads: i32, queue: i32) -> Result<Self> {
        let core_size = if threads < 0 {
            available_cpus() * 2
        } else {
            threads as u32
        };
        let queue_capacity = if queue < 0 {
            core_size * 2
        } else {
            queue as u32
        };
        if queue_capacity < core_size {
            return Err(EngineError::Config(format!(
                "queue size ({}) must be >= thread count ({})",
                queue_capacity, core_size
            )));
        }
        Self::new(core_size, queue_capacity)
    }

    pub fn validate(&self) -> Result<()> {
        if self.core_size == 0 {
            return Err(EngineError::Config("core size must be > 0".into()));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::Config("queue capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// A unit of work to run repeatedly under a label for a target duration
#[derive(Clone)]
pub struct Task {
    label: String,
    duration: Duration,
    operation: Operation,
}

impl Task {
    pub fn new<F, Fut>(label: impl Into<String>, duration: Duration, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            label: label.into(),
            duration,
            operation: Arc::new(move || operation().boxed()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("duration", &self.duration)
            .finish()
    }
}

/// Why a task loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    DurationElapsed,
    /// The pool stopped running
    Shutdown,
    /// The pool interrupted the loop mid-call or while it waited for a worker
    Interrupted,
    /// First fatal failure, rendered with its cause chain
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub label: String,
    /// Completed calls
    pub iterations: u64,
    pub successes: u64,
    pub failures: u64,
    pub elapsed: Duration,
    pub exit: ExitReason,
}

pub struct TaskHandle {
    label: String,
    handle: JoinHandle<TaskOutcome>,
}

impl TaskHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit
    pub async fn join(self) -> Result<TaskOutcome> {
        let label = self.label;
        self.handle.await.map_err(|e| {
            error!(label = %label, error = %e, "Task loop aborted");
            EngineError::TaskPanicked(label)
        })
    }
}

/// Increments a gauge for as long as it is alive
struct InFlight(Arc<AtomicU32>);

impl InFlight {
    fn enter(gauge: &Arc<AtomicU32>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(gauge))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Gauges {
    /// Loops holding a worker
    active: Arc<AtomicU32>,
    /// Loops admitted but waiting for a worker
    queued: Arc<AtomicU32>,
    /// Loops admitted and not yet exited
    outstanding: Arc<AtomicU32>,
}

/// One generation of the worker pool
pub struct WorkerPool {
    sizing: PoolSizing,
    gate: AdmissionGate,
    workers: Arc<Semaphore>,
    state: Arc<RwLock<PoolState>>,
    interrupt: watch::Sender<bool>,
    gauges: Gauges,
    registry: Arc<MetricsRegistry>,
}

impl WorkerPool {
    pub fn new(sizing: PoolSizing, registry: Arc<MetricsRegistry>) -> Self {
        let (interrupt, _) = watch::channel(false);

        info!(
            core_size = sizing.core_size,
            queue_capacity = sizing.queue_capacity,
            "Starting worker pool"
        );

        Self {
            sizing,
            gate: AdmissionGate::new(sizing.queue_capacity),
            workers: Arc::new(Semaphore::new(sizing.core_size as usize)),
            state: Arc::new(RwLock::new(PoolState::Running)),
            interrupt,
            gauges: Gauges::default(),
            registry,
        }
    }

    /// Admit `task`, waiting for a gate slot if the pool is saturated
    pub async fn submit(&self, task: Task) -> Result<TaskHandle> {
        self.ensure_running()?;
        let slot = self.gate.acquire().await?;
        // The pool may have stopped while we were blocked
        self.ensure_running()?;
        Ok(self.spawn(task, slot))
    }

    /// Admit `task` only if a gate slot is free right now
    pub fn try_submit(&self, task: Task) -> Result<TaskHandle> {
        self.ensure_running()?;
        let slot = self.gate.try_acquire()?;
        Ok(self.spawn(task, slot))
    }

    fn ensure_running(&self) -> Result<()> {
        let state = self.state();
        if state != PoolState::Running {
            return Err(EngineError::AdmissionRejected(format!("worker pool is {}", state)));
        }
        Ok(())
    }

    fn spawn(&self, task: Task, slot: GateSlot) -> TaskHandle {
        let label = task.label.clone();
        let admitted = Admitted {
            _slot: slot,
            _outstanding: InFlight::enter(&self.gauges.outstanding),
            queued: InFlight::enter(&self.gauges.queued),
            counter: self.registry.lease(&task.label),
        };
        let ctx = LoopContext {
            workers: Arc::clone(&self.workers),
            state: Arc::clone(&self.state),
            interrupt: self.interrupt.subscribe(),
            active: Arc::clone(&self.gauges.active),
        };

        debug!(label = %label, duration_ms = task.duration.as_millis() as u64, "Task admitted");
        let handle = tokio::spawn(run_loop(task, ctx, admitted));
        TaskHandle { label, handle }
    }

    /// Stop admitting tasks and let running loops finish their current call
    pub fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if *state == PoolState::Running {
                *state = PoolState::Draining;
            }
        }
        self.gate.drain_all();
        info!(outstanding = self.outstanding(), "Worker pool shutting down");
    }

    /// Stop admitting tasks and interrupt every running call and wait
    pub fn shutdown_now(&self) {
        self.shutdown();
        self.interrupt.send_replace(true);
        warn!(
            active = self.active_workers(),
            queued = self.queued_tasks(),
            "Interrupting all workers"
        );
    }

    pub(crate) fn mark_terminated(&self) {
        *self.state.write() = PoolState::Terminated;
    }

    pub fn state(&self) -> PoolState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == PoolState::Running
    }

    /// No loop of this generation is still alive
    pub fn is_terminated(&self) -> bool {
        !self.is_running() && self.outstanding() == 0
    }

    pub fn sizing(&self) -> PoolSizing {
        self.sizing
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn active_workers(&self) -> u32 {
        self.gauges.active.load(Ordering::SeqCst)
    }

    pub fn queued_tasks(&self) -> u32 {
        self.gauges.queued.load(Ordering::SeqCst)
    }

    /// Admitted loops that have not exited yet
    pub fn outstanding(&self) -> u32 {
        self.gauges.outstanding.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            state: self.state(),
            core_size: self.sizing.core_size,
            queue_capacity: self.sizing.queue_capacity,
            active_workers: self.active_workers(),
            queued_tasks: self.queued_tasks(),
            available_permits: self.gate.available_permits(),
            waiting_submitters: self.gate.waiting(),
            label_count: self.registry.len(),
        }
    }
}

/// Everything an admitted loop releases when it exits
struct Admitted {
    _slot: GateSlot,
    _outstanding: InFlight,
    queued: InFlight,
    counter: CounterLease,
}

struct LoopContext {
    workers: Arc<Semaphore>,
    state: Arc<RwLock<PoolState>>,
    interrupt: watch::Receiver<bool>,
    active: Arc<AtomicU32>,
}

impl LoopContext {
    fn is_running(&self) -> bool {
        *self.state.read() == PoolState::Running
    }

    fn is_interrupted(&self) -> bool {
        *self.interrupt.borrow()
    }
}

/// Resolves once the interrupt flag is raised
async fn interrupted(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can interrupt us anymore
            std::future::pending::<()>().await;
        }
    }
}

async fn run_loop(task: Task, ctx: LoopContext, admitted: Admitted) -> TaskOutcome {
    let Admitted { _slot, _outstanding, queued, counter } = admitted;
    let label = task.label.as_str();
    let mut successes = 0u64;
    let mut failures = 0u64;
    let waited = Instant::now();

    let worker = tokio::select! {
        biased;
        _ = interrupted(ctx.interrupt.clone()) => None,
        permit = Arc::clone(&ctx.workers).acquire_owned() => permit.ok(),
    };
    drop(queued);

    let Some(_worker) = worker else {
        debug!(label = %label, "Task interrupted before it got a worker");
        return TaskOutcome {
            label: task.label.clone(),
            iterations: 0,
            successes,
            failures,
            elapsed: waited.elapsed(),
            exit: ExitReason::Interrupted,
        };
    };
    let _active = InFlight::enter(&ctx.active);
    let started = Instant::now();

    let exit = loop {
        if ctx.is_interrupted() {
            break ExitReason::Interrupted;
        }
        if !ctx.is_running() {
            break ExitReason::Shutdown;
        }

        let begin = counter.enter();
        let result = tokio::select! {
            biased;
            _ = interrupted(ctx.interrupt.clone()) => None,
            result = (task.operation)() => Some(result),
        };

        match result {
            None => break ExitReason::Interrupted,
            Some(Ok(())) => {
                counter.exit(begin, true);
                successes += 1;
            }
            Some(Err(err)) => {
                counter.exit(begin, false);
                failures += 1;
                let iteration = successes + failures;
                match classify_failure(&err) {
                    ErrorClass::Transient => {
                        warn!(label = %label, iteration, error = %err, "Transient failure, continuing");
                    }
                    ErrorClass::Fatal => {
                        let message = format!("{:#}", err);
                        error!(
                            label = %label,
                            iteration,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            error = %message,
                            "Fatal failure, stopping task"
                        );
                        break ExitReason::Fatal(message);
                    }
                }
            }
        }

        if started.elapsed() >= task.duration {
            break ExitReason::DurationElapsed;
        }
    };

    let outcome = TaskOutcome {
        label: task.label.clone(),
        iterations: successes + failures,
        successes,
        failures,
        elapsed: started.elapsed(),
        exit,
    };

    debug!(
        label = %label,
        iterations = outcome.iterations,
        failures = outcome.failures,
        elapsed_ms = outcome.elapsed.as_millis() as u64,
        exit = ?outcome.exit,
        "Task finished"
    );

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizing_validation() {
        assert!(PoolSizing::new(0, 4).is_err());
        assert!(PoolSizing::new(4, 0).is_err());
        assert_eq!(PoolSizing::new(2, 8).unwrap().queue_capacity, 8);
    }

    #[test]
    fn test_resize_defaults() {
        let cpus = available_cpus();

        let sizing = PoolSizing::for_resize(-1, -1).unwrap();
        assert_eq!(sizing.core_size, cpus * 2);
        assert_eq!(sizing.queue_capacity, cpus * 4);

        let sizing = PoolSizing::for_resize(3, -1).unwrap();
        assert_eq!(sizing, PoolSizing { core_size: 3, queue_capacity: 6 });

        assert!(matches!(PoolSizing::for_resize(8, 4), Err(EngineError::Config(_))));
        assert!(PoolSizing::for_resize(0, 4).is_err());
    }

    #[tokio::test]
    async fn test_zero_duration_runs_once() {
        let registry = Arc::new(MetricsRegistry::new());
        let pool = WorkerPool::new(PoolSizing::new(1, 1).unwrap(), Arc::clone(&registry));

        let handle = pool
            .submit(Task::new("once", Duration::ZERO, || async { Ok(()) }))
            .await
            .unwrap();
        let outcome = handle.join().await.unwrap();

        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.exit, ExitReason::DurationElapsed);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.gate().available_permits(), 1);
        // The last reference went away with the loop
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_rejected() {
        let pool = WorkerPool::new(PoolSizing::new(1, 1).unwrap(), Arc::new(MetricsRegistry::new()));
        pool.shutdown();
        assert_eq!(pool.state(), PoolState::Draining);

        let result = pool.submit(Task::new("late", Duration::ZERO, || async { Ok(()) })).await;
        assert!(matches!(result, Err(EngineError::AdmissionRejected(_))));
        assert!(pool.is_terminated());
    }
}
