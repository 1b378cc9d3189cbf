//! PoolController - Owns the current worker pool generation
//!
//! Resizing and cancel-and-restart tear the current generation down (drain the
//! gate, interrupt every loop, wait for them to exit, clear all counters) and
//! swap in a fresh one. Reconfigurations never overlap.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{info, warn};
use wl_common::PoolStats;

use crate::error::EngineError;
use crate::metrics::MetricsRegistry;
use crate::pool::{PoolSizing, Task, TaskHandle, WorkerPool};
use crate::Result;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How often to check whether interrupted loops have exited
    pub termination_poll: Duration,
    /// How often to log while waiting for loops to exit
    pub progress_log_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            termination_poll: Duration::from_millis(100),
            progress_log_interval: Duration::from_secs(5),
        }
    }
}

pub struct PoolController {
    config: ControllerConfig,
    pool: RwLock<Arc<WorkerPool>>,
    registry: Arc<MetricsRegistry>,
    reconfigure: Mutex<()>,
}

impl PoolController {
    pub fn new(sizing: PoolSizing, registry: Arc<MetricsRegistry>) -> Result<Self> {
        Self::with_config(sizing, registry, ControllerConfig::default())
    }

    pub fn with_config(
        sizing: PoolSizing,
        registry: Arc<MetricsRegistry>,
        config: ControllerConfig,
    ) -> Result<Self> {
        sizing.validate()?;
        let pool = Arc::new(WorkerPool::new(sizing, Arc::clone(&registry)));
        Ok(Self {
            config,
            pool: RwLock::new(pool),
            registry,
            reconfigure: Mutex::new(()),
        })
    }

    fn current(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.pool.read())
    }

    pub async fn submit(&self, task: Task) -> Result<TaskHandle> {
        self.current().submit(task).await
    }

    pub fn try_submit(&self, task: Task) -> Result<TaskHandle> {
        self.current().try_submit(task)
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn sizing(&self) -> PoolSizing {
        self.current().sizing()
    }

    pub fn stats(&self) -> PoolStats {
        self.current().stats()
    }

    /// Any admitted loop still alive, or any submitter blocked on the gate
    pub fn has_active_workers(&self) -> bool {
        let pool = self.current();
        pool.outstanding() > 0 || pool.gate().has_waiters()
    }

    /// Fail if the pool is busy; call before changing configuration
    pub fn ensure_idle(&self) -> Result<()> {
        let pool = self.current();
        let outstanding = pool.outstanding();
        let waiting = pool.gate().waiting();
        if outstanding > 0 || waiting > 0 {
            return Err(EngineError::ActiveWorkers { outstanding, waiting });
        }
        Ok(())
    }

    /// Restart the pool with a new worker count and admission capacity.
    ///
    /// Negative values fall back to the resize defaults of
    /// [`PoolSizing::for_resize`]; a queue smaller than the thread count is
    /// rejected and the running pool is left untouched.
    pub async fn resize(&self, threads: i32, queue: i32) -> Result<()> {
        let sizing = PoolSizing::for_resize(threads, queue)?;
        self.restart_with(sizing).await
    }

    /// Interrupt every loop, clear all counters and start a fresh pool with
    /// the current sizing
    pub async fn cancel_and_restart(&self) -> Result<()> {
        let sizing = self.sizing();
        self.restart_with(sizing).await
    }

    async fn restart_with(&self, sizing: PoolSizing) -> Result<()> {
        let _guard = self.reconfigure.lock().await;
        let pool = self.current();

        info!(
            outstanding = pool.outstanding(),
            core_size = sizing.core_size,
            queue_capacity = sizing.queue_capacity,
            "Cancelling all workers"
        );
        pool.shutdown_now();
        self.await_termination(&pool, None).await;
        pool.mark_terminated();

        self.registry.clear();
        *self.pool.write() = Arc::new(WorkerPool::new(sizing, Arc::clone(&self.registry)));

        info!(
            core_size = sizing.core_size,
            queue_capacity = sizing.queue_capacity,
            "Worker pool restarted"
        );
        Ok(())
    }

    /// Stop the pool for good.
    ///
    /// Loops get `timeout` to finish their current call; the rest are
    /// interrupted. Returns whether the shutdown completed gracefully.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let _guard = self.reconfigure.lock().await;
        let pool = self.current();

        pool.shutdown();
        let graceful = self
            .await_termination(&pool, Some(Instant::now() + timeout))
            .await;
        if !graceful {
            warn!(
                outstanding = pool.outstanding(),
                timeout_secs = timeout.as_secs(),
                "Graceful shutdown timed out, interrupting workers"
            );
            pool.shutdown_now();
            self.await_termination(&pool, None).await;
        }
        pool.mark_terminated();

        info!(graceful, "Worker pool terminated");
        graceful
    }

    async fn await_termination(&self, pool: &WorkerPool, deadline: Option<Instant>) -> bool {
        let mut last_progress = Instant::now();
        loop {
            let outstanding = pool.outstanding();
            if outstanding == 0 {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            if last_progress.elapsed() >= self.config.progress_log_interval {
                info!(outstanding, "Awaiting worker termination");
                last_progress = Instant::now();
            }
            tokio::time::sleep(self.config.termination_poll).await;
        }
    }
}
