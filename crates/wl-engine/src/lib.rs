//! Workload Engine
//!
//! This crate runs long-lived, concurrent workloads against a transactional
//! store and observes them:
//! - AdmissionGate: Bounded admission of submitted tasks
//! - WorkerPool: Duration-bounded task loops on a fixed number of workers
//! - PoolController: Resize, cancel-and-restart and shutdown of the pool
//! - RetryingInvoker: Bounded retry with exponential backoff for transient store errors
//! - Session: Store connection abstraction and per-transaction session hints
//! - MetricsRegistry: Per-label call counters with percentiles and throughput

pub mod controller;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod session;

pub use controller::{ControllerConfig, PoolController};
pub use error::EngineError;
pub use gate::{AdmissionGate, GateSlot};
pub use metrics::{
    percentile, Counter, CounterLease, CounterSnapshot, MetricsConfig, MetricsRegistry,
    MetricsSummary,
};
pub use pool::{ExitReason, PoolSizing, Task, TaskHandle, TaskOutcome, WorkerPool};
pub use retry::{
    backoff, classify_failure, in_unit_of_work, retryable, AttemptOutcome, AttemptRecord,
    Invocation, RetryingInvoker,
};
pub use session::{apply_hints, hint_statements, Session};

pub use wl_common::{ErrorClass, PoolState, PoolStats, Priority, RetryPolicy, StoreError};

pub type Result<T> = std::result::Result<T, EngineError>;
