use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

pub mod logging;

// ============================================================================
// Store Errors
// ============================================================================

/// SQLSTATE reported by the store when a transaction is aborted due to a
/// serialization conflict with a concurrent transaction.
pub const SERIALIZATION_FAILURE: &str = "40001";

/// An error reported by the transactional store.
///
/// Mirrors what a SQL driver surfaces: a five character SQLSTATE, a vendor
/// error code and a message. Drivers may report several errors for one
/// failed call; those follow-on errors hang off `next` and are only used for
/// logging, they are not part of the `source()` chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    pub sql_state: String,
    pub code: i32,
    pub message: String,
    next: Option<Box<StoreError>>,
}

impl StoreError {
    pub fn new(sql_state: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sql_state: sql_state.into(),
            code: 0,
            message: message.into(),
            next: None,
        }
    }

    /// A `40001` restart error, the one failure the engine retries.
    pub fn serialization_failure(message: impl Into<String>) -> Self {
        Self::new(SERIALIZATION_FAILURE, message)
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    /// Append a follow-on error at the end of the chain.
    pub fn with_next(mut self, next: StoreError) -> Self {
        self.append(next);
        self
    }

    fn append(&mut self, next: StoreError) {
        match self.next {
            Some(ref mut existing) => existing.append(next),
            None => self.next = Some(Box::new(next)),
        }
    }

    pub fn is_serialization_failure(&self) -> bool {
        self.sql_state == SERIALIZATION_FAILURE
    }

    /// This error followed by every follow-on error the store reported.
    pub fn chain(&self) -> impl Iterator<Item = &StoreError> {
        std::iter::successors(Some(self), |e| e.next.as_deref())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SQL state [{}] code [{}]: {}", self.sql_state, self.code, self.message)
    }
}

impl StdError for StoreError {}

/// Outcome of classifying a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Aborted due to contention; safe to run again.
    Transient,
    /// Invalid or futile; running again will not help.
    Fatal,
}

/// Walk the cause chain and return the innermost store error, if any.
pub fn innermost_store_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a StoreError> {
    std::iter::successors(Some(err), |e| (*e).source())
        .filter_map(|e| e.downcast_ref::<StoreError>())
        .last()
}

/// Classify an error by its innermost store error.
///
/// Anything that does not bottom out in a serialization failure is fatal.
pub fn classify(err: &(dyn StdError + 'static)) -> ErrorClass {
    match innermost_store_error(err) {
        Some(store) if store.is_serialization_failure() => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Transaction priority hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    Low,
    High,
}

impl Priority {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
            Priority::High => "HIGH",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Combined transaction timeout cannot be set together with statement or idle-in-transaction timeouts")]
    ConflictingTimeouts,

    #[error("Max backoff must be greater than zero")]
    ZeroBackoff,
}

/// Retry and session-hint settings for one unit of work.
///
/// Attached to an invoker at the call site and never mutated afterwards;
/// different call sites may carry different policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero or negative disables retries.
    pub max_attempts: i32,
    /// Upper bound for a single backoff sleep.
    pub max_backoff_ms: u64,
    /// Multiplied by 2^attempt to form the exponential part of the backoff.
    pub backoff_base_ms: u64,
    /// Upper bound (inclusive) of the random jitter added to every backoff.
    pub max_jitter_ms: u64,
    pub statement_timeout_ms: Option<u64>,
    pub idle_transaction_timeout_ms: Option<u64>,
    /// Sets both statement and idle-in-transaction timeouts to one value.
    pub transaction_timeout_ms: Option<u64>,
    pub read_only: bool,
    /// Read from the nearest replica at a bounded-staleness timestamp.
    /// Implies `read_only`.
    pub follower_read: bool,
    pub priority: Priority,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_backoff_ms: 30_000,
            backoff_base_ms: 1,
            max_jitter_ms: 1_000,
            statement_timeout_ms: None,
            idle_transaction_timeout_ms: None,
            transaction_timeout_ms: None,
            read_only: false,
            follower_read: false,
            priority: Priority::Normal,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self { max_attempts: 0, ..Self::default() }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_backoff_ms(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = max_backoff_ms;
        self
    }

    pub fn with_jitter_ms(mut self, max_jitter_ms: u64) -> Self {
        self.max_jitter_ms = max_jitter_ms;
        self
    }

    pub fn with_statement_timeout_ms(mut self, ms: u64) -> Self {
        self.statement_timeout_ms = Some(ms);
        self
    }

    pub fn with_idle_transaction_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_transaction_timeout_ms = Some(ms);
        self
    }

    pub fn with_transaction_timeout_ms(mut self, ms: u64) -> Self {
        self.transaction_timeout_ms = Some(ms);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn follower_read(mut self) -> Self {
        self.follower_read = true;
        self
    }

    pub fn retries_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only || self.follower_read
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.transaction_timeout_ms.is_some()
            && (self.statement_timeout_ms.is_some() || self.idle_transaction_timeout_ms.is_some())
        {
            return Err(PolicyError::ConflictingTimeouts);
        }
        if self.retries_enabled() && self.max_backoff_ms == 0 {
            return Err(PolicyError::ZeroBackoff);
        }
        Ok(())
    }
}

// ============================================================================
// Pool State
// ============================================================================

/// Lifecycle of a worker pool generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Running,
    Draining,
    Terminated,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolState::Running => "running",
            PoolState::Draining => "draining",
            PoolState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the worker pool and its admission gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub state: PoolState,
    pub core_size: u32,
    pub queue_capacity: u32,
    /// Loops currently holding a worker.
    pub active_workers: u32,
    /// Admitted loops waiting for a worker.
    pub queued_tasks: u32,
    pub available_permits: usize,
    /// Submitters blocked on the admission gate.
    pub waiting_submitters: u32,
    pub label_count: usize,
}

/// Number of CPUs the process may use; pool defaults scale with it.
pub fn available_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("data access failed")]
    struct Wrapper(#[source] StoreError);

    #[derive(Debug, Error)]
    #[error("transaction failed")]
    struct Outer(#[source] Wrapper);

    #[test]
    fn test_classify_unwraps_nested_causes() {
        let err = Outer(Wrapper(StoreError::serialization_failure("restart transaction")));
        assert_eq!(classify(&err), ErrorClass::Transient);

        let err = Outer(Wrapper(StoreError::new("23505", "duplicate key")));
        assert_eq!(classify(&err), ErrorClass::Fatal);
    }

    #[test]
    fn test_classify_without_store_error_is_fatal() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(classify(&err), ErrorClass::Fatal);
    }

    #[test]
    fn test_follow_on_chain() {
        let err = StoreError::new("42601", "syntax error")
            .with_code(7)
            .with_next(StoreError::new("25P02", "transaction aborted"))
            .with_next(StoreError::new("08006", "connection failure"));

        let states: Vec<&str> = err.chain().map(|e| e.sql_state.as_str()).collect();
        assert_eq!(states, vec!["42601", "25P02", "08006"]);
        assert_eq!(err.to_string(), "SQL state [42601] code [7]: syntax error");
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());

        let conflicting = RetryPolicy::default()
            .with_transaction_timeout_ms(5_000)
            .with_statement_timeout_ms(1_000);
        assert_eq!(conflicting.validate(), Err(PolicyError::ConflictingTimeouts));

        let zero = RetryPolicy::default().with_max_backoff_ms(0);
        assert_eq!(zero.validate(), Err(PolicyError::ZeroBackoff));
        assert!(RetryPolicy::no_retry().with_max_backoff_ms(0).validate().is_ok());
    }

    #[test]
    fn test_follower_read_implies_read_only() {
        let policy = RetryPolicy::default().follower_read();
        assert!(policy.is_read_only());
        assert!(!policy.read_only);
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 3, "priority": "high"}"#).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.priority, Priority::High);
        assert_eq!(policy.max_backoff_ms, 30_000);
    }
}
