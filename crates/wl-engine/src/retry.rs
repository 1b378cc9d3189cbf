//! Bounded retry for units of work that must appear atomic.
//!
//! A failed attempt is classified by the innermost store error in its cause
//! chain. Serialization conflicts (`40001`) are retried after an exponential
//! backoff with random jitter; everything else propagates immediately.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use tracing::{debug, error, info, warn};
use wl_common::{ErrorClass, RetryPolicy, StoreError};

use crate::error::EngineError;
use crate::session::{apply_hints, Session};
use crate::Result;

tokio::task_local! {
    /// Name of the unit of work the current task is executing
    static UNIT_OF_WORK: String;
}

/// True when called from within an attempt of a retrying invocation
pub fn in_unit_of_work() -> bool {
    UNIT_OF_WORK.try_with(|_| ()).is_ok()
}

/// Classify a failed operation.
///
/// An exhausted inner retry counts as transient so an outer loop keeps going;
/// otherwise the innermost store error decides and anything without one is
/// fatal.
pub fn classify_failure(err: &anyhow::Error) -> ErrorClass {
    for cause in err.chain() {
        match cause.downcast_ref::<EngineError>() {
            Some(EngineError::RetryExhausted { .. }) => return ErrorClass::Transient,
            Some(EngineError::Operation(inner)) => return classify_failure(inner),
            _ => {}
        }
    }
    wl_common::classify(root_cause_chain(err))
}

fn store_error_of(err: &anyhow::Error) -> Option<&StoreError> {
    wl_common::innermost_store_error(root_cause_chain(err))
}

fn root_cause_chain(err: &anyhow::Error) -> &(dyn StdError + 'static) {
    err.as_ref()
}

/// Sleep before the next attempt after `attempt` (1-based) failed.
///
/// `min(max_backoff, 2^attempt * base + jitter)` with jitter uniform in
/// `[0, max_jitter]`.
pub fn backoff<R: Rng + ?Sized>(attempt: u32, policy: &RetryPolicy, rng: &mut R) -> Duration {
    let exponential = 1u64
        .checked_shl(attempt)
        .unwrap_or(u64::MAX)
        .saturating_mul(policy.backoff_base_ms);
    let jitter = rng.random_range(0..=policy.max_jitter_ms);
    Duration::from_millis(exponential.saturating_add(jitter).min(policy.max_backoff_ms))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Transient,
    Fatal,
}

/// One attempt of an invocation
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started: Instant,
    pub outcome: AttemptOutcome,
}

/// Result of an invocation together with its attempt trace
#[derive(Debug)]
pub struct Invocation<T> {
    pub result: Result<T>,
    pub attempts: Vec<AttemptRecord>,
}

/// Runs a unit of work under a retry policy
#[derive(Debug, Clone)]
pub struct RetryingInvoker {
    name: String,
    policy: Arc<RetryPolicy>,
}

impl RetryingInvoker {
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            policy: Arc::new(policy),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn invoke<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempts = Vec::new();
        self.run(&mut attempts, op).await
    }

    /// Like [`invoke`](Self::invoke) but also returns every attempt made
    pub async fn invoke_recorded<T, F, Fut>(&self, op: F) -> Invocation<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempts = Vec::new();
        let result = self.run(&mut attempts, op).await;
        Invocation { result, attempts }
    }

    /// Run `op` inside a store transaction on `session`.
    ///
    /// Every attempt begins a transaction, applies the policy's session
    /// hints, runs the operation and commits. A failed attempt is rolled back
    /// before it is classified; a failing commit counts like any other failure.
    pub async fn invoke_in_session<S, T, F>(&self, session: &mut S, mut op: F) -> Result<T>
    where
        S: Session + ?Sized,
        F: for<'s> FnMut(&'s mut S) -> BoxFuture<'s, anyhow::Result<T>>,
    {
        if session.in_transaction() {
            return Err(EngineError::TransactionActive(self.name.clone()));
        }
        self.ensure_outside_unit_of_work()?;

        let started = Instant::now();
        let mut attempts = Vec::new();
        loop {
            let attempt = attempts.len() as u32 + 1;
            let attempt_started = Instant::now();
            let result = UNIT_OF_WORK
                .scope(self.name.clone(), self.session_attempt(&mut *session, &mut op))
                .await;

            match result {
                Ok(value) => {
                    self.succeeded(&mut attempts, attempt, attempt_started, started);
                    return Ok(value);
                }
                Err(err) => {
                    self.failed(&mut attempts, attempt, attempt_started, started, err).await?;
                }
            }
        }
    }

    async fn session_attempt<S, T, F>(&self, session: &mut S, op: &mut F) -> anyhow::Result<T>
    where
        S: Session + ?Sized,
        F: for<'s> FnMut(&'s mut S) -> BoxFuture<'s, anyhow::Result<T>>,
    {
        session.begin().await?;

        let outcome = match apply_hints(&mut *session, &self.policy).await {
            Ok(()) => op(&mut *session).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(value) => {
                session.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = session.rollback().await {
                    warn!(operation = %self.name, error = %rollback, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn run<T, F, Fut>(&self, attempts: &mut Vec<AttemptRecord>, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.ensure_outside_unit_of_work()?;

        let started = Instant::now();
        loop {
            let attempt = attempts.len() as u32 + 1;
            let attempt_started = Instant::now();
            let result = UNIT_OF_WORK.scope(self.name.clone(), op()).await;

            match result {
                Ok(value) => {
                    self.succeeded(attempts, attempt, attempt_started, started);
                    return Ok(value);
                }
                Err(err) => self.failed(attempts, attempt, attempt_started, started, err).await?,
            }
        }
    }

    fn ensure_outside_unit_of_work(&self) -> Result<()> {
        if let Ok(outer) = UNIT_OF_WORK.try_with(|name| name.clone()) {
            error!(operation = %self.name, outer = %outer, "Unit of work invoked inside an active transaction");
            return Err(EngineError::TransactionActive(self.name.clone()));
        }
        Ok(())
    }

    fn succeeded(&self, attempts: &mut Vec<AttemptRecord>, attempt: u32, attempt_started: Instant, started: Instant) {
        attempts.push(AttemptRecord {
            attempt,
            started: attempt_started,
            outcome: AttemptOutcome::Succeeded,
        });
        if attempt > 1 {
            info!(
                operation = %self.name,
                attempts = attempt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Recovered from transient errors"
            );
        }
    }

    /// Record a failed attempt, then either back off for the next one or
    /// return the error that ends the invocation
    async fn failed(
        &self,
        attempts: &mut Vec<AttemptRecord>,
        attempt: u32,
        attempt_started: Instant,
        started: Instant,
        err: anyhow::Error,
    ) -> Result<()> {
        let class = classify_failure(&err);
        attempts.push(AttemptRecord {
            attempt,
            started: attempt_started,
            outcome: match class {
                ErrorClass::Transient => AttemptOutcome::Transient,
                ErrorClass::Fatal => AttemptOutcome::Fatal,
            },
        });

        if class == ErrorClass::Fatal {
            self.log_fatal(attempt, started, &err);
        }
        if class == ErrorClass::Fatal || !self.policy.retries_enabled() {
            return Err(EngineError::Operation(err));
        }

        if attempt >= self.policy.max_attempts as u32 {
            warn!(operation = %self.name, attempts = attempt, "Too many transient errors, giving up");
            return Err(EngineError::RetryExhausted {
                attempts: attempt,
                operation: self.name.clone(),
                last: store_error_of(&err).cloned(),
            });
        }

        let delay = backoff(attempt, &self.policy, &mut rand::rng());
        if attempt == 1 {
            warn!(
                operation = %self.name,
                attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Transient error, retrying"
            );
        } else {
            debug!(
                operation = %self.name,
                attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Transient error, retrying"
            );
        }
        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn log_fatal(&self, attempt: u32, started: Instant, err: &anyhow::Error) {
        error!(
            operation = %self.name,
            attempt,
            elapsed_ms = started.elapsed().as_millis() as u64,
            error = %err,
            "Fatal error in unit of work"
        );
        if let Some(store) = store_error_of(err) {
            for reported in store.chain() {
                error!(
                    operation = %self.name,
                    sql_state = %reported.sql_state,
                    code = reported.code,
                    message = %reported.message,
                    "Store reported error"
                );
            }
        }
    }
}

/// Wrap `op` so every call runs under its own retrying invocation.
///
/// The returned closure fits anywhere an operation is expected, including
/// [`Task::new`](crate::pool::Task::new). Exhaustion surfaces as a transient
/// failure to an outer loop, fatal errors as the raw operation error.
pub fn retryable<T, F, Fut>(
    name: impl Into<String>,
    policy: RetryPolicy,
    op: F,
) -> impl Fn() -> BoxFuture<'static, anyhow::Result<T>> + Clone + Send + Sync + 'static
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let invoker = RetryingInvoker::new(name, policy);
    let op = Arc::new(op);
    move || {
        let invoker = invoker.clone();
        let op = Arc::clone(&op);
        async move { invoker.invoke(|| op()).await.map_err(EngineError::into_anyhow) }.boxed()
    }
}
