//! Bounded admission of tasks into the worker pool.
//!
//! A submitter must hold a [`GateSlot`] for as long as its task is queued or
//! running, so the number of outstanding tasks never exceeds the gate
//! capacity. Slots are returned when dropped.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::Result;

pub struct AdmissionGate {
    capacity: u32,
    semaphore: Arc<Semaphore>,
    /// Submitters currently blocked in `acquire`
    waiting: Arc<AtomicU32>,
}

/// An admission slot, released on drop
#[derive(Debug)]
pub struct GateSlot {
    _permit: OwnedSemaphorePermit,
}

struct Waiting(Arc<AtomicU32>);

impl Waiting {
    fn enter(waiting: &Arc<AtomicU32>) -> Self {
        waiting.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(waiting))
    }
}

impl Drop for Waiting {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionGate {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            waiting: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Wait for a free slot.
    ///
    /// Fails with [`EngineError::Interrupted`] if the gate is drained while
    /// waiting. Dropping the returned future gives up the wait without
    /// consuming a slot.
    pub async fn acquire(&self) -> Result<GateSlot> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(GateSlot { _permit: permit }),
            Err(TryAcquireError::Closed) => return Err(EngineError::Interrupted("admission slot")),
            Err(TryAcquireError::NoPermits) => {}
        }

        let _waiting = Waiting::enter(&self.waiting);
        debug!(capacity = self.capacity, "Admission gate saturated, waiting for a slot");
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map(|permit| GateSlot { _permit: permit })
            .map_err(|_| EngineError::Interrupted("admission slot"))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Result<GateSlot> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(GateSlot { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(EngineError::AdmissionRejected(format!(
                "admission gate saturated ({} slots)",
                self.capacity
            ))),
            Err(TryAcquireError::Closed) => {
                Err(EngineError::AdmissionRejected("admission gate closed".to_string()))
            }
        }
    }

    /// Forget every free slot and close the gate.
    ///
    /// Blocked submitters wake up with [`EngineError::Interrupted`]; slots
    /// still held are unaffected. Returns the number of slots drained.
    pub fn drain_all(&self) -> u32 {
        let available = self.semaphore.available_permits() as u32;
        let drained = match self.semaphore.try_acquire_many(available) {
            Ok(permits) => {
                permits.forget();
                available
            }
            Err(_) => 0,
        };
        self.semaphore.close();
        info!(drained, waiting = self.waiting(), "Admission gate drained");
        drained
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn waiting(&self) -> u32 {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn has_waiters(&self) -> bool {
        self.waiting() > 0
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

impl std::fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("capacity", &self.capacity)
            .field("available", &self.available_permits())
            .field("waiting", &self.waiting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_slots_bounded_and_released_on_drop() {
        let gate = AdmissionGate::new(2);
        let first = gate.acquire().await.unwrap();
        let _second = gate.try_acquire().unwrap();
        assert_eq!(gate.available_permits(), 0);
        assert!(matches!(gate.try_acquire(), Err(EngineError::AdmissionRejected(_))));

        drop(first);
        assert_eq!(gate.available_permits(), 1);
        assert!(gate.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_drain_interrupts_waiters() {
        let gate = Arc::new(AdmissionGate::new(1));
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gate.waiting(), 1);
        assert!(gate.has_waiters());

        gate.drain_all();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(EngineError::Interrupted(_))));
        assert_eq!(gate.waiting(), 0);

        drop(held);
        assert!(matches!(gate.try_acquire(), Err(EngineError::AdmissionRejected(_))));
    }

    #[tokio::test]
    async fn test_cancelled_acquire_consumes_nothing() {
        let gate = AdmissionGate::new(1);
        let held = gate.acquire().await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(20), gate.acquire()).await;
        assert!(timed_out.is_err());
        assert_eq!(gate.waiting(), 0);

        drop(held);
        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_drain_forgets_free_slots() {
        let gate = AdmissionGate::new(3);
        let _held = gate.acquire().await.unwrap();
        assert_eq!(gate.drain_all(), 2);
        assert_eq!(gate.available_permits(), 0);
        assert!(gate.is_closed());
    }
}
