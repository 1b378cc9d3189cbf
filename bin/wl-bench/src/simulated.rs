//! In-memory stand-in for a contended transactional store.
//!
//! Every round trip sleeps for the configured latency and then fails with a
//! serialization conflict or an internal error at the configured rates.
//! Writes are buffered per transaction and applied atomically on commit, so
//! the total balance across all accounts never changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::trace;
use wl_common::StoreError;
use wl_config::WorkloadSettings;
use wl_engine::Session;

pub struct SimulatedStore {
    accounts: Mutex<Vec<i64>>,
    transient_rate: f64,
    fatal_rate: f64,
    latency: Duration,
}

impl SimulatedStore {
    pub fn new(accounts: usize, opening_balance: i64, settings: &WorkloadSettings) -> Self {
        Self {
            accounts: Mutex::new(vec![opening_balance; accounts.max(2)]),
            transient_rate: settings.transient_rate,
            fatal_rate: settings.fatal_rate,
            latency: Duration::from_millis(settings.latency_ms),
        }
    }

    pub fn session(self: &Arc<Self>) -> SimulatedSession {
        SimulatedSession {
            store: Arc::clone(self),
            open: false,
            pending: Vec::new(),
        }
    }

    pub fn total_balance(&self) -> i64 {
        self.accounts.lock().iter().sum()
    }

    pub fn account_count(&self) -> usize {
        self.accounts.lock().len()
    }

    /// Two distinct accounts and an amount to move between them
    pub fn random_transfer(&self) -> (usize, usize, i64) {
        let n = self.account_count();
        let mut rng = rand::rng();
        let from = rng.random_range(0..n);
        let to = (from + rng.random_range(1..n)) % n;
        (from, to, rng.random_range(1..=100))
    }

    pub fn random_account(&self) -> usize {
        rand::rng().random_range(0..self.account_count())
    }

    /// A statement outside any transaction
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.round_trip().await
    }

    async fn round_trip(&self) -> anyhow::Result<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let roll: f64 = rand::rng().random();
        if roll < self.fatal_rate {
            return Err(StoreError::new("XX000", "internal error: simulated node failure")
                .with_code(500)
                .with_next(StoreError::new("25P02", "current transaction is aborted"))
                .into());
        }
        if roll < self.fatal_rate + self.transient_rate {
            return Err(StoreError::serialization_failure(
                "restart transaction: TransactionRetryWithProtoRefreshError: simulated write conflict",
            )
            .into());
        }
        Ok(())
    }
}

pub struct SimulatedSession {
    store: Arc<SimulatedStore>,
    open: bool,
    /// Balance deltas applied on commit
    pending: Vec<(usize, i64)>,
}

impl SimulatedSession {
    pub async fn transfer(&mut self, from: usize, to: usize, amount: i64) -> anyhow::Result<()> {
        self.store.round_trip().await?;
        self.pending.push((from, -amount));
        self.store.round_trip().await?;
        self.pending.push((to, amount));
        Ok(())
    }

    pub async fn balance(&mut self, account: usize) -> anyhow::Result<i64> {
        self.store.round_trip().await?;
        let balance = self.store.accounts.lock().get(account).copied().unwrap_or_default();
        Ok(balance)
    }
}

#[async_trait]
impl Session for SimulatedSession {
    fn in_transaction(&self) -> bool {
        self.open
    }

    async fn begin(&mut self) -> anyhow::Result<()> {
        self.open = true;
        self.pending.clear();
        Ok(())
    }

    async fn execute(&mut self, statement: &str) -> anyhow::Result<()> {
        trace!(statement, "Executing statement");
        Ok(())
    }

    async fn commit(&mut self) -> anyhow::Result<()> {
        self.open = false;
        let pending = std::mem::take(&mut self.pending);
        self.store.round_trip().await?;

        let mut accounts = self.store.accounts.lock();
        for (account, delta) in pending {
            if let Some(balance) = accounts.get_mut(account) {
                *balance += delta;
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> anyhow::Result<()> {
        self.open = false;
        self.pending.clear();
        Ok(())
    }
}
