//! Store sessions and per-transaction session hints

use async_trait::async_trait;
use tracing::debug;
use wl_common::{Priority, RetryPolicy};

/// One connection to the transactional store
#[async_trait]
pub trait Session: Send {
    /// Whether a transaction is currently open on this session
    fn in_transaction(&self) -> bool;

    async fn begin(&mut self) -> anyhow::Result<()>;

    async fn execute(&mut self, statement: &str) -> anyhow::Result<()>;

    async fn commit(&mut self) -> anyhow::Result<()>;

    async fn rollback(&mut self) -> anyhow::Result<()>;
}

/// SET statements that apply `policy` to the current transaction, in
/// execution order
pub fn hint_statements(policy: &RetryPolicy) -> Vec<String> {
    let mut statements = Vec::new();

    if let Some(ms) = policy.transaction_timeout_ms {
        statements.push(format!("SET idle_in_transaction_session_timeout = '{}ms'", ms));
        statements.push(format!("SET statement_timeout = '{}ms'", ms));
    } else {
        if let Some(ms) = policy.statement_timeout_ms {
            statements.push(format!("SET statement_timeout = '{}ms'", ms));
        }
        if let Some(ms) = policy.idle_transaction_timeout_ms {
            statements.push(format!("SET idle_in_transaction_session_timeout = '{}ms'", ms));
        }
    }

    if policy.priority != Priority::Normal {
        statements.push(format!("SET TRANSACTION PRIORITY {}", policy.priority.as_sql()));
    }

    if policy.is_read_only() {
        statements.push("SET transaction_read_only = true".to_string());
    }

    if policy.follower_read {
        statements.push("SET TRANSACTION AS OF SYSTEM TIME follower_read_timestamp()".to_string());
    }

    statements
}

/// Execute the hint statements for `policy` on `session`
pub async fn apply_hints<S: Session + ?Sized>(session: &mut S, policy: &RetryPolicy) -> anyhow::Result<()> {
    for statement in hint_statements(policy) {
        debug!(statement = %statement, "Applying session hint");
        session.execute(&statement).await?;
    }
    Ok(())
}
