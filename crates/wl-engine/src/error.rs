use thiserror::Error;
use wl_common::StoreError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("Interrupted while waiting for {0}")]
    Interrupted(&'static str),

    #[error("Too many transient errors ({attempts}) for operation [{operation}]. Giving up!")]
    RetryExhausted {
        attempts: u32,
        operation: String,
        #[source]
        last: Option<StoreError>,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Operation [{0}] invoked inside an already active transaction")]
    TransactionActive(String),

    #[error("Pool has {outstanding} outstanding tasks and {waiting} blocked submitters")]
    ActiveWorkers { outstanding: u32, waiting: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task [{0}] panicked")]
    TaskPanicked(String),

    #[error(transparent)]
    Operation(#[from] anyhow::Error),
}

impl EngineError {
    /// Convert into an `anyhow::Error`, unwrapping raw operation failures so
    /// their cause chain stays visible to classification.
    pub fn into_anyhow(self) -> anyhow::Error {
        match self {
            EngineError::Operation(err) => err,
            other => anyhow::Error::new(other),
        }
    }
}
