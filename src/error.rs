use thiserror::Error;

/// Failures of the work queue store itself.
///
/// None of these say anything about an item's ledger outcome; the relay logs
/// them and moves on to the next tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Queue item not found: {0}")]
    NotFound(u64),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupted queue row {id}: {reason}")]
    Corrupted { id: i64, reason: String },

    #[error("Timestamp {0} ms is outside the range the store can hold")]
    InvalidTimestamp(u64),

    /// The item is no longer leased to `worker`: its lease lapsed and it was
    /// released, reclaimed or finished by someone else.
    #[error("Lease on queue item {id} no longer held by {worker}")]
    LeaseLost { id: u64, worker: String },
}

/// Per-item ledger failures, carried inside a `RelayOutcome::Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Invalid ledger call: {0}")]
    InvalidCall(String),

    #[error("Simulation reverted: {0}")]
    Simulation(String),

    #[error("Submission failed: {0}")]
    Submission(String),

    #[error("Ledger {operation} timed out after {seconds} seconds")]
    Timeout {
        operation: String,
        seconds: u64,
    },
}

impl LedgerError {
    /// Transport-class failures. A reverted or malformed call will revert again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Submission(_) | LedgerError::Timeout { .. })
    }
}

#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Wallet {0} does not exist")]
    UnknownWallet(usize),

    #[error("Relay pool has been stopped")]
    Stopped,

    #[error("Timeout waiting for {operation} after {seconds} seconds")]
    Timeout {
        operation: String,
        seconds: u64,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
