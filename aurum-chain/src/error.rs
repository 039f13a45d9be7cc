use aurum_core::error::{BlockError, ValidationError};
use thiserror::Error;

/// Consensus-layer failures. `FatalState` is non-recoverable: ingestion
/// halts and the on-disk state is preserved as-is for the operator.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("invalid transaction: {0}")]
    Tx(#[from] ValidationError),
    #[error("fatal state error: {0}")]
    FatalState(String),
}

impl From<aurum_storage::StorageError> for ChainError {
    fn from(e: aurum_storage::StorageError) -> Self {
        ChainError::FatalState(e.to_string())
    }
}

/// Admission verdicts for the mempool. Each maps onto a counter and, at
/// the API boundary, an HTTP status.
#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("transaction already known")]
    Duplicate,
    #[error("coinbase transactions are not accepted from the network")]
    Coinbase,
    #[error("fee rate too low")]
    FeeTooLow,
    #[error("sender has too many pending transactions")]
    SenderCap,
    #[error("sender is temporarily banned; retry after {retry_after:.0}s")]
    Banned { retry_after: f64 },
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("input is locked by pending transaction {0}")]
    LockConflict(String),
    #[error("parked as orphan: unknown parent output")]
    Orphaned,
    #[error("replace-by-fee rejected: {0}")]
    Rbf(String),
}
