use aurum_crypto::CryptoError;
use thiserror::Error;

/// Failures raised while constructing or signing a transaction.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("invalid transaction field: {0}")]
    BadField(String),
    #[error("transaction is missing a signature or public key")]
    MissingSignature,
    #[error("signature verification failed: {0}")]
    InvalidSignature(String),
    #[error("cryptographic operation failed: {0}")]
    Crypto(#[from] CryptoError),
}

/// Validation verdicts surfaced to the mempool for ban accounting.
///
/// Every rejection names the failing rule; the variant is the taxonomy the
/// API boundary maps onto HTTP codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("bad field: {0}")]
    BadField(String),
    #[error("bad signature: {0}")]
    BadSignature(String),
    #[error("bad nonce: {0}")]
    BadNonce(String),
    #[error("double spend: {0}")]
    DoubleSpend(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("type rule violation: {0}")]
    TypeRule(String),
}

/// Consensus failures raised while validating a block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("proof of work not satisfied at difficulty {0}")]
    PowNotSatisfied(u32),
    #[error("merkle root mismatch")]
    MerkleMismatch,
    #[error("timestamp rule violated: {0}")]
    Timestamp(String),
}
