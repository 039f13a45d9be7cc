pub mod address;
pub mod block;
pub mod canonical;
pub mod error;
pub mod merkle;
pub mod params;
pub mod transaction;

pub use address::{derive_address, validate_address, Network, COINBASE};
pub use block::{Block, BlockHeader};
pub use canonical::canonical_json;
pub use error::{BlockError, TxError, ValidationError};
pub use merkle::{build_proof, merkle_root, verify_proof, ProofPosition, ProofStep};
pub use params::{block_reward, now_ts};
pub use transaction::{Transaction, TxInput, TxKind, TxOutput};
