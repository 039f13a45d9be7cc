use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical::canonical_json;
use crate::error::BlockError;
use crate::merkle::merkle_root;
use crate::transaction::Transaction;

/// Nonces checked between cancellation-flag reads in the mining loop.
const MINE_BATCH: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub index: u64,
    pub previous_hash: String,
    pub merkle_root: String,
    pub timestamp: f64,
    pub difficulty: u32,
    pub nonce: u64,
}

impl BlockHeader {
    /// Block hash: SHA-256 over the canonical header encoding.
    pub fn calculate_hash(&self) -> String {
        let preimage = json!({
            "index": self.index,
            "previous_hash": self.previous_hash,
            "merkle_root": self.merkle_root,
            "timestamp": self.timestamp,
            "difficulty": self.difficulty,
            "nonce": self.nonce,
        });
        aurum_crypto::sha256_hex(canonical_json(&preimage).as_bytes())
    }
}

/// A block as it travels on the wire: flattened header fields, the full
/// transaction list, and the (redundant, always recomputed) hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    #[serde(flatten)]
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub hash: String,
}

/// `true` when `hash` carries `difficulty` leading zero hex digits.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let target = difficulty as usize;
    hash.len() >= target && hash.bytes().take(target).all(|b| b == b'0')
}

impl Block {
    pub fn new(
        index: u64,
        transactions: Vec<Transaction>,
        previous_hash: String,
        difficulty: u32,
        timestamp: f64,
    ) -> Self {
        let txids: Vec<String> = transactions
            .iter()
            .filter_map(|tx| tx.txid.clone())
            .collect();
        let header = BlockHeader {
            index,
            previous_hash,
            merkle_root: merkle_root(&txids),
            timestamp,
            difficulty,
            nonce: 0,
        };
        Self {
            header,
            transactions,
            hash: String::new(),
        }
    }

    pub fn txids(&self) -> Vec<String> {
        self.transactions
            .iter()
            .filter_map(|tx| tx.txid.clone())
            .collect()
    }

    /// Search the nonce space until the hash meets the difficulty target.
    ///
    /// The cancellation flag is checked once per batch so an external block
    /// landing on the same height aborts the search promptly. Returns the
    /// winning hash, or `None` when cancelled.
    pub fn mine(&mut self, cancel: &AtomicBool) -> Option<String> {
        loop {
            for _ in 0..MINE_BATCH {
                let hash = self.header.calculate_hash();
                if meets_difficulty(&hash, self.header.difficulty) {
                    self.hash = hash.clone();
                    return Some(hash);
                }
                self.header.nonce = self.header.nonce.wrapping_add(1);
            }
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
        }
    }

    /// Recompute the hash and check the difficulty prefix and merkle root.
    pub fn verify_pow(&self) -> Result<(), BlockError> {
        let computed = self.header.calculate_hash();
        if computed != self.hash {
            return Err(BlockError::InvalidHeader(
                "transmitted hash does not match header".into(),
            ));
        }
        if !meets_difficulty(&self.hash, self.header.difficulty) {
            return Err(BlockError::PowNotSatisfied(self.header.difficulty));
        }
        if self.header.merkle_root != merkle_root(&self.txids()) {
            return Err(BlockError::MerkleMismatch);
        }
        Ok(())
    }

    /// Cumulative-work contribution: each extra hex digit of difficulty
    /// multiplies the search space by 16.
    pub fn work(&self) -> u128 {
        16u128.saturating_pow(self.header.difficulty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Network, COINBASE};
    use crate::transaction::TxKind;

    fn coinbase(miner: &str) -> Transaction {
        let mut tx =
            Transaction::new(Network::Mainnet, COINBASE, miner, 60.0, 0.0, 0, TxKind::Coinbase)
                .unwrap();
        tx.sign(Network::Mainnet, "").unwrap();
        tx
    }

    fn miner_addr() -> String {
        let kp = aurum_crypto::generate_keypair();
        crate::address::derive_address(Network::Mainnet, &kp.public_key).unwrap()
    }

    #[test]
    fn mining_satisfies_difficulty_prefix() {
        let mut block = Block::new(1, vec![coinbase(&miner_addr())], "0".repeat(64), 2, 100.0);
        let cancel = AtomicBool::new(false);
        let hash = block.mine(&cancel).unwrap();
        assert!(hash.starts_with("00"));
        block.verify_pow().unwrap();
    }

    #[test]
    fn cancellation_aborts_the_search() {
        // Difficulty 64 is unreachable; the pre-set flag stops the loop
        // after the first batch.
        let mut block = Block::new(1, vec![coinbase(&miner_addr())], "0".repeat(64), 64, 100.0);
        let cancel = AtomicBool::new(true);
        assert!(block.mine(&cancel).is_none());
    }

    #[test]
    fn tampering_breaks_pow_verification() {
        let mut block = Block::new(1, vec![coinbase(&miner_addr())], "0".repeat(64), 1, 100.0);
        block.mine(&AtomicBool::new(false)).unwrap();

        let mut wrong_hash = block.clone();
        wrong_hash.hash = aurum_crypto::sha256_hex(b"forged");
        assert!(wrong_hash.verify_pow().is_err());

        let mut wrong_root = block.clone();
        wrong_root.transactions.push(coinbase(&miner_addr()));
        assert!(matches!(wrong_root.verify_pow(), Err(BlockError::MerkleMismatch)));
    }

    #[test]
    fn identical_headers_hash_identically() {
        let block = Block::new(3, vec![coinbase(&miner_addr())], "ab".repeat(32), 3, 42.5);
        assert_eq!(block.header.calculate_hash(), block.header.clone().calculate_hash());
    }

    #[test]
    fn work_scales_with_difficulty() {
        let a = Block::new(0, vec![], String::new(), 2, 0.0);
        let b = Block::new(0, vec![], String::new(), 3, 0.0);
        assert_eq!(b.work(), a.work() * 16);
    }
}
