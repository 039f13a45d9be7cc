use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use aurum_core::address::{Network, COINBASE};
use aurum_core::params::{block_reward, now_ts};
use aurum_core::transaction::{Transaction, TxKind, TxOutput};
use aurum_core::Block;

use crate::error::ChainError;
use crate::mempool::Mempool;
use crate::store::ChainStore;

/// Collaborator hook for extra coinbase outputs (mining streak bonuses and
/// the like). Bonus outputs never alter the consensus reward rule: a block
/// validates with any payout between `reward + fees` and that plus the
/// hook's total.
pub trait RewardBonus: Send + Sync {
    fn bonus_outputs(&self, miner: &str, height: u64) -> Vec<TxOutput>;
}

/// Default hook: no bonuses, coinbase equals reward + fees exactly.
pub struct NoBonus;

impl RewardBonus for NoBonus {
    fn bonus_outputs(&self, _miner: &str, _height: u64) -> Vec<TxOutput> {
        Vec::new()
    }
}

#[derive(Debug)]
pub enum MinerOutcome {
    Mined(Block),
    /// A better block arrived on the same height and the search stopped.
    Cancelled,
}

/// Assembles candidate blocks from the mempool and searches the nonce
/// space. Interruptible: flip the cancellation flag when an external block
/// lands and the search unwinds cleanly.
pub struct Miner {
    network: Network,
    address: String,
    cancel: Arc<AtomicBool>,
}

impl Miner {
    pub fn new(network: Network, address: String) -> Self {
        Self {
            network,
            address,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Shared handle for workers that need to abort an in-flight search.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Draft a candidate from the prioritized mempool snapshot, prepend
    /// the coinbase, search for a nonce, and append the result.
    pub fn mine_pending(
        &self,
        store: &ChainStore,
        mempool: &Mempool,
        bonus: &dyn RewardBonus,
    ) -> Result<MinerOutcome, ChainError> {
        self.cancel.store(false, Ordering::Relaxed);

        let transactions = mempool.prioritize(Some(mempool.config().max_per_block));
        let (index, previous_hash, difficulty, min_timestamp) = store.candidate_header_info();

        let fees: f64 = transactions.iter().map(|t| t.fee).sum();
        let reward = block_reward(index);
        let mut outputs = vec![TxOutput {
            address: self.address.clone(),
            amount: reward + fees,
        }];
        let bonus_outputs = bonus.bonus_outputs(&self.address, index);
        if !bonus_outputs.is_empty() {
            debug!(count = bonus_outputs.len(), "attaching bonus coinbase outputs");
            outputs.extend(bonus_outputs);
        }
        let total: f64 = outputs.iter().map(|o| o.amount).sum();

        let mut coinbase = Transaction::new(
            self.network,
            COINBASE,
            &self.address,
            total,
            0.0,
            0,
            TxKind::Coinbase,
        )
        .and_then(|tx| tx.with_outputs(self.network, outputs))
        .map_err(|e| ChainError::InvalidBlock(format!("coinbase construction: {e}")))?;
        coinbase
            .sign(self.network, "")
            .map_err(|e| ChainError::InvalidBlock(format!("coinbase hashing: {e}")))?;

        let mut block_txs = Vec::with_capacity(transactions.len() + 1);
        block_txs.push(coinbase);
        block_txs.extend(transactions);

        let timestamp = now_ts().max(min_timestamp);
        let mut candidate = Block::new(index, block_txs, previous_hash, difficulty, timestamp);

        match candidate.mine(&self.cancel) {
            Some(hash) => {
                info!(index, hash = %hash, "candidate block mined");
                store.append(candidate.clone(), mempool)?;
                Ok(MinerOutcome::Mined(candidate))
            }
            None => {
                debug!(index, "mining cancelled by a better tip");
                Ok(MinerOutcome::Cancelled)
            }
        }
    }
}
