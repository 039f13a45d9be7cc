use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

use aurum_core::address::{Network, COINBASE};
use aurum_core::error::ValidationError;
use aurum_core::params::{
    block_reward, now_ts, AMOUNT_EPSILON, MAX_FUTURE_SKEW_SECS, MEDIAN_TIME_SPAN,
    TARGET_BLOCK_SPACING_SECS,
};
use aurum_core::transaction::{Transaction, TxKind, TxOutput};
use aurum_core::Block;
use aurum_storage::ChainDisk;

use crate::checkpoint::{utxo_digest, Checkpoint, SnapshotPayload};
use crate::error::ChainError;
use crate::event::NodeEvent;
use crate::mempool::Mempool;
use crate::miner::RewardBonus;
use crate::nonce::NonceTracker;
use crate::utxo::UtxoManager;
use crate::validator::{TransactionValidator, ValidationContext};

const MIN_DIFFICULTY: u32 = 1;
const MAX_DIFFICULTY: u32 = 12;

#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    pub genesis_difficulty: u32,
    /// Blocks between difficulty retarget checks.
    pub difficulty_window: u64,
    /// Blocks between automatic checkpoints.
    pub checkpoint_interval: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            genesis_difficulty: 3,
            difficulty_window: 10,
            checkpoint_interval: 50,
        }
    }
}

/// Boot parameters plus the initial coinbase distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub network: Network,
    pub difficulty: u32,
    pub timestamp: f64,
    pub allocations: Vec<GenesisAllocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAllocation {
    pub address: String,
    pub amount: f64,
}

impl GenesisConfig {
    pub fn example(network: Network) -> Self {
        Self {
            network,
            difficulty: 3,
            timestamp: 1_700_000_000.0,
            allocations: vec![GenesisAllocation {
                address: "GENESIS".to_string(),
                amount: 1_000_000.0,
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Block extended the current tip.
    Appended,
    /// Block landed on a side branch that is still lighter than the main chain.
    SideChained,
    /// Side branch became heavier and the chain switched to it.
    Reorged { reverted: usize, applied: usize },
    /// Already known or below the checkpointed horizon.
    Ignored,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainStats {
    pub height: u64,
    pub total_blocks: u64,
    pub total_transactions: u64,
    pub total_utxos: u64,
    pub total_supply: f64,
    pub difficulty: u32,
    pub latest_block_hash: String,
}

#[derive(Clone, Default)]
struct ChainState {
    blocks: Vec<Block>,
    utxo: UtxoManager,
    /// txid → (block index, position in block).
    tx_index: HashMap<String, (u64, usize)>,
    address_history: HashMap<String, Vec<String>>,
    /// Blocks off the main chain, by hash, awaiting enough work to reorg.
    side_blocks: HashMap<String, Block>,
}

/// The replicated ledger. One write lock covers `append`, `ingest`, and
/// reorgs end to end, so readers always observe either the old tip or the
/// new tip, never an intermediate state.
pub struct ChainStore {
    params: ChainParams,
    validator: TransactionValidator,
    nonce: Arc<NonceTracker>,
    bonus: Arc<dyn RewardBonus>,
    disk: ChainDisk,
    state: RwLock<ChainState>,
    events: broadcast::Sender<NodeEvent>,
}

impl ChainStore {
    /// Open the store from disk, replaying persisted blocks; bootstrap the
    /// genesis block from `genesis.json` (writing an example document when
    /// absent) on first start.
    pub fn open(
        params: ChainParams,
        disk: ChainDisk,
        nonce: Arc<NonceTracker>,
        bonus: Arc<dyn RewardBonus>,
    ) -> Result<Self, ChainError> {
        let (events, _) = broadcast::channel(256);
        let validator = TransactionValidator::new(params.network);
        let mut state = ChainState::default();

        let indices = disk.block_indices()?;
        if indices.is_empty() {
            let genesis_doc: GenesisConfig = match disk.read_json(&disk.genesis_path())? {
                Some(doc) => doc,
                None => {
                    let doc = GenesisConfig::example(params.network);
                    disk.write_json_atomic(&disk.genesis_path(), &doc)?;
                    doc
                }
            };
            let genesis = Self::build_genesis(params.network, &genesis_doc)?;
            Self::index_block(&mut state, &genesis);
            state.utxo.apply_block(&genesis)?;
            disk.write_json_atomic(&disk.block_path(0), &genesis)?;
            state.blocks.push(genesis);
            info!(hash = %state.blocks[0].hash, "genesis block created");
        } else {
            for (expected, index) in indices.iter().enumerate() {
                if *index != expected as u64 {
                    return Err(ChainError::FatalState(format!(
                        "block files not contiguous: missing height {expected}"
                    )));
                }
                let block: Block = disk
                    .read_json(&disk.block_path(*index))?
                    .ok_or_else(|| ChainError::FatalState(format!("block {index} unreadable")))?;
                block.verify_pow().map_err(|e| {
                    ChainError::FatalState(format!("persisted block {index} invalid: {e}"))
                })?;
                if let Some(tip) = state.blocks.last() {
                    if block.header.previous_hash != tip.hash {
                        return Err(ChainError::FatalState(format!(
                            "persisted block {index} does not link to its parent"
                        )));
                    }
                }
                state.utxo.apply_block(&block)?;
                Self::index_block(&mut state, &block);
                state.blocks.push(block);
            }
            info!(height = state.blocks.len() - 1, "chain replayed from disk");
        }

        nonce.rebuild(Self::confirmed_nonces(&state.blocks), HashMap::new());

        Ok(Self {
            params,
            validator,
            nonce,
            bonus,
            disk,
            state: RwLock::new(state),
            events,
        })
    }

    fn build_genesis(network: Network, doc: &GenesisConfig) -> Result<Block, ChainError> {
        let mut transactions = Vec::new();
        for alloc in &doc.allocations {
            let mut tx = Transaction::new(
                network,
                COINBASE,
                &alloc.address,
                alloc.amount,
                0.0,
                0,
                TxKind::Coinbase,
            )
            .map_err(|e| ChainError::InvalidBlock(format!("genesis allocation: {e}")))?;
            tx.timestamp = doc.timestamp;
            tx.sign(network, "")
                .map_err(|e| ChainError::InvalidBlock(format!("genesis allocation: {e}")))?;
            transactions.push(tx);
        }
        let mut block = Block::new(0, transactions, "0".to_string(), doc.difficulty, doc.timestamp);
        // Deterministic search from nonce zero: every node derives the
        // same genesis hash from the same document.
        block
            .mine(&std::sync::atomic::AtomicBool::new(false))
            .ok_or_else(|| ChainError::InvalidBlock("genesis mining cancelled".into()))?;
        Ok(block)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<NodeEvent> {
        self.events.clone()
    }

    pub fn network(&self) -> Network {
        self.params.network
    }

    // Queries --------------------------------------------------------

    pub fn height(&self) -> u64 {
        let state = self.state.read();
        (state.blocks.len() as u64).saturating_sub(1)
    }

    pub fn tip_hash(&self) -> String {
        self.state.read().blocks.last().map(|b| b.hash.clone()).unwrap_or_default()
    }

    pub fn get_block(&self, height: u64) -> Option<Block> {
        self.state.read().blocks.get(height as usize).cloned()
    }

    pub fn balance(&self, address: &str) -> f64 {
        self.state.read().utxo.balance(address)
    }

    pub fn total_supply(&self) -> f64 {
        self.state.read().utxo.total_supply()
    }

    /// Run a closure against the block list under the read lock.
    pub fn with_blocks<R>(&self, f: impl FnOnce(&[Block]) -> R) -> R {
        f(&self.state.read().blocks)
    }

    /// Run a closure against the UTXO set under the read lock. Used by the
    /// submission path so the chain lock is taken before the mempool lock.
    pub fn with_utxo<R>(&self, f: impl FnOnce(&UtxoManager) -> R) -> R {
        f(&self.state.read().utxo)
    }

    pub fn get_transaction(&self, txid: &str) -> Option<(Transaction, u64)> {
        let state = self.state.read();
        let (block_index, pos) = *state.tx_index.get(txid)?;
        let tx = state.blocks.get(block_index as usize)?.transactions.get(pos)?.clone();
        Some((tx, block_index))
    }

    /// All transactions touching an address, newest last.
    pub fn history(&self, address: &str) -> Vec<serde_json::Value> {
        let state = self.state.read();
        let Some(txids) = state.address_history.get(address) else {
            return Vec::new();
        };
        txids
            .iter()
            .filter_map(|txid| {
                let (block_index, pos) = *state.tx_index.get(txid)?;
                let tx = state.blocks.get(block_index as usize)?.transactions.get(pos)?;
                Some(json!({
                    "block": block_index,
                    "txid": txid,
                    "sender": tx.sender,
                    "recipient": tx.recipient,
                    "amount": tx.amount,
                    "fee": tx.fee,
                    "timestamp": tx.timestamp,
                    "direction": if tx.sender == address { "sent" } else { "received" },
                }))
            })
            .collect()
    }

    pub fn stats(&self) -> ChainStats {
        let state = self.state.read();
        ChainStats {
            height: (state.blocks.len() as u64).saturating_sub(1),
            total_blocks: state.blocks.len() as u64,
            total_transactions: state.blocks.iter().map(|b| b.transactions.len() as u64).sum(),
            total_utxos: state.utxo.len() as u64,
            total_supply: state.utxo.total_supply(),
            difficulty: Self::expected_difficulty(&state.blocks, &self.params),
            latest_block_hash: state.blocks.last().map(|b| b.hash.clone()).unwrap_or_default(),
        }
    }

    /// Everything the miner needs to draft a candidate:
    /// (next index, tip hash, expected difficulty, minimum timestamp).
    pub fn candidate_header_info(&self) -> (u64, String, u32, f64) {
        let state = self.state.read();
        let tip = state.blocks.last();
        let next_index = state.blocks.len() as u64;
        let tip_hash = tip.map(|b| b.hash.clone()).unwrap_or_else(|| "0".to_string());
        let min_timestamp = tip.map(|b| b.header.timestamp + 1e-3).unwrap_or(0.0);
        let difficulty = Self::expected_difficulty(&state.blocks, &self.params);
        (next_index, tip_hash, difficulty, min_timestamp)
    }

    /// Audit the whole chain: linkage, proof of work, merkle roots.
    pub fn validate_chain(&self) -> Result<(), ChainError> {
        let state = self.state.read();
        for (i, block) in state.blocks.iter().enumerate().skip(1) {
            block.verify_pow()?;
            if block.header.previous_hash != state.blocks[i - 1].hash {
                return Err(ChainError::InvalidBlock(format!(
                    "block {i} does not link to its parent"
                )));
            }
            if block.header.timestamp <= state.blocks[i - 1].header.timestamp {
                return Err(ChainError::InvalidBlock(format!(
                    "block {i} timestamp does not advance"
                )));
            }
        }
        Ok(())
    }

    // Mutations ------------------------------------------------------

    /// Append a block that extends the current tip.
    pub fn append(&self, block: Block, mempool: &Mempool) -> Result<(), ChainError> {
        let mut state = self.state.write();
        self.append_locked(&mut state, block, mempool)
    }

    /// Ingest a block from a peer: extend the tip, park it on a side
    /// branch, or trigger a reorg when the side branch outweighs the main
    /// chain.
    pub fn ingest(&self, block: Block, mempool: &Mempool) -> Result<IngestOutcome, ChainError> {
        let mut state = self.state.write();

        let known_on_main = state.blocks.iter().any(|b| b.hash == block.hash);
        if known_on_main || state.side_blocks.contains_key(&block.hash) {
            return Ok(IngestOutcome::Ignored);
        }

        let tip_hash = state.blocks.last().map(|b| b.hash.clone()).unwrap_or_default();
        if block.header.previous_hash == tip_hash {
            self.append_locked(&mut state, block, mempool)?;
            return Ok(IngestOutcome::Appended);
        }

        // Structural sanity before parking on a side branch.
        block.verify_pow()?;
        state.side_blocks.insert(block.hash.clone(), block.clone());

        // Walk the side branch back to the main chain.
        let mut branch = vec![block.clone()];
        let mut cursor = block.header.previous_hash.clone();
        let fork_height = loop {
            if let Some(pos) = state.blocks.iter().position(|b| b.hash == cursor) {
                break pos as u64;
            }
            match state.side_blocks.get(&cursor) {
                Some(parent) => {
                    branch.push(parent.clone());
                    cursor = parent.header.previous_hash.clone();
                }
                // Parent unknown: keep the block parked until it shows up.
                None => return Ok(IngestOutcome::SideChained),
            }
        };
        branch.reverse();

        let branch_work: u128 = branch.iter().map(|b| b.work()).sum();
        let main_work: u128 = state
            .blocks
            .iter()
            .skip(fork_height as usize + 1)
            .map(|b| b.work())
            .sum();
        if branch_work <= main_work {
            return Ok(IngestOutcome::SideChained);
        }

        self.reorg_locked(&mut state, fork_height, branch, mempool)
    }

    fn append_locked(
        &self,
        state: &mut ChainState,
        block: Block,
        mempool: &Mempool,
    ) -> Result<(), ChainError> {
        Self::validate_block(state, &block, &self.params, &self.validator, &*self.bonus, &self.nonce)?;
        self.apply_and_persist(state, &block)?;
        for tx in block.transactions.iter().filter(|t| !t.is_coinbase()) {
            self.nonce.commit(&tx.sender, tx.nonce);
        }
        mempool.remove_included(&block.txids());

        if block.header.index > 0 && block.header.index % self.params.checkpoint_interval == 0 {
            if let Err(e) = self.write_checkpoint(state) {
                warn!(error = %e, "checkpoint write failed");
            }
        }

        let _ = self.events.send(NodeEvent::NewBlock {
            index: block.header.index,
            hash: block.hash.clone(),
            tx_count: block.transactions.len(),
        });
        info!(
            index = block.header.index,
            hash = %block.hash,
            txs = block.transactions.len(),
            "block appended"
        );
        Ok(())
    }

    /// Validate against the staged state (not yet mutated).
    fn validate_block(
        state: &ChainState,
        block: &Block,
        params: &ChainParams,
        validator: &TransactionValidator,
        bonus: &dyn RewardBonus,
        nonce: &NonceTracker,
    ) -> Result<(), ChainError> {
        let tip = state
            .blocks
            .last()
            .ok_or_else(|| ChainError::FatalState("chain has no genesis".into()))?;

        if block.header.index != tip.header.index + 1 {
            return Err(ChainError::InvalidBlock(format!(
                "expected height {}, got {}",
                tip.header.index + 1,
                block.header.index
            )));
        }
        if block.header.previous_hash != tip.hash {
            return Err(ChainError::InvalidBlock("previous hash does not match tip".into()));
        }
        if block.header.timestamp <= tip.header.timestamp {
            return Err(ChainError::InvalidBlock("timestamp does not advance".into()));
        }
        if block.header.timestamp > now_ts() + MAX_FUTURE_SKEW_SECS {
            return Err(ChainError::InvalidBlock("timestamp too far in the future".into()));
        }
        if block.header.timestamp < Self::median_time_past(&state.blocks) {
            return Err(ChainError::InvalidBlock("timestamp below median time past".into()));
        }
        let expected = Self::expected_difficulty(&state.blocks, params);
        if block.header.difficulty != expected {
            return Err(ChainError::InvalidBlock(format!(
                "expected difficulty {expected}, got {}",
                block.header.difficulty
            )));
        }
        block.verify_pow()?;

        let Some(coinbase) = block.transactions.first() else {
            return Err(ChainError::InvalidBlock("block has no coinbase".into()));
        };
        if !coinbase.is_coinbase() || coinbase.kind != TxKind::Coinbase {
            return Err(ChainError::InvalidBlock("first transaction must be coinbase".into()));
        }
        if block.transactions.iter().skip(1).any(|t| t.is_coinbase()) {
            return Err(ChainError::InvalidBlock("multiple coinbase transactions".into()));
        }

        let fees: f64 = block.transactions.iter().skip(1).map(|t| t.fee).sum();
        let reward = block_reward(block.header.index);
        let bonus_total: f64 = bonus
            .bonus_outputs(&coinbase.recipient, block.header.index)
            .iter()
            .map(|o| o.amount)
            .sum();
        let paid = coinbase.total_output();
        if paid + AMOUNT_EPSILON < reward + fees || paid > reward + fees + bonus_total + AMOUNT_EPSILON
        {
            return Err(ChainError::InvalidBlock(format!(
                "coinbase pays {paid}, expected {} (+ up to {bonus_total} bonus)",
                reward + fees
            )));
        }

        // Transactions validate against the pre-block UTXO set with a
        // block-local view for intra-block chaining; the spent set catches
        // two in-block spends of the same confirmed output.
        let mut spent: HashSet<(String, u32)> = HashSet::new();
        let now = now_ts();
        for (i, tx) in block.transactions.iter().enumerate().skip(1) {
            for input in &tx.inputs {
                if !spent.insert((input.txid.clone(), input.vout)) {
                    return Err(ChainError::Tx(ValidationError::DoubleSpend(format!(
                        "input {}:{} spent twice in block",
                        input.txid, input.vout
                    ))));
                }
            }
            let ctx = ValidationContext {
                utxo: &state.utxo,
                nonce,
                mempool_view: &[],
                block_view: &block.transactions[..i],
                now,
                for_mempool: false,
            };
            validator.validate(tx, &ctx)?;
        }
        Ok(())
    }

    /// Mutate the staged state and persist the block and UTXO index.
    fn apply_and_persist(&self, state: &mut ChainState, block: &Block) -> Result<(), ChainError> {
        state.utxo.apply_block(block)?;
        Self::index_block(state, block);
        state.blocks.push(block.clone());
        self.disk
            .write_json_atomic(&self.disk.block_path(block.header.index), block)?;
        self.disk
            .write_bin_atomic(&self.disk.utxo_index_path(), &state.utxo)?;
        Ok(())
    }

    fn reorg_locked(
        &self,
        state: &mut ChainState,
        fork_height: u64,
        branch: Vec<Block>,
        mempool: &Mempool,
    ) -> Result<IngestOutcome, ChainError> {
        let old_tip = state.blocks.len() as u64 - 1;
        info!(
            fork_height,
            old_tip,
            branch_len = branch.len(),
            "heavier side branch found, attempting reorg"
        );

        // Work on a staged copy: a failure anywhere keeps the old chain.
        let mut staged = state.clone();
        let mut reverted_txs: Vec<Transaction> = Vec::new();

        while staged.blocks.len() as u64 > fork_height + 1 {
            let Some(block) = staged.blocks.pop() else { break };
            Self::unindex_block(&mut staged, &block);
            let utxo = &mut staged.utxo;
            let blocks = &staged.blocks;
            let tx_index = &staged.tx_index;
            utxo.revert_block(&block, |txid, vout| {
                resolve_output(blocks, tx_index, txid, vout)
            })?;
            reverted_txs.extend(
                block.transactions.iter().filter(|t| !t.is_coinbase()).cloned(),
            );
        }

        // Replay the branch against a scratch nonce tracker seeded from
        // the truncated chain, so cross-block nonce sequences validate.
        let scratch_nonce = NonceTracker::new();
        scratch_nonce.rebuild(Self::confirmed_nonces(&staged.blocks), HashMap::new());
        for block in &branch {
            Self::validate_block(
                &staged,
                block,
                &self.params,
                &self.validator,
                &*self.bonus,
                &scratch_nonce,
            )?;
            staged.utxo.apply_block(block)?;
            Self::index_block(&mut staged, block);
            staged.blocks.push(block.clone());
            for tx in block.transactions.iter().filter(|t| !t.is_coinbase()) {
                scratch_nonce.commit(&tx.sender, tx.nonce);
            }
        }

        // The branch is valid: move the old main blocks to the side pool
        // (a reorg back remains possible) and adopt the staged state.
        for old in state.blocks.iter().skip(fork_height as usize + 1) {
            staged.side_blocks.insert(old.hash.clone(), old.clone());
        }
        for block in &branch {
            staged.side_blocks.remove(&block.hash);
        }

        // Persist the new chain suffix and drop stale higher block files.
        for block in staged.blocks.iter().skip(fork_height as usize + 1) {
            self.disk
                .write_json_atomic(&self.disk.block_path(block.header.index), block)?;
        }
        let new_tip = staged.blocks.len() as u64 - 1;
        for stale in (new_tip + 1)..=old_tip {
            self.disk.remove(&self.disk.block_path(stale))?;
        }
        self.disk
            .write_bin_atomic(&self.disk.utxo_index_path(), &staged.utxo)?;

        let applied = branch.len();
        let reverted = (old_tip - fork_height) as usize;
        *state = staged;

        // Drop anything the new branch confirmed, rebuild nonce state for
        // the adopted chain, then give reverted transactions that are not
        // in the new branch a second chance.
        let now = now_ts();
        let new_txids: HashSet<String> =
            state.blocks.iter().skip(fork_height as usize + 1).flat_map(|b| b.txids()).collect();
        mempool.remove_included(&new_txids.iter().cloned().collect::<Vec<_>>());
        self.nonce
            .rebuild(Self::confirmed_nonces(&state.blocks), mempool.sender_counts());
        for tx in reverted_txs {
            let Some(txid) = tx.txid.clone() else { continue };
            if new_txids.contains(&txid) {
                continue;
            }
            mempool.forget(&txid);
            match mempool.add_transaction(tx, &state.utxo, now) {
                Ok(()) => info!(txid = %txid, "reverted transaction returned to mempool"),
                Err(e) => warn!(txid = %txid, error = %e, "reverted transaction no longer valid"),
            }
        }

        if let Some(tip) = state.blocks.last() {
            let _ = self.events.send(NodeEvent::NewBlock {
                index: tip.header.index,
                hash: tip.hash.clone(),
                tx_count: tip.transactions.len(),
            });
            info!(new_tip = tip.header.index, reverted, applied, "reorg complete");
        }
        Ok(IngestOutcome::Reorged { reverted, applied })
    }

    // Checkpoints ----------------------------------------------------

    /// Build and persist a checkpoint at the current tip.
    pub fn create_checkpoint(&self) -> Result<Checkpoint, ChainError> {
        let state = self.state.read();
        self.write_checkpoint(&state)
    }

    fn write_checkpoint(&self, state: &ChainState) -> Result<Checkpoint, ChainError> {
        let tip = state
            .blocks
            .last()
            .ok_or_else(|| ChainError::FatalState("chain has no genesis".into()))?;
        let cp = Checkpoint::create(tip, &state.utxo, state.utxo.total_supply());
        self.disk
            .write_json_atomic(&self.disk.checkpoint_path(cp.height), &cp)?;
        info!(height = cp.height, hash = %cp.checkpoint_hash, "checkpoint written");
        Ok(cp)
    }

    /// Re-verify a stored checkpoint against current state. Any mismatch
    /// invalidates that checkpoint file.
    pub fn verify_checkpoint(&self, height: u64) -> Result<Checkpoint, ChainError> {
        let cp: Checkpoint = self
            .disk
            .read_json(&self.disk.checkpoint_path(height))?
            .ok_or_else(|| ChainError::InvalidBlock(format!("no checkpoint at height {height}")))?;
        if !cp.is_self_consistent() {
            return Err(ChainError::InvalidBlock(format!(
                "checkpoint {height} hash mismatch"
            )));
        }
        let state = self.state.read();
        let block = state
            .blocks
            .get(height as usize)
            .ok_or_else(|| ChainError::InvalidBlock(format!("no block at height {height}")))?;
        if block.hash != cp.block_hash || block.header.merkle_root != cp.merkle_root {
            return Err(ChainError::InvalidBlock(format!(
                "checkpoint {height} does not match local chain"
            )));
        }
        if height == state.blocks.len() as u64 - 1 && utxo_digest(&state.utxo) != cp.utxo_digest {
            return Err(ChainError::InvalidBlock(format!(
                "checkpoint {height} UTXO digest does not match live state"
            )));
        }
        Ok(cp)
    }

    pub fn latest_checkpoint(&self) -> Result<Option<Checkpoint>, ChainError> {
        let heights = self.disk.checkpoint_heights()?;
        let Some(height) = heights.last() else {
            return Ok(None);
        };
        Ok(self.disk.read_json(&self.disk.checkpoint_path(*height))?)
    }

    // Snapshots ------------------------------------------------------

    /// Full-state payload for chunked sync, rooted in a fresh checkpoint.
    pub fn snapshot_payload(&self) -> Result<SnapshotPayload, ChainError> {
        let state = self.state.read();
        let tip = state
            .blocks
            .last()
            .ok_or_else(|| ChainError::FatalState("chain has no genesis".into()))?;
        Ok(SnapshotPayload {
            checkpoint: Checkpoint::create(tip, &state.utxo, state.utxo.total_supply()),
            blocks: state.blocks.clone(),
        })
    }

    /// Adopt a verified snapshot: replay its blocks from our genesis and
    /// switch only if the result is heavier than the current chain. The
    /// sync layer has already checked the whole-payload state hash; this
    /// re-validates consensus rules block by block.
    pub fn adopt_snapshot(&self, payload: SnapshotPayload) -> Result<(), ChainError> {
        if !payload.checkpoint.is_self_consistent() {
            return Err(ChainError::InvalidBlock("snapshot checkpoint hash mismatch".into()));
        }
        let mut state = self.state.write();
        let our_genesis = state
            .blocks
            .first()
            .ok_or_else(|| ChainError::FatalState("chain has no genesis".into()))?;
        let Some(their_genesis) = payload.blocks.first() else {
            return Err(ChainError::InvalidBlock("snapshot has no blocks".into()));
        };
        if their_genesis.hash != our_genesis.hash {
            return Err(ChainError::InvalidBlock("snapshot genesis does not match".into()));
        }

        let mut staged = ChainState::default();
        staged.utxo.apply_block(their_genesis)?;
        Self::index_block(&mut staged, their_genesis);
        staged.blocks.push(their_genesis.clone());
        let scratch_nonce = NonceTracker::new();
        for block in payload.blocks.iter().skip(1) {
            Self::validate_block(
                &staged,
                block,
                &self.params,
                &self.validator,
                &*self.bonus,
                &scratch_nonce,
            )?;
            staged.utxo.apply_block(block)?;
            Self::index_block(&mut staged, block);
            staged.blocks.push(block.clone());
            for tx in block.transactions.iter().filter(|t| !t.is_coinbase()) {
                scratch_nonce.commit(&tx.sender, tx.nonce);
            }
        }

        let tip = staged
            .blocks
            .last()
            .ok_or_else(|| ChainError::InvalidBlock("snapshot has no blocks".into()))?;
        if tip.hash != payload.checkpoint.block_hash
            || utxo_digest(&staged.utxo) != payload.checkpoint.utxo_digest
        {
            return Err(ChainError::InvalidBlock(
                "snapshot state does not match its checkpoint".into(),
            ));
        }

        let staged_work: u128 = staged.blocks.iter().map(|b| b.work()).sum();
        let our_work: u128 = state.blocks.iter().map(|b| b.work()).sum();
        if staged_work <= our_work {
            return Err(ChainError::InvalidBlock(
                "snapshot chain is not heavier than local chain".into(),
            ));
        }

        for block in staged.blocks.iter() {
            self.disk
                .write_json_atomic(&self.disk.block_path(block.header.index), block)?;
        }
        self.disk
            .write_bin_atomic(&self.disk.utxo_index_path(), &staged.utxo)?;
        self.nonce
            .rebuild(Self::confirmed_nonces(&staged.blocks), HashMap::new());
        let adopted_height = staged.blocks.len() as u64 - 1;
        *state = staged;
        info!(height = adopted_height, "snapshot adopted");
        Ok(())
    }

    // Helpers --------------------------------------------------------

    fn index_block(state: &mut ChainState, block: &Block) {
        for (pos, tx) in block.transactions.iter().enumerate() {
            let Some(txid) = tx.txid.clone() else { continue };
            state.tx_index.insert(txid.clone(), (block.header.index, pos));
            let mut touched: Vec<&str> = vec![tx.sender.as_str()];
            touched.extend(tx.outputs.iter().map(|o| o.address.as_str()));
            touched.sort_unstable();
            touched.dedup();
            for address in touched {
                state
                    .address_history
                    .entry(address.to_string())
                    .or_default()
                    .push(txid.clone());
            }
        }
    }

    fn unindex_block(state: &mut ChainState, block: &Block) {
        for tx in &block.transactions {
            let Some(txid) = tx.txid.as_deref() else { continue };
            state.tx_index.remove(txid);
            let mut touched: Vec<&str> = vec![tx.sender.as_str()];
            touched.extend(tx.outputs.iter().map(|o| o.address.as_str()));
            touched.sort_unstable();
            touched.dedup();
            for address in touched {
                if let Some(history) = state.address_history.get_mut(address) {
                    history.retain(|t| t != txid);
                }
            }
        }
    }

    fn confirmed_nonces(blocks: &[Block]) -> HashMap<String, u64> {
        let mut confirmed: HashMap<String, u64> = HashMap::new();
        for block in blocks {
            for tx in block.transactions.iter().filter(|t| !t.is_coinbase()) {
                let entry = confirmed.entry(tx.sender.clone()).or_default();
                *entry = (*entry).max(tx.nonce + 1);
            }
        }
        confirmed
    }

    fn median_time_past(blocks: &[Block]) -> f64 {
        let take = blocks.len().min(MEDIAN_TIME_SPAN);
        if take == 0 {
            return 0.0;
        }
        let mut timestamps: Vec<f64> = blocks[blocks.len() - take..]
            .iter()
            .map(|b| b.header.timestamp)
            .collect();
        timestamps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        timestamps[(take - 1) / 2]
    }

    /// Coarse retarget: every `difficulty_window` blocks, nudge the hex
    /// prefix one digit toward the 120-second spacing target.
    fn expected_difficulty(blocks: &[Block], params: &ChainParams) -> u32 {
        let Some(tip) = blocks.last() else {
            return params.genesis_difficulty;
        };
        let current = tip.header.difficulty;
        let next_height = blocks.len() as u64;
        let window = params.difficulty_window;
        if window == 0 || next_height < window || next_height % window != 0 {
            return current;
        }
        let first = &blocks[blocks.len() - window as usize];
        let span = tip.header.timestamp - first.header.timestamp;
        let average = span / (window - 1).max(1) as f64;
        if average < TARGET_BLOCK_SPACING_SECS / 2.0 {
            (current + 1).min(MAX_DIFFICULTY)
        } else if average > TARGET_BLOCK_SPACING_SECS * 2.0 {
            current.saturating_sub(1).max(MIN_DIFFICULTY)
        } else {
            current
        }
    }
}

fn resolve_output(
    blocks: &[Block],
    tx_index: &HashMap<String, (u64, usize)>,
    txid: &str,
    vout: u32,
) -> Option<TxOutput> {
    let (block_index, pos) = *tx_index.get(txid)?;
    blocks
        .get(block_index as usize)?
        .transactions
        .get(pos)?
        .outputs
        .get(vout as usize)
        .cloned()
}
