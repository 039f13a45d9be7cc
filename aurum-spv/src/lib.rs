use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use aurum_chain::ChainStore;
use aurum_core::merkle::{build_proof, verify_proof, ProofStep};
use aurum_core::params::MIN_CONFIRMATIONS;
use aurum_core::transaction::Transaction;
use aurum_core::Block;

const MAX_HEADER_PAGE: u64 = 200;
const STALL_THRESHOLD_SECS: f64 = 30.0;
const RATE_SAMPLES: usize = 10;
const HISTORY_CAP: usize = 100;

/// Header without transaction bodies, as served to light clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactHeader {
    pub index: u64,
    pub hash: String,
    pub previous_hash: String,
    pub merkle_root: String,
    pub timestamp: f64,
    pub difficulty: u32,
    pub nonce: u64,
}

impl From<&Block> for CompactHeader {
    fn from(block: &Block) -> Self {
        Self {
            index: block.header.index,
            hash: block.hash.clone(),
            previous_hash: block.header.previous_hash.clone(),
            merkle_root: block.header.merkle_root.clone(),
            timestamp: block.header.timestamp,
            difficulty: block.header.difficulty,
            nonce: block.header.nonce,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadersPage {
    pub latest_height: u64,
    pub headers: Vec<CompactHeader>,
    pub start: u64,
    pub end: u64,
}

/// Inclusion proof for one transaction, bound to a concrete block hash so
/// verifiers can detect a reorg after the proof was issued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionProof {
    pub block_index: u64,
    pub block_hash: String,
    pub merkle_root: String,
    pub header: CompactHeader,
    pub transaction: Transaction,
    pub proof: Vec<ProofStep>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
    #[error("transaction id does not match the proof")]
    TxidMismatch,
    #[error("merkle proof verification failed")]
    ProofInvalid,
    #[error("block index not found in chain")]
    UnknownBlock,
    #[error("block hash mismatch: chain_reorganization")]
    ChainReorganization,
    #[error("insufficient confirmations: {have}/{need}")]
    InsufficientConfirmations { have: u64, need: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Stalled,
    Synced,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncProgressReport {
    pub current_height: u64,
    pub target_height: u64,
    pub sync_percentage: f64,
    pub estimated_time_remaining: Option<u64>,
    pub sync_state: SyncState,
    pub headers_per_second: f64,
    pub started_at: f64,
}

#[derive(Debug, Default)]
struct TrackState {
    started_at: f64,
    start_height: u64,
    target_height: u64,
    last_height: u64,
    last_progress_at: f64,
    /// (instant, height) samples for the moving-average rate.
    history: Vec<(f64, u64)>,
}

/// Serves compact headers and merkle proofs to light clients.
pub struct LightClientService {
    store: Arc<ChainStore>,
    tracker: Mutex<TrackState>,
}

impl LightClientService {
    pub fn new(store: Arc<ChainStore>) -> Self {
        Self {
            store,
            tracker: Mutex::new(TrackState::default()),
        }
    }

    /// A page of compact headers ending at the tip by default.
    pub fn recent_headers(&self, count: u64, start: Option<u64>) -> HeadersPage {
        let count = count.clamp(1, MAX_HEADER_PAGE);
        self.store.with_blocks(|blocks| {
            let latest = (blocks.len() as u64).saturating_sub(1);
            let start = start
                .unwrap_or_else(|| (latest + 1).saturating_sub(count))
                .min(latest);
            let end = (start + count - 1).min(latest);
            let headers = blocks[start as usize..=end as usize]
                .iter()
                .map(CompactHeader::from)
                .collect();
            HeadersPage { latest_height: latest, headers, start, end }
        })
    }

    /// Walk the chain from the tip backwards and build a proof for the
    /// first block containing `txid`.
    pub fn transaction_proof(&self, txid: &str) -> Option<TransactionProof> {
        self.store.with_blocks(|blocks| {
            for block in blocks.iter().rev() {
                let txids = block.txids();
                if !txids.iter().any(|t| t == txid) {
                    continue;
                }
                let proof = build_proof(&txids, txid)?;
                let transaction = block
                    .transactions
                    .iter()
                    .find(|t| t.txid.as_deref() == Some(txid))?
                    .clone();
                debug!(txid, block = block.header.index, "merkle proof built");
                return Some(TransactionProof {
                    block_index: block.header.index,
                    block_hash: block.hash.clone(),
                    merkle_root: block.header.merkle_root.clone(),
                    header: CompactHeader::from(block),
                    transaction,
                    proof,
                });
            }
            None
        })
    }

    /// Full SPV verification: merkle fold, reorg detection against the
    /// live chain, and a confirmation-depth requirement. Returns the
    /// confirmation count on success.
    pub fn verify_transaction_proof(
        &self,
        txid: &str,
        proof: &TransactionProof,
        min_confirmations: Option<u64>,
    ) -> Result<u64, ProofError> {
        let required = min_confirmations.unwrap_or(MIN_CONFIRMATIONS);
        if proof.transaction.txid.as_deref() != Some(txid) {
            return Err(ProofError::TxidMismatch);
        }
        if !verify_proof(txid, &proof.merkle_root, &proof.proof) {
            warn!(txid, "merkle proof failed to fold into the stated root");
            return Err(ProofError::ProofInvalid);
        }
        self.store.with_blocks(|blocks| {
            let block = blocks
                .get(proof.block_index as usize)
                .ok_or(ProofError::UnknownBlock)?;
            if block.hash != proof.block_hash {
                warn!(
                    txid,
                    height = proof.block_index,
                    "proof block replaced on chain"
                );
                return Err(ProofError::ChainReorganization);
            }
            let tip = (blocks.len() as u64).saturating_sub(1);
            let have = tip - proof.block_index + 1;
            if have < required {
                return Err(ProofError::InsufficientConfirmations { have, need: required });
            }
            info!(txid, confirmations = have, "SPV verification succeeded");
            Ok(have)
        })
    }

    // Header-sync progress ------------------------------------------

    pub fn start_sync(&self, target_height: u64, now: f64) {
        let current = self.store.height();
        let mut t = self.tracker.lock();
        *t = TrackState {
            started_at: now,
            start_height: current,
            target_height,
            last_height: current,
            last_progress_at: now,
            history: vec![(now, current)],
        };
        info!(current, target_height, "header sync started");
    }

    pub fn update_sync_progress(&self, current_height: u64, now: f64) {
        let mut t = self.tracker.lock();
        if current_height != t.last_height {
            t.last_height = current_height;
            t.last_progress_at = now;
            t.history.push((now, current_height));
            if t.history.len() > HISTORY_CAP {
                let excess = t.history.len() - HISTORY_CAP;
                t.history.drain(..excess);
            }
        }
    }

    pub fn sync_progress(&self, now: f64) -> SyncProgressReport {
        let t = self.tracker.lock();
        let current = t.last_height.max(t.start_height);
        let percentage = if t.target_height > t.start_height {
            let total = (t.target_height - t.start_height) as f64;
            let done = (current.min(t.target_height) - t.start_height) as f64;
            (done / total * 100.0).min(100.0)
        } else {
            100.0
        };

        let rate = {
            let samples = t.history.len().min(RATE_SAMPLES);
            if samples < 2 {
                0.0
            } else {
                let window = &t.history[t.history.len() - samples..];
                // The span extends to `now` so a dead session's rate decays
                // instead of reporting its last burst forever.
                let span = now.max(window[window.len() - 1].0) - window[0].0;
                let gained = window[window.len() - 1].1.saturating_sub(window[0].1);
                if span > 0.0 {
                    gained as f64 / span
                } else {
                    0.0
                }
            }
        };

        let eta = if rate > 0.0 && current < t.target_height {
            Some(((t.target_height - current) as f64 / rate) as u64)
        } else {
            None
        };

        let state = if percentage >= 99.99 || current >= t.target_height {
            SyncState::Synced
        } else if now - t.last_progress_at > STALL_THRESHOLD_SECS && rate < 0.01 {
            SyncState::Stalled
        } else if rate > 0.0 {
            SyncState::Syncing
        } else {
            SyncState::Idle
        };

        SyncProgressReport {
            current_height: current,
            target_height: t.target_height,
            sync_percentage: percentage,
            estimated_time_remaining: eta,
            sync_state: state,
            headers_per_second: rate,
            started_at: t.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurum_chain::store::{GenesisAllocation, GenesisConfig};
    use aurum_chain::{
        ChainParams, Mempool, MempoolConfig, Miner, MinerOutcome, NoBonus, NonceTracker,
        TransactionValidator,
    };
    use aurum_core::address::{derive_address, Network};
    use aurum_core::params::now_ts;
    use aurum_core::transaction::{TxInput, TxKind, TxOutput};
    use aurum_storage::ChainDisk;

    struct Fixture {
        service: LightClientService,
        store: Arc<ChainStore>,
        mempool: Mempool,
        wallet_key: aurum_crypto::KeyMaterial,
        wallet: String,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let disk = ChainDisk::open(dir.path()).unwrap();
        let key = aurum_crypto::generate_keypair();
        let wallet = derive_address(Network::Mainnet, &key.public_key).unwrap();
        disk.write_json_atomic(
            &disk.genesis_path(),
            &GenesisConfig {
                network: Network::Mainnet,
                difficulty: 1,
                timestamp: 1_700_000_000.0,
                allocations: vec![GenesisAllocation { address: wallet.clone(), amount: 100.0 }],
            },
        )
        .unwrap();
        let nonce = Arc::new(NonceTracker::new());
        let params = ChainParams {
            network: Network::Mainnet,
            genesis_difficulty: 1,
            difficulty_window: 1000,
            checkpoint_interval: 1000,
        };
        let store =
            Arc::new(ChainStore::open(params, disk, nonce.clone(), Arc::new(NoBonus)).unwrap());
        let mempool = Mempool::new(
            MempoolConfig::default(),
            TransactionValidator::new(Network::Mainnet),
            nonce,
        );
        Fixture {
            service: LightClientService::new(store.clone()),
            store,
            mempool,
            wallet_key: key,
            wallet,
            _dir: dir,
        }
    }

    fn mine(f: &Fixture, n: usize) {
        let miner = Miner::new(Network::Mainnet, f.wallet.clone());
        for _ in 0..n {
            match miner.mine_pending(&f.store, &f.mempool, &NoBonus).unwrap() {
                MinerOutcome::Mined(_) => {}
                MinerOutcome::Cancelled => panic!("unexpected cancellation"),
            }
        }
    }

    /// Confirm a transfer out of the genesis allocation, returning its txid.
    fn confirmed_transfer(f: &Fixture) -> String {
        let genesis = f.store.get_block(0).unwrap();
        let funding = genesis.transactions[0].txid.clone().unwrap();
        let recipient = derive_address(
            Network::Mainnet,
            &aurum_crypto::generate_keypair().public_key,
        )
        .unwrap();
        let mut tx = Transaction::new(
            Network::Mainnet,
            &f.wallet,
            &recipient,
            7.0,
            0.01,
            0,
            TxKind::Normal,
        )
        .unwrap()
        .with_inputs(vec![TxInput { txid: funding, vout: 0 }])
        .unwrap()
        .with_outputs(
            Network::Mainnet,
            vec![
                TxOutput { address: recipient, amount: 7.0 },
                TxOutput { address: f.wallet.clone(), amount: 92.99 },
            ],
        )
        .unwrap();
        tx.sign(Network::Mainnet, &f.wallet_key.secret_key).unwrap();
        let txid = tx.txid.clone().unwrap();
        f.store
            .with_utxo(|u| f.mempool.add_transaction(tx, u, now_ts()))
            .unwrap();
        mine(f, 1);
        txid
    }

    #[test]
    fn header_pages_clamp_to_chain() {
        let f = fixture();
        mine(&f, 5);
        let page = f.service.recent_headers(3, None);
        assert_eq!(page.latest_height, 5);
        assert_eq!((page.start, page.end), (3, 5));
        assert_eq!(page.headers.len(), 3);
        assert_eq!(page.headers[2].index, 5);

        let page = f.service.recent_headers(100, Some(2));
        assert_eq!((page.start, page.end), (2, 5));
        // Headers chain to each other.
        for pair in page.headers.windows(2) {
            assert_eq!(pair[1].previous_hash, pair[0].hash);
        }
    }

    #[test]
    fn proof_roundtrip_with_confirmations() {
        let f = fixture();
        let txid = confirmed_transfer(&f);
        mine(&f, 6);

        let proof = f.service.transaction_proof(&txid).unwrap();
        assert_eq!(proof.block_index, 1);
        let confirmations = f
            .service
            .verify_transaction_proof(&txid, &proof, None)
            .unwrap();
        assert_eq!(confirmations, f.store.height() - 1 + 1);
    }

    #[test]
    fn shallow_proof_lacks_confirmations() {
        let f = fixture();
        let txid = confirmed_transfer(&f);
        let proof = f.service.transaction_proof(&txid).unwrap();
        let err = f
            .service
            .verify_transaction_proof(&txid, &proof, None)
            .unwrap_err();
        assert_eq!(
            err,
            ProofError::InsufficientConfirmations { have: 1, need: MIN_CONFIRMATIONS }
        );
        // An explicit lower bar passes.
        f.service.verify_transaction_proof(&txid, &proof, Some(1)).unwrap();
    }

    #[test]
    fn tampered_proof_fails() {
        let f = fixture();
        let txid = confirmed_transfer(&f);
        mine(&f, 6);
        let good = f.service.transaction_proof(&txid).unwrap();

        let mut bad = good.clone();
        if bad.proof.is_empty() {
            bad.merkle_root = aurum_crypto::sha256_hex(b"forged");
        } else {
            bad.proof[0].hash = aurum_crypto::sha256_hex(b"forged");
        }
        assert_eq!(
            f.service.verify_transaction_proof(&txid, &bad, None),
            Err(ProofError::ProofInvalid)
        );

        let other_txid = aurum_crypto::sha256_hex(b"someone-else");
        assert_eq!(
            f.service.verify_transaction_proof(&other_txid, &good, None),
            Err(ProofError::TxidMismatch)
        );
    }

    #[test]
    fn unknown_transaction_has_no_proof() {
        let f = fixture();
        mine(&f, 2);
        assert!(f
            .service
            .transaction_proof(&aurum_crypto::sha256_hex(b"ghost"))
            .is_none());
    }

    #[test]
    fn proof_detects_reorged_block() {
        let f = fixture();
        let txid = confirmed_transfer(&f);
        mine(&f, 6);
        let proof = f.service.transaction_proof(&txid).unwrap();

        // Simulate the reorg by handing the verifier a proof whose block
        // hash no longer matches the chain at that height.
        let mut stale = proof;
        stale.block_hash = aurum_crypto::sha256_hex(b"replaced-by-reorg");
        assert_eq!(
            f.service.verify_transaction_proof(&txid, &stale, None),
            Err(ProofError::ChainReorganization)
        );
    }

    #[test]
    fn sync_progress_states() {
        let f = fixture();
        let t0 = 1_000.0;
        f.service.start_sync(100, t0);

        let report = f.service.sync_progress(t0 + 1.0);
        assert_eq!(report.sync_state, SyncState::Idle);

        f.service.update_sync_progress(20, t0 + 10.0);
        f.service.update_sync_progress(40, t0 + 20.0);
        let report = f.service.sync_progress(t0 + 21.0);
        assert_eq!(report.sync_state, SyncState::Syncing);
        assert!(report.headers_per_second > 1.0);
        assert!(report.estimated_time_remaining.is_some());
        assert!(report.sync_percentage > 0.0 && report.sync_percentage < 100.0);

        // No progress for > 30s and the decayed rate is effectively zero.
        let report = f.service.sync_progress(t0 + 10_000.0);
        assert_eq!(report.sync_state, SyncState::Stalled);

        f.service.update_sync_progress(100, t0 + 10_010.0);
        let report = f.service.sync_progress(t0 + 10_011.0);
        assert_eq!(report.sync_state, SyncState::Synced);
        assert_eq!(report.sync_percentage, 100.0);
    }
}
