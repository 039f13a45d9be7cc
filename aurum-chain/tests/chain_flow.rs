use std::sync::Arc;

use aurum_chain::store::{GenesisAllocation, GenesisConfig};
use aurum_chain::{
    ChainParams, ChainStore, IngestOutcome, Mempool, MempoolConfig, MempoolError, Miner,
    MinerOutcome, NoBonus, NonceTracker, TransactionValidator,
};
use aurum_core::address::{derive_address, Network};
use aurum_core::params::now_ts;
use aurum_core::transaction::{Transaction, TxInput, TxKind, TxOutput};
use aurum_storage::ChainDisk;

struct Node {
    store: ChainStore,
    mempool: Mempool,
    nonce: Arc<NonceTracker>,
    _dir: tempfile::TempDir,
}

struct Wallet {
    key: aurum_crypto::KeyMaterial,
    address: String,
}

fn wallet() -> Wallet {
    let key = aurum_crypto::generate_keypair();
    let address = derive_address(Network::Mainnet, &key.public_key).unwrap();
    Wallet { key, address }
}

/// A node whose genesis allocates 100 coins to each given address.
fn node_with_genesis(params: ChainParams, funded: &[&str]) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let disk = ChainDisk::open(dir.path()).unwrap();
    let doc = GenesisConfig {
        network: Network::Mainnet,
        difficulty: params.genesis_difficulty,
        timestamp: 1_700_000_000.0,
        allocations: funded
            .iter()
            .map(|a| GenesisAllocation { address: a.to_string(), amount: 100.0 })
            .collect(),
    };
    disk.write_json_atomic(&disk.genesis_path(), &doc).unwrap();

    let nonce = Arc::new(NonceTracker::new());
    let store = ChainStore::open(params, disk, nonce.clone(), Arc::new(NoBonus)).unwrap();
    let mempool = Mempool::new(
        MempoolConfig::default(),
        TransactionValidator::new(Network::Mainnet),
        nonce.clone(),
    );
    Node { store, mempool, nonce, _dir: dir }
}

fn fast_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        genesis_difficulty: 1,
        difficulty_window: 1000,
        checkpoint_interval: 1000,
    }
}

fn mine(node: &Node, miner: &Wallet) -> aurum_core::Block {
    let m = Miner::new(Network::Mainnet, miner.address.clone());
    match m.mine_pending(&node.store, &node.mempool, &NoBonus).unwrap() {
        MinerOutcome::Mined(block) => block,
        MinerOutcome::Cancelled => panic!("mining unexpectedly cancelled"),
    }
}

/// Spend one concrete outpoint, paying `amount` to `to` with change back.
fn transfer(
    node: &Node,
    from: &Wallet,
    to: &str,
    amount: f64,
    fee: f64,
    nonce: u64,
    input: (String, u32),
    input_value: f64,
) -> Transaction {
    let change = input_value - amount - fee;
    let mut outputs = vec![TxOutput { address: to.to_string(), amount }];
    if change > 0.0 {
        outputs.push(TxOutput { address: from.address.clone(), amount: change });
    }
    let mut tx = Transaction::new(
        Network::Mainnet,
        &from.address,
        to,
        amount,
        fee,
        nonce,
        TxKind::Normal,
    )
    .unwrap()
    .with_inputs(vec![TxInput { txid: input.0, vout: input.1 }])
    .unwrap()
    .with_outputs(Network::Mainnet, outputs)
    .unwrap();
    tx.sign(Network::Mainnet, &from.key.secret_key).unwrap();
    tx
}

fn submit(node: &Node, tx: Transaction) -> Result<(), MempoolError> {
    node.store
        .with_utxo(|utxo| node.mempool.add_transaction(tx, utxo, now_ts()))
}

fn coinbase_outpoint(block: &aurum_core::Block) -> (String, u32) {
    (block.transactions[0].txid.clone().unwrap(), 0)
}

#[test]
fn basic_transfer_balances() {
    let a = wallet();
    let b = wallet();
    let m = wallet();
    let node = node_with_genesis(fast_params(), &[]);

    // A mines one block and owns the full reward.
    let block1 = mine(&node, &a);
    let reward = aurum_core::params::block_reward(1);
    assert_eq!(node.store.balance(&a.address), reward);

    // A -> B, amount 1, fee 0.01.
    let tx = transfer(&node, &a, &b.address, 1.0, 0.01, 0, coinbase_outpoint(&block1), reward);
    submit(&node, tx).unwrap();
    assert_eq!(node.mempool.len(), 1);

    // M mines the next block and collects reward + fee.
    mine(&node, &m);
    assert_eq!(node.mempool.len(), 0);

    let next_reward = aurum_core::params::block_reward(2);
    assert!((node.store.balance(&a.address) - (reward - 1.0 - 0.01)).abs() < 1e-9);
    assert!((node.store.balance(&b.address) - 1.0).abs() < 1e-9);
    assert!((node.store.balance(&m.address) - (next_reward + 0.01)).abs() < 1e-9);

    // Confirmed nonce advanced, history recorded.
    assert_eq!(node.nonce.get_nonce(&a.address), 1);
    assert_eq!(node.store.history(&b.address).len(), 1);
    node.store.validate_chain().unwrap();
}

#[test]
fn double_spend_same_nonce_rejected() {
    let a = wallet();
    let b = wallet();
    let c = wallet();
    let node = node_with_genesis(fast_params(), &[]);
    let block1 = mine(&node, &a);
    let reward = aurum_core::params::block_reward(1);

    let tx1 = transfer(&node, &a, &b.address, 5.0, 0.01, 0, coinbase_outpoint(&block1), reward);
    submit(&node, tx1).unwrap();

    // Same nonce, no replaces_txid: rejected, pool size unchanged.
    let tx2 = transfer(&node, &a, &c.address, 5.0, 0.01, 0, coinbase_outpoint(&block1), reward);
    let err = submit(&node, tx2).unwrap_err();
    assert!(matches!(
        err,
        MempoolError::Invalid(aurum_core::error::ValidationError::BadNonce(_))
    ));
    assert_eq!(node.mempool.len(), 1);
}

#[test]
fn rbf_swaps_pending_transaction() {
    let a = wallet();
    let b = wallet();
    let node = node_with_genesis(fast_params(), &[]);
    let block1 = mine(&node, &a);
    let reward = aurum_core::params::block_reward(1);

    let mut tx1 =
        transfer(&node, &a, &b.address, 5.0, 0.01, 0, coinbase_outpoint(&block1), reward).with_rbf();
    tx1.sign(Network::Mainnet, &a.key.secret_key).unwrap();
    let tx1_id = tx1.txid.clone().unwrap();
    submit(&node, tx1).unwrap();

    let mut tx2 = transfer(&node, &a, &b.address, 5.0, 0.05, 0, coinbase_outpoint(&block1), reward)
        .replacing(&tx1_id);
    tx2.sign(Network::Mainnet, &a.key.secret_key).unwrap();
    let tx2_id = tx2.txid.clone().unwrap();
    submit(&node, tx2).unwrap();

    assert_eq!(node.mempool.len(), 1);
    assert!(node.mempool.is_pending(&tx2_id));
    assert!(!node.mempool.is_pending(&tx1_id));
    assert_eq!(node.mempool.sender_counts()[&a.address], 1);

    // The replacement mines cleanly.
    mine(&node, &wallet());
    assert!((node.store.balance(&b.address) - 5.0).abs() < 1e-9);
}

#[test]
fn reorg_adopts_heavier_branch_and_readmits_transactions() {
    let a = wallet();
    let b = wallet();
    let miner1 = wallet();
    let miner2 = wallet();
    let params = fast_params();

    // Two nodes sharing the same genesis, which funds A with 100 coins.
    let n1 = node_with_genesis(params.clone(), &[a.address.as_str()]);
    let n2 = node_with_genesis(params, &[a.address.as_str()]);
    assert_eq!(n1.store.tip_hash(), n2.store.tip_hash());

    let genesis = n1.store.get_block(0).unwrap();
    let funding = coinbase_outpoint(&genesis);

    // N1 confirms A -> B in its own block 1.
    let tx = transfer(&n1, &a, &b.address, 10.0, 0.05, 0, funding, 100.0);
    let txid = tx.txid.clone().unwrap();
    submit(&n1, tx).unwrap();
    mine(&n1, &miner1);
    assert!((n1.store.balance(&b.address) - 10.0).abs() < 1e-9);

    // N2 mines two empty blocks: a heavier branch without the transfer.
    let fork1 = mine(&n2, &miner2);
    let fork2 = mine(&n2, &miner2);

    // Same-height fork only parks; the second block triggers the reorg.
    assert_eq!(
        n1.store.ingest(fork1, &n1.mempool).unwrap(),
        IngestOutcome::SideChained
    );
    let outcome = n1.store.ingest(fork2, &n1.mempool).unwrap();
    assert_eq!(outcome, IngestOutcome::Reorged { reverted: 1, applied: 2 });

    // N1 now follows N2's chain; the transfer was rolled back...
    assert_eq!(n1.store.tip_hash(), n2.store.tip_hash());
    assert_eq!(n1.store.height(), 2);
    assert_eq!(n1.store.balance(&b.address), 0.0);
    // ...and returned to the mempool, still spendable on the new branch.
    assert!(n1.mempool.is_pending(&txid));
    assert_eq!(n1.nonce.get_nonce(&a.address), 0);
    assert_eq!(n1.nonce.next_nonce(&a.address), 1);

    // Mining on the new branch confirms it again.
    mine(&n1, &miner1);
    assert!((n1.store.balance(&b.address) - 10.0).abs() < 1e-9);
    n1.store.validate_chain().unwrap();
}

#[test]
fn ingest_rejects_invalid_branch_and_keeps_chain() {
    let a = wallet();
    let node = node_with_genesis(fast_params(), &[]);
    mine(&node, &a);
    let tip_before = node.store.tip_hash();

    // A forged block claiming an absurd coinbase.
    let m = wallet();
    let mut forged_cb = Transaction::new(
        Network::Mainnet,
        aurum_core::COINBASE,
        &m.address,
        5000.0,
        0.0,
        0,
        TxKind::Coinbase,
    )
    .unwrap();
    forged_cb.sign(Network::Mainnet, "").unwrap();
    let mut forged = aurum_core::Block::new(
        2,
        vec![forged_cb],
        tip_before.clone(),
        1,
        now_ts(),
    );
    forged.mine(&std::sync::atomic::AtomicBool::new(false)).unwrap();

    let err = node.store.append(forged, &node.mempool).unwrap_err();
    assert!(matches!(err, aurum_chain::ChainError::InvalidBlock(_)));
    assert_eq!(node.store.tip_hash(), tip_before);
}

#[test]
fn checkpoint_roundtrip_and_tamper_detection() {
    let a = wallet();
    let node = node_with_genesis(fast_params(), &[]);
    mine(&node, &a);
    mine(&node, &a);

    let cp = node.store.create_checkpoint().unwrap();
    assert_eq!(cp.height, 2);
    let verified = node.store.verify_checkpoint(2).unwrap();
    assert_eq!(verified, cp);
    assert_eq!(
        node.store.latest_checkpoint().unwrap().map(|c| c.height),
        Some(2)
    );

    // Tamper a single field in the stored file: verification must fail.
    let disk = ChainDisk::open(node._dir.path()).unwrap();
    let mut tampered = cp.clone();
    tampered.total_supply += 1.0;
    disk.write_json_atomic(&disk.checkpoint_path(2), &tampered).unwrap();
    assert!(node.store.verify_checkpoint(2).is_err());
}

#[test]
fn difficulty_retargets_after_fast_window() {
    let a = wallet();
    let params = ChainParams {
        network: Network::Mainnet,
        genesis_difficulty: 1,
        difficulty_window: 4,
        checkpoint_interval: 1000,
    };
    let node = node_with_genesis(params, &[]);

    // The first window spans the (old) genesis timestamp, so no step-up
    // happens at height 4; the second window is all freshly mined blocks
    // and trips the retarget at height 8.
    for _ in 0..7 {
        mine(&node, &a);
    }
    assert_eq!(node.store.stats().difficulty, 2);
    let block8 = mine(&node, &a);
    assert_eq!(block8.header.difficulty, 2);
    assert!(block8.hash.starts_with("00"));
}

#[test]
fn snapshot_payload_adopts_on_fresh_node() {
    let a = wallet();
    let source = node_with_genesis(fast_params(), &[a.address.as_str()]);
    mine(&source, &a);
    mine(&source, &a);

    let payload = source.store.snapshot_payload().unwrap();

    let fresh = node_with_genesis(fast_params(), &[a.address.as_str()]);
    assert_eq!(fresh.store.height(), 0);
    fresh.store.adopt_snapshot(payload.clone()).unwrap();
    assert_eq!(fresh.store.height(), 2);
    assert_eq!(fresh.store.tip_hash(), source.store.tip_hash());
    assert!((fresh.store.balance(&a.address) - source.store.balance(&a.address)).abs() < 1e-9);

    // A tampered checkpoint is rejected outright.
    let mut bad = payload;
    bad.checkpoint.total_supply += 1.0;
    let other = node_with_genesis(fast_params(), &[a.address.as_str()]);
    assert!(other.store.adopt_snapshot(bad).is_err());
}

#[test]
fn persisted_chain_reloads() {
    let a = wallet();
    let node = node_with_genesis(fast_params(), &[]);
    mine(&node, &a);
    mine(&node, &a);
    let tip = node.store.tip_hash();
    let balance = node.store.balance(&a.address);

    // Reopen from the same data directory.
    let disk = ChainDisk::open(node._dir.path()).unwrap();
    let nonce = Arc::new(NonceTracker::new());
    let reopened = ChainStore::open(fast_params(), disk, nonce, Arc::new(NoBonus)).unwrap();
    assert_eq!(reopened.height(), 2);
    assert_eq!(reopened.tip_hash(), tip);
    assert_eq!(reopened.balance(&a.address), balance);
}
