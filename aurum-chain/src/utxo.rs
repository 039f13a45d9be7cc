use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use aurum_core::transaction::{Transaction, TxOutput};
use aurum_core::Block;

use crate::error::ChainError;

/// Reference to a concrete output: `(txid, vout)`.
pub type OutPoint = (String, u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub txid: String,
    pub vout: u32,
    pub amount: f64,
    pub owner: String,
}

/// Index of unspent outputs, keyed by outpoint and by owner.
///
/// Confirmed state only: soft locks for pending spends live in the mempool
/// (guarded by the mempool lock), while this index is guarded by the chain
/// store's lock on all write paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UtxoManager {
    unspent: HashMap<OutPoint, UtxoEntry>,
    by_owner: HashMap<String, HashSet<OutPoint>>,
}

impl UtxoManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_unspent_output(&self, txid: &str, vout: u32) -> Option<&UtxoEntry> {
        self.unspent.get(&(txid.to_string(), vout))
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.unspent.contains_key(outpoint)
    }

    pub fn get_utxos_for_address(&self, address: &str) -> Vec<UtxoEntry> {
        let mut utxos: Vec<UtxoEntry> = self
            .by_owner
            .get(address)
            .into_iter()
            .flatten()
            .filter_map(|op| self.unspent.get(op).cloned())
            .collect();
        utxos.sort_by(|a, b| (&a.txid, a.vout).cmp(&(&b.txid, b.vout)));
        utxos
    }

    pub fn balance(&self, address: &str) -> f64 {
        self.by_owner
            .get(address)
            .into_iter()
            .flatten()
            .filter_map(|op| self.unspent.get(op))
            .map(|u| u.amount)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.unspent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unspent.is_empty()
    }

    /// Sum of all unspent amounts: the circulating supply.
    pub fn total_supply(&self) -> f64 {
        self.unspent.values().map(|u| u.amount).sum()
    }

    /// Outpoints in canonical (sorted) order, for digests and snapshots.
    pub fn sorted_entries(&self) -> Vec<&UtxoEntry> {
        let mut entries: Vec<&UtxoEntry> = self.unspent.values().collect();
        entries.sort_by(|a, b| (&a.txid, a.vout).cmp(&(&b.txid, b.vout)));
        entries
    }

    fn insert(&mut self, entry: UtxoEntry) {
        let key = (entry.txid.clone(), entry.vout);
        self.by_owner
            .entry(entry.owner.clone())
            .or_default()
            .insert(key.clone());
        self.unspent.insert(key, entry);
    }

    fn remove(&mut self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        let entry = self.unspent.remove(outpoint)?;
        if let Some(set) = self.by_owner.get_mut(&entry.owner) {
            set.remove(outpoint);
            if set.is_empty() {
                self.by_owner.remove(&entry.owner);
            }
        }
        Some(entry)
    }

    /// Spend every input and add every output of the block, in order, so
    /// intra-block chaining resolves naturally. The whole application is
    /// atomic: any failure leaves `self` untouched.
    pub fn apply_block(&mut self, block: &Block) -> Result<(), ChainError> {
        let mut staged = self.clone();
        for tx in &block.transactions {
            staged.apply_transaction(tx)?;
        }
        *self = staged;
        Ok(())
    }

    fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), ChainError> {
        let txid = tx
            .txid
            .clone()
            .ok_or_else(|| ChainError::InvalidBlock("transaction missing txid".into()))?;
        for input in &tx.inputs {
            let key = (input.txid.clone(), input.vout);
            if self.remove(&key).is_none() {
                return Err(ChainError::InvalidBlock(format!(
                    "input {}:{} is not unspent",
                    input.txid, input.vout
                )));
            }
        }
        for (vout, output) in tx.outputs.iter().enumerate() {
            self.insert(UtxoEntry {
                txid: txid.clone(),
                vout: vout as u32,
                amount: output.amount,
                owner: output.address.clone(),
            });
        }
        Ok(())
    }

    /// Inverse of `apply_block`. `resolve` recovers the original output for
    /// a spent input (the chain store answers from its transaction index).
    pub fn revert_block(
        &mut self,
        block: &Block,
        resolve: impl Fn(&str, u32) -> Option<TxOutput>,
    ) -> Result<(), ChainError> {
        let mut staged = self.clone();
        for tx in block.transactions.iter().rev() {
            let txid = tx
                .txid
                .clone()
                .ok_or_else(|| ChainError::InvalidBlock("transaction missing txid".into()))?;
            for vout in 0..tx.outputs.len() {
                staged.remove(&(txid.clone(), vout as u32));
            }
            for input in &tx.inputs {
                let output = resolve(&input.txid, input.vout).ok_or_else(|| {
                    ChainError::FatalState(format!(
                        "cannot restore spent output {}:{}",
                        input.txid, input.vout
                    ))
                })?;
                staged.insert(UtxoEntry {
                    txid: input.txid.clone(),
                    vout: input.vout,
                    amount: output.amount,
                    owner: output.address,
                });
            }
        }
        *self = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurum_core::address::{Network, COINBASE};
    use aurum_core::transaction::{TxInput, TxKind};

    fn addr(tag: &str) -> String {
        format!("AUR{}", &aurum_crypto::sha256_hex(tag.as_bytes())[..40])
    }

    fn coinbase_block(index: u64, miner: &str, amount: f64) -> Block {
        let mut tx =
            Transaction::new(Network::Mainnet, COINBASE, miner, amount, 0.0, 0, TxKind::Coinbase)
                .unwrap();
        tx.sign(Network::Mainnet, "").unwrap();
        let mut block = Block::new(index, vec![tx], "0".repeat(64), 1, 1.0);
        block.hash = block.header.calculate_hash();
        block
    }

    #[test]
    fn apply_tracks_balances_and_outpoints() {
        let mut utxo = UtxoManager::new();
        let miner = addr("miner");
        let block = coinbase_block(0, &miner, 60.0);
        utxo.apply_block(&block).unwrap();

        assert_eq!(utxo.balance(&miner), 60.0);
        assert_eq!(utxo.len(), 1);
        let txid = block.transactions[0].txid.clone().unwrap();
        assert!(utxo.get_unspent_output(&txid, 0).is_some());
        assert_eq!(utxo.total_supply(), 60.0);
    }

    #[test]
    fn spend_moves_ownership_atomically() {
        let mut utxo = UtxoManager::new();
        let alice = addr("alice");
        let bob = addr("bob");
        let block = coinbase_block(0, &alice, 60.0);
        utxo.apply_block(&block).unwrap();
        let parent = block.transactions[0].txid.clone().unwrap();

        let mut spend = Transaction::new(Network::Mainnet, &alice, &bob, 60.0, 0.0, 0, TxKind::Normal)
            .unwrap()
            .with_inputs(vec![TxInput { txid: parent.clone(), vout: 0 }])
            .unwrap();
        spend.txid = Some(spend.calculate_hash(Network::Mainnet));
        let mut block1 = Block::new(1, vec![spend], block.hash.clone(), 1, 2.0);
        block1.hash = block1.header.calculate_hash();

        utxo.apply_block(&block1).unwrap();
        assert_eq!(utxo.balance(&alice), 0.0);
        assert_eq!(utxo.balance(&bob), 60.0);
        assert!(utxo.get_unspent_output(&parent, 0).is_none());
    }

    #[test]
    fn double_spend_fails_and_leaves_state_untouched() {
        let mut utxo = UtxoManager::new();
        let alice = addr("alice");
        let block = coinbase_block(0, &alice, 60.0);
        utxo.apply_block(&block).unwrap();
        let parent = block.transactions[0].txid.clone().unwrap();

        let mut bad = Transaction::new(
            Network::Mainnet,
            &alice,
            &addr("bob"),
            60.0,
            0.0,
            0,
            TxKind::Normal,
        )
        .unwrap()
        .with_inputs(vec![
            TxInput { txid: parent.clone(), vout: 0 },
            TxInput { txid: parent.clone(), vout: 0 },
        ])
        .unwrap();
        bad.txid = Some(bad.calculate_hash(Network::Mainnet));
        let mut block1 = Block::new(1, vec![bad], block.hash.clone(), 1, 2.0);
        block1.hash = block1.header.calculate_hash();

        assert!(utxo.apply_block(&block1).is_err());
        // Atomicity: the first spend in the failed block did not stick.
        assert_eq!(utxo.balance(&alice), 60.0);
    }

    #[test]
    fn revert_restores_spent_inputs() {
        let mut utxo = UtxoManager::new();
        let alice = addr("alice");
        let bob = addr("bob");
        let block0 = coinbase_block(0, &alice, 60.0);
        utxo.apply_block(&block0).unwrap();
        let parent_tx = block0.transactions[0].clone();
        let parent = parent_tx.txid.clone().unwrap();

        let mut spend = Transaction::new(Network::Mainnet, &alice, &bob, 60.0, 0.0, 0, TxKind::Normal)
            .unwrap()
            .with_inputs(vec![TxInput { txid: parent.clone(), vout: 0 }])
            .unwrap();
        spend.txid = Some(spend.calculate_hash(Network::Mainnet));
        let mut block1 = Block::new(1, vec![spend], block0.hash.clone(), 1, 2.0);
        block1.hash = block1.header.calculate_hash();
        utxo.apply_block(&block1).unwrap();

        let before = utxo.clone();
        utxo.revert_block(&block1, |txid, vout| {
            if txid == parent && vout == 0 {
                Some(parent_tx.outputs[0].clone())
            } else {
                None
            }
        })
        .unwrap();

        assert_eq!(utxo.balance(&alice), 60.0);
        assert_eq!(utxo.balance(&bob), 0.0);
        assert_ne!(before.balance(&alice), utxo.balance(&alice));
    }
}
