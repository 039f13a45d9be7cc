use serde::{Deserialize, Serialize};
use serde_json::json;

use aurum_core::canonical::canonical_json;
use aurum_core::Block;

use crate::utxo::UtxoManager;

/// Digest of chain state at a height, re-hashable for verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    pub block_hash: String,
    pub merkle_root: String,
    pub utxo_digest: String,
    pub total_supply: f64,
    pub timestamp: f64,
    pub checkpoint_hash: String,
}

/// Canonical digest over the unspent set: entries in sorted outpoint order.
pub fn utxo_digest(utxo: &UtxoManager) -> String {
    let entries: Vec<_> = utxo
        .sorted_entries()
        .into_iter()
        .map(|e| {
            json!({
                "txid": e.txid,
                "vout": e.vout,
                "amount": e.amount,
                "owner": e.owner,
            })
        })
        .collect();
    aurum_crypto::sha256_hex(canonical_json(&json!(entries)).as_bytes())
}

impl Checkpoint {
    pub fn create(block: &Block, utxo: &UtxoManager, total_supply: f64) -> Self {
        let mut cp = Self {
            height: block.header.index,
            block_hash: block.hash.clone(),
            merkle_root: block.header.merkle_root.clone(),
            utxo_digest: utxo_digest(utxo),
            total_supply,
            timestamp: block.header.timestamp,
            checkpoint_hash: String::new(),
        };
        cp.checkpoint_hash = cp.compute_hash();
        cp
    }

    /// Hash over every field except the hash itself; any single-field
    /// mutation changes it.
    pub fn compute_hash(&self) -> String {
        let preimage = json!({
            "height": self.height,
            "block_hash": self.block_hash,
            "merkle_root": self.merkle_root,
            "utxo_digest": self.utxo_digest,
            "total_supply": self.total_supply,
            "timestamp": self.timestamp,
        });
        aurum_crypto::sha256_hex(canonical_json(&preimage).as_bytes())
    }

    pub fn is_self_consistent(&self) -> bool {
        self.checkpoint_hash == self.compute_hash()
    }
}

/// Full state payload shipped through chunked sync: the checkpoint plus
/// every block up to its height. Serialized with bincode; the sync layer
/// treats it as opaque bytes under the manifest's `state_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub checkpoint: Checkpoint,
    pub blocks: Vec<Block>,
}

impl SnapshotPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aurum_core::address::{Network, COINBASE};
    use aurum_core::transaction::{Transaction, TxKind};

    fn sample() -> (Block, UtxoManager) {
        let miner = format!("AUR{}", &aurum_crypto::sha256_hex(b"m")[..40]);
        let mut tx =
            Transaction::new(Network::Mainnet, COINBASE, &miner, 60.0, 0.0, 0, TxKind::Coinbase)
                .unwrap();
        tx.sign(Network::Mainnet, "").unwrap();
        let mut block = Block::new(0, vec![tx], "0".repeat(64), 1, 1.0);
        block.hash = block.header.calculate_hash();
        let mut utxo = UtxoManager::new();
        utxo.apply_block(&block).unwrap();
        (block, utxo)
    }

    #[test]
    fn checkpoint_is_self_consistent() {
        let (block, utxo) = sample();
        let cp = Checkpoint::create(&block, &utxo, utxo.total_supply());
        assert!(cp.is_self_consistent());
        assert_eq!(cp.height, 0);
        assert_eq!(cp.block_hash, block.hash);
    }

    #[test]
    fn any_field_mutation_breaks_the_hash() {
        let (block, utxo) = sample();
        let cp = Checkpoint::create(&block, &utxo, utxo.total_supply());

        let mut tampered = cp.clone();
        tampered.total_supply += 1.0;
        assert!(!tampered.is_self_consistent());

        let mut tampered = cp.clone();
        tampered.block_hash = aurum_crypto::sha256_hex(b"forged");
        assert!(!tampered.is_self_consistent());

        let mut tampered = cp;
        tampered.utxo_digest = aurum_crypto::sha256_hex(b"forged");
        assert!(!tampered.is_self_consistent());
    }

    #[test]
    fn utxo_digest_tracks_state() {
        let (block, utxo) = sample();
        let before = utxo_digest(&utxo);
        let mut spent = utxo.clone();
        let txid = block.transactions[0].txid.clone().unwrap();
        // Spending the only output changes the digest.
        let mut drain = Transaction::new(
            Network::Mainnet,
            &block.transactions[0].recipient.clone(),
            &format!("AUR{}", &aurum_crypto::sha256_hex(b"x")[..40]),
            60.0,
            0.0,
            0,
            TxKind::Normal,
        )
        .unwrap()
        .with_inputs(vec![aurum_core::transaction::TxInput { txid, vout: 0 }])
        .unwrap();
        drain.txid = Some(drain.calculate_hash(Network::Mainnet));
        let mut block1 = Block::new(1, vec![drain], block.hash.clone(), 1, 2.0);
        block1.hash = block1.header.calculate_hash();
        spent.apply_block(&block1).unwrap();
        assert_ne!(before, utxo_digest(&spent));
    }

    #[test]
    fn snapshot_payload_roundtrips() {
        let (block, utxo) = sample();
        let payload = SnapshotPayload {
            checkpoint: Checkpoint::create(&block, &utxo, utxo.total_supply()),
            blocks: vec![block],
        };
        let bytes = payload.to_bytes().unwrap();
        let back = SnapshotPayload::from_bytes(&bytes).unwrap();
        assert_eq!(back.checkpoint, payload.checkpoint);
        assert_eq!(back.blocks.len(), 1);
    }
}
