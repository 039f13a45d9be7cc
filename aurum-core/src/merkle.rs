use serde::{Deserialize, Serialize};

/// Which side of the concatenation the sibling hash sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofPosition {
    Left,
    Right,
}

/// One step of a merkle inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: String,
    pub position: ProofPosition,
}

fn hash_pair(left: &str, right: &str) -> String {
    aurum_crypto::sha256_hex(format!("{left}{right}").as_bytes())
}

/// Build all tree layers bottom-up, duplicating the last element of odd
/// layers. Layer 0 is the leaf list itself.
pub fn build_layers(txids: &[String]) -> Vec<Vec<String>> {
    let mut layers = vec![txids.to_vec()];
    while layers.last().map(|l| l.len()).unwrap_or(0) > 1 {
        let mut current = layers.last().cloned().unwrap_or_default();
        if current.len() % 2 != 0 {
            current.push(current.last().cloned().unwrap_or_default());
        }
        let next = current
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
        layers.push(next);
    }
    layers
}

/// Merkle root over transaction IDs. Empty lists hash to SHA-256("").
pub fn merkle_root(txids: &[String]) -> String {
    if txids.is_empty() {
        return aurum_crypto::sha256_hex(b"");
    }
    build_layers(txids)
        .last()
        .and_then(|l| l.first().cloned())
        .unwrap_or_default()
}

/// Build the inclusion proof for `txid`, or `None` when it is not a leaf.
pub fn build_proof(txids: &[String], txid: &str) -> Option<Vec<ProofStep>> {
    let mut index = txids.iter().position(|t| t == txid)?;
    let layers = build_layers(txids);
    let mut proof = Vec::new();

    for layer in &layers[..layers.len().saturating_sub(1)] {
        let mut working = layer.clone();
        if working.len() % 2 != 0 {
            working.push(working.last().cloned().unwrap_or_default());
        }
        let is_right = index % 2 == 1;
        let sibling = if is_right { index - 1 } else { index + 1 };
        let sibling = sibling.min(working.len() - 1);
        proof.push(ProofStep {
            hash: working[sibling].clone(),
            position: if is_right {
                ProofPosition::Left
            } else {
                ProofPosition::Right
            },
        });
        index /= 2;
    }
    Some(proof)
}

/// Fold a proof into a root and compare against the expected value.
pub fn verify_proof(txid: &str, root: &str, proof: &[ProofStep]) -> bool {
    if txid.is_empty() || root.is_empty() {
        return false;
    }
    let mut current = txid.to_string();
    for step in proof {
        if step.hash.is_empty() {
            return false;
        }
        current = match step.position {
            ProofPosition::Left => hash_pair(&step.hash, &current),
            ProofPosition::Right => hash_pair(&current, &step.hash),
        };
    }
    current == root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| aurum_crypto::sha256_hex(format!("tx-{i}").as_bytes()))
            .collect()
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let txids = ids(1);
        assert_eq!(merkle_root(&txids), txids[0]);
        let proof = build_proof(&txids, &txids[0]).unwrap();
        assert!(proof.is_empty());
        assert!(verify_proof(&txids[0], &merkle_root(&txids), &proof));
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        for n in 2..=9 {
            let txids = ids(n);
            let root = merkle_root(&txids);
            for txid in &txids {
                let proof = build_proof(&txids, txid).unwrap();
                assert!(verify_proof(txid, &root, &proof), "n={n} txid={txid}");
            }
        }
    }

    #[test]
    fn odd_layers_duplicate_last_leaf() {
        let txids = ids(3);
        let manual = {
            let a = super::hash_pair(&txids[0], &txids[1]);
            let b = super::hash_pair(&txids[2], &txids[2]);
            super::hash_pair(&a, &b)
        };
        assert_eq!(merkle_root(&txids), manual);
    }

    #[test]
    fn mutation_breaks_verification() {
        let txids = ids(5);
        let root = merkle_root(&txids);
        let mut proof = build_proof(&txids, &txids[2]).unwrap();
        assert!(verify_proof(&txids[2], &root, &proof));

        // Flip one step's sibling.
        proof[0].hash = aurum_crypto::sha256_hex(b"tampered");
        assert!(!verify_proof(&txids[2], &root, &proof));

        // Honest proof, wrong root.
        let proof = build_proof(&txids, &txids[2]).unwrap();
        let bad_root = aurum_crypto::sha256_hex(b"other-root");
        assert!(!verify_proof(&txids[2], &bad_root, &proof));

        // Wrong leaf entirely.
        assert!(!verify_proof(&txids[3], &root, &proof));
    }

    #[test]
    fn missing_leaf_yields_no_proof() {
        let txids = ids(4);
        assert!(build_proof(&txids, "absent").is_none());
    }
}
