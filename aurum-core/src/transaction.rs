use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::address::{validate_address, Network, COINBASE};
use crate::canonical::canonical_json;
use crate::error::TxError;
use crate::params::{
    MAX_FEE, MAX_INPUTS, MAX_METADATA_BYTES, MAX_OUTPUTS, MAX_SUPPLY, MAX_TX_SIZE_BYTES,
};

/// Transaction kinds. Type-specific validation hooks key off this tag but
/// never relax the baseline checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Normal,
    Coinbase,
    Contract,
    Governance,
    GovernanceVote,
    Stake,
    Unstake,
    TimeCapsuleLock,
    TradeSettlement,
}

impl TxKind {
    /// Zero-amount transfers are legal for pure-signal kinds.
    pub fn allows_zero_amount(self) -> bool {
        matches!(self, TxKind::GovernanceVote)
    }
}

/// Reference to a prior unspent output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxInput {
    pub txid: String,
    pub vout: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub amount: f64,
}

/// A signed value transfer.
///
/// Constructed through `Transaction::new` plus the `with_*` builders, all
/// of which validate their fields; a deserialized transaction must pass
/// the validator's structural layer before it is trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: Option<String>,
    pub sender: String,
    pub recipient: String,
    pub amount: f64,
    pub fee: f64,
    pub timestamp: f64,
    pub nonce: u64,
    #[serde(rename = "tx_type")]
    pub kind: TxKind,
    #[serde(default)]
    pub inputs: Vec<TxInput>,
    #[serde(default)]
    pub outputs: Vec<TxOutput>,
    pub public_key: Option<String>,
    pub signature: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub rbf_enabled: bool,
    #[serde(default)]
    pub replaces_txid: Option<String>,
    #[serde(default)]
    pub gas_sponsor: Option<String>,
}

fn validate_amount(value: f64, field: &str, allow_zero: bool) -> Result<(), TxError> {
    if !value.is_finite() {
        return Err(TxError::BadField(format!("{field} must be finite")));
    }
    if value < 0.0 || (!allow_zero && value == 0.0) {
        return Err(TxError::BadField(format!("{field} must be positive")));
    }
    if value > MAX_SUPPLY {
        return Err(TxError::BadField(format!(
            "{field} exceeds maximum ({MAX_SUPPLY})"
        )));
    }
    Ok(())
}

impl Transaction {
    /// Build a transaction with validated core fields and the current
    /// wall-clock timestamp. A default output `{recipient, amount}` is
    /// attached when the caller supplies none via `with_outputs`.
    pub fn new(
        network: Network,
        sender: &str,
        recipient: &str,
        amount: f64,
        fee: f64,
        nonce: u64,
        kind: TxKind,
    ) -> Result<Self, TxError> {
        validate_address(sender, network, true)?;
        if !recipient.is_empty() {
            validate_address(recipient, network, true)?;
        }
        validate_amount(amount, "amount", true)?;
        validate_amount(fee, "fee", true)?;
        if fee > MAX_FEE {
            return Err(TxError::BadField(format!("fee exceeds maximum ({MAX_FEE})")));
        }
        let mut tx = Self {
            txid: None,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee,
            timestamp: crate::params::now_ts(),
            nonce,
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            public_key: None,
            signature: None,
            metadata: Value::Null,
            rbf_enabled: false,
            replaces_txid: None,
            gas_sponsor: None,
        };
        if !tx.recipient.is_empty() && tx.amount > 0.0 {
            tx.outputs.push(TxOutput {
                address: tx.recipient.clone(),
                amount: tx.amount,
            });
        }
        Ok(tx)
    }

    pub fn with_inputs(mut self, inputs: Vec<TxInput>) -> Result<Self, TxError> {
        if inputs.len() > MAX_INPUTS {
            return Err(TxError::BadField(format!(
                "too many inputs: {} > {MAX_INPUTS}",
                inputs.len()
            )));
        }
        self.inputs = inputs;
        Ok(self)
    }

    /// Replace the default output list. Each output is field-validated.
    pub fn with_outputs(mut self, network: Network, outputs: Vec<TxOutput>) -> Result<Self, TxError> {
        if outputs.len() > MAX_OUTPUTS {
            return Err(TxError::BadField(format!(
                "too many outputs: {} > {MAX_OUTPUTS}",
                outputs.len()
            )));
        }
        for (i, out) in outputs.iter().enumerate() {
            validate_address(&out.address, network, true)?;
            validate_amount(out.amount, &format!("output {i} amount"), true)?;
        }
        self.outputs = outputs;
        Ok(self)
    }

    pub fn with_metadata(mut self, metadata: Value) -> Result<Self, TxError> {
        let serialized = canonical_json(&metadata);
        if serialized.len() > MAX_METADATA_BYTES {
            return Err(TxError::BadField(format!(
                "metadata too large: {} > {MAX_METADATA_BYTES} bytes",
                serialized.len()
            )));
        }
        self.metadata = metadata;
        Ok(self)
    }

    pub fn with_rbf(mut self) -> Self {
        self.rbf_enabled = true;
        self
    }

    pub fn replacing(mut self, original_txid: &str) -> Self {
        self.replaces_txid = Some(original_txid.to_string());
        self
    }

    pub fn sponsored_by(mut self, sponsor: &str) -> Self {
        self.gas_sponsor = Some(sponsor.to_string());
        self
    }

    pub fn is_coinbase(&self) -> bool {
        self.sender == COINBASE
    }

    /// Canonical txid: SHA-256 over the sorted-key JSON of the
    /// content-bearing fields. `chain_context` provides cross-network
    /// replay protection.
    pub fn calculate_hash(&self, network: Network) -> String {
        let preimage = json!({
            "chain_context": network.chain_context(),
            "sender": self.sender,
            "recipient": self.recipient,
            "amount": self.amount,
            "fee": self.fee,
            "timestamp": self.timestamp,
            "nonce": self.nonce,
            "inputs": self.inputs,
            "outputs": self.outputs,
        });
        aurum_crypto::sha256_hex(canonical_json(&preimage).as_bytes())
    }

    /// Sign with the sender's secret key, deriving the public key when
    /// absent. Coinbase transactions only receive their txid.
    pub fn sign(&mut self, network: Network, secret_hex: &str) -> Result<(), TxError> {
        if self.is_coinbase() {
            self.txid = Some(self.calculate_hash(network));
            return Ok(());
        }
        if self.public_key.is_none() {
            self.public_key = Some(aurum_crypto::derive_public_key(secret_hex)?);
        }
        let hash = self.calculate_hash(network);
        let digest = aurum_crypto::sha256_digest(hash.as_bytes());
        self.signature = Some(aurum_crypto::sign_digest(secret_hex, &digest)?);
        self.txid = Some(hash);
        Ok(())
    }

    /// Verify the stored signature and that the public key re-derives the
    /// sender address.
    pub fn verify_signature(&self, network: Network) -> Result<(), TxError> {
        if self.is_coinbase() {
            return Ok(());
        }
        let (signature, public_key) = match (&self.signature, &self.public_key) {
            (Some(sig), Some(pk)) => (sig, pk),
            _ => return Err(TxError::MissingSignature),
        };
        let expected = crate::address::derive_address(network, public_key)?;
        if expected != self.sender {
            warn!(
                txid = self.txid.as_deref().unwrap_or("unknown"),
                expected, sender = %self.sender,
                "public key does not match sender address"
            );
            return Err(TxError::InvalidSignature(
                "public key does not match sender address".into(),
            ));
        }
        let hash = self.calculate_hash(network);
        let digest = aurum_crypto::sha256_digest(hash.as_bytes());
        if !aurum_crypto::verify_digest(public_key, &digest, signature)? {
            return Err(TxError::InvalidSignature("ECDSA verification failed".into()));
        }
        Ok(())
    }

    /// Canonical-serialization byte length, used for fee-per-byte math.
    /// Falls back to a structural estimate if serialization fails.
    pub fn canonical_size(&self) -> usize {
        match serde_json::to_value(self) {
            Ok(value) => canonical_json(&value).len(),
            Err(_) => 200 + self.inputs.len() * 50 + self.outputs.len() * 40,
        }
    }

    pub fn fee_rate(&self) -> f64 {
        let size = self.canonical_size();
        if size == 0 {
            0.0
        } else {
            self.fee / size as f64
        }
    }

    pub fn total_output(&self) -> f64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }
}
