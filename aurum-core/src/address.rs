use serde::{Deserialize, Serialize};

use crate::error::TxError;

/// Emission source for block rewards; never a spendable key.
pub const COINBASE: &str = "COINBASE";

/// Reserved module addresses accepted where sentinels are allowed.
pub const RESERVED_ADDRESSES: &[&str] = &["GENESIS", "TREASURY"];

const ADDRESS_BODY_LEN: usize = 40;

/// Chain the node participates in; selects the address prefix and the
/// domain-separation tag mixed into every transaction hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn prefix(self) -> &'static str {
        match self {
            Network::Mainnet => "AUR",
            Network::Testnet => "TAUR",
        }
    }

    /// Tag hashed into every txid so a transaction signed for one network
    /// cannot be replayed on the other.
    pub fn chain_context(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }
}

/// Derive the wallet address for a 64-byte uncompressed public key (hex).
pub fn derive_address(network: Network, public_hex: &str) -> Result<String, TxError> {
    let body = aurum_crypto::address_body(public_hex)?;
    Ok(format!("{}{}", network.prefix(), body))
}

/// Check address shape: a sentinel (where allowed) or prefix + 40 hex chars.
pub fn validate_address(
    address: &str,
    network: Network,
    allow_sentinel: bool,
) -> Result<(), TxError> {
    if address.is_empty() {
        return Err(TxError::BadField("address is empty".into()));
    }
    if address == COINBASE || RESERVED_ADDRESSES.contains(&address) {
        if allow_sentinel {
            return Ok(());
        }
        return Err(TxError::BadField(format!(
            "sentinel address {address} not allowed here"
        )));
    }
    let prefix = network.prefix();
    let body = address
        .strip_prefix(prefix)
        .ok_or_else(|| TxError::BadField(format!("address missing {prefix} prefix")))?;
    if body.len() != ADDRESS_BODY_LEN || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(TxError::BadField(format!(
            "address body must be {ADDRESS_BODY_LEN} hex chars"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_address_validates() {
        let kp = aurum_crypto::generate_keypair();
        let addr = derive_address(Network::Mainnet, &kp.public_key).unwrap();
        assert!(addr.starts_with("AUR"));
        assert_eq!(addr.len(), 3 + 40);
        validate_address(&addr, Network::Mainnet, false).unwrap();
    }

    #[test]
    fn networks_do_not_cross_validate() {
        let kp = aurum_crypto::generate_keypair();
        let main = derive_address(Network::Mainnet, &kp.public_key).unwrap();
        let test = derive_address(Network::Testnet, &kp.public_key).unwrap();
        assert!(validate_address(&main, Network::Testnet, false).is_err());
        assert!(validate_address(&test, Network::Mainnet, false).is_err());
    }

    #[test]
    fn sentinels_require_opt_in() {
        validate_address(COINBASE, Network::Mainnet, true).unwrap();
        assert!(validate_address(COINBASE, Network::Mainnet, false).is_err());
        validate_address("GENESIS", Network::Testnet, true).unwrap();
    }

    #[test]
    fn malformed_bodies_rejected() {
        assert!(validate_address("AURdeadbeef", Network::Mainnet, false).is_err());
        assert!(validate_address("", Network::Mainnet, true).is_err());
        let not_hex = format!("AUR{}", "g".repeat(40));
        assert!(validate_address(&not_hex, Network::Mainnet, false).is_err());
    }
}
