use rand::rngs::OsRng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Uncompressed public key body length (X || Y, without the 0x04 tag).
pub const PUBLIC_KEY_LEN: usize = 64;
/// Compact ECDSA signature length.
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid hex encoding for {0}")]
    BadHex(&'static str),
    #[error("invalid secret key")]
    BadSecretKey,
    #[error("invalid public key")]
    BadPublicKey,
    #[error("invalid signature encoding")]
    BadSignature,
}

/// Hex-encoded keypair handed to wallets and the CLI.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub secret_key: String,
    pub public_key: String,
}

/// Generate a fresh secp256k1 keypair.
///
/// The public key is serialized as the 64-byte uncompressed point (X || Y)
/// so that address derivation hashes the raw coordinates.
pub fn generate_keypair() -> KeyMaterial {
    let secp = Secp256k1::new();
    let (sk, pk) = secp.generate_keypair(&mut OsRng);
    KeyMaterial {
        secret_key: hex::encode(sk.secret_bytes()),
        public_key: hex::encode(&pk.serialize_uncompressed()[1..]),
    }
}

/// Derive the 64-byte public key (hex) for a hex secret key.
pub fn derive_public_key(secret_hex: &str) -> Result<String, CryptoError> {
    let sk = parse_secret(secret_hex)?;
    let pk = PublicKey::from_secret_key(secp256k1::SECP256K1, &sk);
    Ok(hex::encode(&pk.serialize_uncompressed()[1..]))
}

/// SHA-256 over arbitrary bytes, hex encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 over arbitrary bytes, raw digest.
pub fn sha256_digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Sign a 32-byte digest with deterministic (RFC 6979) ECDSA.
///
/// Returns the 64-byte compact signature as 128 hex chars.
pub fn sign_digest(secret_hex: &str, digest: &[u8; 32]) -> Result<String, CryptoError> {
    let sk = parse_secret(secret_hex)?;
    let msg = Message::from_digest(*digest);
    let sig = secp256k1::SECP256K1.sign_ecdsa(&msg, &sk);
    Ok(hex::encode(sig.serialize_compact()))
}

/// Verify a compact ECDSA signature over a 32-byte digest.
///
/// Returns `Ok(false)` for a well-formed signature that does not verify and
/// `Err` when the key or signature bytes themselves are malformed.
pub fn verify_digest(
    public_hex: &str,
    digest: &[u8; 32],
    signature_hex: &str,
) -> Result<bool, CryptoError> {
    let pk = parse_public(public_hex)?;
    let sig_bytes: [u8; SIGNATURE_LEN] = hex::decode(signature_hex)
        .map_err(|_| CryptoError::BadHex("signature"))?
        .try_into()
        .map_err(|_| CryptoError::BadSignature)?;
    let sig = Signature::from_compact(&sig_bytes).map_err(|_| CryptoError::BadSignature)?;
    let msg = Message::from_digest(*digest);
    Ok(secp256k1::SECP256K1.verify_ecdsa(&msg, &sig, &pk).is_ok())
}

/// Hash a 64-byte public key (hex) into the 40-hex-char address body.
///
/// The caller prepends the network prefix; see `aurum-core::address`.
pub fn address_body(public_hex: &str) -> Result<String, CryptoError> {
    let bytes = hex::decode(public_hex).map_err(|_| CryptoError::BadHex("public key"))?;
    if bytes.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::BadPublicKey);
    }
    Ok(sha256_hex(&bytes)[..40].to_string())
}

fn parse_secret(secret_hex: &str) -> Result<SecretKey, CryptoError> {
    let bytes = hex::decode(secret_hex).map_err(|_| CryptoError::BadHex("secret key"))?;
    SecretKey::from_slice(&bytes).map_err(|_| CryptoError::BadSecretKey)
}

fn parse_public(public_hex: &str) -> Result<PublicKey, CryptoError> {
    let bytes = hex::decode(public_hex).map_err(|_| CryptoError::BadHex("public key"))?;
    if bytes.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::BadPublicKey);
    }
    // Re-attach the uncompressed tag stripped at serialization time.
    let mut full = [0u8; PUBLIC_KEY_LEN + 1];
    full[0] = 0x04;
    full[1..].copy_from_slice(&bytes);
    PublicKey::from_slice(&full).map_err(|_| CryptoError::BadPublicKey)
}
