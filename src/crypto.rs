//! Device keys, signatures and addresses
//!
//! Everything signed on chain or on the wire is signed as a compact secp256k1 ECDSA
//! signature over SHA-256 of the canonical bytes. An address is SHA-256 of the
//! 33-byte compressed public key, so a signature only counts for an address when
//! the key presented with it hashes to that address.

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Account address: SHA-256 of the compressed public key.
pub type Address = [u8; 32];

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

fn crypto_err(msg: impl Into<String>) -> ChainError {
    ChainError::CryptoError(msg.into())
}

fn digest(message: &[u8]) -> Message {
    Message::from_digest(sha256(message))
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, ChainError> {
    if bytes.len() != PUBLIC_KEY_SIZE {
        return Err(crypto_err(format!(
            "public key is {} bytes, expected {} (compressed)",
            bytes.len(),
            PUBLIC_KEY_SIZE
        )));
    }
    PublicKey::from_slice(bytes).map_err(|e| crypto_err(format!("public key rejected: {}", e)))
}

fn parse_signature(bytes: &[u8]) -> Result<Signature, ChainError> {
    if bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(crypto_err(format!(
            "signature is {} bytes, expected {} (compact)",
            bytes.len(),
            COMPACT_SIGNATURE_SIZE
        )));
    }
    Signature::from_compact(bytes).map_err(|e| crypto_err(format!("signature rejected: {}", e)))
}

/// Address controlled by a compressed public key.
pub fn address_from_public_key(public_key_bytes: &[u8]) -> Result<Address, ChainError> {
    parse_public_key(public_key_bytes)?;
    Ok(sha256(public_key_bytes))
}

pub fn address_to_hex(addr: &Address) -> String {
    hex::encode(addr)
}

/// First 8 bytes in hex, for log lines.
pub fn short_hex(bytes: &[u8; 32]) -> String {
    hex::encode(&bytes[..8])
}

pub fn address_from_hex(hex_str: &str) -> Result<Address, ChainError> {
    let bytes = hex::decode(hex_str.trim()).map_err(|e| crypto_err(format!("address is not hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| crypto_err(format!("address is {} bytes, expected 32", b.len())))
}

/// A node's device-bound key. Only used to sign blocks and envelopes this node produces.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Result<Self, ChainError> {
        Ok(Self::from_secret(SecretKey::new(&mut OsRng)))
    }

    fn from_secret(secret_key: SecretKey) -> Self {
        KeyPair {
            public_key: PublicKey::from_secret_key(&SECP, &secret_key),
            secret_key,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        if bytes.len() != SECRET_KEY_SIZE {
            return Err(crypto_err(format!(
                "secret key is {} bytes, expected {}",
                bytes.len(),
                SECRET_KEY_SIZE
            )));
        }
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| crypto_err(format!("secret key rejected: {}", e)))?;
        Ok(Self::from_secret(secret_key))
    }

    /// Parse the `validator.secret_key` config value.
    pub fn from_secret_hex(hex_str: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|e| crypto_err(format!("secret key is not hex: {}", e)))?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn address(&self) -> Address {
        sha256(&self.public_key_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    /// Compact signature over SHA-256(`message`).
    pub fn sign(&self, message: &[u8]) -> Result<[u8; COMPACT_SIGNATURE_SIZE], ChainError> {
        Ok(SECP.sign_ecdsa(&digest(message), &self.secret_key).serialize_compact())
    }
}

/// Check a compact signature over SHA-256(`message`).
pub fn verify_signature(public_key_bytes: &[u8], message: &[u8], signature_bytes: &[u8]) -> Result<(), ChainError> {
    let public_key = parse_public_key(public_key_bytes)?;
    let signature = parse_signature(signature_bytes)?;
    SECP.verify_ecdsa(&digest(message), &signature, &public_key)
        .map_err(|_| crypto_err("signature does not match public key"))
}

/// True when `public_key_bytes` controls `address` and signed `message`.
pub fn verify_signed_by(address: &Address, public_key_bytes: &[u8], message: &[u8], signature_bytes: &[u8]) -> bool {
    match address_from_public_key(public_key_bytes) {
        Ok(derived) if &derived == address => verify_signature(public_key_bytes, message, signature_bytes).is_ok(),
        _ => false,
    }
}
