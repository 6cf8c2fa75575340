//! Signature gateway for EscrowChain
//!
//! Keys, signatures and addresses cross the crate boundary as lowercase hex
//! strings. Payloads are hashed with SHA-256 before ECDSA signing.

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Lowercase hex SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn payload_message(payload: &[u8]) -> Message {
    let digest: [u8; 32] = Sha256::digest(payload).into();
    Message::from_digest(digest)
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| ChainError::CryptoError(format!("Invalid secret key hex: {}", e)))?;
        if bytes.len() != SECRET_KEY_SIZE {
            return Err(ChainError::CryptoError(format!(
                "Secret key must be {} bytes, got {}",
                SECRET_KEY_SIZE,
                bytes.len()
            )));
        }
        let secret_key = SecretKey::from_slice(&bytes)
            .map_err(|e| ChainError::CryptoError(format!("Invalid secret key bytes: {}", e)))?;
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Compressed public key as hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Account address: hex SHA-256 of the compressed public key.
    pub fn address(&self) -> String {
        let pubkey_bytes: [u8; PUBLIC_KEY_SIZE] = self.public_key.serialize();
        sha256_hex(&pubkey_bytes)
    }

    /// Signs `payload` and returns the compact signature as hex.
    pub fn sign(&self, payload: &[u8]) -> String {
        let signature = SECP256K1_CONTEXT.sign_ecdsa(&payload_message(payload), &self.secret_key);
        let compact: [u8; COMPACT_SIGNATURE_SIZE] = signature.serialize_compact();
        hex::encode(compact)
    }
}

/// Sign `payload` with a hex-encoded private key.
pub fn sign_payload(private_key_hex: &str, payload: &[u8]) -> Result<String, ChainError> {
    Ok(KeyPair::from_secret_hex(private_key_hex)?.sign(payload))
}

/// Verify a hex signature over `payload`. Malformed keys or signatures verify as `false`.
pub fn verify_payload(public_key_hex: &str, payload: &[u8], signature_hex: &str) -> bool {
    check_signature(public_key_hex, payload, signature_hex).is_ok()
}

/// Decodes a compressed public key from hex.
pub fn parse_public_key(public_key_hex: &str) -> Result<PublicKey, ChainError> {
    let public_key_bytes = hex::decode(public_key_hex.trim())
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key hex: {}", e)))?;
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    PublicKey::from_slice(&public_key_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))
}

/// Like [`verify_payload`] but reports why verification failed.
pub fn check_signature(
    public_key_hex: &str,
    payload: &[u8],
    signature_hex: &str,
) -> Result<(), ChainError> {
    let public_key = parse_public_key(public_key_hex)?;
    let signature_bytes = hex::decode(signature_hex.trim())
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature hex: {}", e)))?;
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let signature = Signature::from_compact(&signature_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&payload_message(payload), &signature, &public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}
