//! Error types for EscrowChain

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// Bad signature, malformed fields or insufficient available balance.
    /// Rejected at admission; never enters the mempool.
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Hash, linkage, proof-of-work, Merkle or authorization mismatch in a block.
    #[error("Chain invariant violation: {0}")]
    ChainInvariantViolation(String),

    #[error("No valid proof of work found after {0} attempts")]
    ProofOfWorkExhausted(u64),

    #[error("Mining stopped")]
    MiningCancelled,

    #[error("Invalid agreement state: {0}")]
    InvalidAgreementState(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Agreement not found: {0}")]
    AgreementNotFound(String),

    #[error("Block not found: {0}")]
    BlockNotFound(u64),

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChainError {
    fn from(err: serde_json::Error) -> Self {
        ChainError::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(ChainError::MiningCancelled.to_string(), "Mining stopped");
        assert_eq!(
            ChainError::ProofOfWorkExhausted(1_000_000).to_string(),
            "No valid proof of work found after 1000000 attempts"
        );
        assert_eq!(
            ChainError::Unauthorized("only the seller may ship".to_string()).to_string(),
            "Unauthorized: only the seller may ship"
        );
        assert_eq!(ChainError::BlockNotFound(7).to_string(), "Block not found: 7");
    }

    #[test]
    fn test_json_error_conversion() {
        let err: ChainError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, ChainError::SerializationError(_)));
    }
}
