//! Transaction types for EscrowChain
use crate::crypto::{sha256_hex, KeyPair};
use crate::error::ChainError;
use rust_decimal::Decimal;
use serde_json::Value;

/// Sender used by reward-minting transactions.
pub const COINBASE_SENDER: &str = "0";

/// Signature carried by transfers the escrow contract authorizes itself.
pub const CONTRACT_SIGNATURE: &str = "VALID";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    #[default]
    Normal,
    Coinbase,
    EscrowDeposit,
    ContractTransfer,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Normal => "normal",
            TransactionType::Coinbase => "coinbase",
            TransactionType::EscrowDeposit => "escrow_deposit",
            TransactionType::ContractTransfer => "contract_transfer",
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transfer of value between two account addresses.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub recipient: String,
    pub amount: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    /// Unix seconds
    pub timestamp: f64,
    #[serde(rename = "type", default)]
    pub tx_type: TransactionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Set on escrow deposits and contract payouts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreement_id: Option<String>,
}

/// Current wall-clock time as Unix seconds with microsecond precision.
pub fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl Transaction {
    /// An unsigned `normal` transfer.
    pub fn transfer(sender: &str, recipient: &str, amount: Decimal, fee: Decimal) -> Self {
        Transaction {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee,
            timestamp: now_timestamp(),
            tx_type: TransactionType::Normal,
            signature: None,
            agreement_id: None,
        }
    }

    pub fn coinbase(recipient: &str, amount: Decimal) -> Self {
        Transaction {
            sender: COINBASE_SENDER.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee: Decimal::ZERO,
            timestamp: now_timestamp(),
            tx_type: TransactionType::Coinbase,
            signature: None,
            agreement_id: None,
        }
    }

    /// An unsigned deposit from `buyer` into the escrow account.
    pub fn escrow_deposit(
        buyer: &str,
        escrow_address: &str,
        amount: Decimal,
        fee: Decimal,
        agreement_id: &str,
    ) -> Self {
        Transaction {
            sender: buyer.to_string(),
            recipient: escrow_address.to_string(),
            amount,
            fee,
            timestamp: now_timestamp(),
            tx_type: TransactionType::EscrowDeposit,
            signature: None,
            agreement_id: Some(agreement_id.to_string()),
        }
    }

    /// A payout authored by the escrow contract. Only escrow code paths build these.
    pub(crate) fn contract_transfer(
        escrow_address: &str,
        recipient: &str,
        amount: Decimal,
        fee: Decimal,
        agreement_id: &str,
        timestamp: f64,
    ) -> Self {
        Transaction {
            sender: escrow_address.to_string(),
            recipient: recipient.to_string(),
            amount,
            fee,
            timestamp,
            tx_type: TransactionType::ContractTransfer,
            signature: Some(CONTRACT_SIGNATURE.to_string()),
            agreement_id: Some(agreement_id.to_string()),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx_type == TransactionType::Coinbase
    }

    /// Amount plus fee: what the sender is debited.
    pub fn total_cost(&self) -> Decimal {
        self.amount + self.fee
    }

    fn canonical_value(&self, include_signature: bool) -> Result<Value, ChainError> {
        let mut value = serde_json::to_value(self)?;
        if !include_signature {
            if let Value::Object(map) = &mut value {
                map.remove("signature");
            }
        }
        Ok(value)
    }

    /// Key-sorted compact JSON without the `signature` field. This is what gets signed.
    pub fn canonical_payload(&self) -> Result<Vec<u8>, ChainError> {
        Ok(serde_json::to_vec(&self.canonical_value(false)?)?)
    }

    /// Key-sorted compact JSON of the whole transaction, signature included.
    pub fn canonical_json(&self) -> Result<Vec<u8>, ChainError> {
        Ok(serde_json::to_vec(&self.canonical_value(true)?)?)
    }

    /// Hex SHA-256 of [`Transaction::canonical_json`]; used as the Merkle leaf.
    pub fn hash_str(&self) -> Result<String, ChainError> {
        Ok(sha256_hex(&self.canonical_json()?))
    }

    pub fn sign_with(&mut self, keypair: &KeyPair) -> Result<(), ChainError> {
        let payload = self.canonical_payload()?;
        self.signature = Some(keypair.sign(&payload));
        Ok(())
    }

    pub fn sign_with_secret_hex(&mut self, private_key_hex: &str) -> Result<(), ChainError> {
        let keypair = KeyPair::from_secret_hex(private_key_hex)?;
        self.sign_with(&keypair)
    }
}
