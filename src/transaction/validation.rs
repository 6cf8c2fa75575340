//! Validation logic for transactions separated from type definitions
use crate::blockchain::AccountState;
use crate::error::ChainError;
use crate::transaction::types::{Transaction, TransactionType, COINBASE_SENDER, CONTRACT_SIGNATURE};
use rust_decimal::Decimal;

impl Transaction {
    /// Stateless checks: addresses present, amounts non-negative.
    pub fn validate_fields(&self) -> Result<(), ChainError> {
        if self.sender.trim().is_empty() {
            return Err(ChainError::InvalidTransaction(
                "Sender address cannot be empty".to_string(),
            ));
        }
        if self.recipient.trim().is_empty() {
            return Err(ChainError::InvalidTransaction(
                "Recipient address cannot be empty".to_string(),
            ));
        }
        if self.amount < Decimal::ZERO {
            return Err(ChainError::InvalidTransaction(
                "Transaction amount cannot be negative".to_string(),
            ));
        }
        if self.fee < Decimal::ZERO {
            return Err(ChainError::InvalidTransaction(
                "Transaction fee cannot be negative".to_string(),
            ));
        }
        if !self.is_coinbase() && self.amount.is_zero() && self.fee.is_zero() {
            return Err(ChainError::InvalidTransaction(
                "Amount and fee cannot both be zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Verifies the signature against the sender's registered public key.
    pub fn verify_signature(&self, accounts: &AccountState) -> Result<(), ChainError> {
        if self.sender == COINBASE_SENDER {
            return Err(ChainError::InvalidTransaction(
                "Only the miner may create coinbase transactions".to_string(),
            ));
        }
        let signature = self.signature.as_deref().ok_or_else(|| {
            ChainError::InvalidTransaction("Transaction not signed".to_string())
        })?;
        let public_key = accounts.public_key(&self.sender).ok_or_else(|| {
            ChainError::InvalidTransaction(format!("No public key registered for {}", self.sender))
        })?;

        let payload = self.canonical_payload()?;
        crate::crypto::check_signature(public_key, &payload, signature)
            .map_err(|e| ChainError::InvalidTransaction(e.to_string()))
    }

    /// Checks a contract-originated payout: escrow sender, known recipient, sentinel signature.
    pub fn verify_contract_transfer(
        &self,
        escrow_address: &str,
        mediator_address: &str,
        accounts: &AccountState,
    ) -> Result<(), ChainError> {
        if self.tx_type != TransactionType::ContractTransfer {
            return Err(ChainError::InvalidTransaction(format!(
                "Expected contract_transfer, got {}",
                self.tx_type
            )));
        }
        if self.sender != escrow_address {
            return Err(ChainError::InvalidTransaction(format!(
                "Contract transfer sender {} is not the escrow contract",
                self.sender
            )));
        }
        if self.recipient != mediator_address && !accounts.is_known(&self.recipient) {
            return Err(ChainError::InvalidTransaction(format!(
                "Contract transfer recipient {} is unknown",
                self.recipient
            )));
        }
        if self.signature.as_deref() != Some(CONTRACT_SIGNATURE) {
            return Err(ChainError::InvalidTransaction(
                "Contract transfer must carry the contract signature".to_string(),
            ));
        }
        Ok(())
    }
}
