use crate::error::ChainError;
use crate::transaction::{Transaction, TransactionType};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

/// Per-address account balances and the key registry supplied by wallet issuance.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AccountState {
    pub balances: HashMap<String, Decimal>,
    pub public_keys: HashMap<String, String>,
    /// Root wallet address -> derived addresses whose balances it aggregates.
    pub wallet_addresses: HashMap<String, Vec<String>>,
}

impl AccountState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Balance held by `address` alone.
    pub fn own_balance(&self, address: &str) -> Decimal {
        self.balances.get(address).copied().unwrap_or(Decimal::ZERO)
    }

    /// A wallet root sees its own balance plus its derived addresses; a derived
    /// (or unrelated) address sees only itself.
    pub fn get_balance(&self, address: &str) -> Decimal {
        let own = self.own_balance(address);
        match self.wallet_addresses.get(address) {
            Some(derived) => own + derived.iter().map(|a| self.own_balance(a)).sum::<Decimal>(),
            None => own,
        }
    }

    pub fn is_known(&self, address: &str) -> bool {
        self.balances.contains_key(address)
    }

    pub fn credit(&mut self, address: &str, amount: Decimal) {
        *self.balances.entry(address.to_string()).or_insert(Decimal::ZERO) += amount;
    }

    fn debit(&mut self, address: &str, amount: Decimal) {
        *self.balances.entry(address.to_string()).or_insert(Decimal::ZERO) -= amount;
    }

    pub fn public_key(&self, address: &str) -> Option<&str> {
        self.public_keys.get(address).map(String::as_str)
    }

    /// Returns `true` when the address had no key registered before.
    pub fn register_public_key(&mut self, address: &str, public_key_hex: &str) -> bool {
        self.public_keys
            .insert(address.to_string(), public_key_hex.to_string())
            .is_none()
    }

    pub fn register_derived_address(&mut self, root: &str, derived: &str) -> Result<(), ChainError> {
        if !self.public_keys.contains_key(root) {
            return Err(ChainError::UnknownAccount(format!(
                "{} is not a registered wallet",
                root
            )));
        }
        if root == derived {
            return Err(ChainError::InvalidTransaction(
                "A wallet cannot derive its own root address".to_string(),
            ));
        }
        let entry = self.wallet_addresses.entry(root.to_string()).or_default();
        if !entry.iter().any(|a| a == derived) {
            entry.push(derived.to_string());
        }
        self.balances.entry(derived.to_string()).or_insert(Decimal::ZERO);
        Ok(())
    }

    /// Sum of every account entry.
    pub fn total_supply(&self) -> Decimal {
        self.balances.values().copied().sum()
    }

    /// Applies a mined transaction's balance effects. Callers apply blocks to a
    /// clone so a failure leaves the committed state untouched.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<(), ChainError> {
        match tx.tx_type {
            TransactionType::Coinbase => {
                self.credit(&tx.recipient, tx.amount);
            }
            _ => {
                let required = tx.total_cost();
                let available = self.get_balance(&tx.sender);
                if available < required {
                    return Err(ChainError::InvalidTransaction(format!(
                        "Insufficient balance for {}: has {}, needs {}",
                        tx.sender, available, required
                    )));
                }
                self.debit(&tx.sender, required);
                self.credit(&tx.recipient, tx.amount);
            }
        }
        debug!(
            sender = %tx.sender,
            recipient = %tx.recipient,
            amount = %tx.amount,
            fee = %tx.fee,
            kind = %tx.tx_type,
            "applied transaction"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(n: i64, scale: u32) -> Decimal {
        Decimal::new(n, scale)
    }

    #[test]
    fn test_root_balance_aggregates_derived_addresses() {
        let mut state = AccountState::new();
        state.register_public_key("root", "02ab");
        state.credit("root", dec(10, 0));
        state.register_derived_address("root", "child").unwrap();
        state.credit("child", dec(3, 0));

        assert_eq!(state.get_balance("root"), dec(13, 0));
        assert_eq!(state.get_balance("child"), dec(3, 0));
        assert_eq!(state.own_balance("root"), dec(10, 0));
    }

    #[test]
    fn test_derived_address_requires_registered_root() {
        let mut state = AccountState::new();
        let result = state.register_derived_address("ghost", "child");
        assert!(matches!(result, Err(ChainError::UnknownAccount(_))));
    }

    #[test]
    fn test_derived_address_registered_once() {
        let mut state = AccountState::new();
        state.register_public_key("root", "02ab");
        state.register_derived_address("root", "child").unwrap();
        state.register_derived_address("root", "child").unwrap();
        assert_eq!(state.wallet_addresses["root"], vec!["child".to_string()]);
    }

    #[test]
    fn test_apply_transfer_debits_amount_plus_fee() {
        let mut state = AccountState::new();
        state.credit("alice", dec(10, 0));
        let tx = Transaction::transfer("alice", "bob", dec(5, 0), dec(1, 1));

        state.apply_transaction(&tx).unwrap();
        assert_eq!(state.get_balance("alice"), dec(49, 1));
        assert_eq!(state.get_balance("bob"), dec(5, 0));
    }

    #[test]
    fn test_apply_coinbase_credits_recipient() {
        let mut state = AccountState::new();
        state.apply_transaction(&Transaction::coinbase("miner", dec(101, 1))).unwrap();
        assert_eq!(state.get_balance("miner"), dec(101, 1));
        assert_eq!(state.total_supply(), dec(101, 1));
    }

    #[test]
    fn test_apply_insufficient_balance_fails_without_mutation() {
        let mut state = AccountState::new();
        state.credit("alice", dec(1, 0));
        let before = state.clone();
        let tx = Transaction::transfer("alice", "bob", dec(5, 0), Decimal::ZERO);

        assert!(matches!(state.apply_transaction(&tx), Err(ChainError::InvalidTransaction(_))));
        assert_eq!(state, before);
    }
}
