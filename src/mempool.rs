//! Pool of admitted, not-yet-mined transactions

use crate::blockchain::AccountState;
use crate::error::ChainError;
use crate::transaction::{Transaction, TransactionType};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct Mempool {
    /// Admission order; fee ordering is computed on read.
    transactions: Vec<Transaction>,
    /// Pulled into a block that is being mined and not yet committed.
    in_flight: Vec<Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Total `amount + fee` sent by `address` in pooled and in-flight transactions.
    pub fn pending_outflow(&self, address: &str) -> Decimal {
        self.transactions
            .iter()
            .chain(&self.in_flight)
            .filter(|tx| tx.sender == address)
            .map(Transaction::total_cost)
            .sum()
    }

    /// Ledger balance minus what the address already has waiting in the pool
    /// or in a block being mined.
    pub fn available_balance(&self, address: &str, accounts: &AccountState) -> Decimal {
        accounts.get_balance(address) - self.pending_outflow(address)
    }

    /// Admits an externally submitted, signed transaction.
    pub fn admit(&mut self, tx: Transaction, accounts: &AccountState) -> Result<(), ChainError> {
        match tx.tx_type {
            TransactionType::Coinbase => {
                return Err(ChainError::InvalidTransaction(
                    "Coinbase transactions are created by the miner only".to_string(),
                ))
            }
            TransactionType::ContractTransfer => {
                return Err(ChainError::InvalidTransaction(
                    "Contract transfers are created by the escrow contract only".to_string(),
                ))
            }
            TransactionType::Normal | TransactionType::EscrowDeposit => {}
        }

        tx.validate_fields()?;
        tx.verify_signature(accounts)?;

        let available = self.available_balance(&tx.sender, accounts);
        let required = tx.total_cost();
        if available < required {
            warn!(sender = %tx.sender, %available, %required, "rejected transaction: insufficient available balance");
            return Err(ChainError::InvalidTransaction(format!(
                "Insufficient available balance for {}: has {}, needs {}",
                tx.sender, available, required
            )));
        }

        info!(sender = %tx.sender, recipient = %tx.recipient, amount = %tx.amount, fee = %tx.fee, kind = %tx.tx_type, "transaction admitted");
        self.transactions.push(tx);
        Ok(())
    }

    /// Queues a payout built by the escrow contract. Authorization is checked
    /// when the block carrying it is verified.
    pub(crate) fn enqueue_contract_transfer(&mut self, tx: Transaction) {
        debug!(recipient = %tx.recipient, amount = %tx.amount, "contract transfer queued");
        self.transactions.push(tx);
    }

    /// Pooled transactions by descending fee, admission order among equal fees.
    pub fn list_pending(&self) -> Vec<Transaction> {
        let mut pending = self.transactions.clone();
        pending.sort_by(|a, b| b.fee.cmp(&a.fee));
        pending
    }

    /// Snapshot of the entries at `indices` of [`Mempool::list_pending`].
    /// Duplicate and out-of-range indices are skipped.
    pub fn select(&self, indices: &[usize]) -> Vec<Transaction> {
        let pending = self.list_pending();
        let mut seen = HashSet::new();
        let mut selected = Vec::with_capacity(indices.len());
        for &i in indices {
            if !seen.insert(i) {
                continue;
            }
            match pending.get(i) {
                Some(tx) => selected.push(tx.clone()),
                None => warn!(index = i, pool_size = pending.len(), "skipping out-of-range mempool index"),
            }
        }
        selected
    }

    /// Drops the first pooled copy of each given transaction.
    pub fn remove(&mut self, transactions: &[Transaction]) {
        for tx in transactions {
            if let Some(pos) = self.transactions.iter().position(|pooled| pooled == tx) {
                self.transactions.remove(pos);
            }
        }
    }

    /// Moves the entries at `indices` (see [`Mempool::select`]) out of the
    /// pool and into the in-flight set, where they keep counting against
    /// their senders until [`Mempool::release`].
    pub fn take_for_mining(&mut self, indices: &[usize]) -> Vec<Transaction> {
        let selected = self.select(indices);
        self.remove(&selected);
        self.in_flight.extend(selected.iter().cloned());
        selected
    }

    /// Drops transactions from the in-flight set once their block is
    /// committed or abandoned.
    pub fn release(&mut self, transactions: &[Transaction]) {
        for tx in transactions {
            if let Some(pos) = self.in_flight.iter().position(|pulled| pulled == tx) {
                self.in_flight.remove(pos);
            }
        }
    }
}
