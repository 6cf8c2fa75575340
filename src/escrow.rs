//! Two-party escrow contract
//!
//! Agreements move `PENDING_SELLER_CONFIRMATION -> AWAITING_SHIPMENT -> SHIPPED
//! -> COMPLETED`, or to `CANCELLED` when the buyer opens a dispute. The contract
//! never touches balances: every movement of funds is a transaction pushed into
//! the mempool and settled when it is mined.

use crate::blockchain::{AccountState, Block};
use crate::config::EscrowConfig;
use crate::error::ChainError;
use crate::mempool::Mempool;
use crate::transaction::{now_timestamp, Transaction, TransactionType};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info};

/// Share of the amount paid to the mediator (1%).
pub fn mediator_fee_rate() -> Decimal {
    Decimal::new(1, 2)
}

/// Share of the amount paid as the deposit's mining fee (0.1%).
pub fn initial_mining_fee_rate() -> Decimal {
    Decimal::new(1, 3)
}

/// Mining fee carried by each payout transaction.
pub fn release_mining_fee() -> Decimal {
    Decimal::new(1, 3)
}

/// Deposit-time reservation covering the two payouts.
pub fn reserved_mining_fees() -> Decimal {
    release_mining_fee() * Decimal::TWO
}

const DEFAULT_CANCEL_REASON: &str = "No reason provided";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgreementStatus {
    PendingSellerConfirmation,
    AwaitingShipment,
    Shipped,
    Completed,
    Cancelled,
}

impl AgreementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgreementStatus::PendingSellerConfirmation => "PENDING_SELLER_CONFIRMATION",
            AgreementStatus::AwaitingShipment => "AWAITING_SHIPMENT",
            AgreementStatus::Shipped => "SHIPPED",
            AgreementStatus::Completed => "COMPLETED",
            AgreementStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AgreementStatus::Completed | AgreementStatus::Cancelled)
    }

    fn listing_rank(&self) -> u8 {
        match self {
            AgreementStatus::Completed => 1,
            AgreementStatus::Cancelled => 2,
            _ => 0,
        }
    }
}

impl std::fmt::Display for AgreementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CancellationDetails {
    pub cancelled_at: f64,
    pub cancelled_from_state: AgreementStatus,
    pub cancelled_by: String,
    pub reason: String,
    /// Always `"DISPUTE"`; disputes are the only way to cancel.
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Agreement {
    pub buyer: String,
    pub seller: String,
    pub amount: Decimal,
    pub mediator_fee: Decimal,
    pub reserved_mining_fees: Decimal,
    pub description: String,
    pub status: AgreementStatus,
    pub shipped: bool,
    pub delivery_confirmed: bool,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_details: Option<CancellationDetails>,
}

/// Inputs to [`EscrowContract::create_agreement`].
#[derive(Debug, Clone)]
pub struct AgreementRequest {
    pub agreement_id: String,
    pub buyer: String,
    pub seller: String,
    pub amount: Decimal,
    pub description: String,
}

/// Fee breakdown for an agreement of a given amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgreementCosts {
    pub mediator_fee: Decimal,
    pub initial_mining_fee: Decimal,
    pub reserved_mining_fees: Decimal,
}

impl AgreementCosts {
    pub fn for_amount(amount: Decimal) -> Self {
        AgreementCosts {
            mediator_fee: amount * mediator_fee_rate(),
            initial_mining_fee: amount * initial_mining_fee_rate(),
            reserved_mining_fees: reserved_mining_fees(),
        }
    }

    /// Amount the escrow deposit moves into the contract.
    pub fn deposit_amount(&self, amount: Decimal) -> Decimal {
        amount + self.mediator_fee + self.reserved_mining_fees
    }

    /// Everything the buyer pays, deposit fee included.
    pub fn total(&self, amount: Decimal) -> Decimal {
        self.deposit_amount(amount) + self.initial_mining_fee
    }
}

#[derive(Debug, Clone)]
pub struct EscrowContract {
    address: String,
    mediator_address: String,
    strict_delivery: bool,
    agreements: HashMap<String, Agreement>,
    /// Mined but not yet released funds, by agreement id.
    locked_funds: HashMap<String, Decimal>,
}

impl EscrowContract {
    pub fn new(config: &EscrowConfig) -> Self {
        EscrowContract {
            address: config.address.clone(),
            mediator_address: config.mediator_address.clone(),
            strict_delivery: config.strict_delivery,
            agreements: HashMap::new(),
            locked_funds: HashMap::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mediator_address(&self) -> &str {
        &self.mediator_address
    }

    pub fn agreement(&self, agreement_id: &str) -> Option<&Agreement> {
        self.agreements.get(agreement_id)
    }

    pub fn locked_funds(&self, agreement_id: &str) -> Decimal {
        self.locked_funds.get(agreement_id).copied().unwrap_or(Decimal::ZERO)
    }

    /// Agreements where `address` is buyer or seller: active first, then
    /// completed, then cancelled, each group newest first.
    pub fn agreements_for(&self, address: &str) -> Vec<(String, Agreement)> {
        let mut found: Vec<(String, Agreement)> = self
            .agreements
            .iter()
            .filter(|(_, a)| a.buyer == address || a.seller == address)
            .map(|(id, a)| (id.clone(), a.clone()))
            .collect();
        found.sort_by(|(_, a), (_, b)| {
            a.status
                .listing_rank()
                .cmp(&b.status.listing_rank())
                .then_with(|| b.timestamp.total_cmp(&a.timestamp))
        });
        found
    }

    fn agreement_mut(&mut self, agreement_id: &str) -> Result<&mut Agreement, ChainError> {
        self.agreements
            .get_mut(agreement_id)
            .ok_or_else(|| ChainError::AgreementNotFound(agreement_id.to_string()))
    }

    /// Signs an escrow deposit with the buyer's key, admits it to the mempool
    /// and records the agreement as `PENDING_SELLER_CONFIRMATION`.
    pub fn create_agreement(
        &mut self,
        request: AgreementRequest,
        buyer_private_key_hex: &str,
        mempool: &mut Mempool,
        accounts: &AccountState,
    ) -> Result<Agreement, ChainError> {
        let AgreementRequest {
            agreement_id,
            buyer,
            seller,
            amount,
            description,
        } = request;

        if self.agreements.contains_key(&agreement_id) {
            return Err(ChainError::InvalidAgreementState(format!(
                "Agreement {} already exists",
                agreement_id
            )));
        }
        if amount <= Decimal::ZERO {
            return Err(ChainError::InvalidTransaction(
                "Agreement amount must be positive".to_string(),
            ));
        }
        if buyer.is_empty() || seller.is_empty() || buyer == seller {
            return Err(ChainError::InvalidTransaction(
                "Buyer and seller must be two distinct addresses".to_string(),
            ));
        }

        let costs = AgreementCosts::for_amount(amount);
        let total = costs.total(amount);
        let available = mempool.available_balance(&buyer, accounts);
        if available < total {
            return Err(ChainError::InvalidTransaction(format!(
                "Insufficient funds for agreement {}: requires {}, available {}",
                agreement_id, total, available
            )));
        }

        let mut deposit = Transaction::escrow_deposit(
            &buyer,
            &self.address,
            costs.deposit_amount(amount),
            costs.initial_mining_fee,
            &agreement_id,
        );
        deposit.sign_with_secret_hex(buyer_private_key_hex)?;
        mempool.admit(deposit, accounts)?;

        let agreement = Agreement {
            buyer,
            seller,
            amount,
            mediator_fee: costs.mediator_fee,
            reserved_mining_fees: costs.reserved_mining_fees,
            description,
            status: AgreementStatus::PendingSellerConfirmation,
            shipped: false,
            delivery_confirmed: false,
            timestamp: now_timestamp(),
            tracking_info: None,
            shipping_timestamp: None,
            cancellation_details: None,
        };
        info!(
            agreement = %agreement_id,
            buyer = %agreement.buyer,
            seller = %agreement.seller,
            amount = %amount,
            "agreement created"
        );
        self.agreements.insert(agreement_id, agreement.clone());
        Ok(agreement)
    }

    pub fn confirm_seller_participation(
        &mut self,
        agreement_id: &str,
        seller: &str,
    ) -> Result<(), ChainError> {
        let agreement = self.agreement_mut(agreement_id)?;
        if agreement.seller != seller {
            return Err(ChainError::Unauthorized(
                "Only the seller can confirm participation".to_string(),
            ));
        }
        if agreement.status != AgreementStatus::PendingSellerConfirmation {
            return Err(ChainError::InvalidAgreementState(format!(
                "Cannot confirm participation in state {}",
                agreement.status
            )));
        }
        agreement.status = AgreementStatus::AwaitingShipment;
        info!(agreement = %agreement_id, status = %agreement.status, "seller confirmed participation");
        Ok(())
    }

    pub fn confirm_shipment(
        &mut self,
        agreement_id: &str,
        seller: &str,
        tracking_info: Option<String>,
    ) -> Result<(), ChainError> {
        let agreement = self.agreement_mut(agreement_id)?;
        if agreement.seller != seller {
            return Err(ChainError::Unauthorized(
                "Only the seller can confirm shipment".to_string(),
            ));
        }
        if agreement.status != AgreementStatus::AwaitingShipment {
            return Err(ChainError::InvalidAgreementState(format!(
                "Cannot confirm shipment in state {}",
                agreement.status
            )));
        }
        agreement.shipped = true;
        agreement.tracking_info = tracking_info;
        agreement.shipping_timestamp = Some(now_timestamp());
        agreement.status = AgreementStatus::Shipped;
        info!(agreement = %agreement_id, tracking = ?agreement.tracking_info, "shipment confirmed");
        Ok(())
    }

    /// Releases the amount to the seller and the mediator fee to the mediator.
    pub fn confirm_delivery(
        &mut self,
        agreement_id: &str,
        buyer: &str,
        mempool: &mut Mempool,
    ) -> Result<(), ChainError> {
        let strict = self.strict_delivery;
        let escrow = self.address.clone();
        let mediator = self.mediator_address.clone();

        let agreement = self.agreement_mut(agreement_id)?;
        if agreement.buyer != buyer {
            return Err(ChainError::Unauthorized(
                "Only the buyer can confirm delivery".to_string(),
            ));
        }
        let allowed = if strict {
            agreement.status == AgreementStatus::Shipped
        } else {
            !agreement.status.is_terminal()
        };
        if !allowed {
            return Err(ChainError::InvalidAgreementState(format!(
                "Cannot confirm delivery in state {}",
                agreement.status
            )));
        }

        let now = now_timestamp();
        let fee = release_mining_fee();
        let to_seller = Transaction::contract_transfer(
            &escrow,
            &agreement.seller,
            agreement.amount,
            fee,
            agreement_id,
            now,
        );
        let to_mediator = Transaction::contract_transfer(
            &escrow,
            &mediator,
            agreement.mediator_fee,
            fee,
            agreement_id,
            now,
        );

        agreement.status = AgreementStatus::Completed;
        agreement.delivery_confirmed = true;
        info!(
            agreement = %agreement_id,
            seller_payout = %to_seller.amount,
            mediator_fee = %to_mediator.amount,
            "delivery confirmed, funds released"
        );

        mempool.enqueue_contract_transfer(to_seller);
        mempool.enqueue_contract_transfer(to_mediator);
        Ok(())
    }

    /// Refunds the buyer and cancels the agreement.
    pub fn open_dispute(
        &mut self,
        agreement_id: &str,
        buyer: &str,
        reason: Option<String>,
        mempool: &mut Mempool,
    ) -> Result<(), ChainError> {
        let escrow = self.address.clone();

        let agreement = self.agreement_mut(agreement_id)?;
        if agreement.buyer != buyer {
            return Err(ChainError::Unauthorized(
                "Only the buyer can open a dispute".to_string(),
            ));
        }
        let previous = agreement.status;
        if previous.is_terminal() {
            return Err(ChainError::InvalidAgreementState(format!(
                "Cannot open a dispute in state {}",
                previous
            )));
        }

        let now = now_timestamp();
        let refund = Transaction::contract_transfer(
            &escrow,
            &agreement.buyer,
            agreement.amount + agreement.mediator_fee,
            agreement.reserved_mining_fees,
            agreement_id,
            now,
        );

        agreement.cancellation_details = Some(CancellationDetails {
            cancelled_at: now,
            cancelled_from_state: previous,
            cancelled_by: buyer.to_string(),
            reason: reason.unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string()),
            kind: "DISPUTE".to_string(),
        });
        agreement.status = AgreementStatus::Cancelled;
        info!(agreement = %agreement_id, from = %previous, refund = %refund.amount, "dispute opened, buyer refunded");

        mempool.enqueue_contract_transfer(refund);
        Ok(())
    }

    /// Tracks funds held per agreement as escrow transactions get mined.
    pub fn on_block_committed(&mut self, block: &Block) {
        for tx in &block.transactions {
            let Some(agreement_id) = tx.agreement_id.as_deref() else {
                continue;
            };
            let delta = match tx.tx_type {
                TransactionType::EscrowDeposit if tx.recipient == self.address => tx.amount,
                TransactionType::ContractTransfer if tx.sender == self.address => -tx.total_cost(),
                _ => continue,
            };

            let locked = self
                .locked_funds
                .entry(agreement_id.to_string())
                .or_insert(Decimal::ZERO);
            *locked += delta;
            debug!(agreement = %agreement_id, locked = %locked, "locked funds updated");
            if *locked <= Decimal::ZERO {
                self.locked_funds.remove(agreement_id);
            }
        }
    }
}
