//! EscrowChain - a single-node proof-of-work ledger with an embedded escrow contract
//!
//! # Architecture
//!
//! ## Core Ledger
//! - [`blockchain`] - Blocks, chain validation and account balances
//! - [`transaction`] - Transaction types, canonical serialization and checks
//! - [`mempool`] - Pending transactions and available-balance admission
//!
//! ## Consensus
//! - [`miner`] - Proof-of-work search with cancellation and progress
//!
//! ## Contracts
//! - [`escrow`] - Buyer/seller escrow agreements
//!
//! ## Cryptography
//! - [`crypto`] - secp256k1 signatures and addresses
//!
//! ## Node & Utilities
//! - [`node`] - Shared ledger state and the public entry points
//! - [`config`] - Configuration management
//! - [`logging`] - Tracing subscriber setup
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod miner;

// ============================================================================
// Contracts
// ============================================================================
pub mod escrow;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// Node, Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
pub mod logging;
pub mod node;

pub use error::{ChainError, Result};
pub use node::{MiningOutcome, Node};
