use crate::blockchain::core::chain::{meets_difficulty, Block, MIN_PROOF_OF_WORK};
use crate::blockchain::core::state::AccountState;
use crate::error::ChainError;
use crate::transaction::{TransactionType, COINBASE_SENDER};

fn violation(block: &Block, msg: impl std::fmt::Display) -> ChainError {
    ChainError::ChainInvariantViolation(format!("Block {}: {}", block.index, msg))
}

/// Full verification of a non-genesis block against the given account state:
/// hash recomputation, minimum proof-of-work, coinbase placement, per-transaction
/// authorization and Merkle root.
pub fn verify_block(
    block: &Block,
    accounts: &AccountState,
    escrow_address: &str,
    mediator_address: &str,
) -> Result<(), ChainError> {
    if block.is_genesis() {
        return Ok(());
    }

    let calculated = block.calculate_hash()?;
    if calculated != block.hash {
        return Err(violation(
            block,
            format!("hash mismatch (stored {}, calculated {})", block.hash, calculated),
        ));
    }

    if !meets_difficulty(&block.hash, MIN_PROOF_OF_WORK) {
        return Err(violation(block, "hash does not meet the minimum proof of work"));
    }

    validate_coinbase(block)?;

    for (i, tx) in block.transactions.iter().enumerate().skip(1) {
        let checked = match tx.tx_type {
            TransactionType::Coinbase => Err(ChainError::InvalidTransaction(
                "coinbase is only allowed as the first transaction".to_string(),
            )),
            TransactionType::ContractTransfer => {
                tx.verify_contract_transfer(escrow_address, mediator_address, accounts)
            }
            TransactionType::Normal | TransactionType::EscrowDeposit => tx.verify_signature(accounts),
        };
        checked.map_err(|e| violation(block, format!("transaction {}: {}", i, e)))?;
    }

    let calculated_merkle = Block::calculate_merkle_root(&block.transactions)?;
    if calculated_merkle != block.merkle_root {
        return Err(violation(
            block,
            format!(
                "Merkle root mismatch (stored {}, calculated {})",
                block.merkle_root, calculated_merkle
            ),
        ));
    }

    Ok(())
}

/// The first transaction of a mined block must be the one and only coinbase.
pub fn validate_coinbase(block: &Block) -> Result<(), ChainError> {
    let first = block
        .transactions
        .first()
        .ok_or_else(|| violation(block, "block has no transactions"))?;

    if first.tx_type != TransactionType::Coinbase || first.sender != COINBASE_SENDER {
        return Err(violation(block, "first transaction must be a coinbase"));
    }
    Ok(())
}
