use crate::config::{Config, MAX_DIFFICULTY};
use crate::crypto::{sha256_hex, verify_payload};
use crate::error::ChainError;
use crate::miner::{CancellationToken, ProofOfWork};
use crate::transaction::{now_timestamp, Transaction, TransactionType, CONTRACT_SIGNATURE};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::state::AccountState;
use super::validation::verify_block;

/// `previous_hash` of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "1";

/// Leading zero hex characters every mined block must carry, whatever the
/// difficulty was when it was mined.
pub const MIN_PROOF_OF_WORK: u32 = 1;

/// Halvings beyond this pay no reward.
const MAX_HALVINGS: u64 = 64;

/// True when `hash` starts with at least `difficulty` `'0'` characters.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    hash.bytes().take_while(|b| *b == b'0').count() >= difficulty as usize
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    /// 1-based height
    pub index: u64,
    pub timestamp: f64,
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    pub merkle_root: String,
    pub nonce: u64,
    pub hash: String,
}

impl Block {
    /// An unmined block: nonce 0, empty hash, Merkle root computed.
    pub fn candidate(
        index: u64,
        previous_hash: &str,
        transactions: Vec<Transaction>,
    ) -> Result<Self, ChainError> {
        let merkle_root = Block::calculate_merkle_root(&transactions)?;
        Ok(Block {
            index,
            timestamp: now_timestamp(),
            transactions,
            previous_hash: previous_hash.to_string(),
            merkle_root,
            nonce: 0,
            hash: String::new(),
        })
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 1
    }

    /// The block as a key-sorted JSON object without its `hash` field.
    pub fn header_value(&self) -> Result<Value, ChainError> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("hash");
        }
        Ok(value)
    }

    /// SHA-256 of the canonical JSON of the block with `hash` excluded.
    pub fn calculate_hash(&self) -> Result<String, ChainError> {
        Ok(sha256_hex(&serde_json::to_vec(&self.header_value()?)?))
    }

    /// Pairwise SHA-256 tree over the transactions' canonical JSON. Odd levels
    /// duplicate their last node; no transactions hash the empty string.
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Result<String, ChainError> {
        if transactions.is_empty() {
            return Ok(sha256_hex(b""));
        }

        let mut level = transactions
            .iter()
            .map(Transaction::hash_str)
            .collect::<Result<Vec<_>, _>>()?;

        loop {
            if level.len() % 2 == 1 {
                if let Some(last) = level.last().cloned() {
                    level.push(last);
                }
            }
            level = level
                .chunks(2)
                .map(|pair| sha256_hex(format!("{}{}", pair[0], pair[1]).as_bytes()))
                .collect();
            if level.len() == 1 {
                break;
            }
        }
        Ok(level.remove(0))
    }
}

/// The append-only chain plus the account state it commits to.
#[derive(Debug, Clone)]
pub struct Blockchain {
    blocks: Vec<Block>,
    difficulty: u32,
    pub accounts: AccountState,
    block_reward: Decimal,
    halving_interval: u64,
    escrow_address: String,
    mediator_address: String,
}

impl Blockchain {
    /// Creates a chain holding only the genesis block and seeds the escrow and
    /// mediator accounts.
    pub fn new(config: &Config) -> Result<Self, ChainError> {
        config.validate()?;
        let genesis_block = Self::create_genesis_block()?;

        let mut accounts = AccountState::new();
        accounts.credit(&config.escrow.address, config.escrow.initial_balance);
        accounts.credit(&config.escrow.mediator_address, Decimal::ZERO);

        info!(hash = %genesis_block.hash, "created genesis block");

        Ok(Blockchain {
            blocks: vec![genesis_block],
            difficulty: config.chain.difficulty,
            accounts,
            block_reward: config.chain.block_reward,
            halving_interval: config.chain.halving_interval,
            escrow_address: config.escrow.address.clone(),
            mediator_address: config.escrow.mediator_address.clone(),
        })
    }

    /// Genesis goes through the same search as every other block, at zero
    /// difficulty, so it settles on nonce 0.
    fn create_genesis_block() -> Result<Block, ChainError> {
        let genesis = Block::candidate(1, GENESIS_PREVIOUS_HASH, Vec::new())?;
        let pow = ProofOfWork::new(0, 1);
        pow.mine_block(genesis, &CancellationToken::new(), None)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn tip(&self) -> &Block {
        // the genesis block is never removed
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn set_difficulty(&mut self, difficulty: u32) -> Result<(), ChainError> {
        if difficulty > MAX_DIFFICULTY {
            return Err(ChainError::ConfigError(format!(
                "difficulty must be between 0 and {}, got {}",
                MAX_DIFFICULTY, difficulty
            )));
        }
        info!(from = self.difficulty, to = difficulty, "mining difficulty changed");
        self.difficulty = difficulty;
        Ok(())
    }

    pub fn escrow_address(&self) -> &str {
        &self.escrow_address
    }

    pub fn mediator_address(&self) -> &str {
        &self.mediator_address
    }

    /// `block_reward / 2^floor((len - 1) / halving_interval)`
    pub fn calculate_block_reward(&self) -> Decimal {
        let halvings = (self.blocks.len() as u64 - 1) / self.halving_interval;
        if halvings >= MAX_HALVINGS {
            return Decimal::ZERO;
        }
        self.block_reward / Decimal::from(1u64 << halvings)
    }

    /// Appends a fully mined block after checking linkage, proof-of-work against
    /// the active difficulty, hash and Merkle root.
    pub fn append(&mut self, block: Block) -> Result<(), ChainError> {
        let tip = self.tip();
        if block.index != tip.index + 1 {
            return Err(ChainError::ChainInvariantViolation(format!(
                "Invalid block index. Expected {}, but got {}.",
                tip.index + 1,
                block.index
            )));
        }
        if block.previous_hash != tip.hash {
            return Err(ChainError::ChainInvariantViolation(format!(
                "Invalid previous block hash. Expected {}, but got {}.",
                tip.hash, block.previous_hash
            )));
        }

        let calculated = block.calculate_hash()?;
        if calculated != block.hash {
            return Err(ChainError::ChainInvariantViolation(format!(
                "Block hash mismatch. Expected {}, but got {}.",
                calculated, block.hash
            )));
        }
        if !meets_difficulty(&block.hash, self.difficulty) {
            return Err(ChainError::ChainInvariantViolation(format!(
                "Invalid Proof-of-Work: hash {} does not have {} leading zeros.",
                block.hash, self.difficulty
            )));
        }

        let expected_merkle_root = Block::calculate_merkle_root(&block.transactions)?;
        if expected_merkle_root != block.merkle_root {
            return Err(ChainError::ChainInvariantViolation(format!(
                "Merkle root mismatch. Expected {}, but got {}.",
                expected_merkle_root, block.merkle_root
            )));
        }

        self.blocks.push(block);
        Ok(())
    }

    /// Removes the tip unless it is the genesis block.
    pub(crate) fn pop_tip(&mut self) -> Option<Block> {
        if self.blocks.len() > 1 {
            self.blocks.pop()
        } else {
            None
        }
    }

    pub fn verify_block(&self, block: &Block) -> Result<(), ChainError> {
        verify_block(block, &self.accounts, &self.escrow_address, &self.mediator_address)
    }

    /// Re-verifies every block: hash, linkage and, from index 2 onward, the full
    /// block checks with the absolute one-zero proof-of-work floor.
    pub fn check_chain(&self) -> Result<(), ChainError> {
        for (i, block) in self.blocks.iter().enumerate() {
            if block.index != i as u64 + 1 {
                return Err(ChainError::ChainInvariantViolation(format!(
                    "Block at position {} has index {}",
                    i, block.index
                )));
            }
            if !block.is_genesis() {
                self.verify_block(block)?;
            }

            let calculated = block.calculate_hash()?;
            if calculated != block.hash {
                return Err(ChainError::ChainInvariantViolation(format!(
                    "Block {}: hash mismatch (stored {}, calculated {})",
                    block.index, block.hash, calculated
                )));
            }

            if i > 0 {
                let previous = &self.blocks[i - 1];
                if block.previous_hash != previous.hash {
                    return Err(ChainError::ChainInvariantViolation(format!(
                        "Block {}: previous hash {} does not match {}",
                        block.index, block.previous_hash, previous.hash
                    )));
                }
            }
        }
        Ok(())
    }

    /// Checks that `claimed` was mined in block `index`.
    ///
    /// Escrow payouts match on recipient, amount, fee and the contract
    /// signature. Other transactions match on sender, recipient, amount and fee
    /// (deposits into escrow must also be `escrow_deposit`), and `signature`
    /// must then verify under `public_key` over the transaction as mined.
    pub fn verify_transaction_in_block(
        &self,
        index: u64,
        claimed: &Transaction,
        signature: Option<&str>,
        public_key: Option<&str>,
    ) -> Result<bool, ChainError> {
        let block = self
            .blocks
            .iter()
            .find(|b| b.index == index)
            .ok_or(ChainError::BlockNotFound(index))?;
        let same_value = |tx: &Transaction| tx.amount == claimed.amount && tx.fee == claimed.fee;

        if claimed.sender == self.escrow_address {
            let found = block.transactions.iter().any(|tx| {
                tx.tx_type == TransactionType::ContractTransfer
                    && tx.sender == self.escrow_address
                    && tx.recipient == claimed.recipient
                    && same_value(tx)
                    && tx.signature.as_deref() == Some(CONTRACT_SIGNATURE)
            });
            debug!(index, found, "contract transfer lookup");
            return Ok(found);
        }

        let is_deposit = claimed.recipient == self.escrow_address;
        let matched = block.transactions.iter().find(|tx| {
            !tx.is_coinbase()
                && (!is_deposit || tx.tx_type == TransactionType::EscrowDeposit)
                && tx.sender == claimed.sender
                && tx.recipient == claimed.recipient
                && same_value(tx)
        });
        let Some(matched) = matched else {
            debug!(index, sender = %claimed.sender, "no matching transaction in block");
            return Ok(false);
        };

        let (Some(signature), Some(public_key)) = (signature, public_key) else {
            return Err(ChainError::InvalidTransaction(
                "A signature and public key are required to verify a signed transaction".to_string(),
            ));
        };
        let mut as_mined = claimed.clone();
        as_mined.timestamp = matched.timestamp;
        as_mined.tx_type = matched.tx_type;
        as_mined.agreement_id.clone_from(&matched.agreement_id);
        as_mined.signature = None;
        Ok(verify_payload(public_key, &as_mined.canonical_payload()?, signature))
    }

    pub fn validate_chain(&self) -> bool {
        match self.check_chain() {
            Ok(()) => true,
            Err(e) => {
                warn!("chain validation failed: {}", e);
                false
            }
        }
    }

    /// Applies the block's balance effects on a copy of the account state,
    /// verifies and appends it, then re-validates the chain. Any failure leaves
    /// both the chain and the balances as they were.
    pub fn commit_mined_block(&mut self, block: Block) -> Result<(), ChainError> {
        let mut next_accounts = self.accounts.clone();
        for tx in &block.transactions {
            next_accounts.apply_transaction(tx)?;
        }
        verify_block(&block, &next_accounts, &self.escrow_address, &self.mediator_address)?;

        self.append(block)?;
        let previous_accounts = std::mem::replace(&mut self.accounts, next_accounts);

        if let Err(e) = self.check_chain() {
            warn!("rolling back block {}: {}", self.tip().index, e);
            self.pop_tip();
            self.accounts = previous_accounts;
            return Err(e);
        }

        info!(index = self.tip().index, hash = %self.tip().hash, "block committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn test_config(difficulty: u32) -> Config {
        let mut config = Config::default();
        config.chain.difficulty = difficulty;
        config
    }

    fn tx(amount: i64, timestamp: f64) -> Transaction {
        let mut tx = Transaction::transfer("alice", "bob", Decimal::from(amount), Decimal::ZERO);
        tx.timestamp = timestamp;
        tx
    }

    fn mine(block: Block, difficulty: u32) -> Block {
        ProofOfWork::new(difficulty, 1_000_000)
            .mine_block(block, &CancellationToken::new(), None)
            .unwrap()
    }

    #[test]
    fn test_genesis_block_shape() {
        let chain = Blockchain::new(&test_config(4)).unwrap();
        let genesis = chain.tip();
        assert_eq!(genesis.index, 1);
        assert_eq!(genesis.previous_hash, GENESIS_PREVIOUS_HASH);
        assert!(genesis.transactions.is_empty());
        assert_eq!(genesis.merkle_root, sha256_hex(b""));
        assert_eq!(genesis.nonce, 0);
        assert_eq!(genesis.hash, genesis.calculate_hash().unwrap());
        assert!(chain.validate_chain());
    }

    #[test]
    fn test_escrow_and_mediator_accounts_seeded() {
        let chain = Blockchain::new(&Config::default()).unwrap();
        assert_eq!(chain.accounts.get_balance("escrow_contract"), Decimal::from(1000));
        assert!(chain.accounts.is_known("mediator"));
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("00ab", 2));
        assert!(meets_difficulty("00ab", 0));
        assert!(!meets_difficulty("0a0b", 2));
        assert!(!meets_difficulty("", 1));
    }

    #[test]
    fn test_merkle_root_empty_is_hash_of_empty_string() {
        assert_eq!(
            Block::calculate_merkle_root(&[]).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_merkle_root_single_leaf_is_duplicated() {
        let only = tx(1, 1.0);
        let leaf = only.hash_str().unwrap();
        let expected = sha256_hex(format!("{}{}", leaf, leaf).as_bytes());
        assert_eq!(Block::calculate_merkle_root(&[only]).unwrap(), expected);
    }

    #[test]
    fn test_merkle_root_deterministic_and_order_sensitive() {
        let txs = vec![tx(1, 1.0), tx(2, 2.0), tx(3, 3.0)];
        let root = Block::calculate_merkle_root(&txs).unwrap();
        assert_eq!(root, Block::calculate_merkle_root(&txs).unwrap());

        let permuted = vec![txs[1].clone(), txs[0].clone(), txs[2].clone()];
        assert_ne!(root, Block::calculate_merkle_root(&permuted).unwrap());
    }

    #[test]
    fn test_merkle_root_handles_odd_inner_levels() {
        let txs: Vec<_> = (1..=5).map(|i| tx(i, i as f64)).collect();
        let root = Block::calculate_merkle_root(&txs).unwrap();
        assert_eq!(root.len(), 64);
    }

    #[test]
    fn test_block_reward_halving() {
        let mut config = test_config(0);
        config.chain.block_reward = Decimal::from(10);
        config.chain.halving_interval = 2;
        let mut chain = Blockchain::new(&config).unwrap();
        assert_eq!(chain.calculate_block_reward(), Decimal::from(10));

        for expected in [Decimal::from(10), Decimal::from(10), Decimal::from(5), Decimal::from(5)] {
            assert_eq!(chain.calculate_block_reward(), expected);
            let block = Block::candidate(
                chain.tip().index + 1,
                &chain.tip().hash.clone(),
                vec![Transaction::coinbase("miner", expected)],
            )
            .unwrap();
            let block = mine(block, 1);
            chain.commit_mined_block(block).unwrap();
        }
        assert_eq!(chain.len(), 5);
        assert_eq!(chain.calculate_block_reward(), Decimal::new(25, 1));
    }

    #[test]
    fn test_append_rejects_bad_linkage() {
        let mut chain = Blockchain::new(&test_config(1)).unwrap();
        let block = Block::candidate(2, "not-the-tip", vec![Transaction::coinbase("miner", Decimal::TEN)]).unwrap();
        let block = mine(block, 1);
        assert!(matches!(chain.append(block), Err(ChainError::ChainInvariantViolation(_))));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_append_rejects_insufficient_work() {
        let mut chain = Blockchain::new(&test_config(1)).unwrap();
        let tip_hash = chain.tip().hash.clone();
        let mut block = Block::candidate(2, &tip_hash, vec![Transaction::coinbase("miner", Decimal::TEN)]).unwrap();
        // find a nonce whose hash does not start with zero
        loop {
            block.hash = block.calculate_hash().unwrap();
            if !block.hash.starts_with('0') {
                break;
            }
            block.nonce += 1;
        }
        assert!(matches!(chain.append(block), Err(ChainError::ChainInvariantViolation(msg)) if msg.contains("Proof-of-Work")));
    }

    #[test]
    fn test_append_rejects_tampered_merkle_root() {
        let mut chain = Blockchain::new(&test_config(1)).unwrap();
        let tip_hash = chain.tip().hash.clone();
        let mut block = Block::candidate(2, &tip_hash, vec![Transaction::coinbase("miner", Decimal::TEN)]).unwrap();
        block.merkle_root = sha256_hex(b"forged");
        let block = mine(block, 1);
        assert!(matches!(chain.append(block), Err(ChainError::ChainInvariantViolation(msg)) if msg.contains("Merkle")));
    }

    #[test]
    fn test_commit_rejects_block_without_coinbase() {
        let mut chain = Blockchain::new(&test_config(1)).unwrap();
        let tip_hash = chain.tip().hash.clone();
        let block = mine(Block::candidate(2, &tip_hash, Vec::new()).unwrap(), 1);
        assert!(chain.commit_mined_block(block).is_err());
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_commit_rejects_unsigned_transfer_and_keeps_balances() {
        let mut chain = Blockchain::new(&test_config(1)).unwrap();
        let keypair = KeyPair::generate();
        let alice = keypair.address();
        chain.accounts.register_public_key(&alice, &keypair.public_key_hex());
        chain.accounts.credit(&alice, Decimal::TEN);
        let before = chain.accounts.clone();

        let tip_hash = chain.tip().hash.clone();
        let unsigned = Transaction::transfer(&alice, "bob", Decimal::ONE, Decimal::ZERO);
        let block = Block::candidate(2, &tip_hash, vec![Transaction::coinbase("miner", Decimal::TEN), unsigned]).unwrap();
        let block = mine(block, 1);

        assert!(matches!(chain.commit_mined_block(block), Err(ChainError::ChainInvariantViolation(_))));
        assert_eq!(chain.accounts, before);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_tampered_history_fails_validation() {
        let mut chain = Blockchain::new(&test_config(1)).unwrap();
        let tip_hash = chain.tip().hash.clone();
        let block = mine(Block::candidate(2, &tip_hash, vec![Transaction::coinbase("miner", Decimal::TEN)]).unwrap(), 1);
        chain.commit_mined_block(block).unwrap();
        assert!(chain.validate_chain());

        chain.blocks[1].transactions[0].amount = Decimal::from(1_000_000);
        assert!(!chain.validate_chain());
    }

    struct MinedFixture {
        chain: Blockchain,
        payer: KeyPair,
        transfer: Transaction,
        deposit: Transaction,
        payout: Transaction,
    }

    fn chain_with_escrow_traffic() -> MinedFixture {
        let mut chain = Blockchain::new(&test_config(1)).unwrap();
        let payer = KeyPair::generate();
        chain.accounts.register_public_key(&payer.address(), &payer.public_key_hex());
        chain.accounts.credit(&payer.address(), Decimal::from(50));
        chain.accounts.credit("seller", Decimal::ZERO);

        let mut transfer = Transaction::transfer(&payer.address(), "bob", Decimal::from(5), Decimal::new(1, 1));
        transfer.sign_with(&payer).unwrap();
        let mut deposit = Transaction::escrow_deposit(
            &payer.address(),
            "escrow_contract",
            Decimal::new(10102, 3),
            Decimal::new(1, 2),
            "deal-1",
        );
        deposit.sign_with(&payer).unwrap();
        let payout = Transaction::contract_transfer("escrow_contract", "seller", Decimal::TEN, Decimal::new(1, 3), "deal-1", 5.0);

        let tip_hash = chain.tip().hash.clone();
        let block = Block::candidate(
            2,
            &tip_hash,
            vec![Transaction::coinbase("miner", Decimal::TEN), transfer.clone(), deposit.clone(), payout.clone()],
        )
        .unwrap();
        chain.commit_mined_block(mine(block, 1)).unwrap();

        MinedFixture { chain, payer, transfer, deposit, payout }
    }

    /// What a client holds: the fields it signed, without timestamp or signature.
    fn as_claimed(tx: &Transaction) -> Transaction {
        let mut claimed = Transaction::transfer(&tx.sender, &tx.recipient, tx.amount, tx.fee);
        claimed.timestamp = 0.0;
        claimed
    }

    #[test]
    fn test_verify_normal_transaction_in_block() {
        let f = chain_with_escrow_traffic();
        let signature = f.transfer.signature.as_deref();
        let public_key = f.payer.public_key_hex();
        let claimed = as_claimed(&f.transfer);

        assert!(f.chain.verify_transaction_in_block(2, &claimed, signature, Some(&public_key)).unwrap());

        let other = KeyPair::generate().public_key_hex();
        assert!(!f.chain.verify_transaction_in_block(2, &claimed, signature, Some(&other)).unwrap());

        let mut wrong_amount = claimed.clone();
        wrong_amount.amount = Decimal::from(6);
        assert!(!f.chain.verify_transaction_in_block(2, &wrong_amount, signature, Some(&public_key)).unwrap());

        assert!(matches!(
            f.chain.verify_transaction_in_block(2, &claimed, None, Some(&public_key)),
            Err(ChainError::InvalidTransaction(_))
        ));
        assert_eq!(
            f.chain.verify_transaction_in_block(9, &claimed, signature, Some(&public_key)),
            Err(ChainError::BlockNotFound(9))
        );
    }

    #[test]
    fn test_verify_escrow_deposit_in_block() {
        let f = chain_with_escrow_traffic();
        let public_key = f.payer.public_key_hex();
        let claimed = as_claimed(&f.deposit);

        assert!(f
            .chain
            .verify_transaction_in_block(2, &claimed, f.deposit.signature.as_deref(), Some(&public_key))
            .unwrap());
        // the transfer's signature does not cover the deposit
        assert!(!f
            .chain
            .verify_transaction_in_block(2, &claimed, f.transfer.signature.as_deref(), Some(&public_key))
            .unwrap());
        assert!(!f
            .chain
            .verify_transaction_in_block(1, &claimed, f.deposit.signature.as_deref(), Some(&public_key))
            .unwrap());
    }

    #[test]
    fn test_verify_contract_transfer_in_block() {
        let f = chain_with_escrow_traffic();
        let claimed = as_claimed(&f.payout);

        assert!(f.chain.verify_transaction_in_block(2, &claimed, None, None).unwrap());

        let mut wrong_recipient = claimed.clone();
        wrong_recipient.recipient = "mallory".to_string();
        assert!(!f.chain.verify_transaction_in_block(2, &wrong_recipient, None, None).unwrap());

        let mut wrong_fee = claimed;
        wrong_fee.fee = Decimal::ZERO;
        assert!(!f.chain.verify_transaction_in_block(2, &wrong_fee, None, None).unwrap());
    }

    #[test]
    fn test_set_difficulty_bounds() {
        let mut chain = Blockchain::new(&test_config(1)).unwrap();
        assert!(chain.set_difficulty(4).is_ok());
        assert!(chain.set_difficulty(5).is_err());
        assert_eq!(chain.difficulty(), 4);
    }
}
