//! The node aggregate: ledger, mempool and escrow behind one lock, plus the miner

use crate::blockchain::{Block, Blockchain, MIN_PROOF_OF_WORK};
use crate::config::Config;
use crate::crypto::{parse_public_key, KeyPair};
use crate::error::ChainError;
use crate::escrow::{Agreement, AgreementRequest, EscrowContract};
use crate::mempool::Mempool;
use crate::miner::{Miner, MiningProgress};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{info, warn};

/// Result of a mining request that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum MiningOutcome {
    Mined(Block),
    /// The attempt was cancelled; nothing was committed.
    Stopped,
}

/// Everything that mutates together.
#[derive(Debug)]
pub struct LedgerState {
    pub chain: Blockchain,
    pub mempool: Mempool,
    pub escrow: EscrowContract,
}

pub struct Node {
    config: Config,
    state: Mutex<LedgerState>,
    miner: Miner,
}

impl Node {
    pub fn new(config: Config) -> Result<Self, ChainError> {
        let chain = Blockchain::new(&config)?;
        let escrow = EscrowContract::new(&config.escrow);
        let miner = Miner::new(config.miner.clone());
        info!(
            difficulty = chain.difficulty(),
            escrow = %escrow.address(),
            "node initialised"
        );
        Ok(Node {
            config,
            state: Mutex::new(LedgerState {
                chain,
                mempool: Mempool::new(),
                escrow,
            }),
            miner,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers a wallet's public key. A new address is credited the
    /// configured initial balance; re-registering changes nothing but the key.
    pub fn register_wallet(&self, address: &str, public_key_hex: &str) -> Result<(), ChainError> {
        if address.trim().is_empty() {
            return Err(ChainError::UnknownAccount("Wallet address cannot be empty".to_string()));
        }
        parse_public_key(public_key_hex)?;

        let mut state = self.state.lock();
        let is_new = !state.chain.accounts.is_known(address);
        state.chain.accounts.register_public_key(address, public_key_hex);
        if is_new {
            let initial = self.config.chain.initial_wallet_balance;
            state.chain.accounts.credit(address, initial);
            info!(%address, balance = %initial, "wallet registered");
        }
        Ok(())
    }

    /// Generates a key pair and registers its address as a wallet.
    pub fn create_wallet(&self) -> Result<KeyPair, ChainError> {
        let keypair = KeyPair::generate();
        self.register_wallet(&keypair.address(), &keypair.public_key_hex())?;
        Ok(keypair)
    }

    pub fn register_derived_address(&self, root: &str, derived: &str) -> Result<(), ChainError> {
        self.state.lock().chain.accounts.register_derived_address(root, derived)
    }

    pub fn balance(&self, address: &str) -> Decimal {
        self.state.lock().chain.accounts.get_balance(address)
    }

    pub fn available_balance(&self, address: &str) -> Decimal {
        let state = self.state.lock();
        state.mempool.available_balance(address, &state.chain.accounts)
    }

    pub fn submit_transaction(&self, tx: Transaction) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        let LedgerState { chain, mempool, .. } = &mut *state;
        mempool.admit(tx, &chain.accounts)
    }

    /// Builds, signs and submits a normal transfer.
    pub fn send(
        &self,
        sender: &str,
        recipient: &str,
        amount: Decimal,
        fee: Decimal,
        private_key_hex: &str,
    ) -> Result<Transaction, ChainError> {
        let mut tx = Transaction::transfer(sender, recipient, amount, fee);
        tx.sign_with_secret_hex(private_key_hex)?;
        self.submit_transaction(tx.clone())?;
        Ok(tx)
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.state.lock().mempool.list_pending()
    }

    pub fn current_block_reward(&self) -> Decimal {
        self.state.lock().chain.calculate_block_reward()
    }

    /// Mines the pooled transactions at `indices` (into the fee-ordered view)
    /// into a new block paying `miner_address`.
    pub fn mine(&self, miner_address: &str, indices: &[usize]) -> Result<MiningOutcome, ChainError> {
        if miner_address.trim().is_empty() {
            return Err(ChainError::InvalidTransaction(
                "Miner address cannot be empty".to_string(),
            ));
        }

        let _attempt = self.miner.begin_attempt();

        let (candidate, difficulty, pulled) = {
            let mut state = self.state.lock();
            let pulled = state.mempool.take_for_mining(indices);

            let fees: Decimal = pulled.iter().map(|tx| tx.fee).sum();
            let reward = state.chain.calculate_block_reward();
            let mut transactions = Vec::with_capacity(pulled.len() + 1);
            transactions.push(Transaction::coinbase(miner_address, reward + fees));
            transactions.extend(pulled.iter().cloned());

            let tip = state.chain.tip();
            let candidate = match Block::candidate(tip.index + 1, &tip.hash, transactions) {
                Ok(candidate) => candidate,
                Err(e) => {
                    state.mempool.release(&pulled);
                    return Err(e);
                }
            };
            // mined blocks always carry at least the chain-wide proof-of-work floor
            let difficulty = state.chain.difficulty().max(MIN_PROOF_OF_WORK);
            (candidate, difficulty, pulled)
        };

        let mined = match self.miner.run(candidate, difficulty) {
            Ok(block) if !self.miner.is_cancelled() => block,
            Ok(block) => {
                info!(index = block.index, "discarding block found after stop request");
                self.abandon(&pulled);
                return Ok(MiningOutcome::Stopped);
            }
            Err(ChainError::MiningCancelled) => {
                self.abandon(&pulled);
                return Ok(MiningOutcome::Stopped);
            }
            Err(e) => {
                self.abandon(&pulled);
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        state.mempool.release(&pulled);
        if let Err(e) = state.chain.commit_mined_block(mined.clone()) {
            warn!(index = mined.index, dropped = pulled.len(), "mined block rejected: {}", e);
            self.miner.record_failure(&e);
            return Err(e);
        }
        state.escrow.on_block_committed(&mined);
        Ok(MiningOutcome::Mined(mined))
    }

    /// Pulled transactions are not requeued when their block is not committed.
    fn abandon(&self, pulled: &[Transaction]) {
        self.state.lock().mempool.release(pulled);
        if !pulled.is_empty() {
            warn!(dropped = pulled.len(), "transactions pulled for an abandoned block were dropped");
        }
    }

    pub fn stop_mining(&self) {
        info!("mining stop requested");
        self.miner.stop();
    }

    pub fn mining_progress(&self) -> MiningProgress {
        self.miner.progress()
    }

    pub fn is_mining(&self) -> bool {
        self.miner.is_mining()
    }

    pub fn difficulty(&self) -> u32 {
        self.state.lock().chain.difficulty()
    }

    /// Waits for any in-flight search to finish, then changes the difficulty.
    pub fn set_difficulty(&self, difficulty: u32) -> Result<(), ChainError> {
        let _idle = self.miner.wait_idle();
        self.state.lock().chain.set_difficulty(difficulty)
    }

    pub fn validate_chain(&self) -> bool {
        self.state.lock().chain.validate_chain()
    }

    /// See [`Blockchain::verify_transaction_in_block`].
    pub fn verify_transaction_in_block(
        &self,
        index: u64,
        claimed: &Transaction,
        signature: Option<&str>,
        public_key: Option<&str>,
    ) -> Result<bool, ChainError> {
        self.state
            .lock()
            .chain
            .verify_transaction_in_block(index, claimed, signature, public_key)
    }

    pub fn chain_snapshot(&self) -> Vec<Block> {
        self.state.lock().chain.blocks().to_vec()
    }

    pub fn chain_len(&self) -> usize {
        self.state.lock().chain.len()
    }

    pub fn create_agreement(
        &self,
        request: AgreementRequest,
        buyer_private_key_hex: &str,
    ) -> Result<Agreement, ChainError> {
        let mut state = self.state.lock();
        let LedgerState { chain, mempool, escrow } = &mut *state;
        escrow.create_agreement(request, buyer_private_key_hex, mempool, &chain.accounts)
    }

    pub fn confirm_seller_participation(&self, agreement_id: &str, seller: &str) -> Result<(), ChainError> {
        self.state.lock().escrow.confirm_seller_participation(agreement_id, seller)
    }

    pub fn confirm_shipment(
        &self,
        agreement_id: &str,
        seller: &str,
        tracking_info: Option<String>,
    ) -> Result<(), ChainError> {
        self.state.lock().escrow.confirm_shipment(agreement_id, seller, tracking_info)
    }

    pub fn confirm_delivery(&self, agreement_id: &str, buyer: &str) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        let LedgerState { mempool, escrow, .. } = &mut *state;
        escrow.confirm_delivery(agreement_id, buyer, mempool)
    }

    pub fn open_dispute(&self, agreement_id: &str, buyer: &str, reason: Option<String>) -> Result<(), ChainError> {
        let mut state = self.state.lock();
        let LedgerState { mempool, escrow, .. } = &mut *state;
        escrow.open_dispute(agreement_id, buyer, reason, mempool)
    }

    pub fn agreement(&self, agreement_id: &str) -> Option<Agreement> {
        self.state.lock().escrow.agreement(agreement_id).cloned()
    }

    pub fn agreements_for(&self, address: &str) -> Vec<(String, Agreement)> {
        self.state.lock().escrow.agreements_for(address)
    }

    pub fn locked_funds(&self, agreement_id: &str) -> Decimal {
        self.state.lock().escrow.locked_funds(agreement_id)
    }
}
