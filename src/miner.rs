//! Proof-of-work search, cancellation and progress reporting

use crate::blockchain::{meets_difficulty, Block};
use crate::config::MinerConfig;
use crate::crypto::sha256_hex;
use crate::error::ChainError;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, trace, warn};

const DEFAULT_LOG_INTERVAL: u64 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiningStatus {
    #[default]
    NotStarted,
    Mining,
    Completed,
    Error,
}

/// Snapshot of the current (or last) search, safe to poll from other threads.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MiningProgress {
    pub status: MiningStatus,
    pub current_nonce: u64,
    pub current_hash: String,
    pub found: bool,
    pub final_nonce: Option<u64>,
    pub final_hash: Option<String>,
    pub error: Option<String>,
}

/// Shared stop flag polled by the search loop on every nonce.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A single search configuration: target difficulty and the attempt ceiling.
#[derive(Debug, Clone)]
pub struct ProofOfWork {
    pub difficulty: u32,
    pub max_attempts: u64,
    pub log_interval: u64,
}

impl ProofOfWork {
    pub fn new(difficulty: u32, max_attempts: u64) -> Self {
        ProofOfWork {
            difficulty,
            max_attempts,
            log_interval: DEFAULT_LOG_INTERVAL,
        }
    }

    pub fn from_config(difficulty: u32, config: &MinerConfig) -> Self {
        ProofOfWork {
            difficulty,
            max_attempts: config.max_attempts,
            log_interval: config.progress_log_interval.max(1),
        }
    }

    /// Tries nonces `0..max_attempts` until the block hash has `difficulty`
    /// leading zeros. Returns the block with `nonce` and `hash` filled in.
    pub fn mine_block(
        &self,
        mut block: Block,
        cancel: &CancellationToken,
        progress: Option<&RwLock<MiningProgress>>,
    ) -> Result<Block, ChainError> {
        let mut header = block.header_value()?;
        let log_interval = self.log_interval.max(1);

        for nonce in 0..self.max_attempts {
            if cancel.is_cancelled() {
                if let Some(progress) = progress {
                    let mut p = progress.write();
                    p.status = MiningStatus::Error;
                    p.error = Some(ChainError::MiningCancelled.to_string());
                }
                info!(index = block.index, nonce, "mining stopped");
                return Err(ChainError::MiningCancelled);
            }

            if let Value::Object(map) = &mut header {
                map.insert("nonce".to_string(), Value::from(nonce));
            }
            let hash = sha256_hex(&serde_json::to_vec(&header)?);

            if let Some(progress) = progress {
                let mut p = progress.write();
                p.current_nonce = nonce;
                p.current_hash.clone_from(&hash);
            }
            if nonce % log_interval == 0 {
                trace!(index = block.index, nonce, hash = %hash, "mining progress");
            }

            if meets_difficulty(&hash, self.difficulty) {
                if let Some(progress) = progress {
                    let mut p = progress.write();
                    p.status = MiningStatus::Completed;
                    p.found = true;
                    p.final_nonce = Some(nonce);
                    p.final_hash = Some(hash.clone());
                }
                block.nonce = nonce;
                block.hash = hash;
                return Ok(block);
            }
        }

        let err = ChainError::ProofOfWorkExhausted(self.max_attempts);
        if let Some(progress) = progress {
            let mut p = progress.write();
            p.status = MiningStatus::Error;
            p.error = Some(err.to_string());
        }
        warn!(index = block.index, difficulty = self.difficulty, "{}", err);
        Err(err)
    }
}

/// Held for the whole of one mining attempt. The miner reports itself idle
/// again once this is dropped.
#[derive(Debug)]
pub struct AttemptGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    active: &'a AtomicBool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Owns the single-flight attempt lock, the cancellation flag and the
/// progress snapshot for one node.
#[derive(Debug)]
pub struct Miner {
    attempt: Mutex<()>,
    /// Set only after the flag and progress of a new attempt are reset.
    active: AtomicBool,
    cancel: CancellationToken,
    progress: RwLock<MiningProgress>,
    config: MinerConfig,
}

impl Miner {
    pub fn new(config: MinerConfig) -> Self {
        Miner {
            attempt: Mutex::new(()),
            active: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            progress: RwLock::new(MiningProgress::default()),
            config,
        }
    }

    /// Stops any in-flight search, waits for it to release the attempt lock,
    /// then clears the flag and progress for a fresh attempt. The attempt
    /// becomes visible through [`Miner::is_mining`] only after the reset, so a
    /// stop request issued once it is visible always reaches the search.
    pub fn begin_attempt(&self) -> AttemptGuard<'_> {
        self.cancel.cancel();
        let lock = self.attempt.lock();
        self.cancel.reset();
        *self.progress.write() = MiningProgress {
            status: MiningStatus::Mining,
            ..MiningProgress::default()
        };
        self.active.store(true, Ordering::SeqCst);
        AttemptGuard {
            _lock: lock,
            active: &self.active,
        }
    }

    /// Waits for the in-flight attempt without cancelling it.
    pub(crate) fn wait_idle(&self) -> MutexGuard<'_, ()> {
        self.attempt.lock()
    }

    /// Runs the search for `block`. The caller must hold the guard from
    /// [`Miner::begin_attempt`].
    pub fn run(&self, block: Block, difficulty: u32) -> Result<Block, ChainError> {
        info!(index = block.index, difficulty, "mining started");
        let pow = ProofOfWork::from_config(difficulty, &self.config);
        let mined = pow.mine_block(block, &self.cancel, Some(&self.progress))?;
        info!(index = mined.index, nonce = mined.nonce, hash = %mined.hash, "block found");
        Ok(mined)
    }

    pub(crate) fn record_failure(&self, err: &ChainError) {
        let mut p = self.progress.write();
        p.status = MiningStatus::Error;
        p.found = false;
        p.error = Some(err.to_string());
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_mining(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> MiningProgress {
        self.progress.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::GENESIS_PREVIOUS_HASH;
    use crate::transaction::Transaction;
    use rust_decimal::Decimal;
    use std::thread;
    use std::time::Duration;

    fn candidate() -> Block {
        Block::candidate(2, GENESIS_PREVIOUS_HASH, vec![Transaction::coinbase("miner", Decimal::TEN)]).unwrap()
    }

    #[test]
    fn test_mined_hash_meets_difficulty() {
        for difficulty in 0..=3 {
            let block = ProofOfWork::new(difficulty, 1_000_000)
                .mine_block(candidate(), &CancellationToken::new(), None)
                .unwrap();
            assert!(meets_difficulty(&block.hash, difficulty));
            assert_eq!(block.hash, block.calculate_hash().unwrap());
        }
    }

    #[test]
    fn test_zero_difficulty_takes_first_nonce() {
        let block = ProofOfWork::new(0, 1)
            .mine_block(candidate(), &CancellationToken::new(), None)
            .unwrap();
        assert_eq!(block.nonce, 0);
    }

    #[test]
    fn test_exhaustion_reports_attempts() {
        let progress = RwLock::new(MiningProgress::default());
        let result = ProofOfWork::new(64, 50).mine_block(candidate(), &CancellationToken::new(), Some(&progress));
        assert_eq!(result, Err(ChainError::ProofOfWorkExhausted(50)));

        let snapshot = progress.read().clone();
        assert_eq!(snapshot.status, MiningStatus::Error);
        assert_eq!(snapshot.current_nonce, 49);
        assert!(!snapshot.found);
    }

    #[test]
    fn test_pre_cancelled_search_stops_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let result = ProofOfWork::new(0, 10).mine_block(candidate(), &token, None);
        assert_eq!(result, Err(ChainError::MiningCancelled));
    }

    #[test]
    fn test_progress_records_completion() {
        let miner = Miner::new(MinerConfig::default());
        let _guard = miner.begin_attempt();
        assert_eq!(miner.progress().status, MiningStatus::Mining);

        let block = miner.run(candidate(), 1).unwrap();
        let progress = miner.progress();
        assert_eq!(progress.status, MiningStatus::Completed);
        assert!(progress.found);
        assert_eq!(progress.final_nonce, Some(block.nonce));
        assert_eq!(progress.final_hash.as_deref(), Some(block.hash.as_str()));
    }

    #[test]
    fn test_stop_after_attempt_is_visible_is_kept() {
        let miner = Arc::new(Miner::new(MinerConfig::default()));
        assert!(!miner.is_mining());

        let started = Arc::new(std::sync::Barrier::new(2));
        let stopped = Arc::new(std::sync::Barrier::new(2));
        let worker = {
            let (miner, started, stopped) = (Arc::clone(&miner), Arc::clone(&started), Arc::clone(&stopped));
            thread::spawn(move || {
                let _guard = miner.begin_attempt();
                started.wait();
                stopped.wait();
                miner.is_cancelled()
            })
        };

        started.wait();
        assert!(miner.is_mining());
        miner.stop();
        stopped.wait();

        assert!(worker.join().unwrap());
        assert!(!miner.is_mining());
    }

    #[test]
    fn test_new_attempt_clears_stale_stop() {
        let miner = Miner::new(MinerConfig::default());
        miner.stop();
        let _guard = miner.begin_attempt();
        assert!(!miner.is_cancelled());
        assert!(miner.is_mining());
    }

    #[test]
    fn test_stop_from_another_thread() {
        let miner = Arc::new(Miner::new(MinerConfig {
            max_attempts: u64::MAX,
            ..MinerConfig::default()
        }));

        let worker = {
            let miner = Arc::clone(&miner);
            thread::spawn(move || {
                let _guard = miner.begin_attempt();
                miner.run(candidate(), 64)
            })
        };

        while !miner.is_mining() || miner.progress().current_nonce == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        miner.stop();

        assert_eq!(worker.join().unwrap(), Err(ChainError::MiningCancelled));
        assert!(!miner.is_mining());
        assert_eq!(miner.progress().error.as_deref(), Some("Mining stopped"));
    }
}
