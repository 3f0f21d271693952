// Canonical block sequence shared by mining, sync and the responder

use crate::consensus::{BlockValidator, Difficulty, TransactionValidator, ValidationError};
use crate::core::{Block, Identity, INDEX_PAGE_SIZE, MINING_REWARD, Transaction};
use crate::storage::{BlockchainDB, StorageError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("block rejected: {0}")]
    Rejected(#[from] ValidationError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("replacement suffix is empty")]
    EmptySuffix,
    #[error("index {index} out of range for chain of length {length}")]
    OutOfRange { index: u64, length: u64 },
    #[error("candidate tip {candidate} does not extend past local tip {local}")]
    NotLonger { candidate: u64, local: u64 },
    #[error("stored chain is inconsistent: {0}")]
    Corrupt(ValidationError),
}

struct ChainState {
    blocks: Vec<Block>,
    /// Set while a reorg is being committed; readers wait for it to clear
    updating: bool,
}

impl ChainState {
    fn tip(&self) -> &Block {
        // Never empty: construction always installs a genesis block.
        &self.blocks[self.blocks.len() - 1]
    }

    fn extends_tip(&self, block: &Block) -> bool {
        let tip = self.tip();
        block.index == tip.index + 1 && block.previous_hash == tip.hash
    }
}

/// Ordered, lock-guarded chain of blocks.
///
/// Index `i` of the internal vector always holds the block with `index == i`.
pub struct Ledger {
    state: Mutex<ChainState>,
    stable: Condvar,
    store: Option<BlockchainDB>,
    validator: BlockValidator,
    /// Bumped on every commit so miners can notice the tip moving without locking
    generation: AtomicU64,
}

/// Marks the ledger as mid-reorg until dropped
pub struct UpdateGuard<'a> {
    ledger: &'a Ledger,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.ledger.lock().updating = false;
        self.ledger.stable.notify_all();
    }
}

impl Ledger {
    /// In-memory ledger holding only the genesis block
    pub fn in_memory(difficulty: Difficulty) -> Self {
        Self::from_parts(vec![Block::genesis()], None, difficulty)
    }

    /// Load the persisted chain, or seed the store with the genesis block
    pub fn open(store: BlockchainDB, difficulty: Difficulty) -> Result<Self, LedgerError> {
        let mut blocks = store.load_chain()?;
        if blocks.is_empty() {
            let genesis = Block::genesis();
            store.put_block(&genesis)?;
            store.flush()?;
            log::info!("Initialized chain with genesis block {}", genesis.hash);
            blocks.push(genesis);
        } else {
            for pair in blocks.windows(2) {
                BlockValidator::validate_link(&pair[0], &pair[1]).map_err(LedgerError::Corrupt)?;
            }
            log::info!("Loaded chain from genesis to index {}", blocks.len() - 1);
        }
        Ok(Self::from_parts(blocks, Some(store), difficulty))
    }

    fn from_parts(blocks: Vec<Block>, store: Option<BlockchainDB>, difficulty: Difficulty) -> Self {
        Self {
            state: Mutex::new(ChainState {
                blocks,
                updating: false,
            }),
            stable: Condvar::new(),
            store,
            validator: BlockValidator::new(difficulty),
            generation: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock, waiting out any reorg in progress
    fn lock_stable(&self) -> MutexGuard<'_, ChainState> {
        let guard = self.lock();
        self.stable
            .wait_while(guard, |state| state.updating)
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn difficulty(&self) -> Difficulty {
        self.validator.difficulty()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Raise the `updating` flag until the guard is dropped
    pub fn begin_update(&self) -> UpdateGuard<'_> {
        let mut state = self.lock_stable();
        state.updating = true;
        UpdateGuard { ledger: self }
    }

    pub fn latest_index(&self) -> u64 {
        self.lock().tip().index
    }

    pub fn latest_hash(&self) -> String {
        self.lock().tip().hash.clone()
    }

    /// (index, hash) of the tip read under one lock
    pub fn tip_info(&self) -> (u64, String) {
        let state = self.lock_stable();
        let tip = state.tip();
        (tip.index, tip.hash.clone())
    }

    pub fn length(&self) -> u64 {
        self.lock().blocks.len() as u64
    }

    pub fn get_block(&self, index: u64) -> Option<Block> {
        self.lock().blocks.get(index as usize).cloned()
    }

    pub fn get_hash(&self, index: u64) -> Option<String> {
        self.lock().blocks.get(index as usize).map(|b| b.hash.clone())
    }

    /// Copy of the whole chain
    pub fn snapshot(&self) -> Vec<Block> {
        self.lock_stable().blocks.clone()
    }

    /// Hashes of every block, genesis first
    pub fn hashes(&self) -> Vec<String> {
        self.lock_stable().blocks.iter().map(|b| b.hash.clone()).collect()
    }

    /// Candidate is the direct successor of the current tip
    pub fn is_block_valid(&self, candidate: &Block) -> bool {
        self.lock().extends_tip(candidate)
    }

    /// Successor of the tip, with genuine hash, enough work and valid transactions
    pub fn verify_block(&self, candidate: &Block) -> Result<(), ValidationError> {
        let state = self.lock();
        Self::check_successor(&state, candidate)?;
        self.validator.validate_block(candidate)
    }

    fn check_successor(state: &ChainState, candidate: &Block) -> Result<(), ValidationError> {
        if !state.extends_tip(candidate) {
            return Err(ValidationError::DoesNotAttach {
                index: candidate.index,
            });
        }
        Ok(())
    }

    /// Append a block after checking it against the tip it must extend
    pub fn add_block(&self, block: Block) -> Result<(), LedgerError> {
        let mut state = self.lock();
        Self::check_successor(&state, &block)?;
        self.validator.validate_block(&block)?;

        if let Some(store) = &self.store {
            store.put_block(&block)?;
        }
        state.blocks.push(block);
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Linear scan for a committed transaction with the same hash
    pub fn does_transaction_exist(&self, tx: &Transaction) -> bool {
        self.contains_transaction(&tx.hash)
    }

    pub fn contains_transaction(&self, hash: &str) -> bool {
        let state = self.lock_stable();
        Self::scan_for(&state.blocks, hash)
    }

    fn scan_for(blocks: &[Block], hash: &str) -> bool {
        blocks.iter().any(|block| block.contains_transaction(hash))
    }

    /// The last `n` blocks plus the one before them: indices `[tip-n ..= tip]`
    pub fn get_blocks_from_top(&self, n: u64) -> Vec<Block> {
        let state = self.lock_stable();
        let tip = state.tip().index;
        let first = tip.saturating_sub(n) as usize;
        state.blocks[first..].to_vec()
    }

    /// Up to `INDEX_PAGE_SIZE` blocks ending at `index` (inclusive).
    ///
    /// Empty when `index` is beyond the tip.
    pub fn get_blocks_from_index(&self, index: u64) -> Vec<Block> {
        let state = self.lock_stable();
        if index > state.tip().index {
            return Vec::new();
        }
        let first = index.saturating_sub(INDEX_PAGE_SIZE - 1) as usize;
        state.blocks[first..=index as usize].to_vec()
    }

    /// True iff the local block at `blocks[0].index` has the same hash
    pub fn compare_blockchains(&self, blocks: &[Block]) -> bool {
        let Some(first) = blocks.first() else {
            return false;
        };
        self.get_hash(first.index).is_some_and(|hash| hash == first.hash)
    }

    /// Truncate at `suffix[0].index` and append `suffix`; returns the removed blocks.
    ///
    /// Performs no validation; callers must have checked linkage and work.
    pub fn replace_blocks(&self, suffix: Vec<Block>) -> Result<Vec<Block>, LedgerError> {
        let mut state = self.lock();
        self.replace_locked(&mut state, suffix)
    }

    fn replace_locked(
        &self,
        state: &mut ChainState,
        suffix: Vec<Block>,
    ) -> Result<Vec<Block>, LedgerError> {
        let Some(first) = suffix.first() else {
            return Err(LedgerError::EmptySuffix);
        };
        let start = first.index;
        let length = state.blocks.len() as u64;
        if start == 0 || start > length {
            return Err(LedgerError::OutOfRange { index: start, length });
        }

        if let Some(store) = &self.store {
            store.replace_from(start, &suffix)?;
        }
        let removed = state.blocks.split_off(start as usize);
        state.blocks.extend(suffix);
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(removed)
    }

    /// Validate `suffix` against the local block it claims to follow and swap it in,
    /// all under a single lock acquisition.
    ///
    /// The suffix must end beyond the current tip. Returns the removed blocks.
    pub fn replace_if_attached(&self, suffix: Vec<Block>) -> Result<Vec<Block>, LedgerError> {
        let mut state = self.lock();
        let (Some(first), Some(last)) = (suffix.first(), suffix.last()) else {
            return Err(LedgerError::EmptySuffix);
        };

        let local_tip = state.tip().index;
        if last.index <= local_tip {
            return Err(LedgerError::NotLonger {
                candidate: last.index,
                local: local_tip,
            });
        }
        let length = state.blocks.len() as u64;
        if first.index == 0 || first.index > length {
            return Err(LedgerError::OutOfRange {
                index: first.index,
                length,
            });
        }

        let kept = &state.blocks[..first.index as usize];
        self.validator.validate_fork(kept, &suffix)?;
        self.replace_locked(&mut state, suffix)
    }

    /// Replay the chain: `+reward` per mined block, `-amount` per send, `+amount` per receive
    pub fn balance_of(&self, identity: &Identity) -> i64 {
        let state = self.lock_stable();
        Self::balance_in(&state.blocks, identity)
    }

    fn balance_in(blocks: &[Block], identity: &Identity) -> i64 {
        let mut balance = 0i128;
        for block in blocks {
            if &block.miner == identity {
                balance += MINING_REWARD as i128;
            }
            for tx in &block.transactions {
                if &tx.sender == identity {
                    balance -= tx.amount as i128;
                }
                if &tx.recipient == identity {
                    balance += tx.amount as i128;
                }
            }
        }
        // Loaded chains are not replayed through validation
        balance.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Signature valid, hash genuine, amount covered by the sender's balance, not yet committed
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<(), ValidationError> {
        TransactionValidator::validate_integrity(tx)?;

        let state = self.lock_stable();
        let available = Self::balance_in(&state.blocks, &tx.sender);
        if (tx.amount as i128) > available as i128 {
            return Err(ValidationError::InsufficientBalance {
                available,
                requested: tx.amount,
            });
        }
        if Self::scan_for(&state.blocks, &tx.hash) {
            return Err(ValidationError::DoubleSpend(tx.hash.clone()));
        }
        Ok(())
    }
}
