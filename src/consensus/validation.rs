// Transaction and block validation

use crate::consensus::pow::{Difficulty, Miner};
use crate::core::{Block, Identity, MAX_AMOUNT, MINING_REWARD, Transaction};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Validation error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Stored block hash doesn't match the recomputed one
    #[error("block {index}: hash does not match contents")]
    HashMismatch { index: u64 },
    /// Block hash doesn't meet the leading-zero requirement
    #[error("block {index}: insufficient proof of work")]
    InsufficientWork { index: u64 },
    /// Transaction hash doesn't match its fields
    #[error("transaction {0}: hash does not match contents")]
    InvalidTransactionHash(String),
    /// Signature doesn't verify under the sender identity
    #[error("transaction {0}: invalid signature")]
    InvalidSignature(String),
    #[error("transaction {0}: amount exceeds {max}", max = MAX_AMOUNT)]
    AmountTooLarge(String),
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: u64 },
    /// Transaction already committed in the ledger
    #[error("transaction {0} already in the ledger")]
    DoubleSpend(String),
    /// Same transaction appears twice in a block or segment
    #[error("transaction {0} appears more than once")]
    DuplicateTransaction(String),
    /// Block does not extend the block it should follow
    #[error("block {index} does not attach to its predecessor")]
    DoesNotAttach { index: u64 },
    #[error("expected block index {expected}, found {found}")]
    NonContiguous { expected: u64, found: u64 },
    #[error("empty block segment")]
    EmptySegment,
}

/// Block validator
pub struct BlockValidator {
    /// PoW miner for verification
    miner: Miner,
}

impl BlockValidator {
    pub fn new(difficulty: Difficulty) -> Self {
        Self {
            miner: Miner::new(difficulty),
        }
    }

    pub fn difficulty(&self) -> Difficulty {
        self.miner.difficulty
    }

    /// Check hash integrity and proof of work of a single block
    pub fn validate_header(&self, block: &Block) -> Result<(), ValidationError> {
        if !block.has_valid_hash() {
            return Err(ValidationError::HashMismatch { index: block.index });
        }
        // Genesis is fixed by the chain, not mined
        if !block.is_genesis() && !self.miner.verify(block) {
            return Err(ValidationError::InsufficientWork { index: block.index });
        }
        Ok(())
    }

    /// Validate a complete block in isolation
    pub fn validate_block(&self, block: &Block) -> Result<(), ValidationError> {
        self.validate_header(block)?;

        let mut seen = HashSet::new();
        for tx in &block.transactions {
            TransactionValidator::validate_integrity(tx)?;
            if !seen.insert(tx.hash.as_str()) {
                return Err(ValidationError::DuplicateTransaction(tx.hash.clone()));
            }
        }
        Ok(())
    }

    /// Check that `block` directly extends `previous`
    pub fn validate_link(previous: &Block, block: &Block) -> Result<(), ValidationError> {
        if block.index != previous.index + 1 {
            return Err(ValidationError::NonContiguous {
                expected: previous.index + 1,
                found: block.index,
            });
        }
        if block.previous_hash != previous.hash {
            return Err(ValidationError::DoesNotAttach { index: block.index });
        }
        Ok(())
    }

    /// Validate a run of blocks meant to follow `anchor`.
    ///
    /// Every block must be individually valid, linked to its predecessor, and no
    /// transaction may repeat anywhere in the segment.
    pub fn validate_segment(&self, anchor: &Block, segment: &[Block]) -> Result<(), ValidationError> {
        if segment.is_empty() {
            return Err(ValidationError::EmptySegment);
        }

        let mut seen = HashSet::new();
        let mut previous = anchor;
        for block in segment {
            Self::validate_link(previous, block)?;
            self.validate_block(block)?;
            for tx in &block.transactions {
                if !seen.insert(tx.hash.as_str()) {
                    return Err(ValidationError::DuplicateTransaction(tx.hash.clone()));
                }
            }
            previous = block;
        }
        Ok(())
    }

    /// Validate a segment replacing everything after `kept`.
    ///
    /// On top of [`BlockValidator::validate_segment`], no segment transaction may
    /// already be committed in `kept`, and every sender must cover what it sends.
    pub fn validate_fork(&self, kept: &[Block], segment: &[Block]) -> Result<(), ValidationError> {
        let (Some(anchor), Some(first)) = (kept.last(), segment.first()) else {
            return Err(ValidationError::EmptySegment);
        };
        if first.index as usize != kept.len() {
            return Err(ValidationError::NonContiguous {
                expected: kept.len() as u64,
                found: first.index,
            });
        }
        self.validate_segment(anchor, segment)?;

        let mut accounts = AccountState::replay(kept);
        for block in segment {
            accounts.apply_checked(block)?;
        }
        Ok(())
    }
}

/// Balances and committed transaction hashes obtained by replaying blocks
#[derive(Debug, Default)]
pub struct AccountState {
    balances: HashMap<Identity, i128>,
    committed: HashSet<String>,
}

impl AccountState {
    /// Replay `blocks` without checking them
    pub fn replay(blocks: &[Block]) -> Self {
        let mut state = Self::default();
        for block in blocks {
            for tx in &block.transactions {
                state.transfer(tx);
            }
            state.reward(&block.miner);
        }
        state
    }

    pub fn balance(&self, identity: &Identity) -> i128 {
        self.balances.get(identity).copied().unwrap_or(0)
    }

    pub fn is_committed(&self, hash: &str) -> bool {
        self.committed.contains(hash)
    }

    /// Apply a block whose transactions must be new and funded, in block order
    pub fn apply_checked(&mut self, block: &Block) -> Result<(), ValidationError> {
        for tx in &block.transactions {
            if self.is_committed(&tx.hash) {
                return Err(ValidationError::DoubleSpend(tx.hash.clone()));
            }
            let available = self.balance(&tx.sender);
            if tx.amount as i128 > available {
                return Err(ValidationError::InsufficientBalance {
                    available: available.clamp(i64::MIN as i128, i64::MAX as i128) as i64,
                    requested: tx.amount,
                });
            }
            self.transfer(tx);
        }
        self.reward(&block.miner);
        Ok(())
    }

    fn transfer(&mut self, tx: &Transaction) {
        let amount = tx.amount as i128;
        *self.balances.entry(tx.sender.clone()).or_insert(0) -= amount;
        *self.balances.entry(tx.recipient.clone()).or_insert(0) += amount;
        self.committed.insert(tx.hash.clone());
    }

    fn reward(&mut self, miner: &Identity) {
        *self.balances.entry(miner.clone()).or_insert(0) += MINING_REWARD as i128;
    }
}

/// Transaction validator (context-free checks)
pub struct TransactionValidator;

impl TransactionValidator {
    /// Hash and signature checks that need no ledger state
    pub fn validate_integrity(tx: &Transaction) -> Result<(), ValidationError> {
        if tx.amount > MAX_AMOUNT {
            return Err(ValidationError::AmountTooLarge(tx.hash.clone()));
        }
        if !tx.has_valid_hash() {
            return Err(ValidationError::InvalidTransactionHash(tx.hash.clone()));
        }
        if !tx.has_valid_signature() {
            return Err(ValidationError::InvalidSignature(tx.hash.clone()));
        }
        Ok(())
    }
}
