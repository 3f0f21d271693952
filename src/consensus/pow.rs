// Proof of Work implementation

use crate::core::{Block, DIFFICULTY, has_leading_zeros};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};

/// Difficulty expressed as the number of leading `'0'` hex characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Difficulty {
    pub zeros: usize,
}

impl Difficulty {
    pub fn new(zeros: usize) -> Self {
        Self { zeros: zeros.min(64) }
    }

    /// Check a hex hash string
    pub fn is_valid_hash(&self, hash: &str) -> bool {
        has_leading_zeros(hash, self.zeros)
    }

    /// Check a raw digest without hex-encoding it: each hex char is one nibble
    #[inline]
    fn is_valid_digest(&self, digest: &[u8; 32]) -> bool {
        (0..self.zeros).all(|i| {
            let byte = digest[i / 2];
            let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            nibble == 0
        })
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Self::new(DIFFICULTY)
    }
}

/// Proof of Work miner
pub struct Miner {
    pub difficulty: Difficulty,
}

impl Miner {
    pub fn new(difficulty: Difficulty) -> Self {
        Self { difficulty }
    }

    /// Search nonces upward from `block.nonce` until the hash satisfies the difficulty.
    ///
    /// `should_abort` is polled before every attempt; when it returns true the search
    /// stops and the result reports `success: false`. On success the block's nonce and
    /// hash are updated in place.
    pub fn mine<F: FnMut() -> bool>(&self, block: &mut Block, mut should_abort: F) -> MiningResult {
        let start_time = Instant::now();
        let mut attempts = 0u64;

        let mut prefix = Sha256::new();
        prefix.update(block.hash_prefix());
        let mut nonce = block.nonce.clone();

        loop {
            if should_abort() {
                block.nonce = nonce.clone();
                return MiningResult {
                    success: false,
                    nonce,
                    hash: String::new(),
                    attempts,
                    duration: start_time.elapsed(),
                };
            }

            let mut hasher = prefix.clone();
            hasher.update(Block::nonce_suffix(&nonce));
            let mut digest = [0u8; 32];
            digest.copy_from_slice(&hasher.finalize());
            attempts += 1;

            if self.difficulty.is_valid_digest(&digest) {
                let hash = hex::encode(digest);
                block.nonce = nonce.clone();
                block.hash = hash.clone();
                return MiningResult {
                    success: true,
                    nonce,
                    hash,
                    attempts,
                    duration: start_time.elapsed(),
                };
            }

            // Progress indicator every 100k attempts
            if attempts % 100_000 == 0 {
                let elapsed = start_time.elapsed();
                log::debug!(
                    "Mining block {}: {} attempts ({:.1} KH/s)",
                    block.index,
                    attempts,
                    attempts as f64 / elapsed.as_secs_f64() / 1000.0
                );
            }

            nonce += 1u32;
        }
    }

    /// Verify that a block's stored hash is genuine and satisfies PoW
    pub fn verify(&self, block: &Block) -> bool {
        block.has_valid_hash() && self.difficulty.is_valid_hash(&block.hash)
    }
}

/// Mining result
#[derive(Debug)]
pub struct MiningResult {
    /// Whether a valid nonce was found before the search was aborted
    pub success: bool,
    pub nonce: BigUint,
    /// The resulting hash (empty when aborted)
    pub hash: String,
    pub attempts: u64,
    pub duration: Duration,
}

impl MiningResult {
    /// Calculate hash rate (hashes per second)
    pub fn hash_rate(&self) -> f64 {
        self.attempts as f64 / self.duration.as_secs_f64().max(f64::EPSILON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Identity;

    fn draft() -> Block {
        Block::new(1, 1_234_567_890, Identity::new("miner"), vec![], "00".repeat(32))
    }

    #[test]
    fn test_digest_check_matches_hex_check() {
        let difficulty = Difficulty::new(3);
        let mut digest = [0xffu8; 32];
        digest[0] = 0x00;
        digest[1] = 0x0f;
        assert!(difficulty.is_valid_digest(&digest));
        assert!(difficulty.is_valid_hash(&hex::encode(digest)));

        digest[1] = 0x10;
        assert!(!difficulty.is_valid_digest(&digest));
        assert!(!difficulty.is_valid_hash(&hex::encode(digest)));
    }

    #[test]
    fn test_pow_mining_easy() {
        let miner = Miner::new(Difficulty::new(2));
        let mut block = draft();

        let result = miner.mine(&mut block, || false);
        assert!(result.success);
        assert!(block.hash.starts_with("00"));
        assert!(block.has_valid_hash());
        assert!(miner.verify(&block));
        assert_eq!(result.hash, block.hash);
    }

    #[test]
    fn test_mining_aborts() {
        let miner = Miner::new(Difficulty::new(64));
        let mut block = draft();
        let mut polls = 0;

        let result = miner.mine(&mut block, || {
            polls += 1;
            polls > 10
        });
        assert!(!result.success);
        assert_eq!(result.attempts, 10);
    }

    #[test]
    fn test_verify_rejects_forged_hash() {
        let miner = Miner::new(Difficulty::new(2));
        let mut block = draft();
        block.hash = format!("00{}", "a".repeat(62));
        assert!(!miner.verify(&block));
    }

    #[test]
    fn test_default_difficulty() {
        assert_eq!(Difficulty::default().zeros, 5);
    }
}
