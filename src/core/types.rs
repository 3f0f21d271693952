// Basic types and chain parameters

use serde::{Deserialize, Serialize};
use std::fmt;

/// Required number of leading `'0'` hex characters in a block hash
pub const DIFFICULTY: usize = 5;

/// Credits awarded to the miner of each block
pub const MINING_REWARD: i64 = 50;

/// Largest transferable amount; balances are replayed as signed integers
pub const MAX_AMOUNT: u64 = i64::MAX as u64;

/// Maximum number of transactions a miner packs into one block
pub const MAX_BLOCK_TRANSACTIONS: usize = 5;

/// Number of blocks returned for an index-specific request
pub const INDEX_PAGE_SIZE: u64 = 10;

/// Account identity: hex-encoded compressed secp256k1 public key.
///
/// Identities are opaque to the ledger; only the signer interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First 12 characters, for log lines
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
