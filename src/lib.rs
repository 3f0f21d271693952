// Peer-to-peer proof-of-work ledger node

pub mod core;
pub mod consensus;
pub mod storage;
pub mod chain;
pub mod network;
pub mod wallet;
pub mod node;
pub mod cli;

// Re-exports for convenience
pub use crate::core::{Block, Identity, Transaction};
pub use crate::consensus::{BlockValidator, Difficulty, Miner, ValidationError};
pub use crate::storage::BlockchainDB;
pub use crate::chain::{Ledger, TransactionPool};
pub use crate::network::{Communicator, Message, PeerBook, PeerSync, SyncConfig};
pub use crate::wallet::{KeyPair, NodeConfig};
pub use crate::node::{MineOutcome, Node, NodeError};
