// Consensus and validation logic

pub mod pow;
pub mod validation;

pub use pow::{Difficulty, Miner, MiningResult};
pub use validation::{AccountState, BlockValidator, TransactionValidator, ValidationError};
