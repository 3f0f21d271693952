// Persistent block storage

mod blockchain_db;

pub use blockchain_db::{BlockchainDB, StorageError};
