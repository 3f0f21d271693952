// Keys, node configuration and transaction building

mod keystore;
mod tx_builder;

pub use keystore::{KeyPair, KeystoreError, NodeConfig};
pub use tx_builder::{BuildError, TransactionBuilder};
