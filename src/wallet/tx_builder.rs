// Transaction builder

use crate::chain::Ledger;
use crate::core::{Identity, SignError, Transaction, now_millis};
use crate::wallet::KeyPair;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("insufficient balance: have {available}, need {requested}")]
    InsufficientBalance { available: i64, requested: u64 },
    #[error("signing failed: {0}")]
    Sign(#[from] SignError),
}

/// Builds signed transfers from one key pair, funded by its ledger balance
pub struct TransactionBuilder<'a> {
    keys: &'a KeyPair,
    ledger: &'a Ledger,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(keys: &'a KeyPair, ledger: &'a Ledger) -> Self {
        Self { keys, ledger }
    }

    /// Build a transaction to send amount to recipient, stamped with the current time
    pub fn build(&self, recipient: &Identity, amount: u64) -> Result<Transaction, BuildError> {
        self.build_at(recipient, amount, now_millis())
    }

    /// Build with an explicit timestamp
    pub fn build_at(
        &self,
        recipient: &Identity,
        amount: u64,
        timestamp: i64,
    ) -> Result<Transaction, BuildError> {
        let available = self.ledger.balance_of(&self.keys.identity);
        if (amount as i128) > available as i128 {
            return Err(BuildError::InsufficientBalance {
                available,
                requested: amount,
            });
        }

        let mut tx = Transaction::new(
            self.keys.identity.clone(),
            recipient.clone(),
            amount,
            timestamp,
        );
        tx.sign(&self.keys.secret_key)?;
        Ok(tx)
    }
}
