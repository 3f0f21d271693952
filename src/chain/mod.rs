// Chain state: the ledger and the pending transaction pool

mod ledger;
mod pool;

pub use ledger::{Ledger, LedgerError, UpdateGuard};
pub use pool::TransactionPool;
