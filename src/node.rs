// Node orchestration: mining, transaction admission, balances and the service loops

use crate::chain::{Ledger, LedgerError, TransactionPool};
use crate::consensus::{Miner, ValidationError};
use crate::core::{Block, Identity, MAX_BLOCK_TRANSACTIONS, Transaction, now_millis};
use crate::network::{Communicator, NetworkError, PeerBook, PeerSync, SyncConfig};
use crate::wallet::{BuildError, KeyPair, TransactionBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("network: {0}")]
    Network(#[from] NetworkError),
}

/// What a single `mine` call produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MineOutcome {
    /// Nothing minable in the pool
    Empty,
    Mined(Block),
    /// The tip moved (or shutdown began) during the search; transactions were requeued
    Stale,
}

/// A ledger participant: owns the chain, the pool, its key and the sync engine
pub struct Node {
    ledger: Arc<Ledger>,
    pool: Arc<TransactionPool>,
    keys: KeyPair,
    sync: Arc<PeerSync>,
    stopping: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Node {
    pub fn new(ledger: Ledger, keys: KeyPair, peers: PeerBook, config: SyncConfig) -> Self {
        let ledger = Arc::new(ledger);
        let pool = Arc::new(TransactionPool::new());
        let sync = Arc::new(PeerSync::new(
            Arc::clone(&ledger),
            Arc::clone(&pool),
            Arc::new(peers),
            config,
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            ledger,
            pool,
            keys,
            sync,
            stopping: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn pool(&self) -> &Arc<TransactionPool> {
        &self.pool
    }

    pub fn sync(&self) -> &Arc<PeerSync> {
        &self.sync
    }

    pub fn peers(&self) -> &Arc<PeerBook> {
        self.sync.peers()
    }

    pub fn identity(&self) -> &Identity {
        &self.keys.identity
    }

    /// Build, sign and enqueue a transfer from this node's identity
    pub fn make_transaction(&self, recipient: &Identity, amount: u64) -> Result<Transaction, NodeError> {
        let tx = TransactionBuilder::new(&self.keys, &self.ledger).build(recipient, amount)?;
        self.pool.add(tx.clone());
        log::info!("Queued transaction {} ({} to {})", tx.hash, amount, recipient.short());
        Ok(tx)
    }

    /// Balance from replaying the ledger
    pub fn check_balance(&self, identity: &Identity) -> i64 {
        self.ledger.balance_of(identity)
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> bool {
        self.ledger.verify_transaction(tx).is_ok()
    }

    /// Drain up to `MAX_BLOCK_TRANSACTIONS` verified transactions, search for a
    /// nonce and commit the block if the tip has not moved in the meantime.
    ///
    /// Transactions that fail verification are dropped. Ones that are valid but
    /// would overdraw their sender within this block wait for the next one.
    pub fn mine(&self) -> Result<MineOutcome, NodeError> {
        if self.pool.is_empty() {
            return Ok(MineOutcome::Empty);
        }
        // Taken before anything is drained so any later commit aborts the search
        let generation = self.ledger.generation();

        let (selected, deferred) = self.select_transactions();
        if selected.is_empty() {
            self.pool.requeue(deferred);
            return Ok(MineOutcome::Empty);
        }

        let (tip_index, tip_hash) = self.ledger.tip_info();
        let mut block = Block::new(
            tip_index + 1,
            now_millis(),
            self.keys.identity.clone(),
            selected,
            tip_hash,
        );

        let miner = Miner::new(self.ledger.difficulty());
        let result = miner.mine(&mut block, || {
            self.ledger.generation() != generation || self.stopping.load(Ordering::Relaxed)
        });

        if !result.success {
            log::info!(
                "Abandoned block {} after {} attempts",
                block.index,
                result.attempts
            );
            self.requeue_after(block.transactions, deferred);
            return Ok(MineOutcome::Stale);
        }

        match self.ledger.add_block(block.clone()) {
            Ok(()) => {
                log::info!(
                    "Mined block {} ({}) in {} attempts, {:.0} H/s",
                    block.index,
                    block.hash,
                    result.attempts,
                    result.hash_rate()
                );
                self.pool.requeue(deferred);
                Ok(MineOutcome::Mined(block))
            }
            Err(LedgerError::Rejected(ValidationError::DoesNotAttach { .. })) => {
                log::info!("Mined block {} is stale; requeueing its transactions", block.index);
                self.requeue_after(block.transactions, deferred);
                Ok(MineOutcome::Stale)
            }
            Err(e) => {
                self.requeue_after(block.transactions, deferred);
                Err(e.into())
            }
        }
    }

    /// Pop verified transactions until the block is full or the pool is empty.
    ///
    /// Returns (selected, deferred): deferred ones verify alone but not on top
    /// of what this block already spends.
    fn select_transactions(&self) -> (Vec<Transaction>, Vec<Transaction>) {
        let mut selected = Vec::new();
        let mut deferred = Vec::new();
        let mut spent: HashMap<Identity, u64> = HashMap::new();

        while selected.len() < MAX_BLOCK_TRANSACTIONS {
            let Some(tx) = self.pool.remove() else {
                break;
            };
            if let Err(e) = self.ledger.verify_transaction(&tx) {
                log::debug!("Dropping transaction {}: {}", tx.hash, e);
                continue;
            }

            let already = spent.get(&tx.sender).copied().unwrap_or(0);
            let balance = self.ledger.balance_of(&tx.sender);
            if (already as i128 + tx.amount as i128) > balance as i128 {
                deferred.push(tx);
                continue;
            }
            spent.insert(tx.sender.clone(), already + tx.amount);
            selected.push(tx);
        }
        (selected, deferred)
    }

    fn requeue_after(&self, mut txs: Vec<Transaction>, deferred: Vec<Transaction>) {
        txs.extend(deferred);
        self.pool.requeue(txs);
    }

    /// Build a transfer, queue it locally and gossip it to every known peer
    pub async fn send(&self, recipient: &Identity, amount: u64) -> Result<(Transaction, usize), NodeError> {
        let tx = self.make_transaction(recipient, amount)?;
        let delivered = self.sync.broadcast_transaction(&tx).await;
        Ok((tx, delivered))
    }

    /// Stop mining and every service loop
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        self.shutdown.send_replace(true);
    }

    /// Receiver that flips to `true` on shutdown
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    /// Serve peers, run the sync loops and, if `mine_every` is set, the mining
    /// loop. Returns once [`Node::shutdown`] has been called and every loop has exited.
    pub async fn run(self: Arc<Self>, listener: TcpListener, mine_every: Option<Duration>) -> Result<(), NodeError> {
        if self.is_stopping() {
            return Ok(());
        }
        let mut handles = self.sync.spawn(self.shutdown.subscribe());

        let communicator: Communicator = *self.sync.communicator();
        let responder = Arc::clone(&self.sync);
        let shutdown = self.shutdown.subscribe();
        let listener_task =
            tokio::spawn(async move { communicator.listen(listener, responder, shutdown).await });

        if let Some(interval) = mine_every {
            handles.push(tokio::spawn(Arc::clone(&self).mining_loop(interval)));
        }

        let mut stop = self.shutdown.subscribe();
        let _ = stop.wait_for(|stopped| *stopped).await;

        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Service task failed: {}", e);
            }
        }
        match listener_task.await {
            Ok(result) => result?,
            Err(e) => log::error!("Listener task failed: {}", e),
        }
        log::info!("Node stopped");
        Ok(())
    }

    async fn mining_loop(self: Arc<Self>, interval: Duration) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let node = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || node.mine()).await {
                Ok(Ok(MineOutcome::Mined(_) | MineOutcome::Empty)) => {}
                Ok(Ok(MineOutcome::Stale)) => log::debug!("Mining round went stale"),
                Ok(Err(e)) => log::error!("Mining failed: {}", e),
                Err(e) => log::error!("Mining task failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Difficulty;
    use crate::core::MINING_REWARD;
    use std::thread;

    fn node_with(difficulty: Difficulty) -> Node {
        Node::new(
            Ledger::in_memory(difficulty),
            KeyPair::generate(),
            PeerBook::new(""),
            SyncConfig::default(),
        )
    }

    fn signed(keys: &KeyPair, recipient: &Identity, amount: u64, timestamp: i64) -> Transaction {
        let mut tx = Transaction::new(keys.identity.clone(), recipient.clone(), amount, timestamp);
        tx.sign(&keys.secret_key).unwrap();
        tx
    }

    #[test]
    fn test_mine_two_zero_amount_transactions() {
        let node = node_with(Difficulty::default());
        let x = KeyPair::generate();
        let y = KeyPair::generate();
        let genesis_hash = node.ledger().latest_hash();

        assert!(node.pool().add(signed(&x, &y.identity, 0, 1)));
        assert!(node.pool().add(signed(&y, &x.identity, 0, 2)));

        let block = match node.mine().unwrap() {
            MineOutcome::Mined(block) => block,
            other => panic!("expected a block, got {:?}", other),
        };
        assert_eq!(block.index, 1);
        assert_eq!(block.previous_hash, genesis_hash);
        assert!(block.hash.starts_with("00000"));
        assert_eq!(block.transactions.len(), 2);
        assert!(node.pool().is_empty());
        assert_eq!(node.ledger().length(), 2);
        assert_eq!(node.check_balance(node.identity()), MINING_REWARD);
    }

    #[test]
    fn test_mine_empty_pool_is_noop() {
        let node = node_with(Difficulty::new(1));
        assert_eq!(node.mine().unwrap(), MineOutcome::Empty);
        assert_eq!(node.ledger().length(), 1);
    }

    #[test]
    fn test_overspend_never_enters_pool() {
        let node = node_with(Difficulty::new(1));
        let bob = KeyPair::generate().identity;
        assert_eq!(node.check_balance(node.identity()), 0);

        assert!(matches!(
            node.make_transaction(&bob, 1),
            Err(NodeError::Build(BuildError::InsufficientBalance { available: 0, requested: 1 }))
        ));
        assert!(node.pool().is_empty());

        // Zero is within a zero balance
        let tx = node.make_transaction(&bob, 0).unwrap();
        assert!(node.pool().exists(&tx));
    }

    #[test]
    fn test_unverified_dropped_and_overdraft_deferred() {
        let node = node_with(Difficulty::new(1));
        let alice = KeyPair::generate();
        let bob = KeyPair::generate().identity;

        // Fund alice with one mined block
        let genesis = node.ledger().get_block(0).unwrap();
        let mut funding = Block::new(1, 1, alice.identity.clone(), vec![], genesis.hash);
        Miner::new(node.ledger().difficulty()).mine(&mut funding, || false);
        node.ledger().add_block(funding).unwrap();

        let mut forged = signed(&alice, &bob, 1, 10);
        forged.amount = 2;
        forged.hash = forged.compute_hash();
        let first = signed(&alice, &bob, 30, 11);
        let second = signed(&alice, &bob, 30, 12);
        node.pool().add(forged.clone());
        node.pool().add(first.clone());
        node.pool().add(second.clone());

        let block = match node.mine().unwrap() {
            MineOutcome::Mined(block) => block,
            other => panic!("expected a block, got {:?}", other),
        };
        assert_eq!(block.transactions, vec![first]);
        // Forged signature is gone for good; the overdraft waits
        assert_eq!(node.pool().snapshot(), vec![second]);
        assert!(!node.pool().exists(&forged));
        assert_eq!(node.check_balance(&alice.identity), MINING_REWARD - 30);
    }

    #[test]
    fn test_stale_block_requeues_transactions() {
        let node = Arc::new(node_with(Difficulty::new(64)));
        let x = KeyPair::generate();
        let tx = signed(&x, &node.identity().clone(), 0, 1);
        node.pool().add(tx.clone());

        let miner = {
            let node = Arc::clone(&node);
            thread::spawn(move || node.mine())
        };
        // Let the search start, then move the tip underneath it
        while !node.pool().is_empty() {
            thread::yield_now();
        }
        let genesis = node.ledger().get_block(0).unwrap();
        let rival = Block::new(1, 5, Identity::new("rival"), vec![], genesis.hash);
        node.ledger().replace_blocks(vec![rival]).unwrap();

        assert_eq!(miner.join().unwrap().unwrap(), MineOutcome::Stale);
        assert_eq!(node.pool().snapshot(), vec![tx]);
        assert_eq!(node.ledger().length(), 2);
    }

    #[test]
    fn test_shutdown_aborts_search() {
        let node = Arc::new(node_with(Difficulty::new(64)));
        let x = KeyPair::generate();
        node.pool().add(signed(&x, &x.identity, 0, 1));

        let miner = {
            let node = Arc::clone(&node);
            thread::spawn(move || node.mine())
        };
        while !node.pool().is_empty() {
            thread::yield_now();
        }
        node.shutdown();
        assert!(node.is_stopping());
        assert_eq!(miner.join().unwrap().unwrap(), MineOutcome::Stale);
        assert_eq!(node.pool().len(), 1);
    }
}
