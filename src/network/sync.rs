// Peer reconciliation: chain sync, peer discovery, pool sync and the inbound responder

use crate::chain::{Ledger, LedgerError, TransactionPool};
use crate::core::{Block, Transaction};
use crate::network::{Communicator, Message, MessageType, NetworkError, PeerBook, Responder};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("no common ancestor with peer")]
    NoCommonAncestor,
    #[error("peer sent an unusable block page for index {requested}")]
    BadPage { requested: u64 },
    #[error("background task failed: {0}")]
    Task(#[from] JoinError),
}

/// Timing and size limits for peer reconciliation
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub chain_interval: Duration,
    pub peer_interval: Duration,
    pub pool_interval: Duration,
    /// Bound on every connect, read and write
    pub io_timeout: Duration,
    pub max_frame: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chain_interval: Duration::from_secs(5),
            peer_interval: Duration::from_secs(15),
            pool_interval: Duration::from_secs(5),
            io_timeout: Duration::from_secs(5),
            max_frame: 16 * 1024 * 1024,
        }
    }
}

/// Result of reconciling the chain with one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainSync {
    /// Peer is not ahead of us
    UpToDate,
    /// Local blocks from `fork` onward were replaced; `orphaned` transactions went back to the pool
    Replaced { fork: u64, tip: u64, orphaned: usize },
}

/// Periodic initiator plus synchronous responder over the shared ledger, pool and peer list
pub struct PeerSync {
    ledger: Arc<Ledger>,
    pool: Arc<TransactionPool>,
    peers: Arc<PeerBook>,
    communicator: Communicator,
    config: SyncConfig,
}

impl PeerSync {
    pub fn new(
        ledger: Arc<Ledger>,
        pool: Arc<TransactionPool>,
        peers: Arc<PeerBook>,
        config: SyncConfig,
    ) -> Self {
        let communicator = Communicator::new(config.io_timeout, config.max_frame);
        Self {
            ledger,
            pool,
            peers,
            communicator,
            config,
        }
    }

    pub fn peers(&self) -> &Arc<PeerBook> {
        &self.peers
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    async fn request_blocks(&self, addr: &str, request: Message) -> Result<Vec<Block>, NetworkError> {
        match self.communicator.send_and_receive(addr, &request).await? {
            Message::Blocks(blocks) => Ok(blocks),
            other => Err(NetworkError::UnexpectedReply {
                expected: MessageType::Blocks,
                found: other.message_type(),
            }),
        }
    }

    /// Reconcile the local chain with one peer.
    ///
    /// Fetches the blocks the peer has beyond our tip, walks backward in pages
    /// until the oldest fetched block matches local history, then swaps in the
    /// divergent suffix after validating it.
    pub async fn sync_chain_with(&self, addr: &str) -> Result<ChainSync, SyncError> {
        let (peer_index, peer_hash) = match self
            .communicator
            .send_and_receive(addr, &Message::BlockchainRequest)
            .await?
        {
            Message::ChainTip { index, hash } => (index, hash),
            other => {
                return Err(NetworkError::UnexpectedReply {
                    expected: MessageType::ChainTip,
                    found: other.message_type(),
                }
                .into());
            }
        };

        let local_index = self.ledger.latest_index();
        if peer_index <= local_index {
            return Ok(ChainSync::UpToDate);
        }
        log::debug!(
            "Peer {} is ahead: index {} ({}) vs local {}",
            addr,
            peer_index,
            peer_hash,
            local_index
        );

        let requested = peer_index - local_index;
        let mut fetched = self.request_blocks(addr, Message::FromTop(requested)).await?;
        if !is_contiguous(&fetched) {
            return Err(SyncError::BadPage { requested: peer_index });
        }

        // Walk backward until the oldest fetched block is one we already have
        while !self.ledger.compare_blockchains(&fetched) {
            let first = fetched[0].index;
            if first == 0 {
                return Err(SyncError::NoCommonAncestor);
            }
            let wanted = first - 1;
            let mut page = self.request_blocks(addr, Message::IndexSpecific(wanted)).await?;
            if !is_contiguous(&page) || page.last().map(|b| b.index) != Some(wanted) {
                return Err(SyncError::BadPage { requested: wanted });
            }
            page.append(&mut fetched);
            fetched = page;
        }

        let matched = fetched
            .iter()
            .take_while(|block| {
                self.ledger
                    .get_hash(block.index)
                    .is_some_and(|hash| hash == block.hash)
            })
            .count();
        let suffix = fetched.split_off(matched);
        let Some(fork) = suffix.first().map(|b| b.index) else {
            return Ok(ChainSync::UpToDate);
        };

        let ledger = Arc::clone(&self.ledger);
        let pool = Arc::clone(&self.pool);
        let (tip, orphaned) =
            tokio::task::spawn_blocking(move || commit_suffix(&ledger, &pool, suffix)).await??;

        log::info!(
            "Adopted chain from {}: replaced blocks from index {} onward, new tip {}",
            addr,
            fork,
            tip
        );
        Ok(ChainSync::Replaced {
            fork,
            tip,
            orphaned,
        })
    }

    /// One chain-sync round over every known peer
    pub async fn sync_chain(&self) {
        for addr in self.peers.list() {
            if let Err(e) = self.sync_chain_with(&addr).await {
                log::warn!("Chain sync with {} failed: {}", addr, e);
            }
        }
    }

    /// Ask every known peer for its peer list; returns how many addresses were new
    pub async fn discover_peers(&self) -> usize {
        let mut added = 0;
        for addr in self.peers.list() {
            match self.communicator.send_and_receive(&addr, &Message::PeersRequest).await {
                Ok(Message::PeerAddresses(addrs)) => added += self.peers.extend(addrs),
                Ok(other) => log::warn!(
                    "Peer discovery with {} failed: unexpected {} reply",
                    addr,
                    other.message_type()
                ),
                Err(e) => log::warn!("Peer discovery with {} failed: {}", addr, e),
            }
        }
        if added > 0 {
            log::info!("Discovered {} new peers ({} known)", added, self.peers.len());
        }
        added
    }

    /// Pull every peer's pending transactions; returns how many were admitted
    pub async fn sync_pool(&self) -> usize {
        let mut admitted = 0;
        for addr in self.peers.list() {
            let txs = match self.communicator.send_and_receive(&addr, &Message::PoolRequest).await {
                Ok(Message::PoolSync(txs)) => txs,
                Ok(other) => {
                    log::warn!(
                        "Pool sync with {} failed: unexpected {} reply",
                        addr,
                        other.message_type()
                    );
                    continue;
                }
                Err(e) => {
                    log::warn!("Pool sync with {} failed: {}", addr, e);
                    continue;
                }
            };

            let ledger = Arc::clone(&self.ledger);
            let pool = Arc::clone(&self.pool);
            match tokio::task::spawn_blocking(move || admit_all(&ledger, &pool, txs)).await {
                Ok(count) => admitted += count,
                Err(e) => log::error!("Pool admission task failed: {}", e),
            }
        }
        admitted
    }

    /// Gossip a transaction to every known peer; returns how many accepted it
    pub async fn broadcast_transaction(&self, tx: &Transaction) -> usize {
        let message = Message::NewTransaction(tx.clone());
        let peers = self.peers.list();
        log::info!("Broadcasting transaction {} to {} peers", tx.hash, peers.len());

        let mut delivered = 0;
        for addr in peers {
            match self.communicator.send_and_receive(&addr, &message).await {
                Ok(Message::Ack) => delivered += 1,
                Ok(other) => log::warn!("Peer {} answered {} to a transaction", addr, other.message_type()),
                Err(e) => log::warn!("Could not send transaction to {}: {}", addr, e),
            }
        }
        delivered
    }

    /// Start the three reconciliation loops; they stop when `shutdown` flips
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).chain_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(self).peer_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(self).pool_loop(shutdown)),
        ]
    }

    async fn chain_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.chain_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sync_chain().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn peer_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.peer_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.discover_peers().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn pool_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.pool_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let admitted = self.sync_pool().await;
                    if admitted > 0 {
                        log::debug!("Admitted {} transactions from peers", admitted);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

impl Responder for PeerSync {
    fn respond(&self, request: Message) -> Message {
        match request {
            Message::BlockchainRequest => {
                let (index, hash) = self.ledger.tip_info();
                Message::ChainTip { index, hash }
            }
            Message::FromTop(n) => Message::Blocks(self.ledger.get_blocks_from_top(n)),
            Message::IndexSpecific(index) => {
                Message::Blocks(self.ledger.get_blocks_from_index(index))
            }
            Message::PoolRequest => Message::PoolSync(self.pool.snapshot()),
            Message::PeersRequest => Message::PeerAddresses(self.peers.advertised()),
            Message::NewTransaction(tx) => {
                if self.pool.exists(&tx) {
                    return Message::Ack;
                }
                match self.ledger.verify_transaction(&tx) {
                    Ok(()) => {
                        if self.pool.add(tx) {
                            log::debug!("Admitted gossiped transaction");
                        }
                        Message::Ack
                    }
                    Err(e) => Message::ProtocolError(format!("transaction rejected: {}", e)),
                }
            }
            other => Message::ProtocolError(format!(
                "{} is not a request",
                other.message_type()
            )),
        }
    }
}

/// Blocks carry consecutive indices
fn is_contiguous(blocks: &[Block]) -> bool {
    !blocks.is_empty() && blocks.windows(2).all(|pair| pair[1].index == pair[0].index + 1)
}

/// Swap in a fetched suffix and return orphaned transactions to the pool.
///
/// Returns the new tip index and how many transactions were requeued.
fn commit_suffix(
    ledger: &Ledger,
    pool: &TransactionPool,
    suffix: Vec<Block>,
) -> Result<(u64, usize), LedgerError> {
    let removed = {
        let _update = ledger.begin_update();
        ledger.replace_if_attached(suffix)?
    };

    // Verification reads the new chain, so the guard must be gone by now
    let orphans: Vec<Transaction> = removed
        .into_iter()
        .flat_map(|block| block.transactions)
        .filter(|tx| ledger.verify_transaction(tx).is_ok())
        .collect();
    let orphaned = pool.requeue(orphans);
    Ok((ledger.latest_index(), orphaned))
}

/// Admit transactions that are new to the pool and still valid against the ledger
fn admit_all(ledger: &Ledger, pool: &TransactionPool, txs: Vec<Transaction>) -> usize {
    txs.into_iter()
        .filter(|tx| !pool.exists(tx))
        .filter(|tx| ledger.verify_transaction(tx).is_ok())
        .filter(|tx| pool.add(tx.clone()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{Difficulty, Miner};
    use crate::core::{Identity, MINING_REWARD, identity_of};
    use crate::storage::BlockchainDB;
    use rand::rngs::OsRng;
    use secp256k1::{Secp256k1, SecretKey};

    const EASY: Difficulty = Difficulty { zeros: 1 };

    fn key() -> (SecretKey, Identity) {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::new(&mut OsRng);
        (secret_key, identity_of(&secret_key.public_key(&secp)))
    }

    fn extend(ledger: &Ledger, miner: &Identity, txs: Vec<Transaction>) {
        let tip = ledger.get_block(ledger.latest_index()).unwrap();
        let mut block = Block::new(tip.index + 1, tip.timestamp + 1, miner.clone(), txs, tip.hash);
        Miner::new(ledger.difficulty()).mine(&mut block, || false);
        ledger.add_block(block).unwrap();
    }

    fn engine(ledger: Ledger, own: &str) -> Arc<PeerSync> {
        let config = SyncConfig {
            io_timeout: Duration::from_secs(2),
            ..SyncConfig::default()
        };
        Arc::new(PeerSync::new(
            Arc::new(ledger),
            Arc::new(TransactionPool::new()),
            Arc::new(PeerBook::new(own)),
            config,
        ))
    }

    async fn serve(sync: &Arc<PeerSync>) -> (String, watch::Sender<bool>) {
        let listener = Communicator::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = watch::channel(false);
        let communicator = *sync.communicator();
        let responder = Arc::clone(sync);
        tokio::spawn(async move { communicator.listen(listener, responder, rx).await });
        (addr, tx)
    }

    #[test]
    fn test_responder_ranges() {
        let ledger = Ledger::in_memory(EASY);
        let (_, miner) = key();
        for _ in 0..12 {
            extend(&ledger, &miner, vec![]);
        }
        let sync = engine(ledger, "127.0.0.1:1");

        match sync.respond(Message::BlockchainRequest) {
            Message::ChainTip { index, .. } => assert_eq!(index, 12),
            other => panic!("unexpected {:?}", other.message_type()),
        }
        match sync.respond(Message::FromTop(2)) {
            Message::Blocks(blocks) => {
                assert_eq!(blocks.iter().map(|b| b.index).collect::<Vec<_>>(), vec![10, 11, 12])
            }
            other => panic!("unexpected {:?}", other.message_type()),
        }
        match sync.respond(Message::IndexSpecific(11)) {
            Message::Blocks(blocks) => {
                assert_eq!(blocks.len(), 10);
                assert_eq!(blocks[0].index, 2);
            }
            other => panic!("unexpected {:?}", other.message_type()),
        }
        match sync.respond(Message::PeersRequest) {
            Message::PeerAddresses(addrs) => assert_eq!(addrs, vec!["127.0.0.1:1".to_string()]),
            other => panic!("unexpected {:?}", other.message_type()),
        }
        assert!(matches!(sync.respond(Message::Ack), Message::ProtocolError(_)));
    }

    #[test]
    fn test_responder_admits_valid_gossip_once() {
        let ledger = Ledger::in_memory(EASY);
        let (alice_key, alice) = key();
        extend(&ledger, &alice, vec![]);
        let sync = engine(ledger, "");

        let mut tx = Transaction::new(alice.clone(), Identity::new("bob"), 10, 1);
        tx.sign(&alice_key).unwrap();
        assert_eq!(sync.respond(Message::NewTransaction(tx.clone())), Message::Ack);
        assert_eq!(sync.respond(Message::NewTransaction(tx.clone())), Message::Ack);
        assert_eq!(sync.pool.len(), 1);

        let mut greedy = Transaction::new(alice, Identity::new("bob"), MINING_REWARD as u64 + 1, 2);
        greedy.sign(&alice_key).unwrap();
        assert!(matches!(
            sync.respond(Message::NewTransaction(greedy)),
            Message::ProtocolError(_)
        ));
        assert_eq!(sync.pool.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_adopts_longer_fork() {
        let (_, a) = key();
        let (alice_key, alice) = key();
        let (_, b) = key();

        let ours = Ledger::in_memory(EASY);
        let theirs = Ledger::in_memory(EASY);
        for _ in 0..2 {
            extend(&ours, &alice, vec![]);
        }
        for i in 1..=2 {
            theirs.add_block(ours.get_block(i).unwrap()).unwrap();
        }

        // A transaction only the losing fork carries
        let mut orphan = Transaction::new(alice.clone(), a.clone(), 5, 77);
        orphan.sign(&alice_key).unwrap();
        extend(&ours, &a, vec![orphan.clone()]);
        for _ in 0..14 {
            extend(&theirs, &b, vec![]);
        }

        let local = engine(ours, "");
        let remote = engine(theirs, "");
        let (addr, _shutdown) = serve(&remote).await;

        let outcome = local.sync_chain_with(&addr).await.unwrap();
        assert_eq!(
            outcome,
            ChainSync::Replaced {
                fork: 3,
                tip: 16,
                orphaned: 1
            }
        );
        assert_eq!(local.ledger.hashes(), remote.ledger.hashes());
        assert!(local.pool.exists(&orphan));

        // Nothing more to do once level
        assert_eq!(local.sync_chain_with(&addr).await.unwrap(), ChainSync::UpToDate);
    }

    #[tokio::test]
    async fn test_sync_rejects_foreign_genesis() {
        let (_, miner) = key();
        let mut chain = vec![Block::new(0, 1, miner.clone(), vec![], String::new())];
        for i in 1..=3u64 {
            let prev = chain[(i - 1) as usize].hash.clone();
            let mut block = Block::new(i, i as i64, miner.clone(), vec![], prev);
            Miner::new(EASY).mine(&mut block, || false);
            chain.push(block);
        }
        let store = BlockchainDB::memory().unwrap();
        for block in &chain {
            store.put_block(block).unwrap();
        }
        let remote = engine(Ledger::open(store, EASY).unwrap(), "");
        let (addr, _shutdown) = serve(&remote).await;

        let local = engine(Ledger::in_memory(EASY), "");
        assert!(matches!(
            local.sync_chain_with(&addr).await,
            Err(SyncError::NoCommonAncestor)
        ));
        assert_eq!(local.ledger.length(), 1);
    }

    #[tokio::test]
    async fn test_discovery_and_pool_sync() {
        let (alice_key, alice) = key();
        let ledger = Ledger::in_memory(EASY);
        extend(&ledger, &alice, vec![]);
        let blocks = ledger.snapshot();

        let remote = engine(ledger, "");
        let (addr, _shutdown) = serve(&remote).await;
        remote.peers.add("10.0.0.9:4000");

        let mut tx = Transaction::new(alice, Identity::new("carol"), 7, 3);
        tx.sign(&alice_key).unwrap();
        remote.pool.add(tx.clone());

        let local_ledger = Ledger::in_memory(EASY);
        local_ledger.replace_blocks(blocks[1..].to_vec()).unwrap();
        let local = engine(local_ledger, "127.0.0.1:1");
        local.peers.add(addr.clone());

        // Remote advertises 10.0.0.9:4000 plus its own (empty) address
        assert_eq!(local.discover_peers().await, 1);
        assert!(local.peers.contains("10.0.0.9:4000"));

        // Only the reachable peer answers; the unreachable one is skipped
        local.peers.remove("10.0.0.9:4000");
        assert_eq!(local.sync_pool().await, 1);
        assert!(local.pool.exists(&tx));
        assert_eq!(local.sync_pool().await, 0);
    }
}
