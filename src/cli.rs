// CLI commands

use crate::chain::{Ledger, LedgerError};
use crate::consensus::Difficulty;
use crate::core::{Block, Identity};
use crate::network::{Communicator, NetworkError, PeerBook, SyncConfig};
use crate::node::{Node, NodeError};
use crate::storage::{BlockchainDB, StorageError};
use crate::wallet::{KeystoreError, NodeConfig};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Keystore(#[from] KeystoreError),
    #[error("{0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Ledger(#[from] LedgerError),
    #[error("{0}")]
    Network(#[from] NetworkError),
    #[error("{0}")]
    Node(#[from] NodeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{} is already initialized", .0.display())]
    AlreadyInitialized(PathBuf),
    #[error("no chain in {}; run `init` first", .0.display())]
    NotInitialized(PathBuf),
    #[error("block {0} not found")]
    BlockNotFound(u64),
}

#[derive(Parser)]
#[command(name = "ledger-node")]
#[command(about = "Peer-to-peer proof-of-work ledger node", long_about = None)]
pub struct Cli {
    /// Directory holding node.json and the block store
    #[arg(long, global = true, default_value = "./data")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an identity, node config and genesis block
    Init {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:7000")]
        listen: String,
        /// Address peers should use to reach this node (defaults to --listen)
        #[arg(long)]
        advertise: Option<String>,
        /// Initial peer address (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,
    },

    /// Serve peers and keep the chain in sync until Ctrl-C
    Run {
        /// Mine pending transactions
        #[arg(long)]
        mine: bool,
        /// Delay between mining rounds
        #[arg(long, default_value_t = 1000)]
        mine_interval_ms: u64,
        #[arg(long, default_value_t = 5)]
        chain_interval_secs: u64,
        #[arg(long, default_value_t = 15)]
        peer_interval_secs: u64,
        #[arg(long, default_value_t = 5)]
        pool_interval_secs: u64,
        /// Bound on every connect, read and write
        #[arg(long, default_value_t = 5)]
        io_timeout_secs: u64,
    },

    /// Show identity and chain summary
    Info,

    /// Show the balance of an identity (defaults to this node's)
    Balance { identity: Option<String> },

    /// Sign a transfer and gossip it to the configured peers
    Send { recipient: String, amount: u64 },

    /// List configured peers
    Peers,

    /// Print one block
    Block { index: u64 },
}

/// CLI handler
pub struct CliHandler {
    data_dir: PathBuf,
}

impl CliHandler {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.data_dir.join("node.json")
    }

    fn store_path(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    /// Handle CLI command
    pub async fn handle(&self, command: Commands) -> Result<(), CliError> {
        match command {
            Commands::Init {
                listen,
                advertise,
                peers,
            } => self.init(&listen, advertise.as_deref(), peers),
            Commands::Run {
                mine,
                mine_interval_ms,
                chain_interval_secs,
                peer_interval_secs,
                pool_interval_secs,
                io_timeout_secs,
            } => {
                let config = SyncConfig {
                    chain_interval: Duration::from_secs(chain_interval_secs.max(1)),
                    peer_interval: Duration::from_secs(peer_interval_secs.max(1)),
                    pool_interval: Duration::from_secs(pool_interval_secs.max(1)),
                    io_timeout: Duration::from_secs(io_timeout_secs.max(1)),
                    ..SyncConfig::default()
                };
                let mine_every = mine.then(|| Duration::from_millis(mine_interval_ms.max(1)));
                self.run(config, mine_every).await
            }
            Commands::Info => self.info(),
            Commands::Balance { identity } => self.balance(identity),
            Commands::Send { recipient, amount } => self.send(recipient, amount).await,
            Commands::Peers => self.peers(),
            Commands::Block { index } => self.block(index),
        }
    }

    fn init(&self, listen: &str, advertise: Option<&str>, peers: Vec<String>) -> Result<(), CliError> {
        let config_path = self.config_path();
        if config_path.exists() {
            return Err(CliError::AlreadyInitialized(self.data_dir.clone()));
        }
        std::fs::create_dir_all(&self.data_dir)?;

        let config = NodeConfig::generate(listen, advertise, peers);
        config.save(&config_path)?;
        let ledger = Ledger::open(BlockchainDB::new(self.store_path())?, Difficulty::default())?;

        println!("Initialized node in {}", self.data_dir.display());
        println!("  Identity: {}", config.key_pair()?.identity);
        println!("  Listen: {} (advertised as {})", config.listen_addr, config.advertised_addr);
        println!("  Genesis: {}", ledger.latest_hash());
        Ok(())
    }

    /// Load config and chain and assemble a node
    fn open_node(&self, sync: SyncConfig) -> Result<(Node, NodeConfig), CliError> {
        let config = NodeConfig::load(self.config_path())?;
        let store = BlockchainDB::new(self.store_path())?;
        if store.is_empty() {
            return Err(CliError::NotInitialized(self.data_dir.clone()));
        }
        let ledger = Ledger::open(store, Difficulty::default())?;
        let peers = PeerBook::with_peers(config.advertised_addr.clone(), config.peers.clone());
        let node = Node::new(ledger, config.key_pair()?, peers, sync);
        Ok((node, config))
    }

    async fn run(&self, sync: SyncConfig, mine_every: Option<Duration>) -> Result<(), CliError> {
        let peer_interval = sync.peer_interval;
        let (node, mut config) = self.open_node(sync)?;
        let listener = Communicator::bind(&config.listen_addr).await?;
        let node = Arc::new(node);
        log::info!(
            "Node {} at index {} with {} peers",
            node.identity().short(),
            node.ledger().latest_index(),
            node.peers().len()
        );

        {
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("Shutting down");
                }
                node.shutdown();
            });
        }

        // Persist discovered peers as they arrive
        let saver = {
            let node = Arc::clone(&node);
            let path = self.config_path();
            let mut config = config.clone();
            let mut shutdown = node.subscribe_shutdown();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(peer_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.changed() => break,
                    }
                    let peers = node.peers().list();
                    if peers != config.peers {
                        config.peers = peers;
                        if let Err(e) = config.save(&path) {
                            log::warn!("Could not save peer list: {}", e);
                        }
                    }
                }
            })
        };

        Arc::clone(&node).run(listener, mine_every).await?;
        let _ = saver.await;

        config.peers = node.peers().list();
        config.save(self.config_path())?;
        Ok(())
    }

    fn info(&self) -> Result<(), CliError> {
        let (node, config) = self.open_node(SyncConfig::default())?;
        let ledger = node.ledger();

        println!("Node Info:");
        println!("  Identity: {}", node.identity());
        println!("  Listen: {}", config.listen_addr);
        println!("  Chain length: {}", ledger.length());
        println!("  Tip: {}", ledger.latest_hash());
        println!("Blocks:");
        for (index, hash) in ledger.hashes().iter().enumerate() {
            println!("  [{}] {}", index, hash);
        }
        Ok(())
    }

    fn balance(&self, identity: Option<String>) -> Result<(), CliError> {
        let (node, _) = self.open_node(SyncConfig::default())?;
        let identity = identity.map(Identity::new).unwrap_or_else(|| node.identity().clone());

        println!("Balance for {}:", identity);
        println!("  {}", node.check_balance(&identity));
        Ok(())
    }

    async fn send(&self, recipient: String, amount: u64) -> Result<(), CliError> {
        let (node, _) = self.open_node(SyncConfig::default())?;
        let (tx, delivered) = node.send(&Identity::new(recipient), amount).await?;

        println!("Transaction created:");
        println!("  Hash: {}", tx.hash);
        println!("  Amount: {}", tx.amount);
        println!("  Accepted by {} of {} peers", delivered, node.peers().len());
        if delivered == 0 {
            log::warn!("No peer accepted the transaction; it will not be mined");
        }
        Ok(())
    }

    fn peers(&self) -> Result<(), CliError> {
        let config = NodeConfig::load(self.config_path())?;
        println!("Peers ({}):", config.peers.len());
        for peer in &config.peers {
            println!("  {}", peer);
        }
        Ok(())
    }

    fn block(&self, index: u64) -> Result<(), CliError> {
        let (node, _) = self.open_node(SyncConfig::default())?;
        let block = node
            .ledger()
            .get_block(index)
            .ok_or(CliError::BlockNotFound(index))?;
        print_block(&block);
        Ok(())
    }
}

/// Print block information
fn print_block(block: &Block) {
    println!("Block {}:", block.index);
    println!("  Hash: {}", block.hash);
    println!("  Previous: {}", block.previous_hash);
    println!("  Miner: {}", block.miner);
    println!("  Timestamp: {}", block.timestamp);
    println!("  Nonce: {}", block.nonce);
    println!("  Transactions: {}", block.transactions.len());

    for (i, tx) in block.transactions.iter().enumerate() {
        println!("    [{}] {} -> {}: {} ({})", i, tx.sender.short(), tx.recipient.short(), tx.amount, tx.hash);
    }
}
