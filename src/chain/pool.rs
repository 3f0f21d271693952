// Pending transaction queue

use crate::core::serialize::{read_list, write_list};
use crate::core::{CodecError, Transaction};
use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Transaction>,
    hashes: HashSet<String>,
}

/// FIFO of transactions waiting to be mined, deduplicated by hash
#[derive(Default)]
pub struct TransactionPool {
    state: Mutex<PoolState>,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue at the back; returns false if a transaction with the same hash is already queued
    pub fn add(&self, tx: Transaction) -> bool {
        let mut state = self.lock();
        if !state.hashes.insert(tx.hash.clone()) {
            return false;
        }
        state.queue.push_back(tx);
        true
    }

    /// Dequeue from the front
    pub fn remove(&self) -> Option<Transaction> {
        let mut state = self.lock();
        let tx = state.queue.pop_front()?;
        state.hashes.remove(&tx.hash);
        Some(tx)
    }

    /// Put transactions back at the front, keeping their relative order.
    ///
    /// Hashes already queued are skipped. Returns how many were restored.
    pub fn requeue(&self, txs: Vec<Transaction>) -> usize {
        let mut state = self.lock();
        let mut restored = 0;
        for tx in txs.into_iter().rev() {
            if state.hashes.insert(tx.hash.clone()) {
                state.queue.push_front(tx);
                restored += 1;
            }
        }
        restored
    }

    pub fn exists(&self, tx: &Transaction) -> bool {
        self.contains(&tx.hash)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.lock().hashes.contains(hash)
    }

    /// Copy of the queue, front first
    pub fn snapshot(&self) -> Vec<Transaction> {
        self.lock().queue.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Write a pool-sync payload: a varint-prefixed transaction list
    pub fn write_payload(buf: &mut Vec<u8>, txs: &[Transaction]) {
        write_list(buf, txs);
    }

    /// Read a pool-sync payload written by [`TransactionPool::write_payload`]
    pub fn read_payload<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<Transaction>, CodecError> {
        read_list(reader)
    }
}
