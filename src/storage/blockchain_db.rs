// Block store using sled: one serialized block per chain index

use crate::core::{Block, CodecError, Serializable};
use sled::{Batch, Db};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("corrupt block record at index {index}: {source}")]
    Corrupt { index: u64, source: CodecError },
    #[error("block at index {found} stored under key {expected}")]
    Misplaced { expected: u64, found: u64 },
}

/// Blockchain database
pub struct BlockchainDB {
    db: Db,
}

impl BlockchainDB {
    /// Open (or create) a block store on disk
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Create an in-memory database (for testing)
    pub fn memory() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    /// Store a block under its index
    pub fn put_block(&self, block: &Block) -> Result<(), StorageError> {
        self.db.insert(Self::height_key(block.index), block.serialize())?;
        Ok(())
    }

    /// Get block by index
    pub fn get_block(&self, index: u64) -> Result<Option<Block>, StorageError> {
        match self.db.get(Self::height_key(index))? {
            Some(data) => {
                let block = Block::deserialize(&data)
                    .map_err(|source| StorageError::Corrupt { index, source })?;
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    /// Drop every block at or above `index` and write `blocks` in one batch
    pub fn replace_from(&self, index: u64, blocks: &[Block]) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        for item in self.db.range(Self::height_key(index)..) {
            let (key, _) = item?;
            batch.remove(key);
        }
        for block in blocks {
            batch.insert(Self::height_key(block.index).to_vec(), block.serialize());
        }
        self.db.apply_batch(batch)?;
        Ok(())
    }

    /// Load the contiguous chain starting at index 0.
    ///
    /// Loading stops at the first missing index; an empty result means nothing
    /// has been stored yet.
    pub fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();
        let mut index = 0u64;
        while let Some(block) = self.get_block(index)? {
            if block.index != index {
                return Err(StorageError::Misplaced {
                    expected: index,
                    found: block.index,
                });
            }
            blocks.push(block);
            index += 1;
        }
        Ok(blocks)
    }

    /// Number of stored block records
    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }

    /// Manually flush database (call after batch operations)
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    // Big-endian so sled's key order is chain order
    fn height_key(index: u64) -> [u8; 9] {
        let mut key = [0u8; 9];
        key[0] = b'h';
        key[1..].copy_from_slice(&index.to_be_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Identity;

    fn chain(len: u64) -> Vec<Block> {
        let mut blocks = vec![Block::genesis()];
        for i in 1..len {
            let prev = &blocks[(i - 1) as usize];
            blocks.push(Block::new(i, i as i64, Identity::new("m"), vec![], prev.hash.clone()));
        }
        blocks
    }

    #[test]
    fn test_store_and_get_block() {
        let db = BlockchainDB::memory().unwrap();
        let block = Block::genesis();

        db.put_block(&block).unwrap();
        let retrieved = db.get_block(0).unwrap().unwrap();
        assert_eq!(block, retrieved);
        assert!(db.get_block(1).unwrap().is_none());
    }

    #[test]
    fn test_load_chain_in_order() {
        let db = BlockchainDB::memory().unwrap();
        let blocks = chain(300);
        // Insert out of order; keys must still sort by index
        for block in blocks.iter().rev() {
            db.put_block(block).unwrap();
        }

        let loaded = db.load_chain().unwrap();
        assert_eq!(loaded.len(), 300);
        assert_eq!(loaded, blocks);
    }

    #[test]
    fn test_replace_from() {
        let db = BlockchainDB::memory().unwrap();
        for block in chain(6) {
            db.put_block(&block).unwrap();
        }

        let tip = chain(3).pop().unwrap();
        let replacement = Block::new(3, 99, Identity::new("other"), vec![], tip.hash.clone());

        db.replace_from(3, &[replacement.clone()]).unwrap();
        let loaded = db.load_chain().unwrap();
        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded[3], replacement);
        assert_eq!(db.len(), 4);
    }

    #[test]
    fn test_empty_store() {
        let db = BlockchainDB::memory().unwrap();
        assert!(db.is_empty());
        assert!(db.load_chain().unwrap().is_empty());
    }
}
