// Block data structures

use crate::core::serialize::{
    read_i64, read_list, read_u64, read_var_bytes, read_var_str, write_i64, write_list,
    write_u64, write_var_bytes, write_var_str,
};
use crate::core::{CodecError, Identity, Serializable, Transaction, hash_hex};
use num_bigint::BigUint;
use std::io::Read;

/// True iff `hash` starts with `zeros` ASCII `'0'` characters
pub fn has_leading_zeros(hash: &str, zeros: usize) -> bool {
    hash.len() >= zeros && hash.bytes().take(zeros).all(|b| b == b'0')
}

/// Block - one chain entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Position in the chain (genesis = 0)
    pub index: u64,
    /// Block timestamp in milliseconds
    pub timestamp: i64,
    /// Identity credited with the mining reward
    pub miner: Identity,
    pub transactions: Vec<Transaction>,
    /// Hash of the block at `index - 1`
    pub previous_hash: String,
    /// Proof-of-work search counter
    pub nonce: BigUint,
    pub hash: String,
}

impl Block {
    /// Create a draft block with nonce 0 and its hash computed
    pub fn new(
        index: u64,
        timestamp: i64,
        miner: Identity,
        transactions: Vec<Transaction>,
        previous_hash: String,
    ) -> Self {
        let mut block = Self {
            index,
            timestamp,
            miner,
            transactions,
            previous_hash,
            nonce: BigUint::from(0u32),
            hash: String::new(),
        };
        block.update_hash();
        block
    }

    /// Create the genesis block
    pub fn genesis() -> Self {
        Self::new(0, 0, Identity::default(), Vec::new(), String::new())
    }

    /// Hash preimage up to (not including) the nonce.
    ///
    /// The nonce is the last field so the miner can hash this prefix once.
    pub fn hash_prefix(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_u64(&mut buf, self.index);
        write_i64(&mut buf, self.timestamp);
        write_var_str(&mut buf, self.miner.as_str());
        write_list(&mut buf, &self.transactions);
        write_var_str(&mut buf, &self.previous_hash);
        buf
    }

    /// Encoding of a nonce as it appears at the end of the preimage
    pub fn nonce_suffix(nonce: &BigUint) -> Vec<u8> {
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, &nonce.to_bytes_le());
        buf
    }

    /// Calculate the hash of this block from its current fields
    pub fn calculate_hash(&self) -> String {
        let mut preimage = self.hash_prefix();
        preimage.extend_from_slice(&Self::nonce_suffix(&self.nonce));
        hash_hex(&preimage)
    }

    /// Recompute and store the hash
    pub fn update_hash(&mut self) {
        self.hash = self.calculate_hash();
    }

    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    /// Check the stored hash against a leading-zero requirement
    pub fn satisfies_difficulty(&self, zeros: usize) -> bool {
        has_leading_zeros(&self.hash, zeros)
    }

    /// Check if this is the genesis block
    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.previous_hash.is_empty()
    }

    pub fn contains_transaction(&self, hash: &str) -> bool {
        self.transactions.iter().any(|tx| tx.hash == hash)
    }
}

impl Serializable for Block {
    fn write_to(&self, buf: &mut Vec<u8>) {
        write_u64(buf, self.index);
        write_i64(buf, self.timestamp);
        write_var_str(buf, self.miner.as_str());
        write_list(buf, &self.transactions);
        write_var_str(buf, &self.previous_hash);
        write_var_bytes(buf, &self.nonce.to_bytes_le());
        write_var_str(buf, &self.hash);
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            index: read_u64(reader)?,
            timestamp: read_i64(reader)?,
            miner: Identity(read_var_str(reader)?),
            transactions: read_list(reader)?,
            previous_hash: read_var_str(reader)?,
            nonce: BigUint::from_bytes_le(&read_var_bytes(reader)?),
            hash: read_var_str(reader)?,
        })
    }
}
