// Signed transfer between two identities

use crate::core::serialize::{
    read_i64, read_u64, read_var_str, write_i64, write_u64, write_var_str,
};
use crate::core::{CodecError, Identity, Serializable, SignError, hash_hex, sign_digest, verify_digest};
use secp256k1::SecretKey;
use std::hash::{Hash, Hasher};
use std::io::Read;

/// Transaction - a transfer of `amount` credits from sender to recipient.
///
/// Two transactions are the same transaction iff their hashes match.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub sender: Identity,
    pub recipient: Identity,
    pub amount: u64,
    /// Creation time in milliseconds
    pub timestamp: i64,
    /// Hex digest over the fields above
    pub hash: String,
    /// Sender's signature over `hash`
    pub signature: String,
}

impl Transaction {
    /// Create an unsigned transaction with its hash already computed
    pub fn new(sender: Identity, recipient: Identity, amount: u64, timestamp: i64) -> Self {
        let mut tx = Self {
            sender,
            recipient,
            amount,
            timestamp,
            hash: String::new(),
            signature: String::new(),
        };
        tx.hash = tx.compute_hash();
        tx
    }

    fn digest_preimage(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_var_str(&mut buf, self.sender.as_str());
        write_var_str(&mut buf, self.recipient.as_str());
        write_u64(&mut buf, self.amount);
        write_i64(&mut buf, self.timestamp);
        buf
    }

    /// Recompute the digest from the current fields
    pub fn compute_hash(&self) -> String {
        hash_hex(&self.digest_preimage())
    }

    /// Sign the stored hash with the sender's key
    pub fn sign(&mut self, secret_key: &SecretKey) -> Result<(), SignError> {
        self.signature = sign_digest(&self.hash, secret_key)?;
        Ok(())
    }

    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }

    pub fn has_valid_signature(&self) -> bool {
        verify_digest(&self.hash, &self.signature, &self.sender)
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Transaction {}

impl Hash for Transaction {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl Serializable for Transaction {
    fn write_to(&self, buf: &mut Vec<u8>) {
        write_var_str(buf, self.sender.as_str());
        write_var_str(buf, self.recipient.as_str());
        write_u64(buf, self.amount);
        write_i64(buf, self.timestamp);
        write_var_str(buf, &self.hash);
        write_var_str(buf, &self.signature);
    }

    fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CodecError> {
        Ok(Self {
            sender: Identity(read_var_str(reader)?),
            recipient: Identity(read_var_str(reader)?),
            amount: read_u64(reader)?,
            timestamp: read_i64(reader)?,
            hash: read_var_str(reader)?,
            signature: read_var_str(reader)?,
        })
    }
}
