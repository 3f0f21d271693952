// Network protocol messages

use crate::core::serialize::{
    MAX_VAR_BYTES, read_list, read_u64, read_var_str, read_varint, write_list, write_u64,
    write_var_str, write_varint,
};
use crate::chain::TransactionPool;
use crate::core::{Block, CodecError, Serializable, Transaction};
use crate::network::NetworkError;
use std::fmt;

/// Version byte leading every frame
pub const PROTOCOL_VERSION: u8 = 1;

/// Width of the zero-padded ASCII kind field
pub const KIND_LEN: usize = 12;

/// version (1) + kind (12) + payload length (4)
pub const HEADER_LEN: usize = 1 + KIND_LEN + 4;

/// Network message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    BlockchainRequest,
    ChainTip,
    FromTop,
    IndexSpecific,
    Blocks,
    PoolRequest,
    PoolSync,
    PeersRequest,
    PeerAddresses,
    NewTransaction,
    Ack,
    ProtocolError,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::BlockchainRequest => "chainreq",
            MessageType::ChainTip => "chaintip",
            MessageType::FromTop => "fromtop",
            MessageType::IndexSpecific => "indexspec",
            MessageType::Blocks => "blocks",
            MessageType::PoolRequest => "poolreq",
            MessageType::PoolSync => "poolsync",
            MessageType::PeersRequest => "peersreq",
            MessageType::PeerAddresses => "peers",
            MessageType::NewTransaction => "newtx",
            MessageType::Ack => "ack",
            MessageType::ProtocolError => "error",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "chainreq" => Some(MessageType::BlockchainRequest),
            "chaintip" => Some(MessageType::ChainTip),
            "fromtop" => Some(MessageType::FromTop),
            "indexspec" => Some(MessageType::IndexSpecific),
            "blocks" => Some(MessageType::Blocks),
            "poolreq" => Some(MessageType::PoolRequest),
            "poolsync" => Some(MessageType::PoolSync),
            "peersreq" => Some(MessageType::PeersRequest),
            "peers" => Some(MessageType::PeerAddresses),
            "newtx" => Some(MessageType::NewTransaction),
            "ack" => Some(MessageType::Ack),
            "error" => Some(MessageType::ProtocolError),
            _ => None,
        }
    }

    /// Zero-padded kind field as it appears on the wire
    pub fn to_field(&self) -> [u8; KIND_LEN] {
        let mut field = [0u8; KIND_LEN];
        let name = self.as_str().as_bytes();
        field[..name.len()].copy_from_slice(name);
        field
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Ask for the peer's tip
    BlockchainRequest,
    ChainTip { index: u64, hash: String },
    /// Ask for the blocks `[tip-n ..= tip]`
    FromTop(u64),
    /// Ask for the page of blocks ending at this index
    IndexSpecific(u64),
    Blocks(Vec<Block>),
    PoolRequest,
    PoolSync(Vec<Transaction>),
    PeersRequest,
    PeerAddresses(Vec<String>),
    NewTransaction(Transaction),
    Ack,
    ProtocolError(String),
}

impl Message {
    /// Get message type
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::BlockchainRequest => MessageType::BlockchainRequest,
            Message::ChainTip { .. } => MessageType::ChainTip,
            Message::FromTop(_) => MessageType::FromTop,
            Message::IndexSpecific(_) => MessageType::IndexSpecific,
            Message::Blocks(_) => MessageType::Blocks,
            Message::PoolRequest => MessageType::PoolRequest,
            Message::PoolSync(_) => MessageType::PoolSync,
            Message::PeersRequest => MessageType::PeersRequest,
            Message::PeerAddresses(_) => MessageType::PeerAddresses,
            Message::NewTransaction(_) => MessageType::NewTransaction,
            Message::Ack => MessageType::Ack,
            Message::ProtocolError(_) => MessageType::ProtocolError,
        }
    }

    /// Serialize into a complete frame: header followed by payload
    pub fn serialize(&self) -> Vec<u8> {
        let payload = self.serialize_payload();

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.push(PROTOCOL_VERSION);
        bytes.extend_from_slice(&self.message_type().to_field());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        bytes
    }

    /// Serialize message payload
    fn serialize_payload(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        match self {
            Message::BlockchainRequest
            | Message::PoolRequest
            | Message::PeersRequest
            | Message::Ack => {}
            Message::ChainTip { index, hash } => {
                write_u64(&mut bytes, *index);
                write_var_str(&mut bytes, hash);
            }
            Message::FromTop(n) => write_u64(&mut bytes, *n),
            Message::IndexSpecific(index) => write_u64(&mut bytes, *index),
            Message::Blocks(blocks) => write_list(&mut bytes, blocks),
            Message::PoolSync(txs) => TransactionPool::write_payload(&mut bytes, txs),
            Message::PeerAddresses(addrs) => {
                write_varint(&mut bytes, addrs.len() as u64);
                for addr in addrs {
                    write_var_str(&mut bytes, addr);
                }
            }
            Message::NewTransaction(tx) => tx.write_to(&mut bytes),
            Message::ProtocolError(reason) => bytes.extend_from_slice(reason.as_bytes()),
        }
        bytes
    }

    /// Decode a payload for an already identified message type.
    ///
    /// The whole payload must be consumed.
    pub fn decode(kind: MessageType, payload: &[u8]) -> Result<Self, NetworkError> {
        let malformed = |source| NetworkError::MalformedPayload { kind, source };
        let mut reader = payload;

        let message = match kind {
            MessageType::BlockchainRequest => Message::BlockchainRequest,
            MessageType::PoolRequest => Message::PoolRequest,
            MessageType::PeersRequest => Message::PeersRequest,
            MessageType::Ack => Message::Ack,
            MessageType::ChainTip => Message::ChainTip {
                index: read_u64(&mut reader).map_err(malformed)?,
                hash: read_var_str(&mut reader).map_err(malformed)?,
            },
            MessageType::FromTop => Message::FromTop(read_u64(&mut reader).map_err(malformed)?),
            MessageType::IndexSpecific => {
                Message::IndexSpecific(read_u64(&mut reader).map_err(malformed)?)
            }
            MessageType::Blocks => Message::Blocks(read_list(&mut reader).map_err(malformed)?),
            MessageType::PoolSync => {
                Message::PoolSync(TransactionPool::read_payload(&mut reader).map_err(malformed)?)
            }
            MessageType::PeerAddresses => {
                Message::PeerAddresses(read_addresses(&mut reader).map_err(malformed)?)
            }
            MessageType::NewTransaction => {
                Message::NewTransaction(Transaction::read_from(&mut reader).map_err(malformed)?)
            }
            MessageType::ProtocolError => {
                let reason = std::str::from_utf8(reader)
                    .map_err(|_| malformed(CodecError::InvalidUtf8))?
                    .to_string();
                reader = &[];
                Message::ProtocolError(reason)
            }
        };

        if !reader.is_empty() {
            return Err(malformed(CodecError::TrailingBytes(reader.len())));
        }
        Ok(message)
    }

    /// Deserialize a complete frame held in memory
    pub fn deserialize(data: &[u8]) -> Result<Self, NetworkError> {
        if data.len() < HEADER_LEN {
            return Err(NetworkError::MalformedPayload {
                kind: MessageType::ProtocolError,
                source: CodecError::Truncated,
            });
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&data[..HEADER_LEN]);
        let (version, kind, payload_len) = RawFrame::parse_header(&header);

        let payload = &data[HEADER_LEN..];
        if payload.len() != payload_len {
            return Err(NetworkError::MalformedPayload {
                kind: MessageType::ProtocolError,
                source: CodecError::Truncated,
            });
        }

        RawFrame {
            version,
            kind,
            payload: payload.to_vec(),
        }
        .into_message()
    }
}

fn read_addresses(reader: &mut &[u8]) -> Result<Vec<String>, CodecError> {
    let count = read_varint(reader)?;
    if count > MAX_VAR_BYTES {
        return Err(CodecError::LengthTooLarge(count));
    }
    let mut addrs = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        addrs.push(read_var_str(reader)?);
    }
    Ok(addrs)
}

/// A frame read off the wire whose kind and payload are not yet interpreted
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub version: u8,
    pub kind: [u8; KIND_LEN],
    pub payload: Vec<u8>,
}

impl RawFrame {
    /// Split a header into (version, kind field, payload length)
    pub fn parse_header(header: &[u8; HEADER_LEN]) -> (u8, [u8; KIND_LEN], usize) {
        let mut kind = [0u8; KIND_LEN];
        kind.copy_from_slice(&header[1..1 + KIND_LEN]);

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[1 + KIND_LEN..]);
        (header[0], kind, u32::from_le_bytes(len_bytes) as usize)
    }

    /// Kind field with padding stripped
    pub fn kind_name(&self) -> String {
        String::from_utf8_lossy(&self.kind)
            .trim_end_matches('\0')
            .to_string()
    }

    /// Check the version and kind, then decode the payload
    pub fn into_message(self) -> Result<Message, NetworkError> {
        if self.version != PROTOCOL_VERSION {
            return Err(NetworkError::UnsupportedVersion(self.version));
        }
        let name = self.kind_name();
        let kind = MessageType::from_name(&name).ok_or(NetworkError::UnknownKind(name))?;
        Message::decode(kind, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Identity;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::FromTop.as_str(), "fromtop");
        assert_eq!(MessageType::from_name("fromtop"), Some(MessageType::FromTop));
        assert_eq!(MessageType::from_name("version"), None);
        for name in ["chainreq", "indexspec", "peersreq", "newtx", "error"] {
            let kind = MessageType::from_name(name).unwrap();
            assert!(kind.as_str().len() <= KIND_LEN);
            assert_eq!(kind.as_str(), name);
        }
    }

    #[test]
    fn test_frame_layout() {
        let bytes = Message::FromTop(3).serialize();
        assert_eq!(bytes.len(), HEADER_LEN + 8);
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(&bytes[1..8], b"fromtop");
        assert!(bytes[8..13].iter().all(|&b| b == 0));
        assert_eq!(&bytes[13..17], &8u32.to_le_bytes());
    }

    #[test]
    fn test_chain_tip_serialization() {
        let tip = Message::ChainTip {
            index: 42,
            hash: "00000abc".to_string(),
        };
        assert_eq!(Message::deserialize(&tip.serialize()).unwrap(), tip);
    }

    #[test]
    fn test_payload_with_delimiter_like_bytes() {
        // Identities containing separators and NULs must survive framing untouched
        let tx = Transaction::new(Identity::new("a|b\n\0c"), Identity::new("::"), 3, 9);
        let blocks = vec![
            Block::genesis(),
            Block::new(1, 5, Identity::new("m|\0"), vec![tx.clone()], Block::genesis().hash),
        ];
        let message = Message::Blocks(blocks.clone());
        match Message::deserialize(&message.serialize()).unwrap() {
            Message::Blocks(decoded) => assert_eq!(decoded, blocks),
            other => panic!("wrong message: {:?}", other),
        }

        let addrs = Message::PeerAddresses(vec!["127.0.0.1:1".into(), "x\0y".into()]);
        assert_eq!(Message::deserialize(&addrs.serialize()).unwrap(), addrs);
    }

    #[test]
    fn test_pool_sync_uses_pool_payload() {
        let pool = TransactionPool::new();
        pool.add(Transaction::new(Identity::new("a"), Identity::new("b"), 1, 1));
        pool.add(Transaction::new(Identity::new("b"), Identity::new("a"), 2, 2));

        let bytes = Message::PoolSync(pool.snapshot()).serialize();
        let mut expected = Vec::new();
        TransactionPool::write_payload(&mut expected, &pool.snapshot());
        assert_eq!(&bytes[HEADER_LEN..], &expected[..]);

        match Message::deserialize(&bytes).unwrap() {
            Message::PoolSync(txs) => assert_eq!(txs, pool.snapshot()),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_protocol_error_reason() {
        let error = Message::ProtocolError("unknown kind".to_string());
        assert_eq!(Message::deserialize(&error.serialize()).unwrap(), error);
    }

    #[test]
    fn test_rejects_bad_frames() {
        let mut bytes = Message::Ack.serialize();
        bytes[0] = 9;
        assert!(matches!(
            Message::deserialize(&bytes),
            Err(NetworkError::UnsupportedVersion(9))
        ));

        let mut bytes = Message::Ack.serialize();
        bytes[1..4].copy_from_slice(b"zzz");
        assert!(matches!(
            Message::deserialize(&bytes),
            Err(NetworkError::UnknownKind(name)) if name == "zzz"
        ));

        // Trailing byte after a fixed-size payload
        let mut bytes = Message::FromTop(1).serialize();
        bytes.push(0);
        bytes[13..17].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            Message::deserialize(&bytes),
            Err(NetworkError::MalformedPayload { kind: MessageType::FromTop, .. })
        ));

        assert!(Message::deserialize(&[PROTOCOL_VERSION]).is_err());
    }
}
