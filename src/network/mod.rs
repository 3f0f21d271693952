// P2P networking

mod message;
mod peer;
mod communicator;
mod sync;

pub use message::{Message, MessageType, RawFrame, HEADER_LEN, KIND_LEN, PROTOCOL_VERSION};
pub use peer::{Peer, PeerBook, read_frame, write_message};
pub use communicator::{Communicator, Responder};
pub use sync::{ChainSync, PeerSync, SyncConfig, SyncError};

use crate::core::CodecError;
use std::io;
use thiserror::Error;

/// Transport and protocol failures for a single exchange with a peer
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("could not connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("could not bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
    #[error("malformed {kind} payload: {source}")]
    MalformedPayload { kind: MessageType, source: CodecError },
    #[error("peer reported protocol error: {0}")]
    Remote(String),
    #[error("expected {expected} reply, got {found}")]
    UnexpectedReply { expected: MessageType, found: MessageType },
}
