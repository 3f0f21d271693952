// Peer connections and the known-peer list

use crate::network::{HEADER_LEN, Message, NetworkError, RawFrame};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Write one framed message and flush
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.serialize()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame: fixed header, then exactly the advertised payload length.
///
/// The payload is read in full even when the kind turns out to be unknown, so
/// the caller can still answer on the same connection.
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> Result<RawFrame, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let (version, kind, payload_len) = RawFrame::parse_header(&header);

    if payload_len > max_frame {
        return Err(NetworkError::FrameTooLarge {
            size: payload_len,
            limit: max_frame,
        });
    }

    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok(RawFrame {
        version,
        kind,
        payload,
    })
}

/// Outbound connection used for a single request/response exchange
pub struct Peer {
    pub addr: String,
    stream: TcpStream,
    io_timeout: Duration,
}

impl Peer {
    /// Connect to a peer, bounded by `io_timeout`
    pub async fn connect(addr: &str, io_timeout: Duration) -> Result<Self, NetworkError> {
        let stream = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout("connect"))?
            .map_err(|source| NetworkError::Connect {
                addr: addr.to_string(),
                source,
            })?;

        Ok(Self {
            addr: addr.to_string(),
            stream,
            io_timeout,
        })
    }

    /// Send a message to the peer
    pub async fn send_message(&mut self, message: &Message) -> Result<(), NetworkError> {
        timeout(self.io_timeout, write_message(&mut self.stream, message))
            .await
            .map_err(|_| NetworkError::Timeout("write"))?
    }

    /// Receive a message from the peer
    pub async fn receive_message(&mut self, max_frame: usize) -> Result<Message, NetworkError> {
        let frame = timeout(self.io_timeout, read_frame(&mut self.stream, max_frame))
            .await
            .map_err(|_| NetworkError::Timeout("read"))??;
        frame.into_message()
    }

    /// Close the write half so the peer sees a clean end of stream
    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Known peer addresses, deduplicated and never containing our own address
pub struct PeerBook {
    own_addr: String,
    peers: Mutex<Vec<String>>,
}

impl PeerBook {
    pub fn new(own_addr: impl Into<String>) -> Self {
        Self {
            own_addr: own_addr.into(),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_peers<I, S>(own_addr: impl Into<String>, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let book = Self::new(own_addr);
        book.extend(peers);
        book
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The address we advertise to others
    pub fn own_addr(&self) -> &str {
        &self.own_addr
    }

    /// Add an address; returns false for blanks, duplicates and our own address
    pub fn add(&self, addr: impl Into<String>) -> bool {
        let owned = addr.into();
        let addr = owned.trim();
        if addr.is_empty() || addr == self.own_addr {
            return false;
        }
        let mut peers = self.lock();
        if peers.iter().any(|known| known == addr) {
            return false;
        }
        peers.push(addr.to_string());
        true
    }

    /// Add several addresses; returns how many were new
    pub fn extend<I, S>(&self, addrs: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        addrs.into_iter().map(|addr| self.add(addr)).filter(|&added| added).count()
    }

    pub fn remove(&self, addr: &str) -> bool {
        let mut peers = self.lock();
        let before = peers.len();
        peers.retain(|known| known != addr);
        peers.len() != before
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.lock().iter().any(|known| known == addr)
    }

    /// Copy of the known peers
    pub fn list(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Known peers plus our own address, as sent in peer-list replies
    pub fn advertised(&self) -> Vec<String> {
        let mut addrs = self.list();
        if !self.own_addr.is_empty() {
            addrs.push(self.own_addr.clone());
        }
        addrs
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
