// One-request-one-response transport

use crate::network::{Message, NetworkError, Peer, RawFrame, read_frame, write_message};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

/// Answers one inbound request synchronously
pub trait Responder: Send + Sync + 'static {
    fn respond(&self, request: Message) -> Message;
}

#[derive(Debug, Clone, Copy)]
pub struct Communicator {
    io_timeout: Duration,
    max_frame: usize,
}

impl Communicator {
    pub fn new(io_timeout: Duration, max_frame: usize) -> Self {
        Self {
            io_timeout,
            max_frame,
        }
    }

    /// Dial `addr`, send `request`, wait for exactly one reply, close.
    ///
    /// A `ProtocolError` reply is surfaced as [`NetworkError::Remote`].
    pub async fn send_and_receive(&self, addr: &str, request: &Message) -> Result<Message, NetworkError> {
        let mut peer = Peer::connect(addr, self.io_timeout).await?;
        peer.send_message(request).await?;
        let reply = peer.receive_message(self.max_frame).await;
        peer.close().await;

        match reply? {
            Message::ProtocolError(reason) => Err(NetworkError::Remote(reason)),
            message => Ok(message),
        }
    }

    /// Bind the listening socket; failure here is fatal for a node
    pub async fn bind(addr: &str) -> Result<TcpListener, NetworkError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind {
                addr: addr.to_string(),
                source,
            })
    }

    /// Accept connections until `shutdown` flips, one task per connection
    pub async fn listen<R: Responder>(
        &self,
        listener: TcpListener,
        responder: Arc<R>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), NetworkError> {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Node listening on {}", addr);
        }

        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => break,
            };

            let communicator = *self;
            let responder = Arc::clone(&responder);
            tokio::spawn(async move {
                if let Err(e) = communicator.handle_connection(stream, addr, responder).await {
                    log::debug!("Connection from {} failed: {}", addr, e);
                }
            });
        }

        log::info!("Listener stopped");
        Ok(())
    }

    /// Read one request, answer it, close
    async fn handle_connection<R: Responder>(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
        responder: Arc<R>,
    ) -> Result<(), NetworkError> {
        // Oversized, truncated and stalled requests get an error reply as well
        let request = timeout(self.io_timeout, read_frame(&mut stream, self.max_frame))
            .await
            .unwrap_or(Err(NetworkError::Timeout("read")))
            .and_then(RawFrame::into_message);

        let reply = match request {
            Ok(request) => {
                log::debug!("Received {} from {}", request.message_type(), addr);
                // Ledger reads may wait out a reorg; keep them off the async workers
                tokio::task::spawn_blocking(move || responder.respond(request))
                    .await
                    .unwrap_or_else(|e| Message::ProtocolError(format!("request handler failed: {}", e)))
            }
            Err(e) => {
                log::warn!("Rejecting request from {}: {}", addr, e);
                Message::ProtocolError(e.to_string())
            }
        };

        timeout(self.io_timeout, write_message(&mut stream, &reply))
            .await
            .map_err(|_| NetworkError::Timeout("write"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{HEADER_LEN, PROTOCOL_VERSION};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Echo;

    impl Responder for Echo {
        fn respond(&self, request: Message) -> Message {
            match request {
                Message::FromTop(n) => Message::IndexSpecific(n),
                Message::Ack => Message::ProtocolError("no acks please".to_string()),
                _ => Message::Ack,
            }
        }
    }

    async fn start() -> (String, watch::Sender<bool>) {
        let listener = Communicator::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = watch::channel(false);
        let communicator = Communicator::new(Duration::from_secs(2), 1 << 20);
        tokio::spawn(async move { communicator.listen(listener, Arc::new(Echo), rx).await });
        (addr, tx)
    }

    #[tokio::test]
    async fn test_request_response() {
        let (addr, _shutdown) = start().await;
        let communicator = Communicator::new(Duration::from_secs(2), 1 << 20);

        let reply = communicator.send_and_receive(&addr, &Message::FromTop(4)).await.unwrap();
        assert_eq!(reply, Message::IndexSpecific(4));

        // Each exchange uses a fresh connection
        let reply = communicator.send_and_receive(&addr, &Message::PeersRequest).await.unwrap();
        assert_eq!(reply, Message::Ack);
    }

    #[tokio::test]
    async fn test_protocol_error_reply_is_an_error() {
        let (addr, _shutdown) = start().await;
        let communicator = Communicator::new(Duration::from_secs(2), 1 << 20);

        match communicator.send_and_receive(&addr, &Message::Ack).await {
            Err(NetworkError::Remote(reason)) => assert_eq!(reason, "no acks please"),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_kind_gets_explicit_error() {
        let (addr, _shutdown) = start().await;

        let mut stream = TcpStream::connect(&addr).await.unwrap();
        let mut frame = vec![PROTOCOL_VERSION];
        frame.extend_from_slice(b"bogus\0\0\0\0\0\0\0");
        frame.extend_from_slice(&3u32.to_le_bytes());
        frame.extend_from_slice(b"abc");
        stream.write_all(&frame).await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert!(reply.len() > HEADER_LEN);
        match Message::deserialize(&reply).unwrap() {
            Message::ProtocolError(reason) => assert!(reason.contains("bogus")),
            other => panic!("expected protocol error, got {:?}", other.message_type()),
        }
    }

    async fn reply_to(addr: &str, bytes: &[u8]) -> Message {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(bytes).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        Message::deserialize(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_oversized_frame_gets_explicit_error() {
        let (addr, _shutdown) = start().await;

        let mut header = vec![PROTOCOL_VERSION];
        header.extend_from_slice(b"poolreq\0\0\0\0\0");
        header.extend_from_slice(&((1u32 << 20) + 1).to_le_bytes());

        match reply_to(&addr, &header).await {
            Message::ProtocolError(reason) => assert!(reason.contains("exceeds limit")),
            other => panic!("expected protocol error, got {:?}", other.message_type()),
        }
    }

    #[tokio::test]
    async fn test_truncated_frame_gets_explicit_error() {
        let (addr, _shutdown) = start().await;

        let mut frame = vec![PROTOCOL_VERSION];
        frame.extend_from_slice(b"fromtop\0\0\0\0\0");
        frame.extend_from_slice(&8u32.to_le_bytes());
        frame.extend_from_slice(&[1, 2, 3]);

        assert!(matches!(reply_to(&addr, &frame).await, Message::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let communicator = Communicator::new(Duration::from_millis(500), 1024);
        // Bind then drop to find a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let result = communicator.send_and_receive(&addr, &Message::PoolRequest).await;
        assert!(matches!(
            result,
            Err(NetworkError::Connect { .. }) | Err(NetworkError::Timeout(_))
        ));
    }
}
