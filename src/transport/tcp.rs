//! TCP transport with length-prefixed message framing

use super::{codec, Listener, Message, Socket, Transport, TransportConfig, TransportError};
use async_trait::async_trait;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

/// Initial read buffer capacity
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// TCP transport
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    pub fn new_default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new_default()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Socket>, TransportError> {
        let timeout = Duration::from_secs(self.config.connect_timeout);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        debug!("TCP transport connected to {}", addr);
        Ok(Arc::new(TcpSocket::new(stream, &self.config)?))
    }

    async fn listen(&self, addr: &str) -> Result<Arc<dyn Listener>, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?.to_string();

        debug!("TCP transport listening on {}", addr);
        Ok(Arc::new(TcpTransportListener {
            listener,
            addr,
            config: self.config.clone(),
            closed: watch::channel(false).0,
        }))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Established TCP connection
struct TcpSocket {
    reader: Mutex<(OwnedReadHalf, BytesMut)>,
    writer: Mutex<OwnedWriteHalf>,
    local: String,
    remote: String,
    write_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl TcpSocket {
    fn new(stream: TcpStream, config: &TransportConfig) -> Result<Self, TransportError> {
        // Configure TCP options
        if config.nodelay {
            stream.set_nodelay(true).ok();
        }

        let local = stream.local_addr()?.to_string();
        let remote = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: Mutex::new((reader, BytesMut::with_capacity(READ_BUFFER_SIZE))),
            writer: Mutex::new(writer),
            local,
            remote,
            write_timeout: Duration::from_secs(config.write_timeout),
            closed: watch::channel(false).0,
        })
    }

    async fn read_message(
        reader: &mut OwnedReadHalf,
        buf: &mut BytesMut,
    ) -> Result<Message, TransportError> {
        loop {
            if let Some(msg) = codec::decode(buf)? {
                return Ok(msg);
            }

            let n = reader.read_buf(buf).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
        }
    }
}

#[async_trait]
impl Socket for TcpSocket {
    async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }

        let frame = codec::encode(msg)?;
        let mut writer = self.writer.lock().await;

        tokio::time::timeout(self.write_timeout, writer.write_all(&frame))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Io)?;

        Ok(())
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.reader.lock().await;
        let (reader, buf) = &mut *guard;

        tokio::select! {
            res = Self::read_message(reader, buf) => res,
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.send_if_modified(|c| !std::mem::replace(c, true)) {
            trace!("TCP socket {} -> {} closed", self.local, self.remote);
            self.writer.lock().await.shutdown().await.ok();
        }
        Ok(())
    }

    fn local(&self) -> String {
        self.local.clone()
    }

    fn remote(&self) -> String {
        self.remote.clone()
    }
}

/// Bound TCP listener
struct TcpTransportListener {
    listener: TcpListener,
    addr: String,
    config: TransportConfig,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl Listener for TcpTransportListener {
    async fn accept(&self) -> Result<Arc<dyn Socket>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            res = self.listener.accept() => {
                let (stream, peer) = res?;
                trace!("TCP listener {} accepted {}", self.addr, peer);
                Ok(Arc::new(TcpSocket::new(stream, &self.config)?) as Arc<dyn Socket>)
            }
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
        }
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.send_if_modified(|c| !std::mem::replace(c, true));
        Ok(())
    }
}
