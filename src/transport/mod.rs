//! Transport layer implementations
//!
//! The tunnel runs over any point-to-point duplex transport that can move
//! header + body [`Message`]s. Two backends are provided:
//! - Memory (in-process, for tests and embedding)
//! - TCP (length-prefixed message framing)

pub mod codec;
mod memory;
mod tcp;

pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Address in use: {0}")]
    AddressInUse(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// A transport message: string headers plus an opaque body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub header: HashMap<String, String>,
    pub body: Bytes,
}

impl Message {
    /// Create a message with an empty header
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            header: HashMap::new(),
            body: body.into(),
        }
    }

    /// Builder style header insertion
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key.into(), value.into());
        self
    }

    /// Number of bytes this message occupies on the wire, excluding framing
    pub fn size(&self) -> usize {
        self.body.len()
            + self
                .header
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// One end of an established duplex connection
///
/// All methods take `&self`: a socket is shared between a reader and a
/// writer task, and implementations serialize each direction internally.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Send one message
    async fn send(&self, msg: &Message) -> Result<(), TransportError>;

    /// Receive the next message
    async fn recv(&self) -> Result<Message, TransportError>;

    /// Close the connection; pending and future calls fail with `Closed`
    async fn close(&self) -> Result<(), TransportError>;

    /// Local address label
    fn local(&self) -> String;

    /// Remote address label
    fn remote(&self) -> String;
}

/// A bound listener producing inbound sockets
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next inbound connection
    async fn accept(&self) -> Result<Arc<dyn Socket>, TransportError>;

    /// The bound address
    fn addr(&self) -> String;

    /// Stop listening
    async fn close(&self) -> Result<(), TransportError>;
}

/// Trait for transport implementations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote endpoint
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Socket>, TransportError>;

    /// Listen on a local address
    async fn listen(&self, addr: &str) -> Result<Arc<dyn Listener>, TransportError>;

    /// Short name of the transport
    fn name(&self) -> &'static str;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Write timeout in seconds
    pub write_timeout: u64,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            write_timeout: 60,
            nodelay: true,
        }
    }
}
