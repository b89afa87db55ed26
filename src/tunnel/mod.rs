//! Tunnel layer - encrypted sessions multiplexed over a mesh of links
//!
//! Provides:
//! - Links: monitored wrappers around transport sockets
//! - The tunnel: link management, session table and message routing
//! - Sessions: encrypted virtual circuits on a logical channel
//! - Listeners: acceptors of inbound sessions on a channel

mod frame;
mod link;
mod listener;
mod mesh;
mod session;
mod signal;

pub use frame::{Frame, FrameType};
pub use link::{Link, LinkState};
pub use listener::TunnelListener;
pub use mesh::Tunnel;
pub use session::{DialOptions, ListenOptions, Mode, Session};
pub use signal::{completion, CloseSignal, Completer, Completion};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("link not found")]
    LinkNotFound,

    #[error("link disconnected")]
    LinkDisconnected,

    #[error("link is loopback")]
    LinkLoopback,

    #[error("link is remote")]
    LinkRemote,

    #[error("dial timeout")]
    DialTimeout,

    #[error("failed to discover channel")]
    DiscoverFailed,

    #[error("read timeout")]
    ReadTimeout,

    #[error("failed to decrypt message")]
    DecryptionFailed,

    #[error("closed")]
    Closed,

    #[error("tunnel not connected")]
    NotConnected,

    #[error("already listening on {0}")]
    AlreadyListening(String),

    #[error("session {1} already exists on {0}")]
    SessionExists(String, String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

impl TunnelError {
    /// True when the transport refused one message but the link is fine
    pub fn is_message_error(&self) -> bool {
        matches!(
            self,
            TunnelError::Transport(crate::transport::TransportError::Codec(_))
        )
    }

    /// True for the errors a dial reports when nobody serves the channel
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TunnelError::LinkNotFound | TunnelError::DialTimeout | TunnelError::DiscoverFailed
        )
    }
}
