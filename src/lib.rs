//! # Mesh Tunnel
//!
//! Encrypted, addressable virtual circuits multiplexed over a mesh of
//! point-to-point links.
//!
//! ## Features
//!
//! - **Sessions** on named channels, dialed and accepted like sockets
//! - **Unicast, multicast and broadcast** delivery
//! - **Link scoring** by queue depth, round trip time and throughput
//! - **Automatic discovery** of which peer serves a channel
//! - **Per-session encryption** with ChaCha20-Poly1305 keyed from a shared token
//! - **Pluggable transports**: in-memory and TCP included
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Session Layer                       │
//! │        (Dial, Listen/Accept, Send/Recv, Close)       │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                       │
//! │   (Session table, routing, discovery, reconnects)    │
//! ├─────────────────────────────────────────────────────┤
//! │                    Link Layer                        │
//! │        (Packet queues, RTT probes, metrics)          │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │                  (Memory, TCP)                       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use mesh_tunnel::transport::MemoryTransport;
//! use mesh_tunnel::tunnel::DialOptions;
//! use mesh_tunnel::{Config, Tunnel};
//! use std::sync::Arc;
//!
//! # async fn run() -> mesh_tunnel::Result<()> {
//! let tunnel = Tunnel::new(&Config::default(), Arc::new(MemoryTransport::new()));
//! tunnel.connect().await?;
//!
//! let session = tunnel.dial("greeter", DialOptions::default()).await?;
//! session.send(mesh_tunnel::transport::Message::new(&b"hello"[..])).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod protocol;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use tunnel::Tunnel;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
