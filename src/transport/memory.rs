//! In-process transport
//!
//! Every dial produces a connected pair of sockets joined by bounded queues.
//! Clones of a [`MemoryTransport`] share one address registry, so tunnels in
//! the same process reach each other through it.

use super::{Listener, Message, Socket, Transport, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace};

/// Capacity of each socket direction and of the accept backlog
const QUEUE_SIZE: usize = 128;

/// Shared registry of bound listeners
#[derive(Default)]
struct Registry {
    listeners: Mutex<HashMap<String, mpsc::Sender<Arc<dyn Socket>>>>,
    next_port: AtomicU64,
}

impl Registry {
    fn next_addr(&self) -> String {
        let port = 10_000 + self.next_port.fetch_add(1, Ordering::Relaxed);
        format!("127.0.0.1:{}", port)
    }
}

/// In-memory transport
#[derive(Clone, Default)]
pub struct MemoryTransport {
    registry: Arc<Registry>,
}

impl MemoryTransport {
    /// Create a transport with a fresh, private address registry
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn Socket>, TransportError> {
        let accept_tx = {
            let listeners = self.registry.listeners.lock().await;
            listeners
                .get(addr)
                .cloned()
                .ok_or_else(|| TransportError::ConnectionFailed(format!("no listener on {}", addr)))?
        };

        let local = self.registry.next_addr();
        let (client, server) = MemorySocket::pair(local.clone(), addr.to_string());

        accept_tx
            .send(Arc::new(server))
            .await
            .map_err(|_| TransportError::ConnectionFailed(format!("listener on {} closed", addr)))?;

        debug!("Memory transport {} connected to {}", local, addr);
        Ok(Arc::new(client))
    }

    async fn listen(&self, addr: &str) -> Result<Arc<dyn Listener>, TransportError> {
        let mut listeners = self.registry.listeners.lock().await;

        // Port zero (or no address at all) asks for a fresh address
        let addr = if addr.is_empty() || addr.ends_with(":0") {
            let mut candidate = self.registry.next_addr();
            while listeners.contains_key(&candidate) {
                candidate = self.registry.next_addr();
            }
            candidate
        } else {
            addr.to_string()
        };

        if listeners.contains_key(&addr) {
            return Err(TransportError::AddressInUse(addr));
        }

        let (accept_tx, accept_rx) = mpsc::channel(QUEUE_SIZE);
        listeners.insert(addr.clone(), accept_tx);

        debug!("Memory transport listening on {}", addr);
        Ok(Arc::new(MemoryListener {
            addr,
            accept_rx: Mutex::new(accept_rx),
            registry: self.registry.clone(),
            closed: watch::channel(false).0,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// One end of an in-memory connection
struct MemorySocket {
    local: String,
    remote: String,
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
    /// Shared by both ends, so closing either side closes the pair
    closed: Arc<watch::Sender<bool>>,
}

impl MemorySocket {
    fn pair(client_addr: String, server_addr: String) -> (Self, Self) {
        let (client_tx, server_rx) = mpsc::channel(QUEUE_SIZE);
        let (server_tx, client_rx) = mpsc::channel(QUEUE_SIZE);
        let closed = Arc::new(watch::channel(false).0);

        let client = Self {
            local: client_addr.clone(),
            remote: server_addr.clone(),
            tx: client_tx,
            rx: Mutex::new(client_rx),
            closed: closed.clone(),
        };
        let server = Self {
            local: server_addr,
            remote: client_addr,
            tx: server_tx,
            rx: Mutex::new(server_rx),
            closed,
        };

        (client, server)
    }
}

#[async_trait]
impl Socket for MemorySocket {
    async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            res = self.tx.send(msg.clone()) => res.map_err(|_| TransportError::Closed),
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
        }
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        let mut rx = self.rx.lock().await;
        let mut closed = self.closed.subscribe();

        // Messages sent before the close are still delivered
        tokio::select! {
            biased;
            msg = rx.recv() => msg.ok_or(TransportError::Closed),
            _ = closed.wait_for(|c| *c) => rx.try_recv().map_err(|_| TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.send_if_modified(|c| !std::mem::replace(c, true)) {
            trace!("Memory socket {} -> {} closed", self.local, self.remote);
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

/// Listener bound in the registry
struct MemoryListener {
    addr: String,
    accept_rx: Mutex<mpsc::Receiver<Arc<dyn Socket>>>,
    registry: Arc<Registry>,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Arc<dyn Socket>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }

        let mut accept_rx = self.accept_rx.lock().await;
        tokio::select! {
            sock = accept_rx.recv() => sock.ok_or(TransportError::Closed),
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
        }
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.send_if_modified(|c| !std::mem::replace(c, true)) {
            self.registry.listeners.lock().await.remove(&self.addr);
            debug!("Memory listener on {} closed", self.addr);
        }
        Ok(())
    }
}
