//! Listeners: acceptors of inbound sessions on one channel

use super::frame::FrameType;
use super::session::{Mode, Session};
use super::signal::CloseSignal;
use super::TunnelError;
use crate::protocol::{BROADCAST_SESSION, MULTICAST_SESSION};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

/// Accepts sessions dialed to a channel
///
/// Every inbound frame for the channel lands on the listener's own
/// `"listener"` session. A background task splits that stream by session id:
/// unicast dialers each get their own [`Session`], while multicast and
/// broadcast listeners share a single session per mode.
pub struct TunnelListener {
    channel: String,
    session: Session,
    accept_rx: Mutex<mpsc::Receiver<Session>>,
    closed: Arc<CloseSignal>,
}

impl std::fmt::Debug for TunnelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelListener")
            .field("channel", &self.channel)
            .field("mode", &self.session.mode())
            .finish_non_exhaustive()
    }
}

impl TunnelListener {
    pub(crate) fn new(session: Session, queue_size: usize) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(queue_size);
        let closed = Arc::new(CloseSignal::new());

        tokio::spawn(process(session.clone(), accept_tx, closed.clone()));

        Self {
            channel: session.channel().to_string(),
            session,
            accept_rx: Mutex::new(accept_rx),
            closed,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn mode(&self) -> Mode {
        self.session.mode()
    }

    /// Wait for the next inbound session
    pub async fn accept(&self) -> Result<Session, TunnelError> {
        let mut accept_rx = self.accept_rx.lock().await;

        let session = tokio::select! {
            _ = self.closed.closed() => return Err(TunnelError::Closed),
            session = accept_rx.recv() => session.ok_or(TunnelError::Closed)?,
        };

        if session.mode() == Mode::Unicast {
            session.accept().await?;
        }

        debug!(
            "Listener on {} accepted session {} from {}",
            self.channel,
            session.id(),
            session.remote()
        );
        Ok(session)
    }

    /// Stop listening. Only the first call has any effect.
    pub async fn close(&self) {
        if self.closed.close() {
            self.session.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }
}

/// Demultiplex the listener session into per-dialer sessions
async fn process(session: Session, accept_tx: mpsc::Sender<Session>, closed: Arc<CloseSignal>) {
    let mut conns: HashMap<String, Session> = HashMap::new();

    loop {
        let env = tokio::select! {
            res = session.wait_for(None, None, TunnelError::Closed) => match res {
                Ok(env) => env,
                Err(_) => break,
            },
            _ = closed.closed() => break,
        };

        let id = match env.mode {
            Mode::Multicast => MULTICAST_SESSION.to_string(),
            Mode::Broadcast => BROADCAST_SESSION.to_string(),
            Mode::Unicast => env.session.clone(),
        };

        let conn = match conns.get(&id).filter(|c| !c.is_closed()) {
            Some(conn) => conn.clone(),
            None => {
                // Only an open or data starts a session
                if !matches!(env.kind, FrameType::Open | FrameType::Session) {
                    trace!("Listener on {} ignoring {} for {}", session.channel(), env.kind, id);
                    continue;
                }

                let link = match env.mode {
                    Mode::Unicast => env.link.clone(),
                    _ => None,
                };
                let conn = match session.child(&id, link, env.loopback, &env.tunnel) {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!("Listener on {} failed to create session {}: {}", session.channel(), id, e);
                        continue;
                    }
                };
                conns.insert(id.clone(), conn.clone());

                tokio::select! {
                    res = accept_tx.send(conn.clone()) => if res.is_err() { break },
                    _ = closed.closed() => break,
                }
                conn
            }
        };

        match env.kind {
            FrameType::Close => {
                // Shared sessions outlive any single peer
                if conn.mode() == Mode::Unicast {
                    conn.close_local().await;
                    conns.remove(&id);
                }
            }
            FrameType::Session => {
                if !conn.deliver(env) {
                    trace!("Listener on {} dropped message for {}", session.channel(), id);
                }
            }
            _ => {}
        }

        conns.retain(|_, c| !c.is_closed());
    }

    closed.close();
    for (_, conn) in conns.drain() {
        conn.close().await;
    }
    debug!("Listener on {} stopped", session.channel());
}
