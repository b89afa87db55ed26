//! Sessions: encrypted virtual circuits on a logical channel
//!
//! A session never touches a link directly. Outbound traffic is wrapped in
//! an [`Envelope`] and queued for the tunnel's router, which reports the
//! outcome through the envelope's completer. Inbound traffic is pushed into
//! the session's private queue by the tunnel (or by a listener).

use super::frame::FrameType;
use super::signal::{completion, CloseSignal, Completer};
use super::TunnelError;
use crate::crypto::{derive_session_key, Cipher};
use crate::protocol::{
    ProtocolError, HEADER_RECEIVED_LINK, LISTENER_SESSION, MAX_PAYLOAD_SIZE, MULTICAST_SESSION,
};
use crate::transport::Message;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace};

/// How long a close frame may wait for room in the outbound queue
const CLOSE_TIMEOUT: Duration = Duration::from_millis(10);

/// Delivery mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Mode {
    /// One link, chosen by link scoring
    #[default]
    Unicast,
    /// Every link that announced the channel
    Multicast,
    /// Every connected, non-loopback link
    Broadcast,
}

/// Options for [`Tunnel::dial`](super::Tunnel::dial)
#[derive(Debug, Clone)]
pub struct DialOptions {
    pub mode: Mode,
    /// Bound on discovery and the open/accept handshake
    pub timeout: Duration,
    /// Wait for the listener to accept (unicast only)
    pub wait: bool,
    /// Dial over this link id only
    pub link: Option<String>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Unicast,
            timeout: Duration::from_millis(crate::protocol::DIAL_TIMEOUT_MS),
            wait: true,
            link: None,
        }
    }
}

impl DialOptions {
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }
}

/// Options for [`Tunnel::listen`](super::Tunnel::listen)
#[derive(Debug, Clone, Default)]
pub struct ListenOptions {
    pub mode: Mode,
    /// Bound on each `recv` of accepted sessions
    pub read_timeout: Option<Duration>,
}

/// Sessions registered with a tunnel, keyed by (channel, session id)
pub(crate) type SessionTable = HashMap<(String, String), Session>;

/// Internal dispatch message between sessions, listeners and the router
#[derive(Debug)]
pub(crate) struct Envelope {
    pub kind: FrameType,
    /// Sending tunnel id
    pub tunnel: String,
    pub channel: String,
    pub session: String,
    pub mode: Mode,
    /// Sent by the dialing side
    pub outbound: bool,
    /// Belongs to a loopback flow
    pub loopback: bool,
    /// Link to send on, or the link it arrived on
    pub link: Option<String>,
    pub data: Option<Message>,
    pub status: Completer,
}

/// Everything needed to build a session
pub(crate) struct SessionParams {
    pub tunnel: String,
    pub channel: String,
    pub id: String,
    pub token: String,
    pub mode: Mode,
    pub outbound: bool,
    pub loopback: bool,
    pub local: String,
    pub remote: String,
    pub link: Option<String>,
    pub dial_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub queue_size: usize,
    pub send_tx: mpsc::Sender<Envelope>,
    pub table: Weak<RwLock<SessionTable>>,
}

struct SessionInner {
    tunnel: String,
    channel: String,
    id: String,
    token: String,
    mode: Mode,
    outbound: bool,
    loopback: bool,
    local: String,
    remote: String,
    dial_timeout: Duration,
    read_timeout: Option<Duration>,
    queue_size: usize,
    link: RwLock<Option<String>>,
    accepted: AtomicBool,
    discovered: AtomicBool,
    cipher: Cipher,
    closed: CloseSignal,
    send_tx: mpsc::Sender<Envelope>,
    recv_tx: mpsc::Sender<Envelope>,
    recv_rx: Mutex<mpsc::Receiver<Envelope>>,
    table: Weak<RwLock<SessionTable>>,
}

/// An encrypted virtual circuit, returned by dial and accept
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("channel", &self.inner.channel)
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("closed", &self.inner.closed.is_closed())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(params: SessionParams) -> Result<Self, TunnelError> {
        let key = derive_session_key(&params.token, &params.channel, &params.id)?;
        let (recv_tx, recv_rx) = mpsc::channel(params.queue_size);

        Ok(Self {
            inner: Arc::new(SessionInner {
                tunnel: params.tunnel,
                channel: params.channel,
                id: params.id,
                token: params.token,
                mode: params.mode,
                outbound: params.outbound,
                loopback: params.loopback,
                local: params.local,
                remote: params.remote,
                dial_timeout: params.dial_timeout,
                read_timeout: params.read_timeout,
                queue_size: params.queue_size,
                link: RwLock::new(params.link),
                accepted: AtomicBool::new(false),
                discovered: AtomicBool::new(false),
                cipher: Cipher::new(&key)?,
                closed: CloseSignal::new(),
                send_tx: params.send_tx,
                recv_tx,
                recv_rx: Mutex::new(recv_rx),
                table: params.table,
            }),
        })
    }

    /// Build a session owned by a listener for an inbound dialer
    pub(crate) fn child(
        &self,
        id: &str,
        link: Option<String>,
        loopback: bool,
        remote: &str,
    ) -> Result<Self, TunnelError> {
        let inner = &self.inner;
        Self::new(SessionParams {
            tunnel: inner.tunnel.clone(),
            channel: inner.channel.clone(),
            id: id.to_string(),
            token: inner.token.clone(),
            mode: inner.mode,
            outbound: false,
            loopback,
            local: inner.local.clone(),
            remote: remote.to_string(),
            link,
            dial_timeout: inner.dial_timeout,
            read_timeout: inner.read_timeout,
            queue_size: inner.queue_size,
            send_tx: inner.send_tx.clone(),
            table: Weak::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn local(&self) -> &str {
        &self.inner.local
    }

    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    /// Id of the link this session is bound to, if any
    pub async fn link(&self) -> Option<String> {
        self.inner.link.read().await.clone()
    }

    pub(crate) async fn set_link(&self, link: String) {
        *self.inner.link.write().await = Some(link);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_closed()
    }

    pub(crate) fn is_accepted(&self) -> bool {
        self.inner.accepted.load(Ordering::Acquire)
    }

    pub(crate) fn set_accepted(&self) {
        self.inner.accepted.store(true, Ordering::Release);
    }

    pub(crate) fn is_discovered(&self) -> bool {
        self.inner.discovered.load(Ordering::Acquire)
    }

    pub(crate) fn set_discovered(&self) {
        self.inner.discovered.store(true, Ordering::Release);
    }

    pub(crate) fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    async fn envelope(&self, kind: FrameType) -> Envelope {
        let inner = &self.inner;
        Envelope {
            kind,
            tunnel: inner.tunnel.clone(),
            channel: inner.channel.clone(),
            session: inner.id.clone(),
            mode: inner.mode,
            outbound: inner.outbound,
            loopback: inner.loopback,
            link: self.link().await,
            data: None,
            status: Completer::detached(),
        }
    }

    async fn enqueue(&self, env: Envelope) -> Result<(), TunnelError> {
        let closed = &self.inner.closed;
        if closed.is_closed() {
            return Err(TunnelError::Closed);
        }

        tokio::select! {
            res = self.inner.send_tx.send(env) => res.map_err(|_| TunnelError::Closed),
            _ = closed.closed() => Err(TunnelError::Closed),
        }
    }

    /// Queue an envelope for the router and wait for its outcome
    async fn dispatch(&self, mut env: Envelope) -> Result<(), TunnelError> {
        let (status, done) = completion();
        env.status = status;
        self.enqueue(env).await?;

        tokio::select! {
            res = done.wait() => res,
            _ = self.inner.closed.closed() => Err(TunnelError::Closed),
        }
    }

    /// Wait for the next inbound envelope, optionally of one kind only
    pub(crate) async fn wait_for(
        &self,
        kind: Option<FrameType>,
        deadline: Option<Instant>,
        on_timeout: TunnelError,
    ) -> Result<Envelope, TunnelError> {
        let mut recv_rx = self.inner.recv_rx.lock().await;

        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        loop {
            let env = tokio::select! {
                biased;
                env = recv_rx.recv() => match env {
                    Some(env) => env,
                    None => return Err(TunnelError::Closed),
                },
                // Drain what was queued before the close
                _ = self.inner.closed.closed() => match recv_rx.try_recv() {
                    Ok(env) => env,
                    Err(_) => return Err(TunnelError::Closed),
                },
                _ = &mut expired => return Err(on_timeout),
            };

            match kind {
                Some(kind) if env.kind != kind => {
                    debug!(
                        "Session {} received {} while waiting for {}",
                        self.inner.id, env.kind, kind
                    );
                }
                _ => return Ok(env),
            }
        }
    }

    /// Find a link serving the channel. Used by the dialer only.
    pub(crate) async fn discover(&self) -> Result<(), TunnelError> {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.dial_timeout;

        let mut env = self.envelope(FrameType::Discover).await;
        env.mode = Mode::Broadcast;
        env.outbound = true;
        env.link = None;
        if inner.mode == Mode::Multicast {
            env.session = MULTICAST_SESSION.to_string();
        }

        match tokio::time::timeout_at(deadline, self.dispatch(env)).await {
            Err(_) => return Err(TunnelError::DialTimeout),
            // Multicast may start before anyone routes the channel
            Ok(Err(TunnelError::LinkNotFound)) if inner.mode != Mode::Unicast => {}
            Ok(Err(TunnelError::LinkNotFound | TunnelError::LinkDisconnected)) => {
                return Err(TunnelError::DiscoverFailed)
            }
            Ok(res) => res?,
        }

        // Only unicast waits to hear back
        if inner.mode != Mode::Unicast {
            self.set_discovered();
            self.set_accepted();
            return Ok(());
        }

        let announce = self
            .wait_for(
                Some(FrameType::Announce),
                Some(deadline),
                TunnelError::DialTimeout,
            )
            .await?;

        if let Some(link) = announce.link {
            self.set_link(link).await;
        }
        self.set_discovered();

        Ok(())
    }

    /// Ask the listener for a session and wait for its accept
    pub(crate) async fn open(&self) -> Result<(), TunnelError> {
        let deadline = Instant::now() + self.inner.dial_timeout;
        let env = self.envelope(FrameType::Open).await;

        tokio::time::timeout_at(deadline, self.dispatch(env))
            .await
            .map_err(|_| TunnelError::DialTimeout)??;

        let accept = self
            .wait_for(Some(FrameType::Accept), Some(deadline), TunnelError::DialTimeout)
            .await?;

        self.set_accepted();
        if let Some(link) = accept.link {
            self.set_link(link).await;
        }

        Ok(())
    }

    /// Answer a dialer's open
    pub(crate) async fn accept(&self) -> Result<(), TunnelError> {
        let env = self.envelope(FrameType::Accept).await;
        self.dispatch(env).await?;
        self.set_accepted();
        Ok(())
    }

    /// Encrypt and send a message
    pub async fn send(&self, msg: Message) -> Result<(), TunnelError> {
        let cipher = &self.inner.cipher;

        let body = cipher.seal(&[], &msg.body)?;
        let mut header = HashMap::with_capacity(msg.header.len());
        for (key, value) in msg.header {
            let sealed = cipher.seal(&[], value.as_bytes())?;
            header.insert(key, URL_SAFE_NO_PAD.encode(sealed));
        }

        let data = Message {
            header,
            body: body.into(),
        };
        if data.size() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge(data.size()).into());
        }

        let mut env = self.envelope(FrameType::Session).await;
        env.data = Some(data);
        if self.inner.mode != Mode::Unicast {
            env.link = None;
        }

        trace!("Session {} sending on {}", self.inner.id, self.inner.channel);
        self.dispatch(env).await
    }

    /// Receive and decrypt the next message
    pub async fn recv(&self) -> Result<Message, TunnelError> {
        let deadline = self.inner.read_timeout.map(|t| Instant::now() + t);
        let env = self
            .wait_for(Some(FrameType::Session), deadline, TunnelError::ReadTimeout)
            .await?;
        let data = env.data.unwrap_or_default();

        // Multicast listeners share one session for many dialers, so the
        // key follows the sender's session id
        let derived;
        let cipher = if env.session == self.inner.id {
            &self.inner.cipher
        } else {
            let key = derive_session_key(&self.inner.token, &self.inner.channel, &env.session)?;
            derived = Cipher::new(&key)?;
            &derived
        };

        let body = cipher.open(&[], &data.body).map_err(|e| {
            debug!("Session {} failed to decrypt body: {}", self.inner.id, e);
            TunnelError::DecryptionFailed
        })?;

        let mut header = HashMap::with_capacity(data.header.len() + 1);
        for (key, value) in data.header {
            let sealed = URL_SAFE_NO_PAD
                .decode(value.as_bytes())
                .map_err(|_| TunnelError::DecryptionFailed)?;
            let plain = cipher.open(&[], &sealed).map_err(|e| {
                debug!("Session {} failed to decrypt header {}: {}", self.inner.id, key, e);
                TunnelError::DecryptionFailed
            })?;
            let value = String::from_utf8(plain).map_err(|_| TunnelError::DecryptionFailed)?;
            header.insert(key, value);
        }

        if let Some(link) = env.link {
            header.insert(HEADER_RECEIVED_LINK.to_string(), link);
        }

        Ok(Message {
            header,
            body: body.into(),
        })
    }

    /// Push an inbound envelope without blocking. Returns false if it was dropped.
    pub(crate) fn deliver(&self, env: Envelope) -> bool {
        if self.inner.closed.is_closed() {
            return false;
        }
        self.inner.recv_tx.try_send(env).is_ok()
    }

    /// Close the session and tell the peer
    ///
    /// Unicast sessions send a close frame; closing a listener's session
    /// broadcasts it so every peer forgets the channel mapping.
    pub async fn close(&self) {
        if !self.inner.closed.close() {
            return;
        }
        self.deregister().await;

        let listener = self.inner.id == LISTENER_SESSION;
        if self.inner.mode != Mode::Unicast && !listener {
            return;
        }

        let mut env = self.envelope(FrameType::Close).await;
        if listener {
            env.mode = Mode::Broadcast;
            env.link = None;
        }

        debug!("Session {} on {} closing", self.inner.id, self.inner.channel);
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.inner.send_tx.send(env)).await;
    }

    /// Close without notifying the peer
    pub(crate) async fn close_local(&self) {
        if self.inner.closed.close() {
            self.deregister().await;
        }
    }

    pub(crate) async fn deregister(&self) {
        let Some(table) = self.inner.table.upgrade() else {
            return;
        };

        let key = (self.inner.channel.clone(), self.inner.id.clone());
        let mut table = table.write().await;
        if table.get(&key).is_some_and(|s| s.ptr_eq(self)) {
            table.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(id: &str, mode: Mode, send_tx: mpsc::Sender<Envelope>) -> SessionParams {
        SessionParams {
            tunnel: "tunnel-a".to_string(),
            channel: "svc".to_string(),
            id: id.to_string(),
            token: "token".to_string(),
            mode,
            outbound: true,
            loopback: false,
            local: "tunnel-a".to_string(),
            remote: "svc".to_string(),
            link: Some("link-1".to_string()),
            dial_timeout: Duration::from_millis(100),
            read_timeout: Some(Duration::from_millis(100)),
            queue_size: 4,
            send_tx,
            table: Weak::new(),
        }
    }

    fn inbound(mut env: Envelope) -> Envelope {
        env.status = Completer::detached();
        env.link = Some("link-2".to_string());
        env
    }

    #[tokio::test]
    async fn test_send_encrypts_and_peer_decrypts() {
        let (send_tx, mut send_rx) = mpsc::channel(4);
        let dialer = Session::new(params("abc", Mode::Unicast, send_tx.clone())).unwrap();
        let peer = Session::new(params("abc", Mode::Unicast, send_tx)).unwrap();

        let sender = {
            let dialer = dialer.clone();
            tokio::spawn(async move {
                dialer
                    .send(Message::new(&b"ping"[..]).with_header("Content-Type", "text"))
                    .await
            })
        };

        let mut env = send_rx.recv().await.unwrap();
        assert_eq!(env.kind, FrameType::Session);
        assert_eq!(env.link.as_deref(), Some("link-1"));

        let data = env.data.clone().unwrap();
        assert_ne!(&data.body[..], b"ping");
        assert_ne!(data.header["Content-Type"], "text");

        env.status.complete(Ok(()));
        sender.await.unwrap().unwrap();

        assert!(peer.deliver(inbound(env)));
        let msg = peer.recv().await.unwrap();
        assert_eq!(&msg.body[..], b"ping");
        assert_eq!(msg.header["Content-Type"], "text");
        assert_eq!(msg.header[HEADER_RECEIVED_LINK], "link-2");
    }

    #[tokio::test]
    async fn test_oversized_send_is_rejected_locally() {
        let (send_tx, mut send_rx) = mpsc::channel(4);
        let session = Session::new(params("abc", Mode::Unicast, send_tx)).unwrap();

        let body = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let res = session.send(Message::new(body)).await;
        assert!(matches!(
            res,
            Err(TunnelError::Protocol(ProtocolError::MessageTooLarge(_)))
        ));

        // Nothing reached the router and the session stays usable
        assert!(send_rx.try_recv().is_err());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_wrong_token_fails_to_decrypt() {
        let (send_tx, mut send_rx) = mpsc::channel(4);
        let dialer = Session::new(params("abc", Mode::Unicast, send_tx.clone())).unwrap();

        let mut other = params("abc", Mode::Unicast, send_tx);
        other.token = "other-token".to_string();
        let peer = Session::new(other).unwrap();

        let sender = {
            let dialer = dialer.clone();
            tokio::spawn(async move { dialer.send(Message::new(&b"secret"[..])).await })
        };
        let mut env = send_rx.recv().await.unwrap();
        env.status.complete(Ok(()));
        sender.await.unwrap().unwrap();

        peer.deliver(inbound(env));
        assert!(matches!(peer.recv().await, Err(TunnelError::DecryptionFailed)));
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let (send_tx, _send_rx) = mpsc::channel(4);
        let session = Session::new(params("abc", Mode::Unicast, send_tx)).unwrap();
        assert!(matches!(session.recv().await, Err(TunnelError::ReadTimeout)));
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let (send_tx, _send_rx) = mpsc::channel(4);
        let session = Session::new(params("abc", Mode::Unicast, send_tx.clone())).unwrap();
        let source = Session::new(params("abc", Mode::Unicast, send_tx)).unwrap();

        for _ in 0..4 {
            assert!(session.deliver(source.envelope(FrameType::Session).await));
        }
        assert!(!session.deliver(source.envelope(FrameType::Session).await));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (send_tx, mut send_rx) = mpsc::channel(4);
        let session = Session::new(params("abc", Mode::Unicast, send_tx.clone())).unwrap();
        let source = Session::new(params("abc", Mode::Unicast, send_tx)).unwrap();

        let sender = {
            let source = source.clone();
            tokio::spawn(async move { source.send(Message::new(&b"queued"[..])).await })
        };
        let mut env = send_rx.recv().await.unwrap();
        env.status.complete(Ok(()));
        sender.await.unwrap().unwrap();
        session.deliver(inbound(env));

        session.close().await;
        session.close().await;

        // Unicast close notifies the peer
        let close = send_rx.recv().await.unwrap();
        assert_eq!(close.kind, FrameType::Close);
        assert_eq!(close.session, "abc");

        assert_eq!(&session.recv().await.unwrap().body[..], b"queued");
        assert!(matches!(session.recv().await, Err(TunnelError::Closed)));
        assert!(!session.deliver(source.envelope(FrameType::Session).await));
        assert!(matches!(
            session.send(Message::default()).await,
            Err(TunnelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_multicast_close_is_silent() {
        let (send_tx, mut send_rx) = mpsc::channel(4);
        let session = Session::new(params("abc", Mode::Multicast, send_tx)).unwrap();

        session.close().await;
        assert!(send_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_listener_close_is_broadcast() {
        let (send_tx, mut send_rx) = mpsc::channel(4);
        let session = Session::new(params(LISTENER_SESSION, Mode::Multicast, send_tx)).unwrap();

        session.close().await;
        let close = send_rx.recv().await.unwrap();
        assert_eq!(close.kind, FrameType::Close);
        assert_eq!(close.mode, Mode::Broadcast);
        assert_eq!(close.session, LISTENER_SESSION);
        assert!(close.link.is_none());
    }

    #[tokio::test]
    async fn test_open_times_out_without_accept() {
        let (send_tx, mut send_rx) = mpsc::channel(4);
        let session = Session::new(params("abc", Mode::Unicast, send_tx)).unwrap();

        // Router that acknowledges every send but never answers
        tokio::spawn(async move {
            while let Some(mut env) = send_rx.recv().await {
                env.status.complete(Ok(()));
            }
        });

        assert!(matches!(session.open().await, Err(TunnelError::DialTimeout)));
        assert!(!session.is_accepted());
    }

    #[tokio::test]
    async fn test_open_completes_on_accept() {
        let (send_tx, mut send_rx) = mpsc::channel(4);
        let session = Session::new(params("abc", Mode::Unicast, send_tx)).unwrap();

        let responder = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut env = send_rx.recv().await.unwrap();
                assert_eq!(env.kind, FrameType::Open);
                env.status.complete(Ok(()));

                let mut accept = session.envelope(FrameType::Accept).await;
                accept.link = Some("link-9".to_string());
                session.deliver(accept);
            })
        };

        session.open().await.unwrap();
        responder.await.unwrap();
        assert!(session.is_accepted());
        assert_eq!(session.link().await.as_deref(), Some("link-9"));
    }
}
