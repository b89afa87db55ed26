//! The tunnel: link management, the session table and message routing
//!
//! ```text
//!   Session::send ──► outbound queue ──► router ──► Link ──► peer
//!   peer ──► Link ──► protocol loop ──► Session / listener queue
//! ```

use super::frame::{Frame, FrameType};
use super::link::{Link, LinkState};
use super::listener::TunnelListener;
use super::session::{DialOptions, Envelope, ListenOptions, Mode, Session, SessionParams, SessionTable};
use super::signal::{CloseSignal, Completer};
use super::TunnelError;
use crate::config::{Config, LinkConfig, TunnelConfig};
use crate::crypto::random_index;
use crate::protocol::{LISTENER_SESSION, MULTICAST_SESSION};
use crate::transport::{Listener, Transport, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

struct State {
    connected: bool,
    closed: Arc<CloseSignal>,
    listener: Option<Arc<dyn Listener>>,
    address: String,
}

struct Inner {
    id: String,
    config: TunnelConfig,
    link_config: LinkConfig,
    transport: Arc<dyn Transport>,
    /// Outbound links by node address, inbound links by remote address
    links: RwLock<HashMap<String, Arc<Link>>>,
    sessions: Arc<RwLock<SessionTable>>,
    send_tx: mpsc::Sender<Envelope>,
    send_rx: Mutex<mpsc::Receiver<Envelope>>,
    state: Mutex<State>,
}

/// A mesh of links carrying encrypted sessions
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.inner.id)
            .field("transport", &self.inner.transport.name())
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        let (send_tx, send_rx) = mpsc::channel(config.tunnel.queue_size);
        let id = config
            .tunnel
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            inner: Arc::new(Inner {
                id,
                config: config.tunnel.clone(),
                link_config: config.link.clone(),
                transport,
                links: RwLock::new(HashMap::new()),
                sessions: Arc::new(RwLock::new(HashMap::new())),
                send_tx,
                send_rx: Mutex::new(send_rx),
                state: Mutex::new(State {
                    connected: false,
                    closed: Arc::new(CloseSignal::new()),
                    listener: None,
                    address: config.tunnel.address.clone(),
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The bound transport address once connected, the configured one before
    pub async fn address(&self) -> String {
        self.inner.state.lock().await.address.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.connected
    }

    /// Snapshot of the link table
    pub async fn links(&self) -> Vec<Arc<Link>> {
        self.inner.links.read().await.values().cloned().collect()
    }

    /// Channels this tunnel listens on
    pub async fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self
            .inner
            .sessions
            .read()
            .await
            .keys()
            .filter(|(_, id)| id == LISTENER_SESSION)
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    /// Start listening on the transport and connect to the configured nodes
    pub async fn connect(&self) -> Result<(), TunnelError> {
        let mut state = self.inner.state.lock().await;
        if state.connected {
            return Ok(());
        }

        let listener = self.inner.transport.listen(&self.inner.config.address).await?;
        let closed = Arc::new(CloseSignal::new());

        state.address = listener.addr();
        state.listener = Some(listener.clone());
        state.closed = closed.clone();
        state.connected = true;
        info!(
            "Tunnel {} listening on {} via {}",
            self.inner.id,
            state.address,
            self.inner.transport.name()
        );
        drop(state);

        tokio::spawn(self.clone().accept_loop(listener, closed.clone()));
        tokio::spawn(self.clone().process(closed.clone()));

        // First pass inline so configured peers are usable on return
        self.manage_links(&closed).await;
        tokio::spawn(self.clone().manage(closed));

        Ok(())
    }

    /// Close every session and link and stop listening
    pub async fn close(&self) -> Result<(), TunnelError> {
        let (closed, listener) = {
            let mut state = self.inner.state.lock().await;
            if !state.connected {
                return Ok(());
            }
            state.connected = false;
            (state.closed.clone(), state.listener.take())
        };

        let sessions: Vec<Session> = self
            .inner
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            session.close().await;
        }

        let links: Vec<Arc<Link>> = self
            .inner
            .links
            .write()
            .await
            .drain()
            .map(|(_, link)| link)
            .collect();
        for link in links {
            let msg = Frame::new(FrameType::Close, self.inner.id.clone())
                .with_link(link.id())
                .encode();
            let _ = tokio::time::timeout(self.inner.config.dial_timeout(), link.send(msg)).await;
            link.close().await;
        }

        closed.close();
        if let Some(listener) = listener {
            let _ = listener.close().await;
        }

        info!("Tunnel {} closed", self.inner.id);
        Ok(())
    }

    /// Open a session to whoever listens on `channel`
    pub async fn dial(&self, channel: &str, opts: DialOptions) -> Result<Session, TunnelError> {
        if !self.is_connected().await {
            return Err(TunnelError::NotConnected);
        }

        let mut mode = opts.mode;
        let mut routes = Vec::new();
        if let Some(id) = opts.link.as_deref() {
            let link = self
                .find_link(Some(id))
                .await
                .ok_or(TunnelError::LinkNotFound)?;
            // Dialers never use loopback links
            if link.loopback().await {
                return Err(TunnelError::LinkLoopback);
            }
            if !link.is_connected().await || !link.has_channel(channel).await {
                return Err(TunnelError::LinkNotFound);
            }
            routes.push(link);
            mode = Mode::Unicast;
        } else {
            for link in self.links().await {
                if link.is_connected().await
                    && !link.loopback().await
                    && link.has_channel(channel).await
                {
                    routes.push(link);
                }
            }
        }

        let session = self
            .new_session(SessionParams {
                tunnel: self.inner.id.clone(),
                channel: channel.to_string(),
                id: Uuid::new_v4().to_string(),
                token: self.inner.config.token.clone(),
                mode,
                outbound: true,
                loopback: false,
                local: self.inner.id.clone(),
                remote: channel.to_string(),
                link: None,
                dial_timeout: opts.timeout,
                read_timeout: None,
                queue_size: self.inner.config.queue_size,
                send_tx: self.inner.send_tx.clone(),
                table: Arc::downgrade(&self.inner.sessions),
            })
            .await?;

        debug!(
            "Tunnel {} dialing {} session {} ({:?}, {} known routes)",
            self.inner.id,
            channel,
            session.id(),
            mode,
            routes.len()
        );

        if let Err(e) = self.establish(&session, routes, opts.wait).await {
            debug!("Tunnel {} dial to {} failed: {}", self.inner.id, channel, e);
            session.close_local().await;
            return Err(e);
        }

        Ok(session)
    }

    async fn establish(
        &self,
        session: &Session,
        routes: Vec<Arc<Link>>,
        wait: bool,
    ) -> Result<(), TunnelError> {
        if !routes.is_empty() {
            session.set_discovered();
            if session.mode() == Mode::Unicast {
                let link = pick_link(&routes).await?;
                session.set_link(link.id().to_string()).await;
            } else {
                session.set_accepted();
            }
        }

        if !session.is_discovered() {
            let start = Instant::now();
            session.discover().await?;

            // The discover round trip doubles as an RTT sample
            if let Some(link) = self.find_link(session.link().await.as_deref()).await {
                link.set_rtt(start.elapsed()).await;
            }
        }

        if session.mode() != Mode::Unicast || !wait {
            return Ok(());
        }

        let start = Instant::now();
        session.open().await?;

        if let Some(link) = self.find_link(session.link().await.as_deref()).await {
            if link.length().await.is_zero() {
                link.set_rtt(start.elapsed()).await;
            }
        }

        Ok(())
    }

    /// Accept sessions dialed to `channel`
    pub async fn listen(
        &self,
        channel: &str,
        opts: ListenOptions,
    ) -> Result<TunnelListener, TunnelError> {
        let session = self
            .new_session(SessionParams {
                tunnel: self.inner.id.clone(),
                channel: channel.to_string(),
                id: LISTENER_SESSION.to_string(),
                token: self.inner.config.token.clone(),
                mode: opts.mode,
                outbound: false,
                loopback: false,
                local: channel.to_string(),
                remote: "remote".to_string(),
                link: None,
                dial_timeout: self.inner.config.dial_timeout(),
                read_timeout: opts.read_timeout,
                queue_size: self.inner.config.queue_size,
                send_tx: self.inner.send_tx.clone(),
                table: Arc::downgrade(&self.inner.sessions),
            })
            .await
            .map_err(|e| match e {
                TunnelError::SessionExists(channel, _) => TunnelError::AlreadyListening(channel),
                e => e,
            })?;

        info!("Tunnel {} listening on channel {}", self.inner.id, channel);

        // Tell peers right away rather than waiting for their next discover
        let tunnel = self.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            for link in tunnel.links().await {
                if link.is_connected().await {
                    tunnel.announce(Some(channel.clone()), None, &link).await;
                }
            }
        });

        Ok(TunnelListener::new(session, self.inner.config.queue_size))
    }

    async fn new_session(&self, params: SessionParams) -> Result<Session, TunnelError> {
        let key = (params.channel.clone(), params.id.clone());
        let mut sessions = self.inner.sessions.write().await;

        if sessions.contains_key(&key) {
            return Err(TunnelError::SessionExists(key.0, key.1));
        }

        let session = Session::new(params)?;
        sessions.insert(key, session.clone());
        Ok(session)
    }

    async fn get_session(&self, channel: &str, id: &str) -> Option<Session> {
        self.inner
            .sessions
            .read()
            .await
            .get(&(channel.to_string(), id.to_string()))
            .cloned()
    }

    async fn find_link(&self, id: Option<&str>) -> Option<Arc<Link>> {
        let id = id?;
        self.inner
            .links
            .read()
            .await
            .values()
            .find(|link| link.id() == id)
            .cloned()
    }

    /// Remove a link from the table and close it
    async fn del_link(&self, link: &Arc<Link>) {
        self.inner
            .links
            .write()
            .await
            .retain(|_, l| !Arc::ptr_eq(l, link));
        link.close().await;
    }

    async fn send_control(&self, kind: FrameType, link: &Link) -> Result<(), TunnelError> {
        let msg = Frame::new(kind, self.inner.id.clone())
            .with_link(link.id())
            .encode();
        link.send(msg).await
    }

    /// Advertise listened channels over a link
    ///
    /// With a channel, only that channel is announced and only if a listener
    /// for it exists; without one every listened channel is.
    async fn announce(&self, channel: Option<String>, session: Option<String>, link: &Link) {
        let channels = match channel {
            Some(channel) => {
                if self.get_session(&channel, LISTENER_SESSION).await.is_none() {
                    return;
                }
                channel
            }
            None => {
                let channels = self.channels().await;
                if channels.is_empty() {
                    return;
                }
                channels.join(",")
            }
        };

        let mut frame = Frame::new(FrameType::Announce, self.inner.id.clone())
            .with_channel(channels)
            .with_link(link.id());
        if let Some(session) = session {
            frame = frame.with_session(session);
        }

        trace!("Tunnel {} announcing {:?} on link {}", self.inner.id, frame.channel, link.id());
        if let Err(e) = link.send(frame.encode()).await {
            debug!("Tunnel {} failed to announce on link {}: {}", self.inner.id, link.id(), e);
        }
    }

    async fn accept_loop(self, listener: Arc<dyn Listener>, closed: Arc<CloseSignal>) {
        loop {
            let res = tokio::select! {
                res = listener.accept() => res,
                _ = closed.closed() => return,
            };

            match res {
                Ok(socket) => {
                    let link = Link::new(socket, &self.inner.link_config);
                    debug!(
                        "Tunnel {} accepted link {} from {}",
                        self.inner.id,
                        link.id(),
                        link.remote()
                    );
                    tokio::spawn(self.clone().manage_link(link.clone(), closed.clone()));
                    tokio::spawn(self.clone().listen_link(link, closed.clone()));
                }
                Err(TransportError::Closed) => return,
                Err(e) => {
                    if closed.is_closed() {
                        return;
                    }
                    warn!("Tunnel {} accept error: {}", self.inner.id, e);
                }
            }
        }
    }

    /// Route outbound envelopes until the tunnel closes
    async fn process(self, closed: Arc<CloseSignal>) {
        let mut send_rx = self.inner.send_rx.lock().await;

        loop {
            let env = tokio::select! {
                env = send_rx.recv() => match env {
                    Some(env) => env,
                    None => return,
                },
                _ = closed.closed() => return,
            };

            self.route(env).await;
        }
    }

    async fn route(&self, mut env: Envelope) {
        if env.mode == Mode::Unicast {
            if let Err(e) = self.check_pinned(&env).await {
                env.status.complete(Err(e));
                return;
            }
        }

        let mut eligible = Vec::new();
        for link in self.links().await {
            if !link.is_connected().await {
                continue;
            }

            let loopback = link.loopback().await;
            // Dialers never use loopback links
            if loopback && env.outbound {
                continue;
            }
            // Replies on a loopback flow stay on loopback links
            if env.loopback && !loopback {
                continue;
            }

            match env.mode {
                Mode::Multicast => {
                    if !link.has_channel(&env.channel).await {
                        continue;
                    }
                }
                Mode::Broadcast => {
                    if loopback {
                        continue;
                    }
                }
                Mode::Unicast => {
                    if env.link.as_deref().is_some_and(|id| id != link.id()) {
                        continue;
                    }
                }
            }

            eligible.push(link);
        }

        if eligible.is_empty() {
            trace!(
                "Tunnel {} has no link for {} on {} ({:?})",
                self.inner.id,
                env.kind,
                env.channel,
                env.mode
            );
            let result = match env.mode {
                Mode::Multicast => Ok(()),
                _ => Err(TunnelError::LinkNotFound),
            };
            env.status.complete(result);
            return;
        }

        let mut frame = Frame::new(env.kind, env.tunnel.clone())
            .with_channel(env.channel.clone())
            .with_session(env.session.clone());
        if let Some(data) = env.data.take() {
            frame = frame.with_payload(data);
        }

        match env.mode {
            Mode::Unicast => {
                if env.link.is_none() {
                    let mut mapped = Vec::new();
                    for link in &eligible {
                        if link.has_channel(&env.channel).await {
                            mapped.push(link.clone());
                        }
                    }
                    if !mapped.is_empty() {
                        eligible = mapped;
                    }
                }

                let result = self.send_on(&eligible, frame).await;
                env.status.complete(result);
            }
            Mode::Multicast | Mode::Broadcast => {
                let tunnel = self.clone();
                let status = std::mem::replace(&mut env.status, Completer::detached());
                tokio::spawn(tunnel.fan_out(eligible, frame, status));
            }
        }
    }

    /// Reject a unicast envelope pinned to a link its flow may not use
    async fn check_pinned(&self, env: &Envelope) -> Result<(), TunnelError> {
        let Some(id) = env.link.as_deref() else {
            return Ok(());
        };
        let link = self
            .find_link(Some(id))
            .await
            .ok_or(TunnelError::LinkNotFound)?;

        let loopback = link.loopback().await;
        if env.outbound && loopback {
            return Err(TunnelError::LinkLoopback);
        }
        if env.loopback && !loopback {
            return Err(TunnelError::LinkRemote);
        }
        Ok(())
    }

    async fn send_on(&self, links: &[Arc<Link>], frame: Frame) -> Result<(), TunnelError> {
        let link = pick_link(links).await?;
        trace!(
            "Tunnel {} sending {} on link {}",
            self.inner.id,
            frame.frame_type,
            link.id()
        );

        let msg = frame.with_link(link.id()).encode();
        if let Err(e) = link.send(msg).await {
            debug!("Tunnel {} link {} send failed: {}", self.inner.id, link.id(), e);
            // A message the transport cannot frame says nothing about the link
            if e.is_message_error() {
                return Err(e);
            }
            self.del_link(&link).await;
            return Err(TunnelError::LinkDisconnected);
        }
        Ok(())
    }

    async fn fan_out(self, links: Vec<Arc<Link>>, frame: Frame, mut status: Completer) {
        let mut sends = JoinSet::new();
        for link in links {
            let msg = frame.clone().with_link(link.id()).encode();
            sends.spawn(async move {
                let res = link.send(msg).await;
                (link, res)
            });
        }

        let mut delivered = false;
        let mut rejected = None;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(()))) => delivered = true,
                Ok((link, Err(e))) if e.is_message_error() => {
                    debug!("Tunnel {} link {} rejected message: {}", self.inner.id, link.id(), e);
                    rejected = Some(e);
                }
                Ok((link, Err(e))) => {
                    debug!("Tunnel {} link {} send failed: {}", self.inner.id, link.id(), e);
                    self.del_link(&link).await;
                }
                Err(e) => warn!("Tunnel {} send task failed: {}", self.inner.id, e),
            }
        }

        status.complete(match (delivered, rejected) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(TunnelError::LinkDisconnected),
        });
    }

    /// Protocol loop for one link
    async fn listen_link(self, link: Arc<Link>, closed: Arc<CloseSignal>) {
        loop {
            let res = tokio::select! {
                res = link.recv() => res,
                _ = closed.closed() => break,
            };

            let msg = match res {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("Tunnel {} link {} receive error: {}", self.inner.id, link.id(), e);
                    break;
                }
            };

            let frame = match Frame::decode(msg) {
                Ok(frame) => frame,
                Err(e) => {
                    trace!("Tunnel {} dropping message on link {}: {}", self.inner.id, link.id(), e);
                    continue;
                }
            };

            if !self.handle_frame(&link, frame).await {
                break;
            }
        }

        self.del_link(&link).await;
    }

    /// Act on one inbound frame. Returns false when the link should go away.
    async fn handle_frame(&self, link: &Arc<Link>, frame: Frame) -> bool {
        if frame.frame_type != FrameType::Connect && !link.is_connected().await {
            trace!("Tunnel {} dropping {} before connect", self.inner.id, frame.frame_type);
            return true;
        }

        let loopback = link.loopback().await;
        trace!(
            "Tunnel {} received {} on link {} from {}",
            self.inner.id,
            frame.frame_type,
            link.id(),
            frame.tunnel_id
        );

        match frame.frame_type {
            FrameType::Connect => {
                let loopback = frame.tunnel_id == self.inner.id;
                if loopback {
                    link.set_loopback(true).await;
                }
                link.set_connected(true).await;

                let replaced = self
                    .inner
                    .links
                    .write()
                    .await
                    .insert(link.remote(), link.clone());
                if let Some(old) = replaced.filter(|old| !Arc::ptr_eq(old, link)) {
                    old.close().await;
                }

                info!(
                    "Tunnel {} link {} connected from {} (loopback: {})",
                    self.inner.id,
                    link.id(),
                    frame.tunnel_id,
                    loopback
                );

                let tunnel = self.clone();
                let link = link.clone();
                tokio::spawn(async move {
                    tunnel.announce(None, None, &link).await;
                    if let Err(e) = tunnel.send_control(FrameType::Discover, &link).await {
                        debug!("Tunnel {} failed to discover on link {}: {}", tunnel.inner.id, link.id(), e);
                    }
                });
                return true;
            }
            FrameType::Close => {
                let Some(channel) = frame.channel.as_deref() else {
                    debug!("Tunnel {} link {} closed by peer", self.inner.id, link.id());
                    return false;
                };
                let session = frame.session.as_deref().unwrap_or_default();

                if session == LISTENER_SESSION {
                    link.del_channel(channel).await;
                    return true;
                }

                if !loopback {
                    if let Some(s) = self.get_session(channel, session).await {
                        if s.mode() == Mode::Unicast {
                            debug!("Tunnel {} peer closed session {}", self.inner.id, session);
                            s.close_local().await;
                        }
                        return true;
                    }
                }
            }
            FrameType::Keepalive => {
                link.keepalive().await;
                return true;
            }
            FrameType::Discover => {
                let tunnel = self.clone();
                let link = link.clone();
                tokio::spawn(async move {
                    tunnel.announce(frame.channel, frame.session, &link).await;
                });
                return true;
            }
            FrameType::Announce => {
                link.set_channels(&frame.channels()).await;

                let (Some(channel), Some(session)) = (frame.channel.as_deref(), frame.session.as_deref())
                else {
                    return true;
                };
                if session == LISTENER_SESSION || session == MULTICAST_SESSION {
                    return true;
                }

                if let Some(s) = self.get_session(channel, session).await {
                    if !s.is_discovered() {
                        s.deliver(Envelope {
                            kind: FrameType::Announce,
                            tunnel: frame.tunnel_id.clone(),
                            channel: channel.to_string(),
                            session: session.to_string(),
                            mode: s.mode(),
                            outbound: false,
                            loopback,
                            link: Some(link.id().to_string()),
                            data: None,
                            status: Completer::detached(),
                        });
                    }
                }
                return true;
            }
            FrameType::Accept => {
                if let (Some(channel), Some(session)) = (frame.channel.as_deref(), frame.session.as_deref()) {
                    if let Some(s) = self.get_session(channel, session).await {
                        if s.is_accepted() {
                            return true;
                        }
                        if s.mode() != Mode::Unicast {
                            s.set_accepted();
                            return true;
                        }
                    }
                }
            }
            FrameType::Open | FrameType::Session => {}
        }

        self.deliver(link, loopback, frame).await;
        true
    }

    /// Hand a session-bearing frame to its session or the channel's listener
    async fn deliver(&self, link: &Link, loopback: bool, frame: Frame) {
        let (Some(channel), Some(session)) = (frame.channel.clone(), frame.session.clone()) else {
            trace!("Tunnel {} dropping {} without channel or session", self.inner.id, frame.frame_type);
            return;
        };

        let target = if loopback || frame.frame_type == FrameType::Open {
            self.get_session(&channel, LISTENER_SESSION).await
        } else if frame.frame_type == FrameType::Accept {
            self.get_session(&channel, &session).await
        } else {
            match self.get_session(&channel, &session).await {
                Some(s) => Some(s),
                None => self.get_session(&channel, LISTENER_SESSION).await,
            }
        };

        let Some(target) = target else {
            trace!("Tunnel {} no session for {} {}", self.inner.id, channel, session);
            return;
        };

        if target.is_closed() {
            target.deregister().await;
            return;
        }

        let env = Envelope {
            kind: frame.frame_type,
            tunnel: frame.tunnel_id.clone(),
            channel,
            session,
            mode: target.mode(),
            outbound: false,
            loopback,
            link: Some(link.id().to_string()),
            data: Some(frame.payload()),
            status: Completer::detached(),
        };

        if !target.deliver(env) {
            trace!("Tunnel {} session {} queue full, dropping", self.inner.id, target.id());
        }
    }

    /// Keepalive and discover for one link
    async fn manage_link(self, link: Arc<Link>, closed: Arc<CloseSignal>) {
        let keepalive_interval = self.inner.config.keepalive_interval();
        let discover_interval = self.inner.config.discover_interval();

        let mut keepalive = interval_at(Instant::now() + keepalive_interval, keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut discover = interval_at(Instant::now() + discover_interval, discover_interval);
        discover.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = closed.closed() => return,
                _ = keepalive.tick() => {
                    if link.is_closed() {
                        return;
                    }
                    let tunnel = self.clone();
                    let link = link.clone();
                    tokio::spawn(async move {
                        if let Err(e) = tunnel.send_control(FrameType::Keepalive, &link).await {
                            debug!("Tunnel {} keepalive failed on link {}: {}", tunnel.inner.id, link.id(), e);
                            tunnel.del_link(&link).await;
                        }
                    });
                }
                _ = discover.tick() => {
                    if link.is_closed() {
                        return;
                    }
                    let tunnel = self.clone();
                    let link = link.clone();
                    tokio::spawn(async move {
                        if let Err(e) = tunnel.send_control(FrameType::Discover, &link).await {
                            debug!("Tunnel {} discover failed on link {}: {}", tunnel.inner.id, link.id(), e);
                        }
                    });
                }
            }
        }
    }

    /// Reconnection manager
    async fn manage(self, closed: Arc<CloseSignal>) {
        let period = self.inner.config.reconnect_interval();
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = closed.closed() => return,
                _ = tick.tick() => self.manage_links(&closed).await,
            }
        }
    }

    /// Evict failed links and dial configured nodes that have none
    async fn manage_links(&self, closed: &Arc<CloseSignal>) {
        for link in self.links().await {
            match link.state().await {
                LinkState::Connected => {}
                state => {
                    debug!("Tunnel {} evicting link {} ({:?})", self.inner.id, link.id(), state);
                    self.del_link(&link).await;
                }
            }
        }

        let missing: Vec<String> = {
            let links = self.inner.links.read().await;
            self.inner
                .config
                .nodes
                .iter()
                .filter(|node| !links.contains_key(*node))
                .cloned()
                .collect()
        };

        let mut dials = JoinSet::new();
        for node in missing {
            let tunnel = self.clone();
            let closed = closed.clone();
            dials.spawn(async move {
                let res = tunnel.setup_link(&node, closed).await;
                (node, res)
            });
        }

        while let Some(joined) = dials.join_next().await {
            let Ok((node, res)) = joined else { continue };
            match res {
                Ok(link) => {
                    let duplicate = {
                        let mut links = self.inner.links.write().await;
                        if links.contains_key(&node) {
                            Some(link)
                        } else {
                            info!("Tunnel {} connected to {} on link {}", self.inner.id, node, link.id());
                            links.insert(node, link);
                            None
                        }
                    };
                    if let Some(link) = duplicate {
                        link.close().await;
                    }
                }
                Err(e) => debug!("Tunnel {} failed to connect to {}: {}", self.inner.id, node, e),
            }
        }
    }

    async fn setup_link(&self, node: &str, closed: Arc<CloseSignal>) -> Result<Arc<Link>, TunnelError> {
        let socket = tokio::time::timeout(self.inner.config.dial_timeout(), self.inner.transport.dial(node))
            .await
            .map_err(|_| TunnelError::DialTimeout)??;

        let link = Link::new(socket, &self.inner.link_config);
        if let Err(e) = self.send_control(FrameType::Connect, &link).await {
            link.close().await;
            return Err(e);
        }
        link.set_connected(true).await;

        tokio::spawn(self.clone().listen_link(link.clone(), closed.clone()));
        tokio::spawn(self.clone().manage_link(link.clone(), closed));

        Ok(link)
    }
}

/// Choose the best link for a unicast send
///
/// Connected, non-loopback links with a measured RTT are scored by
/// `delay × length × rate` and the lowest wins; ties go to the lowest link id.
/// Without any scored link a random usable link is chosen, or a random link
/// when none is usable.
pub(crate) async fn pick_link(links: &[Arc<Link>]) -> Result<Arc<Link>, TunnelError> {
    if links.is_empty() {
        return Err(TunnelError::LinkNotFound);
    }

    let mut sorted: Vec<&Arc<Link>> = links.iter().collect();
    sorted.sort_by(|a, b| a.id().cmp(b.id()));

    let mut usable = Vec::with_capacity(sorted.len());
    let mut best: Option<(f64, &Arc<Link>)> = None;
    for link in sorted.iter().copied() {
        if link.state().await != LinkState::Connected || link.loopback().await {
            continue;
        }
        usable.push(link);

        let length = link.length().await;
        if length.is_zero() {
            continue;
        }

        let score = link.delay() as f64 * length.as_nanos() as f64 * link.rate().await;
        if best.map_or(true, |(lowest, _)| score < lowest) {
            best = Some((score, link));
        }
    }

    if let Some((_, link)) = best {
        return Ok(link.clone());
    }

    let candidates = if usable.is_empty() { &sorted } else { &usable };
    let index = random_index(candidates.len())?;
    Ok(candidates[index].clone())
}
