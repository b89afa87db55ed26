//! Links: monitored packet streams over one transport socket
//!
//! Each link runs three tasks:
//! - a read pump classifying inbound messages into probes and traffic
//! - a write pump writing queued packets one at a time
//! - a manager measuring RTT, expiring channel mappings and applying metrics

use super::signal::{completion, CloseSignal, Completer};
use super::TunnelError;
use crate::config::LinkConfig;
use crate::protocol::{
    is_link_probe, HEADER_LINK_ID, HEADER_METHOD, LINK_REQUEST, LINK_RESPONSE, METHOD_LINK,
};
use crate::transport::{Message, Socket};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};
use uuid::Uuid;

/// Health of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Closed,
    Error,
}

/// A packet queued for the write pump
struct Packet {
    message: Message,
    status: Completer,
}

/// Outcome of one send, applied in batches by the manager
#[derive(Debug, Clone, Copy)]
pub(crate) struct Metric {
    /// Bytes sent
    pub data: usize,
    /// Time from enqueue to write confirmation
    pub duration: Duration,
    pub failed: bool,
}

impl Metric {
    pub(crate) fn failure() -> Self {
        Self {
            data: 0,
            duration: Duration::ZERO,
            failed: true,
        }
    }
}

/// Mutable link state
struct LinkData {
    loopback: bool,
    connected: bool,
    /// Channel -> last time it was announced over this link
    channels: HashMap<String, Instant>,
    /// Smoothed round trip time
    length: Duration,
    /// Smoothed throughput in bits per second
    rate: f64,
    err_count: u32,
    last_keepalive: Instant,
}

impl LinkData {
    fn set_rtt(&mut self, d: Duration) {
        if self.length.is_zero() {
            self.length = d;
            return;
        }
        self.length = self.length.mul_f64(0.8) + d.mul_f64(0.2);
    }

    fn set_rate(&mut self, bits: f64, delta: Duration) {
        let secs = delta.as_secs_f64();
        if secs <= 0.0 {
            return;
        }

        let rate = bits / secs;
        if self.rate == 0.0 {
            self.rate = rate;
        } else {
            self.rate = 0.8 * self.rate + 0.2 * rate;
        }
    }

    fn record(&mut self, metric: &Metric) {
        if metric.failed {
            self.err_count += 1;
            return;
        }

        self.err_count = 0;

        if metric.data > 0 {
            self.set_rate((metric.data * 8) as f64, metric.duration);
        }
    }
}

/// A monitored connection to one peer
pub struct Link {
    id: String,
    socket: Arc<dyn Socket>,
    config: LinkConfig,
    data: RwLock<LinkData>,
    closed: CloseSignal,
    send_tx: mpsc::Sender<Packet>,
    recv_tx: mpsc::Sender<Result<Message, TunnelError>>,
    recv_rx: Mutex<mpsc::Receiver<Result<Message, TunnelError>>>,
    metric_tx: mpsc::Sender<Metric>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("remote", &self.socket.remote())
            .finish_non_exhaustive()
    }
}

impl Link {
    /// Wrap a connected socket and start the link tasks
    pub fn new(socket: Arc<dyn Socket>, config: &LinkConfig) -> Arc<Self> {
        let (send_tx, send_rx) = mpsc::channel(config.queue_size);
        let (recv_tx, recv_rx) = mpsc::channel(config.queue_size);
        let (probe_tx, probe_rx) = mpsc::channel(config.probe_queue_size);
        let (metric_tx, metric_rx) = mpsc::channel(config.queue_size);

        let link = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            socket,
            config: config.clone(),
            data: RwLock::new(LinkData {
                loopback: false,
                connected: false,
                channels: HashMap::new(),
                length: Duration::ZERO,
                rate: 0.0,
                err_count: 0,
                last_keepalive: Instant::now(),
            }),
            closed: CloseSignal::new(),
            send_tx,
            recv_tx,
            recv_rx: Mutex::new(recv_rx),
            metric_tx,
        });

        debug!("Link {} created for {}", link.id, link.socket.remote());

        tokio::spawn(link.clone().read_loop(probe_tx));
        tokio::spawn(link.clone().write_loop(send_rx));
        tokio::spawn(link.clone().manage(probe_rx, metric_rx));

        link
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote(&self) -> String {
        self.socket.remote()
    }

    pub fn local(&self) -> String {
        self.socket.local()
    }

    /// Read pump: probes go to the manager, everything else to the receive queue
    async fn read_loop(self: Arc<Self>, probe_tx: mpsc::Sender<Message>) {
        loop {
            let result = tokio::select! {
                res = self.socket.recv() => res,
                _ = self.closed.closed() => return,
            };

            match result {
                Ok(msg) if is_link_probe(&msg) => {
                    // Probes are best effort
                    if probe_tx.try_send(msg).is_err() {
                        trace!("Link {} dropped probe", self.id);
                    }
                }
                Ok(msg) => {
                    tokio::select! {
                        _ = self.recv_tx.send(Ok(msg)) => {}
                        _ = self.closed.closed() => return,
                    }
                }
                Err(e) => {
                    debug!("Link {} receive error: {}", self.id, e);
                    let _ = self.metric_tx.try_send(Metric::failure());
                    tokio::select! {
                        _ = self.recv_tx.send(Err(e.into())) => {}
                        _ = self.closed.closed() => {}
                    }
                    return;
                }
            }
        }
    }

    /// Write pump: the socket is never written concurrently
    async fn write_loop(self: Arc<Self>, mut send_rx: mpsc::Receiver<Packet>) {
        loop {
            let mut packet = tokio::select! {
                packet = send_rx.recv() => match packet {
                    Some(packet) => packet,
                    None => return,
                },
                _ = self.closed.closed() => return,
            };

            let result = self.socket.send(&packet.message).await;
            packet.status.complete(result.map_err(TunnelError::from));
        }
    }

    /// Manager: RTT probes, channel expiry and metric batches
    async fn manage(
        self: Arc<Self>,
        mut probe_rx: mpsc::Receiver<Message>,
        mut metric_rx: mpsc::Receiver<Metric>,
    ) {
        let probe_interval = self.config.probe_interval();
        let metrics_interval = self.config.metrics_interval();

        let mut probe_tick = interval_at(Instant::now() + probe_interval, probe_interval);
        probe_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut metrics_tick = interval_at(Instant::now() + metrics_interval, metrics_interval);
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut probe_sent = Instant::now();
        self.spawn_probe(&LINK_REQUEST);

        loop {
            tokio::select! {
                _ = self.closed.closed() => return,
                probe = probe_rx.recv() => {
                    let Some(probe) = probe else { return };

                    if probe.body.as_ref() == LINK_REQUEST {
                        trace!("Link {} received link request", self.id);
                        self.spawn_probe(&LINK_RESPONSE);
                    } else if probe.body.as_ref() == LINK_RESPONSE {
                        let rtt = probe_sent.elapsed();
                        trace!("Link {} received link response in {:?}", self.id, rtt);
                        self.set_rtt(rtt).await;
                    }
                }
                _ = probe_tick.tick() => {
                    self.purge_channels().await;

                    probe_sent = Instant::now();
                    self.spawn_probe(&LINK_REQUEST);
                }
                _ = metrics_tick.tick() => {
                    let mut batch = Vec::new();
                    while let Ok(metric) = metric_rx.try_recv() {
                        batch.push(metric);
                    }

                    if batch.is_empty() {
                        continue;
                    }

                    // Lock once per batch
                    let mut data = self.data.write().await;
                    for metric in &batch {
                        data.record(metric);
                    }
                }
            }
        }
    }

    /// Send a probe without stalling the manager
    fn spawn_probe(self: &Arc<Self>, body: &[u8; 4]) {
        let link = self.clone();
        let msg = Message::new(body.to_vec())
            .with_header(HEADER_METHOD, METHOD_LINK)
            .with_header(HEADER_LINK_ID, self.id.clone());

        tokio::spawn(async move {
            if let Err(e) = link.send(msg).await {
                trace!("Link {} failed to send probe: {}", link.id, e);
            }
        });
    }

    /// Drop channel mappings older than the TTL
    pub(crate) async fn purge_channels(&self) {
        let ttl = self.config.channel_ttl();
        let mut data = self.data.write().await;

        data.channels.retain(|channel, seen| {
            let keep = seen.elapsed() <= ttl;
            if !keep {
                debug!("Link {} expiring channel {}", self.id, channel);
            }
            keep
        });
    }

    /// Send a message, waiting until it has been written to the socket
    pub async fn send(&self, msg: Message) -> Result<(), TunnelError> {
        if self.closed.is_closed() {
            return Err(TunnelError::Closed);
        }

        let (status, done) = completion();
        let data = msg.size();
        let start = Instant::now();

        tokio::select! {
            res = self.send_tx.send(Packet { message: msg, status }) => {
                res.map_err(|_| TunnelError::Closed)?;
            }
            _ = self.closed.closed() => return Err(TunnelError::Closed),
        }

        let result = tokio::select! {
            res = done.wait() => res,
            _ = self.closed.closed() => return Err(TunnelError::Closed),
        };

        // Never block the caller on metrics
        let _ = self.metric_tx.try_send(Metric {
            data,
            duration: start.elapsed(),
            failed: result.as_ref().is_err_and(|e| !e.is_message_error()),
        });

        result
    }

    /// Receive the next non-probe message
    pub async fn recv(&self) -> Result<Message, TunnelError> {
        let mut recv_rx = self.recv_rx.lock().await;

        tokio::select! {
            biased;
            item = recv_rx.recv() => item.unwrap_or(Err(TunnelError::Closed)),
            _ = self.closed.closed() => recv_rx.try_recv().unwrap_or(Err(TunnelError::Closed)),
        }
    }

    /// Close the link. Only the first call has any effect.
    pub async fn close(&self) {
        if !self.closed.close() {
            return;
        }

        debug!("Link {} to {} closed", self.id, self.socket.remote());
        let _ = self.socket.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    /// Combined depth of the send and receive queues
    pub fn delay(&self) -> usize {
        let queued = |max: usize, free: usize| max.saturating_sub(free);
        queued(self.send_tx.max_capacity(), self.send_tx.capacity())
            + queued(self.recv_tx.max_capacity(), self.recv_tx.capacity())
    }

    /// Smoothed throughput in bits per second
    pub async fn rate(&self) -> f64 {
        self.data.read().await.rate
    }

    /// Smoothed round trip time, zero when nothing was measured yet
    pub async fn length(&self) -> Duration {
        self.data.read().await.length
    }

    pub async fn loopback(&self) -> bool {
        self.data.read().await.loopback
    }

    pub(crate) async fn set_loopback(&self, loopback: bool) {
        self.data.write().await.loopback = loopback;
    }

    pub async fn is_connected(&self) -> bool {
        self.data.read().await.connected
    }

    pub(crate) async fn set_connected(&self, connected: bool) {
        self.data.write().await.connected = connected;
    }

    pub(crate) async fn set_rtt(&self, d: Duration) {
        self.data.write().await.set_rtt(d);
    }

    /// Mark channels as routed over this link
    pub(crate) async fn set_channels(&self, channels: &[String]) {
        let now = Instant::now();
        let mut data = self.data.write().await;
        for channel in channels {
            data.channels.insert(channel.clone(), now);
        }
    }

    pub(crate) async fn del_channel(&self, channel: &str) {
        self.data.write().await.channels.remove(channel);
    }

    pub async fn has_channel(&self, channel: &str) -> bool {
        self.data.read().await.channels.contains_key(channel)
    }

    /// Channels currently mapped to this link
    pub async fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.data.read().await.channels.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Refresh the keepalive timestamp
    pub(crate) async fn keepalive(&self) {
        self.data.write().await.last_keepalive = Instant::now();
    }

    pub async fn last_keepalive(&self) -> Instant {
        self.data.read().await.last_keepalive
    }

    /// Apply a metric immediately
    #[cfg(test)]
    pub(crate) async fn record(&self, metric: Metric) {
        self.data.write().await.record(&metric);
    }

    pub async fn state(&self) -> LinkState {
        if self.closed.is_closed() {
            return LinkState::Closed;
        }

        if self.data.read().await.err_count > self.config.error_threshold {
            return LinkState::Error;
        }

        LinkState::Connected
    }
}
