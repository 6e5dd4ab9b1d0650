//! Per-peer connections over a shared transport endpoint.
//!
//! An [`Endpoint`] owns the actual I/O: the transport (primary plugin or
//! fallback UDP), a send worker and a receive worker, and the per-peer queue
//! registry. A [`Connection`] is the per-participant contract object:
//! non-blocking `send` into a bounded outbound queue, buffered-window
//! `peek`/`next` over the bounded inbound queue, retry with capped backoff,
//! reconnect, and metrics. Primary and Fallback connections expose the same
//! surface; downstream code cannot tell them apart.
//!
//! Queue discipline (one per direction, per peer): bounded at 1024, single
//! producer, single consumer. The consumer side of the inbound queue drains
//! into a private `VecDeque` window so `peek(n)` never inspects the
//! lock-free queue itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::metrics::{ConnectionMetrics, MetricsSnapshot};
use crate::net::packet::RawPacket;
use crate::net::plugin::{self, Transport, TransportError};
use crate::net::redundancy::RedundancyManager;

/// Capacity of each per-connection packet queue.
pub const QUEUE_CAPACITY: usize = 1024;
/// Attempts per packet before the retry loop gives up.
pub const SEND_MAX_ATTEMPTS: u32 = 3;
/// Failed sends before a connection becomes a reconnect candidate.
pub const RECONNECT_THRESHOLD: u64 = 10;
/// Bounded wait on outbound overflow before the packet is dropped.
pub const BACKPRESSURE_WAIT: Duration = Duration::from_millis(10);

/// Capped exponential backoff between send attempts.
fn send_backoff(attempt: u32) -> Duration {
    Duration::from_millis((100 * attempt as u64).min(500))
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connection is closed")]
    Closed,
    #[error("reconnect not permitted")]
    ReconnectForbidden,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Initialized,
    Running,
    Degraded,
    Closing,
    Closed,
}

/// Which backing carries this connection's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    Primary,
    Fallback,
    Local,
}

struct PeerChannels {
    outbound_rx: Receiver<RawPacket>,
    inbound_tx: Sender<RawPacket>,
    metrics: Arc<ConnectionMetrics>,
}

struct EndpointInner {
    transport: Mutex<Box<dyn Transport>>,
    registry: Mutex<HashMap<String, PeerChannels>>,
    accept_tx: Sender<(String, RawPacket)>,
    redundancy: Option<Mutex<RedundancyManager>>,
    running: AtomicBool,
    using_fallback: bool,
    host: String,
    port: u16,
    loss_factor: u32,
    loss_counter: AtomicU32,
    /// Counters for one-shot sends to peers with no registered connection.
    stray_metrics: Arc<ConnectionMetrics>,
}

impl EndpointInner {
    /// Artificial loss for testing: swallow one in `loss_factor` sends.
    fn lose_packet(&self) -> bool {
        if self.loss_factor == 0 {
            return false;
        }
        self.loss_counter.fetch_add(1, Ordering::Relaxed) % self.loss_factor == 0
    }

    fn send_with_retry(&self, peer: &str, packet: &RawPacket, metrics: &ConnectionMetrics) {
        if self.lose_packet() {
            debug!(peer, "dropping packet (artificial loss)");
            return;
        }
        for attempt in 1..=SEND_MAX_ATTEMPTS {
            let result = self.transport.lock().send(packet.as_bytes(), peer);
            match result {
                Ok(()) => {
                    metrics.record_sent(packet.len());
                    if let Some(redundancy) = &self.redundancy {
                        redundancy.lock().record_send_success(peer);
                    }
                    return;
                }
                Err(TransportError::Timeout) | Err(TransportError::NetworkDown) => {
                    metrics.record_send_failure();
                    if attempt == SEND_MAX_ATTEMPTS {
                        warn!(peer, attempts = attempt, "send failed, giving up on packet");
                        if let Some(redundancy) = &self.redundancy {
                            redundancy.lock().record_send_failure(peer);
                        }
                    } else {
                        thread::sleep(send_backoff(attempt));
                    }
                }
                Err(err) => {
                    warn!(peer, %err, "send aborted");
                    return;
                }
            }
        }
    }
}

/// Shared transport endpoint: constructed once per server, hands out
/// per-peer [`Connection`]s.
pub struct Endpoint {
    inner: Arc<EndpointInner>,
    accept_rx: Receiver<(String, RawPacket)>,
    workers: Vec<thread::JoinHandle<()>>,
    metrics_interval: Duration,
    can_reconnect: bool,
    reconnect_timeout: Duration,
}

impl Endpoint {
    /// Attempt the configured primary transport; on any setup failure fall
    /// back to the classic UDP listener on the same port. A double failure is
    /// unrecoverable and surfaces to the caller.
    pub fn open(config: &NetworkConfig) -> Result<Self, ConnectionError> {
        let (transport, using_fallback): (Box<dyn Transport>, bool) =
            match plugin::open_primary(config) {
                Ok(t) => (t, false),
                Err(err) => {
                    warn!(%err, "primary transport failed, falling back to {}", config.fallback_transport);
                    let udp = plugin::open_fallback(config)?;
                    (Box::new(udp), true)
                }
            };

        let redundancy = if using_fallback {
            None
        } else {
            Some(Mutex::new(RedundancyManager::new(
                config.group_rtt_threshold,
                &config.peers,
            )))
        };

        let (accept_tx, accept_rx) = bounded(QUEUE_CAPACITY);
        let inner = Arc::new(EndpointInner {
            transport: Mutex::new(transport),
            registry: Mutex::new(HashMap::new()),
            accept_tx,
            redundancy,
            running: AtomicBool::new(true),
            using_fallback,
            host: config.host.clone(),
            port: config.port,
            loss_factor: config.network_settings.network_loss_factor,
            loss_counter: AtomicU32::new(0),
            stray_metrics: Arc::new(ConnectionMetrics::new()),
        });

        let mut workers = Vec::with_capacity(2);
        {
            let inner = inner.clone();
            workers.push(
                thread::Builder::new()
                    .name("net-recv".into())
                    .spawn(move || recv_loop(inner))
                    .map_err(|e| ConnectionError::Transport(TransportError::Setup(e.to_string())))?,
            );
        }
        {
            let inner = inner.clone();
            workers.push(
                thread::Builder::new()
                    .name("net-send".into())
                    .spawn(move || send_loop(inner))
                    .map_err(|e| ConnectionError::Transport(TransportError::Setup(e.to_string())))?,
            );
        }

        info!(
            using_fallback,
            port = config.port,
            "network endpoint ready"
        );
        Ok(Self {
            inner,
            accept_rx,
            workers,
            metrics_interval: Duration::from_millis(config.logging.metrics_interval),
            can_reconnect: config.server.can_reconnect,
            reconnect_timeout: Duration::from_secs(config.network_settings.reconnect_timeout),
        })
    }

    pub fn using_fallback(&self) -> bool {
        self.inner.using_fallback
    }

    /// Bound local address, when the backing transport exposes one. Useful
    /// with port 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.transport.lock().local_addr()
    }

    /// Open a connection to a peer. The peer becomes part of the redundancy
    /// graph on the primary path.
    pub fn connect(&self, peer: &str) -> Connection {
        let (outbound_tx, outbound_rx) = bounded(QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = bounded(QUEUE_CAPACITY);
        let metrics = Arc::new(ConnectionMetrics::new());
        self.inner.registry.lock().insert(
            peer.to_string(),
            PeerChannels {
                outbound_rx,
                inbound_tx,
                metrics: metrics.clone(),
            },
        );
        if let Some(redundancy) = &self.inner.redundancy {
            redundancy.lock().register_peer(peer);
        }
        Connection {
            peer: peer.to_string(),
            kind: if self.inner.using_fallback {
                BackingKind::Fallback
            } else {
                BackingKind::Primary
            },
            state: ConnectionState::Running,
            outbound_tx,
            inbound_rx,
            window: VecDeque::new(),
            metrics,
            endpoint: Some(self.inner.clone()),
            can_reconnect: self.can_reconnect,
            reconnect_timeout: self.reconnect_timeout,
            degraded_since: None,
            metrics_interval: self.metrics_interval,
        }
    }

    /// Next datagram from a peer no connection is registered for (joins).
    pub fn accept(&self) -> Option<(String, RawPacket)> {
        self.accept_rx.try_recv().ok()
    }

    /// One-shot send to a peer with no registered connection (rejection
    /// replies). Runs the normal retry policy on the calling thread.
    pub fn send_to_peer(&self, peer: &str, packet: &RawPacket) {
        self.inner
            .send_with_retry(peer, packet, &self.inner.stray_metrics);
    }

    /// Record an RTT observation for a peer (driven by ping handling).
    pub fn record_rtt(&self, peer: &str, rtt_millis: f64) {
        if let Some(redundancy) = &self.inner.redundancy {
            redundancy.lock().record_rtt(peer, rtt_millis);
        }
    }

    /// Mean RTT across the redundancy graph; 0 on the fallback path.
    pub fn average_rtt_millis(&self) -> f64 {
        self.inner
            .redundancy
            .as_ref()
            .map(|r| r.lock().average_rtt_millis())
            .unwrap_or(0.0)
    }

    /// Degrade the current primary path and promote the next-best peer.
    /// Invoked by the sync checker after a desync; also resets every
    /// connection's failure counter per the failover contract.
    pub fn trigger_failover_if_needed(&self) {
        if let Some(redundancy) = &self.inner.redundancy {
            let mut manager = redundancy.lock();
            if let Some(primary) = manager.primary_path().map(str::to_string) {
                manager.trigger_failover(&primary);
            }
        }
        for channels in self.inner.registry.lock().values() {
            channels.metrics.reset_failures();
        }
    }

    /// Stop workers and release the transport. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.inner.transport.lock().destroy();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn recv_loop(inner: Arc<EndpointInner>) {
    while inner.running.load(Ordering::SeqCst) {
        let received = inner.transport.lock().receive();
        match received {
            Ok(Some(datagram)) => {
                let peer = datagram.peer;
                let packet = match RawPacket::new(datagram.data) {
                    Ok(p) => p,
                    Err(err) => {
                        warn!(peer, %err, "dropping invalid packet");
                        continue;
                    }
                };
                let registry = inner.registry.lock();
                if let Some(channels) = registry.get(&peer) {
                    channels.metrics.record_received(packet.len());
                    if let Err(TrySendError::Full(_)) = channels.inbound_tx.try_send(packet) {
                        warn!(peer, "inbound queue full, dropping packet");
                    }
                } else if let Err(TrySendError::Full(_)) =
                    inner.accept_tx.try_send((peer.clone(), packet))
                {
                    warn!(peer, "accept queue full, dropping packet");
                }
            }
            Ok(None) => thread::sleep(Duration::from_millis(1)),
            Err(err) => {
                warn!(%err, "transport receive error");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn send_loop(inner: Arc<EndpointInner>) {
    let mut last_reprobe = Instant::now();
    while inner.running.load(Ordering::SeqCst) {
        // Snapshot the registry so sends happen outside the lock.
        let peers: Vec<(String, Receiver<RawPacket>, Arc<ConnectionMetrics>)> = inner
            .registry
            .lock()
            .iter()
            .map(|(peer, ch)| (peer.clone(), ch.outbound_rx.clone(), ch.metrics.clone()))
            .collect();

        let mut sent_any = false;
        for (peer, outbound_rx, metrics) in &peers {
            while let Ok(packet) = outbound_rx.try_recv() {
                inner.send_with_retry(peer, &packet, metrics);
                sent_any = true;
            }
        }

        if last_reprobe.elapsed() >= Duration::from_secs(1) {
            last_reprobe = Instant::now();
            if let Some(redundancy) = &inner.redundancy {
                for peer in redundancy.lock().reprobe_degraded() {
                    debug!(peer, "re-probing degraded peer");
                }
            }
        }

        if !sent_any {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Snapshot of one connection for bandwidth reporting and diagnostics.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub peer: String,
    pub kind: BackingKind,
    pub state: ConnectionState,
    pub queued_outbound: usize,
    pub metrics: MetricsSnapshot,
}

impl std::fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{:?}/{:?}] queued {}: {}",
            self.peer, self.kind, self.state, self.queued_outbound, self.metrics
        )
    }
}

/// Per-peer reliable-ish channel. Owned exclusively by one participant.
pub struct Connection {
    peer: String,
    kind: BackingKind,
    state: ConnectionState,
    outbound_tx: Sender<RawPacket>,
    inbound_rx: Receiver<RawPacket>,
    window: VecDeque<RawPacket>,
    metrics: Arc<ConnectionMetrics>,
    endpoint: Option<Arc<EndpointInner>>,
    can_reconnect: bool,
    reconnect_timeout: Duration,
    degraded_since: Option<Instant>,
    metrics_interval: Duration,
}

impl Connection {
    /// In-process pair for the local client: each side's sends surface on the
    /// other side's inbound queue. No workers, no retry.
    pub fn local_pair() -> (Connection, Connection) {
        let (a_to_b_tx, a_to_b_rx) = bounded(QUEUE_CAPACITY);
        let (b_to_a_tx, b_to_a_rx) = bounded(QUEUE_CAPACITY);
        let make = |outbound_tx, inbound_rx| Connection {
            peer: "local".to_string(),
            kind: BackingKind::Local,
            state: ConnectionState::Running,
            outbound_tx,
            inbound_rx,
            window: VecDeque::new(),
            metrics: Arc::new(ConnectionMetrics::new()),
            endpoint: None,
            can_reconnect: false,
            reconnect_timeout: Duration::from_secs(15),
            degraded_since: None,
            metrics_interval: Duration::from_secs(5),
        };
        (make(a_to_b_tx, b_to_a_rx), make(b_to_a_tx, a_to_b_rx))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn kind(&self) -> BackingKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    /// Non-blocking enqueue. On overflow the call waits up to 10 ms for the
    /// consumer, then drops the packet and logs; dropping is not an error to
    /// the caller.
    pub fn send(&self, packet: &RawPacket) -> Result<(), ConnectionError> {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return Err(ConnectionError::Closed);
        }
        match self.outbound_tx.try_send(packet.clone()) {
            Ok(()) => {
                if self.kind == BackingKind::Local {
                    self.metrics.record_sent(packet.len());
                }
                Ok(())
            }
            Err(TrySendError::Full(pkt)) => {
                match self.outbound_tx.send_timeout(pkt, BACKPRESSURE_WAIT) {
                    Ok(()) => {
                        if self.kind == BackingKind::Local {
                            self.metrics.record_sent(packet.len());
                        }
                        Ok(())
                    }
                    Err(_) => {
                        warn!(peer = %self.peer, "outbound queue full, dropping packet");
                        Ok(())
                    }
                }
            }
            Err(TrySendError::Disconnected(_)) => Err(ConnectionError::Closed),
        }
    }

    fn fill_window(&mut self) {
        while let Ok(packet) = self.inbound_rx.try_recv() {
            if self.kind == BackingKind::Local {
                self.metrics.record_received(packet.len());
            }
            self.window.push_back(packet);
        }
    }

    pub fn has_incoming(&mut self) -> bool {
        self.fill_window();
        !self.window.is_empty()
    }

    /// Non-destructive look at the n-th buffered inbound packet.
    pub fn peek(&mut self, n: usize) -> Option<RawPacket> {
        self.fill_window();
        self.window.get(n).cloned()
    }

    /// Remove and return the oldest inbound packet.
    pub fn next(&mut self) -> Option<RawPacket> {
        self.fill_window();
        self.window.pop_front()
    }

    /// Drain inbound into the window, attempt reconnect when warranted, and
    /// emit metrics on the configured cadence. Reconnect attempts are
    /// abandoned once the connection has been degraded longer than the
    /// configured reconnect timeout.
    pub fn update(&mut self) {
        self.fill_window();
        if self.needs_reconnect() {
            self.state = ConnectionState::Degraded;
            let since = *self.degraded_since.get_or_insert_with(Instant::now);
            if since.elapsed() <= self.reconnect_timeout && self.can_reconnect() {
                match self.reconnect() {
                    Ok(()) => info!(peer = %self.peer, "reconnected"),
                    Err(err) => warn!(peer = %self.peer, %err, "reconnect failed"),
                }
            }
        } else {
            self.degraded_since = None;
        }
        if self.metrics.should_emit(self.metrics_interval) {
            debug!(peer = %self.peer, stats = %self.metrics.snapshot(), "connection metrics");
        }
    }

    pub fn needs_reconnect(&self) -> bool {
        self.metrics.failed_send_attempts() > RECONNECT_THRESHOLD
    }

    pub fn can_reconnect(&self) -> bool {
        self.can_reconnect && self.endpoint.is_some()
    }

    /// Re-open the underlying transport. The inbound window is preserved.
    pub fn reconnect(&mut self) -> Result<(), ConnectionError> {
        if !self.can_reconnect {
            return Err(ConnectionError::ReconnectForbidden);
        }
        let Some(inner) = self.endpoint.as_ref() else {
            return Err(ConnectionError::ReconnectForbidden);
        };
        {
            let mut transport = inner.transport.lock();
            transport.destroy();
            transport.setup(&inner.host, inner.port)?;
        }
        self.metrics.reset_failures();
        self.degraded_since = None;
        self.state = ConnectionState::Running;
        Ok(())
    }

    /// Best-effort wait for the outbound queue to drain.
    pub fn flush(&self, forced: bool) {
        let deadline = Instant::now()
            + if forced {
                Duration::from_secs(1)
            } else {
                Duration::from_millis(100)
            };
        while !self.outbound_tx.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stop this connection. Idempotent; with `flush` the outbound queue is
    /// drained first.
    pub fn close(&mut self, flush: bool) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        if flush {
            self.flush(true);
        }
        self.state = ConnectionState::Closing;
        if let Some(inner) = &self.endpoint {
            inner.registry.lock().remove(&self.peer);
            if let Some(redundancy) = &inner.redundancy {
                redundancy.lock().remove_peer(&self.peer);
            }
        }
        self.state = ConnectionState::Closed;
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            peer: self.peer.clone(),
            kind: self.kind,
            state: self.state,
            queued_outbound: self.outbound_tx.len(),
            metrics: self.metrics.snapshot(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close(false);
    }
}
