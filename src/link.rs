//! The transport link: one ordered, reliable, message-framed connection
//! between two peers, carrying binary frames and short text commands.
//!
//! The link owns the socket pair, the bounded outbound queue, the
//! heartbeat timer and the liveness watchdog. Everything above it —
//! engines, dispatchers, the pending table — sends through one
//! [`Link::send_frame`] entry point and receives through one inbound
//! channel, so no component ever holds a reference to its peers.
//!
//! A link outlives its sockets. While no socket is attached, outbound
//! frames accumulate in the queue (up to the configured bound; overflow
//! drops the new frame, never reorders). [`Link::attach`] binds a fresh
//! socket and drains the queue in FIFO order, which is what makes the
//! reconnect grace window work.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{TunnelError, TunnelResult};
use crate::proto::{self, Frame, Kind, timeouts};

/// One message on the underlying socket, shared by every endpoint flavor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    Binary(Bytes),
    Text(String),
    Ping,
    Pong,
    Close,
}

impl SocketMessage {
    fn cost(&self) -> usize {
        match self {
            SocketMessage::Binary(b) => b.len(),
            SocketMessage::Text(t) => t.len(),
            _ => 0,
        }
    }
}

/// Write half of a transport socket.
#[async_trait]
pub trait SocketTx: Send {
    async fn send(&mut self, msg: SocketMessage) -> std::io::Result<()>;
    /// Best-effort close notification; errors are ignored by the link.
    async fn close(&mut self);
}

/// Read half of a transport socket. `None` means the peer is gone.
#[async_trait]
pub trait SocketRx: Send {
    async fn recv(&mut self) -> Option<std::io::Result<SocketMessage>>;
}

/// Inbound traffic handed to the dispatcher, already split by channel.
#[derive(Debug)]
pub enum Inbound {
    Frame(Frame),
    Text(String),
}

/// Link state transitions observed by the session layer.
///
/// `TimedOut` means the grace window elapsed with no reconnect; the
/// egress side responds by destroying every stream of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    TimedOut,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub reconnect_grace: Duration,
    pub queue_limit: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: timeouts::HEARTBEAT_INTERVAL,
            heartbeat_timeout: timeouts::HEARTBEAT_TIMEOUT,
            reconnect_grace: timeouts::RECONNECT_TIMEOUT,
            queue_limit: proto::MAX_QUEUE_SIZE,
        }
    }
}

/// Counters surfaced by the `STATS` control verb.
#[derive(Debug, Default)]
pub struct LinkStats {
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub frames_dropped: AtomicU64,
}

pub struct Link {
    cfg: LinkConfig,
    queue: Mutex<VecDeque<SocketMessage>>,
    queue_notify: Notify,
    buffered: AtomicUsize,
    state: Mutex<LinkState>,
    /// Bumped on every attach; tasks from an older socket generation
    /// must not mutate link state when they die late.
    socket_epoch: AtomicU64,
    socket_token: Mutex<CancellationToken>,
    shutdown: CancellationToken,
    events: broadcast::Sender<LinkEvent>,
    inbound: mpsc::Sender<Inbound>,
    pub stats: LinkStats,
}

impl Link {
    pub fn new(cfg: LinkConfig) -> (Arc<Link>, mpsc::Receiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(16);
        let link = Arc::new(Link {
            cfg,
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            buffered: AtomicUsize::new(0),
            state: Mutex::new(LinkState::Connecting),
            socket_epoch: AtomicU64::new(0),
            socket_token: Mutex::new(CancellationToken::new()),
            shutdown: CancellationToken::new(),
            events,
            inbound: inbound_tx,
            stats: LinkStats::default(),
        });
        (link, inbound_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().expect("link state lock")
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Socket send-buffer depth as seen by the engines: bytes enqueued
    /// but not yet handed to the sink.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    /// Cooperative backpressure: parks the caller until the buffered
    /// depth falls under `threshold`.
    pub async fn yield_while_buffered(&self, threshold: usize) {
        while self.buffered_bytes() > threshold {
            tokio::time::sleep(timeouts::BACKPRESSURE_POLL).await;
        }
    }

    pub fn send_frame(&self, frame: Frame) -> TunnelResult<()> {
        trace!(kind = ?frame.kind, resource_id = frame.resource_id, "send frame");
        self.stats.frames_out.fetch_add(1, Ordering::Relaxed);
        self.enqueue(SocketMessage::Binary(frame.encode()))
    }

    pub fn send_text(&self, text: String) -> TunnelResult<()> {
        self.enqueue(SocketMessage::Text(text))
    }

    fn enqueue(&self, msg: SocketMessage) -> TunnelResult<()> {
        if self.state() == LinkState::Closed {
            return Err(TunnelError::ConnectionClosed);
        }
        let cost = msg.cost();
        {
            let mut queue = self.queue.lock().expect("link queue lock");
            if queue.len() >= self.cfg.queue_limit {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    limit = self.cfg.queue_limit,
                    "send queue full, dropping frame"
                );
                return Err(TunnelError::QueueFull);
            }
            queue.push_back(msg);
        }
        self.buffered.fetch_add(cost, Ordering::Relaxed);
        self.queue_notify.notify_one();
        Ok(())
    }

    fn dequeue(&self) -> Option<SocketMessage> {
        self.queue.lock().expect("link queue lock").pop_front()
    }

    /// Binds a fresh socket to this link, replacing any previous one.
    /// At most one socket is live at a time: the previous generation's
    /// tasks are cancelled before the new ones start.
    pub fn attach(
        self: &Arc<Self>,
        tx: Box<dyn SocketTx>,
        rx: Box<dyn SocketRx>,
    ) {
        if self.state() == LinkState::Closed {
            warn!("ignoring socket attach on a closed link");
            return;
        }
        let epoch = self.socket_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let token = {
            let mut slot = self.socket_token.lock().expect("socket token lock");
            slot.cancel();
            let fresh = self.shutdown.child_token();
            *slot = fresh.clone();
            fresh
        };
        *self.state.lock().expect("link state lock") = LinkState::Connected;
        let _ = self.events.send(LinkEvent::Connected);
        debug!(epoch, "socket attached");

        tokio::spawn(self.clone().write_loop(tx, token.clone(), epoch));
        tokio::spawn(self.clone().read_loop(rx, token, epoch));
    }

    /// Permanently closes the link: cancels socket tasks, rejects future
    /// sends and emits `Closed`.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("link state lock");
        if *state == LinkState::Closed {
            return;
        }
        *state = LinkState::Closed;
        drop(state);
        self.shutdown.cancel();
        let _ = self.events.send(LinkEvent::Closed);
    }

    async fn write_loop(
        self: Arc<Self>,
        mut tx: Box<dyn SocketTx>,
        token: CancellationToken,
        epoch: u64,
    ) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                msg = self.next_outbound() => msg,
            };
            let cost = msg.cost();
            let result = tx.send(msg).await;
            self.buffered.fetch_sub(cost, Ordering::Relaxed);
            if let Err(e) = result {
                debug!(error = %e, "socket write failed");
                token.cancel();
                self.socket_down(epoch);
                return;
            }
        }
        tx.close().await;
    }

    async fn next_outbound(&self) -> SocketMessage {
        loop {
            if let Some(msg) = self.dequeue() {
                return msg;
            }
            self.queue_notify.notified().await;
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut rx: Box<dyn SocketRx>,
        token: CancellationToken,
        epoch: u64,
    ) {
        // First heartbeat one interval after connect, not immediately.
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.cfg.heartbeat_interval,
            self.cfg.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut deadline = Instant::now() + self.cfg.heartbeat_timeout;

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = heartbeat.tick() => {
                    let _ = self.send_frame(Frame::heartbeat());
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("heartbeat watchdog expired, dropping socket");
                    token.cancel();
                    self.socket_down(epoch);
                    return;
                }
                msg = rx.recv() => {
                    deadline = Instant::now() + self.cfg.heartbeat_timeout;
                    match msg {
                        Some(Ok(msg)) => {
                            if !self.handle_message(msg).await {
                                token.cancel();
                                self.socket_down(epoch);
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            debug!(error = %e, "socket read failed");
                            token.cancel();
                            self.socket_down(epoch);
                            return;
                        }
                        None => {
                            debug!("socket closed by peer");
                            token.cancel();
                            self.socket_down(epoch);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Routes one inbound message. Returns `false` when the socket
    /// should be torn down.
    async fn handle_message(&self, msg: SocketMessage) -> bool {
        match msg {
            SocketMessage::Binary(bytes) => {
                let frame = match Frame::decode(bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable frame");
                        return true;
                    }
                };
                self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
                match frame.kind {
                    // Receiving a heartbeat only refreshes the watchdog.
                    // Never echo one back: the sender drives its own
                    // timer, and an echo would ping-pong forever.
                    Kind::Heartbeat => {
                        trace!("heartbeat received");
                        true
                    }
                    Kind::Unknown(octet) => {
                        warn!(
                            octet = %format_args!("{octet:#04x}"),
                            resource_id = frame.resource_id,
                            "dropping frame of unknown type"
                        );
                        true
                    }
                    _ => self.inbound.send(Inbound::Frame(frame)).await.is_ok(),
                }
            }
            SocketMessage::Text(text) => {
                self.inbound.send(Inbound::Text(text)).await.is_ok()
            }
            // Protocol-level pings refresh the watchdog (already done by
            // the caller); the endpoint adapters answer them themselves.
            SocketMessage::Ping | SocketMessage::Pong => true,
            SocketMessage::Close => false,
        }
    }

    fn socket_down(self: &Arc<Self>, epoch: u64) {
        if self.socket_epoch.load(Ordering::SeqCst) != epoch {
            // A newer socket already took over.
            return;
        }
        {
            let mut state = self.state.lock().expect("link state lock");
            if matches!(*state, LinkState::Disconnected | LinkState::Closed) {
                return;
            }
            *state = LinkState::Disconnected;
        }
        let _ = self.events.send(LinkEvent::Disconnected);
        debug!(epoch, "socket down, grace window opens");

        let link = self.clone();
        let grace = self.cfg.reconnect_grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = link.shutdown.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if link.socket_epoch.load(Ordering::SeqCst) == epoch
                        && link.state() == LinkState::Disconnected
                    {
                        debug!(epoch, "grace window elapsed without reconnect");
                        let _ = link.events.send(LinkEvent::TimedOut);
                    }
                }
            }
        });
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    fn fast_config() -> LinkConfig {
        LinkConfig {
            heartbeat_interval: Duration::from_secs(3600),
            heartbeat_timeout: Duration::from_secs(3600),
            reconnect_grace: Duration::from_secs(3600),
            queue_limit: proto::MAX_QUEUE_SIZE,
        }
    }

    #[tokio::test]
    async fn queue_bound_drops_new_frames_and_preserves_order() {
        let mut cfg = fast_config();
        cfg.queue_limit = 10;
        let (link, _inbound) = Link::new(cfg);

        for i in 0..13u32 {
            let result = link.send_frame(Frame::empty(Kind::TcpData, i));
            if i < 10 {
                assert!(result.is_ok(), "frame {i} should be queued");
            } else {
                assert!(
                    matches!(result, Err(TunnelError::QueueFull)),
                    "frame {i} should be dropped"
                );
            }
        }

        let ((tx, rx), _peer_tx, mut peer_rx) = raw_socket();
        link.attach(Box::new(tx), Box::new(rx));

        for expected in 0..10u32 {
            let msg = peer_rx.recv().await.unwrap();
            let SocketMessage::Binary(bytes) = msg else {
                panic!("expected binary message");
            };
            let frame = Frame::decode(bytes).unwrap();
            assert_eq!(frame.resource_id, expected);
        }
        assert!(peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn heartbeat_is_not_echoed() {
        let (link, mut inbound) = Link::new(fast_config());
        let ((tx, rx), peer_tx, mut peer_rx) = raw_socket();
        link.attach(Box::new(tx), Box::new(rx));

        peer_tx
            .send(SocketMessage::Binary(Frame::heartbeat().encode()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(peer_rx.try_recv().is_err(), "no frame may be sent back");
        assert!(inbound.try_recv().is_err(), "heartbeats stay in the link");
    }

    #[tokio::test]
    async fn unknown_kinds_are_dropped_not_fatal() {
        let (link, mut inbound) = Link::new(fast_config());
        let ((tx, rx), peer_tx, _peer_rx) = raw_socket();
        link.attach(Box::new(tx), Box::new(rx));

        peer_tx
            .send(SocketMessage::Binary(
                Frame::empty(Kind::Unknown(0x7A), 5).encode(),
            ))
            .await
            .unwrap();
        peer_tx
            .send(SocketMessage::Binary(
                Frame::empty(Kind::TcpClose, 6).encode(),
            ))
            .await
            .unwrap();

        // The good frame after the unknown one still arrives.
        let Inbound::Frame(frame) = inbound.recv().await.unwrap() else {
            panic!("expected frame");
        };
        assert_eq!(frame.kind, Kind::TcpClose);
        assert_eq!(frame.resource_id, 6);
    }

    #[tokio::test]
    async fn watchdog_expiry_disconnects() {
        let mut cfg = fast_config();
        cfg.heartbeat_timeout = Duration::from_millis(50);
        let (link, _inbound) = Link::new(cfg);
        let mut events = link.subscribe();

        let ((tx, rx), _peer_tx, _peer_rx) = raw_socket();
        link.attach(Box::new(tx), Box::new(rx));
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Connected);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Disconnected);
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn grace_expiry_emits_timeout() {
        let mut cfg = fast_config();
        cfg.reconnect_grace = Duration::from_millis(50);
        let (link, _inbound) = Link::new(cfg);
        let mut events = link.subscribe();

        let ((tx, rx), peer_tx, _peer_rx) = raw_socket();
        link.attach(Box::new(tx), Box::new(rx));
        drop(peer_tx); // peer goes away

        assert_eq!(events.recv().await.unwrap(), LinkEvent::Connected);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Disconnected);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::TimedOut);
    }

    #[tokio::test]
    async fn reconnect_within_grace_suppresses_timeout() {
        let mut cfg = fast_config();
        cfg.reconnect_grace = Duration::from_millis(100);
        let (link, _inbound) = Link::new(cfg);
        let mut events = link.subscribe();

        let ((tx, rx), peer_tx, _peer_rx) = raw_socket();
        link.attach(Box::new(tx), Box::new(rx));
        drop(peer_tx);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Connected);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Disconnected);

        // Reconnect before the grace window elapses.
        let ((tx2, rx2), _peer_tx2, _peer_rx2) = raw_socket();
        link.attach(Box::new(tx2), Box::new(rx2));
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Connected);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)),
            "no TimedOut may fire after a successful reconnect"
        );
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn frames_queued_while_disconnected_flush_on_reconnect() {
        let (link, _inbound) = Link::new(fast_config());
        let ((tx, rx), peer_tx, _peer_rx) = raw_socket();
        link.attach(Box::new(tx), Box::new(rx));
        drop(peer_tx);
        while link.state() != LinkState::Disconnected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        link.send_frame(Frame::empty(Kind::TcpData, 42)).unwrap();

        let ((tx2, rx2), _peer_tx2, mut peer_rx2) = raw_socket();
        link.attach(Box::new(tx2), Box::new(rx2));
        let SocketMessage::Binary(bytes) = peer_rx2.recv().await.unwrap() else {
            panic!("expected binary message");
        };
        assert_eq!(Frame::decode(bytes).unwrap().resource_id, 42);
    }
}
