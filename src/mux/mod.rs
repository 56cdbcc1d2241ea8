//! Ingress-side core: allocates resource ids, sends the opening frame of
//! each stream class, and joins the egress peer's replies back to their
//! awaiters through the pending table.
//!
//! The dispatcher here is the ingress half of the demultiplexer: it runs
//! on one task per link, never suspends before updating the table for
//! the frame at hand, and answers frames for unknown resource ids with
//! the matching terminal so a leaking peer cleans up.

mod handles;
mod pending;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

pub use handles::{HttpCall, HttpResponse, TcpTunnel, UdpTunnel};
use pending::{DnsPending, HttpPending, Pending, PendingTable, TcpPending, UdpPending};

use crate::command::{self, Command, CommandContext, CommandResponse};
use crate::error::{TunnelError, TunnelResult};
use crate::link::{Inbound, Link, LinkEvent};
use crate::proto::wire::{
    ConnectTarget, DnsQuery, DnsResponse, HttpRequestMeta, RecordType, UdpEndpoint, UdpPacket,
};
use crate::proto::{Frame, Kind, timeouts};

/// Cadence of the pending-table reaper sweep.
const REAPER_SWEEP: std::time::Duration = std::time::Duration::from_secs(30);

pub struct TunnelClient {
    link: Arc<Link>,
    pending: Arc<PendingTable>,
    /// Next candidate resource id. Ids live in `[1, u32::MAX]`; zero is
    /// reserved for heartbeats and control.
    next_id: AtomicU32,
    uuid: String,
    started: Instant,
    pub reconnects: AtomicU64,
}

impl TunnelClient {
    /// Builds the client core and spawns its dispatcher and reaper on
    /// the given link.
    pub fn spawn(
        link: Arc<Link>,
        inbound: mpsc::Receiver<Inbound>,
        max_pending: usize,
    ) -> Arc<TunnelClient> {
        let client = Arc::new(TunnelClient {
            link,
            pending: Arc::new(PendingTable::new(max_pending)),
            next_id: AtomicU32::new(1),
            uuid: uuid::Uuid::new_v4().simple().to_string(),
            started: Instant::now(),
            reconnects: AtomicU64::new(0),
        });
        // Subscribe before returning so no event can slip past between
        // the caller's attach and the dispatcher starting up.
        let events = client.link.subscribe();
        tokio::spawn(client.clone().dispatch_loop(inbound, events));
        tokio::spawn(client.clone().reaper_loop());
        client
    }

    /// Session identity published to the egress peer via `SET UUID` and
    /// used for `?id=` reattachment.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Permanently shuts the tunnel down, failing every awaiter.
    pub fn close(&self) {
        self.link.close();
        self.pending.reject_all(|| TunnelError::ConnectionClosed);
    }

    fn alloc_id(&self) -> u32 {
        loop {
            let id = self
                .next_id
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    Some(if n == u32::MAX { 1 } else { n + 1 })
                })
                .expect("id allocator never yields None");
            // After a wrap, skip ids that still have a live handler.
            if !self.pending.contains(id) {
                return id;
            }
        }
    }

    /// Opens a TCP connection through the egress peer.
    pub async fn connect_tcp(&self, host: &str, port: u16) -> TunnelResult<TcpTunnel> {
        let id = self.alloc_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::channel(64);
        self.pending.insert(
            id,
            Pending::Tcp(TcpPending {
                reply: Some(reply_tx),
                data: data_tx,
                created: Instant::now(),
            }),
        )?;
        let target = ConnectTarget {
            host: host.to_owned(),
            port,
        };
        if let Err(e) = self
            .link
            .send_frame(Frame::new(Kind::TcpConnect, id, target.encode()))
        {
            self.pending.remove(id);
            return Err(e);
        }
        match tokio::time::timeout(timeouts::REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(Ok(()))) => Ok(TcpTunnel::new(
                id,
                data_rx,
                self.link.clone(),
                self.pending.clone(),
            )),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TunnelError::ConnectionClosed),
            Err(_) => {
                if let Some(p) = self.pending.remove(id) {
                    p.finalize();
                }
                Err(TunnelError::Timeout)
            }
        }
    }

    /// Allocates a UDP socket on the egress peer. The requested address
    /// is advisory; the egress binds an ephemeral port and reports it.
    pub async fn bind_udp(&self) -> TunnelResult<UdpTunnel> {
        let id = self.alloc_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::channel(64);
        self.pending.insert(
            id,
            Pending::Udp(UdpPending {
                reply: Some(reply_tx),
                data: data_tx,
                created: Instant::now(),
            }),
        )?;
        let requested = UdpEndpoint {
            host: "0.0.0.0".to_owned(),
            port: 0,
        };
        if let Err(e) = self
            .link
            .send_frame(Frame::new(Kind::UdpBind, id, requested.encode()))
        {
            self.pending.remove(id);
            return Err(e);
        }
        match tokio::time::timeout(timeouts::REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(Ok(local))) => Ok(UdpTunnel::new(
                id,
                local,
                data_rx,
                self.link.clone(),
                self.pending.clone(),
            )),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TunnelError::ConnectionClosed),
            Err(_) => {
                if let Some(p) = self.pending.remove(id) {
                    p.finalize();
                }
                Err(TunnelError::Timeout)
            }
        }
    }

    /// Resolves a name on the egress peer's network.
    pub async fn query_dns(
        &self,
        name: &str,
        record_type: RecordType,
        deadline: std::time::Duration,
    ) -> TunnelResult<Vec<String>> {
        let query = DnsQuery {
            name: name.to_owned(),
            record_type,
        };
        let payload = query.encode()?;
        let id = self.alloc_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(
            id,
            Pending::Dns(DnsPending {
                reply: Some(reply_tx),
                created: Instant::now(),
            }),
        )?;
        if let Err(e) = self.link.send_frame(Frame::new(Kind::DnsQuery, id, payload)) {
            self.pending.remove(id);
            return Err(e);
        }
        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TunnelError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(id);
                Err(TunnelError::Timeout)
            }
        }
    }

    /// Starts an HTTP exchange. The body channel is installed before the
    /// request frame is sent, so response chunks can never outrun it.
    pub fn fetch_http(&self, request: HttpRequestMeta) -> TunnelResult<HttpCall> {
        let parsed =
            url::Url::parse(&request.url).map_err(|e| TunnelError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TunnelError::InvalidUrl(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }
        let id = self.alloc_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(64);
        self.pending.insert(
            id,
            Pending::Http(HttpPending {
                reply: Some(reply_tx),
                body: body_tx,
                created: Instant::now(),
            }),
        )?;
        if let Err(e) = self
            .link
            .send_frame(Frame::new(Kind::HttpRequest, id, request.encode()))
        {
            self.pending.remove(id);
            return Err(e);
        }
        Ok(HttpCall::new(
            id,
            reply_rx,
            body_rx,
            self.link.clone(),
            self.pending.clone(),
        ))
    }

    async fn reaper_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(REAPER_SWEEP);
        loop {
            tick.tick().await;
            let reaped = self.pending.reap(timeouts::PENDING_REAPER);
            if reaped > 0 {
                warn!(reaped, "reaped stale pending requests");
            }
        }
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Inbound>,
        mut events: broadcast::Receiver<LinkEvent>,
    ) {
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(Inbound::Frame(frame)) => self.handle_frame(frame).await,
                    Some(Inbound::Text(text)) => self.handle_text(text),
                    None => break,
                },
                event = events.recv() => match event {
                    // A dropped socket fails the awaiters still waiting
                    // on a first reply; established streams survive
                    // toward a reconnect within the grace window.
                    Ok(LinkEvent::Disconnected) => {
                        self.pending.reject_unreplied(|| TunnelError::ConnectionClosed);
                    }
                    Ok(LinkEvent::TimedOut) => {
                        self.pending.reject_all(|| TunnelError::ConnectionClosed);
                    }
                    Ok(LinkEvent::Closed) => {
                        self.pending.reject_all(|| TunnelError::ConnectionClosed);
                        break;
                    }
                    Ok(LinkEvent::Connected) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("ingress dispatcher stopped");
    }

    async fn handle_frame(&self, frame: Frame) {
        let id = frame.resource_id;
        match frame.kind {
            Kind::TcpConnectAck => {
                let Some(mut entry) = self.pending.get_mut(id) else {
                    return self.late_frame(frame.kind, id);
                };
                if let Pending::Tcp(tcp) = entry.value_mut() {
                    if let Some(reply) = tcp.reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                } else {
                    warn!(resource_id = id, "connect ack for a non-tcp stream");
                }
            }
            Kind::TcpData => {
                // Clone the sender out of the table so the map guard is
                // not held across the await below.
                let sender = match self.pending.get_mut(id).as_deref() {
                    Some(Pending::Tcp(tcp)) => Some(tcp.data.clone()),
                    Some(_) => None,
                    None => None,
                };
                let Some(sender) = sender else {
                    return self.late_frame(frame.kind, id);
                };
                if sender.send(Ok(frame.payload)).await.is_err() {
                    // Consumer went away; tear the stream down.
                    self.pending.remove(id);
                    let _ = self.link.send_frame(Frame::empty(Kind::TcpClose, id));
                }
            }
            Kind::TcpClose | Kind::UdpClose => {
                if let Some(pending) = self.pending.remove(id) {
                    pending.finalize();
                }
                // Late closes are silently dropped.
            }
            Kind::UdpBindAck => {
                let reply = match self.pending.get_mut(id).as_deref_mut() {
                    Some(Pending::Udp(udp)) => udp.reply.take(),
                    Some(_) => None,
                    None => return self.late_frame(frame.kind, id),
                };
                if let Some(reply) = reply {
                    let result =
                        UdpEndpoint::decode(&frame.payload).map_err(TunnelError::Decode);
                    let failed = result.is_err();
                    let _ = reply.send(result);
                    if failed {
                        // No usable stream can follow a bad ack.
                        self.pending.remove(id);
                    }
                }
            }
            Kind::UdpData => {
                let sender = match self.pending.get_mut(id).as_deref() {
                    Some(Pending::Udp(udp)) => Some(udp.data.clone()),
                    _ => None,
                };
                let Some(sender) = sender else {
                    return self.late_frame(frame.kind, id);
                };
                match UdpPacket::decode(&frame.payload) {
                    Ok(packet) => {
                        if sender.send(Ok(packet)).await.is_err() {
                            self.pending.remove(id);
                            let _ = self.link.send_frame(Frame::empty(Kind::UdpClose, id));
                        }
                    }
                    Err(e) => warn!(resource_id = id, error = %e, "bad udp payload"),
                }
            }
            Kind::DnsResponse => {
                let Some(pending) = self.pending.remove(id) else {
                    return;
                };
                if let Pending::Dns(mut dns) = pending {
                    if let Some(reply) = dns.reply.take() {
                        let result = DnsResponse::decode(&frame.payload)
                            .map(|r| r.addresses)
                            .map_err(TunnelError::Decode);
                        let _ = reply.send(result);
                    }
                }
            }
            Kind::HttpResponse => {
                let reply = match self.pending.get_mut(id).as_deref_mut() {
                    Some(Pending::Http(http)) => http.reply.take(),
                    Some(_) => None,
                    None => return self.late_frame(frame.kind, id),
                };
                if let Some(reply) = reply {
                    let result = crate::proto::wire::HttpResponseMeta::decode(&frame.payload)
                        .map_err(TunnelError::Decode);
                    let failed = result.is_err();
                    let _ = reply.send(result);
                    if failed {
                        self.pending.remove(id);
                    }
                }
            }
            Kind::HttpBodyChunk => {
                let sender = match self.pending.get_mut(id).as_deref() {
                    Some(Pending::Http(http)) => Some(http.body.clone()),
                    _ => None,
                };
                let Some(sender) = sender else {
                    return self.late_frame(frame.kind, id);
                };
                if sender.send(Ok(frame.payload)).await.is_err() {
                    self.pending.remove(id);
                    let _ = self.link.send_frame(Frame::empty(Kind::HttpBodyEnd, id));
                }
            }
            Kind::HttpBodyEnd => {
                if let Some(pending) = self.pending.remove(id) {
                    pending.finalize();
                }
            }
            Kind::Error => {
                let message = String::from_utf8_lossy(&frame.payload).into_owned();
                debug!(resource_id = id, error = %message, "peer reported stream error");
                if let Some(pending) = self.pending.remove(id) {
                    pending.reject(TunnelError::Upstream(message));
                }
            }
            // Egress-addressed requests reaching the ingress peer mean a
            // leaked stream on the other side; force it to clean up.
            Kind::TcpConnect | Kind::UdpBind | Kind::DnsQuery | Kind::HttpRequest => {
                self.late_frame(frame.kind, id);
            }
            // Heartbeats and unknown kinds never leave the link.
            Kind::Heartbeat | Kind::Unknown(_) => {}
        }
    }

    fn late_frame(&self, kind: Kind, id: u32) {
        debug!(?kind, resource_id = id, "frame for unknown stream");
        if let Some(terminal) = kind.late_reply() {
            let _ = self.link.send_frame(Frame::empty(terminal, id));
        }
    }

    fn handle_text(&self, text: String) {
        // JSON on the text channel is a reply to one of our own
        // commands, not a command.
        if text.trim_start().starts_with('{') {
            debug!(response = %text, "command response");
            return;
        }
        let parsed = command::parse(&text);
        let response = match &parsed {
            Command::SetUuid(_) => Some(CommandResponse::fail(
                "SET UUID is only accepted by the egress peer",
            )),
            Command::SetLogLevel(_) => Some(CommandResponse::fail(
                "SET LOGLEVEL is only accepted by the egress peer",
            )),
            other => command::respond(other, &self.command_context()),
        };
        if let Some(response) = response {
            let _ = self.link.send_text(response.render());
        }
    }

    fn command_context(&self) -> CommandContext {
        CommandContext {
            role: "ingress",
            started_at_millis: chrono::Utc::now().timestamp_millis()
                - self.started.elapsed().as_millis() as i64,
            uptime_secs: self.started.elapsed().as_secs(),
            sessions: usize::from(self.link.is_connected()),
            streams: self.pending.len(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::link::testutil::raw_socket;
    use crate::link::{LinkConfig, SocketMessage};
    use crate::proto::MAX_PENDING_REQUESTS;

    fn fast_link_config() -> LinkConfig {
        LinkConfig {
            heartbeat_interval: std::time::Duration::from_secs(3600),
            heartbeat_timeout: std::time::Duration::from_secs(3600),
            reconnect_grace: std::time::Duration::from_secs(3600),
            ..LinkConfig::default()
        }
    }

    /// A scripted egress peer on the far end of a raw socket.
    struct FakeEgress {
        tx: tokio::sync::mpsc::Sender<SocketMessage>,
        rx: tokio::sync::mpsc::Receiver<SocketMessage>,
    }

    impl FakeEgress {
        async fn expect_frame(&mut self) -> Frame {
            loop {
                match self.rx.recv().await.expect("peer socket open") {
                    SocketMessage::Binary(bytes) => {
                        let frame = Frame::decode(bytes).unwrap();
                        // Skip the link's own heartbeats.
                        if frame.kind != Kind::Heartbeat {
                            return frame;
                        }
                    }
                    SocketMessage::Text(_) => continue,
                    other => panic!("unexpected socket message: {other:?}"),
                }
            }
        }

        async fn send_frame(&self, frame: Frame) {
            self.tx
                .send(SocketMessage::Binary(frame.encode()))
                .await
                .expect("peer socket open");
        }
    }

    fn client_with_peer() -> (Arc<TunnelClient>, FakeEgress) {
        let (link, inbound) = Link::new(fast_link_config());
        let client = TunnelClient::spawn(link.clone(), inbound, MAX_PENDING_REQUESTS);
        let ((tx, rx), peer_tx, peer_rx) = raw_socket();
        link.attach(Box::new(tx), Box::new(rx));
        (
            client,
            FakeEgress {
                tx: peer_tx,
                rx: peer_rx,
            },
        )
    }

    #[tokio::test]
    async fn tcp_echo_exchanges_expected_frames_in_order() {
        let (client, mut peer) = client_with_peer();

        let egress = tokio::spawn(async move {
            let connect = peer.expect_frame().await;
            assert_eq!(connect.kind, Kind::TcpConnect);
            assert_eq!(connect.resource_id, 1);
            let target = ConnectTarget::decode(&connect.payload).unwrap();
            assert_eq!(target.host, "127.0.0.1");
            assert_eq!(target.port, 9);
            peer.send_frame(Frame::empty(Kind::TcpConnectAck, 1)).await;

            let data = peer.expect_frame().await;
            assert_eq!(data.kind, Kind::TcpData);
            assert_eq!(&data.payload[..], b"hello");
            // Echo it back.
            peer.send_frame(Frame::new(Kind::TcpData, 1, data.payload))
                .await;

            let close = peer.expect_frame().await;
            assert_eq!(close.kind, Kind::TcpClose);
            assert_eq!(close.resource_id, 1);
            peer
        });

        let mut tunnel = client.connect_tcp("127.0.0.1", 9).await.unwrap();
        tunnel.send(Bytes::from_static(b"hello")).await.unwrap();
        let echoed = tunnel.recv().await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"hello");
        tunnel.close();

        egress.await.unwrap();
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn id_allocation_is_monotonic_and_wraps_to_one() {
        let (client, _peer) = client_with_peer();
        assert_eq!(client.alloc_id(), 1);
        assert_eq!(client.alloc_id(), 2);
        client.next_id.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(client.alloc_id(), u32::MAX);
        assert_eq!(client.alloc_id(), 1, "wraps past zero back to one");
    }

    #[tokio::test]
    async fn wrapped_allocation_skips_ids_with_live_handlers() {
        let (client, _peer) = client_with_peer();
        let (tx, _rx) = oneshot::channel();
        let (data_tx, _data_rx) = mpsc::channel(1);
        client
            .pending
            .insert(
                1,
                Pending::Tcp(TcpPending {
                    reply: Some(tx),
                    data: data_tx,
                    created: Instant::now(),
                }),
            )
            .unwrap();
        client.next_id.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(client.alloc_id(), u32::MAX);
        assert_eq!(client.alloc_id(), 2, "id 1 is still pending and skipped");
    }

    #[tokio::test]
    async fn late_frames_are_answered_with_matching_terminals() {
        let (_client, mut peer) = client_with_peer();

        peer.send_frame(Frame::new(Kind::TcpData, 99, Bytes::from_static(b"x")))
            .await;
        let reply = peer.expect_frame().await;
        assert_eq!(reply.kind, Kind::TcpClose);
        assert_eq!(reply.resource_id, 99);

        peer.send_frame(Frame::new(Kind::HttpBodyChunk, 7, Bytes::from_static(b"y")))
            .await;
        let reply = peer.expect_frame().await;
        assert_eq!(reply.kind, Kind::HttpBodyEnd);
        assert_eq!(reply.resource_id, 7);

        // Late terminals are silently dropped.
        peer.send_frame(Frame::empty(Kind::TcpClose, 100)).await;
        peer.send_frame(Frame::new(Kind::TcpData, 101, Bytes::from_static(b"z")))
            .await;
        let reply = peer.expect_frame().await;
        assert_eq!(reply.resource_id, 101, "no reply was sent for the close");
    }

    #[tokio::test]
    async fn error_frame_rejects_the_awaiter() {
        let (client, mut peer) = client_with_peer();

        let egress = tokio::spawn(async move {
            let connect = peer.expect_frame().await;
            assert_eq!(connect.kind, Kind::TcpConnect);
            peer.send_frame(Frame::error(connect.resource_id, "connection refused"))
                .await;
        });

        let result = client.connect_tcp("10.0.0.1", 81).await;
        match result {
            Err(TunnelError::Upstream(message)) => assert_eq!(message, "connection refused"),
            other => panic!("expected upstream error, got {other:?}"),
        }
        egress.await.unwrap();
    }

    #[tokio::test]
    async fn transport_loss_rejects_in_flight_requests() {
        let (client, peer) = client_with_peer();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.connect_tcp("example.com", 443).await })
        };
        // Wait for the request to hit the wire, then kill the transport.
        let mut peer = peer;
        let frame = peer.expect_frame().await;
        assert_eq!(frame.kind, Kind::TcpConnect);
        drop(peer);

        match pending.await.unwrap() {
            Err(TunnelError::ConnectionClosed) => {}
            other => panic!("expected connection closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dns_query_round_trips_the_wire_vectors() {
        let (client, mut peer) = client_with_peer();

        let egress = tokio::spawn(async move {
            let query = peer.expect_frame().await;
            assert_eq!(query.kind, Kind::DnsQuery);
            assert_eq!(
                &query.payload[..],
                [0x06, 0x00, b'a', b'.', b't', b'e', b's', b't', 0x00]
            );
            let response = DnsResponse {
                addresses: vec!["1.2.3.4".into(), "5.6.7.8".into()],
            };
            peer.send_frame(Frame::new(
                Kind::DnsResponse,
                query.resource_id,
                response.encode(),
            ))
            .await;
        });

        let addresses = client
            .query_dns("a.test", RecordType::A, std::time::Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(addresses, vec!["1.2.3.4".to_owned(), "5.6.7.8".to_owned()]);
        egress.await.unwrap();
        assert_eq!(client.pending_count(), 0, "dns entries are single-shot");
    }

    #[tokio::test]
    async fn http_body_streams_in_order_with_exactly_one_end() {
        let (client, mut peer) = client_with_peer();

        let egress = tokio::spawn(async move {
            let request = peer.expect_frame().await;
            assert_eq!(request.kind, Kind::HttpRequest);
            let meta = HttpRequestMeta::decode(&request.payload).unwrap();
            assert_eq!(meta.method, "GET");
            assert_eq!(meta.url, "http://srv/x");

            let id = request.resource_id;
            let response = crate::proto::wire::HttpResponseMeta {
                status: 200,
                status_text: "OK".into(),
                headers: vec![("content-type".into(), "application/octet-stream".into())],
                url: "http://srv/x".into(),
                body: true,
            };
            peer.send_frame(Frame::new(Kind::HttpResponse, id, response.encode()))
                .await;
            for index in 0..3u8 {
                peer.send_frame(Frame::new(
                    Kind::HttpBodyChunk,
                    id,
                    Bytes::from(vec![index; 16]),
                ))
                .await;
            }
            peer.send_frame(Frame::empty(Kind::HttpBodyEnd, id)).await;
        });

        let call = client
            .fetch_http(HttpRequestMeta {
                method: "GET".into(),
                url: "http://srv/x".into(),
                headers: vec![],
            })
            .unwrap();
        let mut response = call.response().await.unwrap();
        assert_eq!(response.meta.status, 200);

        for index in 0..3u8 {
            let chunk = response.chunk().await.unwrap().unwrap();
            assert_eq!(&chunk[..], &[index; 16][..]);
        }
        assert!(response.chunk().await.is_none(), "stream ends after the end frame");
        egress.await.unwrap();
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn bad_scheme_is_rejected_before_the_wire() {
        let (client, _peer) = client_with_peer();
        let result = client.fetch_http(HttpRequestMeta {
            method: "GET".into(),
            url: "ftp://srv/x".into(),
            headers: vec![],
        });
        assert!(matches!(result, Err(TunnelError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn ping_text_command_yields_parseable_pong() {
        let (_client, mut peer) = client_with_peer();
        peer.tx
            .send(SocketMessage::Text("PING".into()))
            .await
            .unwrap();
        loop {
            match peer.rx.recv().await.unwrap() {
                SocketMessage::Text(reply) => {
                    let json: serde_json::Value = serde_json::from_str(&reply).unwrap();
                    assert_eq!(json["success"], true);
                    assert_eq!(json["message"], "PONG");
                    assert!(json["data"]["timestamp"].is_i64());
                    break;
                }
                SocketMessage::Binary(_) => continue,
                other => panic!("unexpected message {other:?}"),
            }
        }
    }
}
