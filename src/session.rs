//! Egress-side session registry.
//!
//! A session is one ingress identity: its link, its engines, and the
//! UUID the client published via `SET UUID`. The session outlives any
//! single socket — when the socket drops, the link holds the streams
//! through the grace window, and a fresh upgrade carrying `?id=<uuid>`
//! re-binds the same session. Only when the grace window elapses (or
//! the session is displaced) are its streams destroyed.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::command::{self, Command, CommandContext, CommandResponse};
use crate::egress::Engines;
use crate::link::{Inbound, Link, LinkConfig, LinkEvent, SocketRx, SocketTx};

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    max_sessions: usize,
    link_config: LinkConfig,
    http_client: reqwest::Client,
    started: Instant,
    reconnect_total: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        max_sessions: usize,
        link_config: LinkConfig,
        http_client: reqwest::Client,
    ) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry {
            sessions: DashMap::new(),
            max_sessions,
            link_config,
            http_client,
            started: Instant::now(),
            reconnect_total: AtomicU64::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn at_capacity(&self) -> bool {
        self.sessions.len() >= self.max_sessions
    }

    /// Builds a fresh session and starts its dispatcher. The session is
    /// not addressable until the client publishes its UUID. Returns
    /// `None` at capacity.
    pub fn create(self: &Arc<Self>) -> Option<Arc<Session>> {
        if self.at_capacity() {
            warn!(max = self.max_sessions, "session capacity reached");
            return None;
        }
        let (link, inbound) = Link::new(self.link_config.clone());
        let engines = Engines::new(link.clone(), self.http_client.clone());
        let session = Arc::new(Session {
            uuid: OnceLock::new(),
            link: link.clone(),
            engines,
            reconnect_count: AtomicU32::new(0),
            created: Instant::now(),
        });
        let events = link.subscribe();
        tokio::spawn(session.clone().run(self.clone(), inbound, events));
        Some(session)
    }

    pub fn find(&self, uuid: &str) -> Option<Arc<Session>> {
        self.sessions.get(uuid).map(|s| s.value().clone())
    }

    /// Re-binds a known session to a fresh socket. Returns `false` for
    /// unknown ids, which the caller must reject.
    pub fn reattach(
        &self,
        uuid: &str,
        tx: Box<dyn SocketTx>,
        rx: Box<dyn SocketRx>,
    ) -> bool {
        let Some(session) = self.find(uuid) else {
            return false;
        };
        session.reconnect_count.fetch_add(1, Ordering::Relaxed);
        self.reconnect_total.fetch_add(1, Ordering::Relaxed);
        info!(
            uuid,
            reconnects = session.reconnect_count.load(Ordering::Relaxed),
            "session reattached"
        );
        session.link.attach(tx, rx);
        true
    }

    /// Records a session under the identity its client published. A
    /// session already holding that identity is replaced and destroyed.
    fn register(&self, session: &Arc<Session>, uuid: &str) -> CommandResponse {
        if session.uuid.get().is_some_and(|u| u == uuid) {
            return CommandResponse::ok("identity unchanged");
        }
        if session.uuid.set(uuid.to_owned()).is_err() {
            return CommandResponse::fail("session identity cannot be changed");
        }
        if let Some(displaced) = self.sessions.insert(uuid.to_owned(), session.clone()) {
            if !Arc::ptr_eq(&displaced, session) {
                warn!(uuid, "displacing session with duplicate identity");
                displaced.destroy();
            }
        }
        info!(uuid, "session registered");
        CommandResponse::ok("UUID recorded")
    }

    /// Drops a session from the registry, guarding against removing a
    /// replacement that took the same identity.
    fn deregister(&self, session: &Arc<Session>) {
        if let Some(uuid) = session.uuid.get() {
            self.sessions
                .remove_if(uuid, |_, current| Arc::ptr_eq(current, session));
        }
    }

    pub fn stream_total(&self) -> usize {
        self.sessions
            .iter()
            .map(|s| s.engines.stream_count())
            .sum()
    }

    fn command_context(&self) -> CommandContext {
        CommandContext {
            role: "egress",
            started_at_millis: chrono::Utc::now().timestamp_millis()
                - self.started.elapsed().as_millis() as i64,
            uptime_secs: self.started.elapsed().as_secs(),
            sessions: self.len(),
            streams: self.stream_total(),
            reconnects: self.reconnect_total.load(Ordering::Relaxed),
        }
    }
}

pub struct Session {
    /// Set once, when the client publishes `SET UUID`.
    uuid: OnceLock<String>,
    link: Arc<Link>,
    engines: Arc<Engines>,
    pub reconnect_count: AtomicU32,
    created: Instant,
}

impl Session {
    pub fn uuid(&self) -> Option<&str> {
        self.uuid.get().map(String::as_str)
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    pub fn attach(&self, tx: Box<dyn SocketTx>, rx: Box<dyn SocketRx>) {
        self.link.attach(tx, rx);
    }

    /// Destroys every stream and the link itself.
    fn destroy(&self) {
        self.engines.close_all();
        self.link.close();
    }

    async fn run(
        self: Arc<Self>,
        registry: Arc<SessionRegistry>,
        mut inbound: mpsc::Receiver<Inbound>,
        mut events: broadcast::Receiver<LinkEvent>,
    ) {
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(Inbound::Frame(frame)) => self.engines.handle_frame(frame).await,
                    Some(Inbound::Text(text)) => self.handle_text(&registry, &text),
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(LinkEvent::Disconnected) => {
                        debug!(uuid = ?self.uuid(), "session socket lost, awaiting reconnect");
                    }
                    Ok(LinkEvent::TimedOut) => {
                        info!(uuid = ?self.uuid(), "grace window elapsed, destroying session");
                        registry.deregister(&self);
                        self.destroy();
                        break;
                    }
                    Ok(LinkEvent::Closed) => {
                        registry.deregister(&self);
                        self.engines.close_all();
                        break;
                    }
                    Ok(LinkEvent::Connected) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!(uuid = ?self.uuid(), "session dispatcher stopped");
    }

    fn handle_text(self: &Arc<Self>, registry: &Arc<SessionRegistry>, text: &str) {
        // JSON is a reply to one of our own commands.
        if text.trim_start().starts_with('{') {
            debug!(response = %text, "command response");
            return;
        }
        let parsed = command::parse(text);
        let response = match &parsed {
            Command::SetUuid(uuid) => Some(registry.register(self, uuid)),
            other => command::respond(other, &registry.command_context()),
        };
        if let Some(response) = response {
            let _ = self.link.send_text(response.render());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::SocketMessage;
    use crate::link::testutil::raw_socket;
    use std::time::Duration;

    fn registry_with(grace: Duration, max_sessions: usize) -> Arc<SessionRegistry> {
        let link_config = LinkConfig {
            heartbeat_interval: Duration::from_secs(3600),
            heartbeat_timeout: Duration::from_secs(3600),
            reconnect_grace: grace,
            ..LinkConfig::default()
        };
        SessionRegistry::new(max_sessions, link_config, reqwest::Client::new())
    }

    async fn expect_json(
        rx: &mut tokio::sync::mpsc::Receiver<SocketMessage>,
    ) -> serde_json::Value {
        loop {
            match rx.recv().await.expect("socket open") {
                SocketMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn set_uuid_registers_and_reattach_preserves_session() {
        let registry = registry_with(Duration::from_secs(3600), 4);
        let session = registry.create().unwrap();

        let ((tx, rx), peer_tx, mut peer_rx) = raw_socket();
        session.attach(Box::new(tx), Box::new(rx));

        peer_tx
            .send(SocketMessage::Text("SET UUID abc123".into()))
            .await
            .unwrap();
        let reply = expect_json(&mut peer_rx).await;
        assert_eq!(reply["success"], true);
        assert!(registry.find("abc123").is_some());

        // Socket drops; the session stays addressable.
        drop(peer_tx);
        drop(peer_rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.find("abc123").is_some());

        // Reattach within the grace window.
        let ((tx2, rx2), peer_tx2, mut peer_rx2) = raw_socket();
        assert!(registry.reattach("abc123", Box::new(tx2), Box::new(rx2)));
        assert_eq!(session.reconnect_count.load(Ordering::Relaxed), 1);

        // The re-bound link answers commands on the new socket.
        peer_tx2
            .send(SocketMessage::Text("GET STATUS".into()))
            .await
            .unwrap();
        let reply = expect_json(&mut peer_rx2).await;
        assert_eq!(reply["data"]["status"], "connected");
    }

    #[tokio::test]
    async fn grace_expiry_destroys_and_deregisters() {
        let registry = registry_with(Duration::from_millis(50), 4);
        let session = registry.create().unwrap();

        let ((tx, rx), peer_tx, mut peer_rx) = raw_socket();
        session.attach(Box::new(tx), Box::new(rx));
        peer_tx
            .send(SocketMessage::Text("SET UUID gone42".into()))
            .await
            .unwrap();
        let _ = expect_json(&mut peer_rx).await;
        assert_eq!(registry.len(), 1);

        drop(peer_tx);
        drop(peer_rx);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.find("gone42").is_none(), "session was destroyed");
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn capacity_rejects_new_sessions() {
        let registry = registry_with(Duration::from_secs(3600), 1);
        let _first = registry.create().unwrap();
        // Capacity counts registered sessions only once they have an
        // identity; an anonymous session does not block the slot.
        assert!(registry.create().is_some());

        let session = registry.create().unwrap();
        let ((tx, rx), peer_tx, mut peer_rx) = raw_socket();
        session.attach(Box::new(tx), Box::new(rx));
        peer_tx
            .send(SocketMessage::Text("SET UUID full1".into()))
            .await
            .unwrap();
        let _ = expect_json(&mut peer_rx).await;
        assert!(registry.at_capacity());
        assert!(registry.create().is_none());
    }

    #[tokio::test]
    async fn unknown_reattach_id_is_rejected() {
        let registry = registry_with(Duration::from_secs(3600), 4);
        let ((tx, rx), _peer_tx, _peer_rx) = raw_socket();
        assert!(!registry.reattach("nope", Box::new(tx), Box::new(rx)));
    }

    #[tokio::test]
    async fn end_to_end_tcp_echo_through_paired_links() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // A real echo server on the egress network.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if socket.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Egress session on one end, ingress client on the other,
        // joined by an in-memory socket pair.
        let registry = registry_with(Duration::from_secs(3600), 4);
        let session = registry.create().unwrap();

        let link_config = LinkConfig {
            heartbeat_interval: Duration::from_secs(3600),
            heartbeat_timeout: Duration::from_secs(3600),
            reconnect_grace: Duration::from_secs(3600),
            ..LinkConfig::default()
        };
        let (ingress_link, inbound) = Link::new(link_config);
        let client = crate::mux::TunnelClient::spawn(ingress_link.clone(), inbound, 100);

        let ((left_tx, left_rx), (right_tx, right_rx)) =
            crate::link::testutil::socket_pair();
        ingress_link.attach(Box::new(left_tx), Box::new(left_rx));
        session.attach(Box::new(right_tx), Box::new(right_rx));

        let mut tunnel = client
            .connect_tcp(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();
        tunnel
            .send(bytes::Bytes::from_static(b"hello"))
            .await
            .unwrap();
        let echoed = tunnel.recv().await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"hello");

        // Swap in a fresh socket pair mid-stream: the established
        // stream keeps delivering through the re-bound transport.
        let ((left_tx, left_rx), (right_tx, right_rx)) =
            crate::link::testutil::socket_pair();
        ingress_link.attach(Box::new(left_tx), Box::new(left_rx));
        session.attach(Box::new(right_tx), Box::new(right_rx));

        tunnel
            .send(bytes::Bytes::from_static(b"again"))
            .await
            .unwrap();
        let echoed = tunnel.recv().await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"again");

        tunnel.close();
        client.close();
    }
}
