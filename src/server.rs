//! Egress WebSocket endpoint: accepts upgrades, binds sockets to
//! sessions, and honors `?id=<uuid>` reattachment.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use salvo::prelude::*;
use salvo::websocket::{Message, WebSocket, WebSocketUpgrade};
use tracing::debug;

use crate::config::ServerConfig;
use crate::link::{LinkConfig, SocketMessage, SocketRx, SocketTx};
use crate::session::SessionRegistry;

static REGISTRY: OnceLock<Arc<SessionRegistry>> = OnceLock::new();

/// Builds the global session registry from the boot configuration.
pub fn init(config: &ServerConfig) -> Arc<SessionRegistry> {
    let link_config = LinkConfig {
        heartbeat_interval: config.heartbeat_interval(),
        heartbeat_timeout: config.heartbeat_timeout(),
        reconnect_grace: config.reconnect_grace(),
        queue_limit: config.send_queue_limit,
    };
    let registry = SessionRegistry::new(
        config.max_sessions,
        link_config,
        reqwest::Client::new(),
    );
    REGISTRY
        .set(registry.clone())
        .unwrap_or_else(|_| panic!("session registry initialized twice"));
    registry
}

pub fn registry() -> &'static Arc<SessionRegistry> {
    REGISTRY.get().expect("session registry should be set")
}

/// The upgrade route at the configured connect path.
pub fn router(connect_path: &str) -> Router {
    let path = connect_path.trim_matches('/');
    if path.is_empty() {
        Router::new().goal(tunnel_upgrade)
    } else {
        Router::with_path(path).goal(tunnel_upgrade)
    }
}

/// Upgrades one connection. Absence of `id` opens a new session;
/// presence re-binds the session it names, and unknown ids are
/// rejected before the upgrade completes.
#[handler]
async fn tunnel_upgrade(req: &mut Request, res: &mut Response) -> Result<(), StatusError> {
    let registry = registry().clone();
    match req.query::<String>("id") {
        Some(id) => {
            if registry.find(&id).is_none() {
                return Err(StatusError::forbidden().brief("unknown session id"));
            }
            WebSocketUpgrade::new()
                .upgrade(req, res, move |ws| async move {
                    let (sink, stream) = ws.split();
                    if !registry.reattach(&id, Box::new(WsTx(sink)), Box::new(WsRx(stream))) {
                        debug!(uuid = %id, "session expired during upgrade");
                    }
                })
                .await
        }
        None => {
            let Some(session) = registry.create() else {
                return Err(StatusError::too_many_requests().brief("session capacity reached"));
            };
            WebSocketUpgrade::new()
                .upgrade(req, res, move |ws| async move {
                    let (sink, stream) = ws.split();
                    session.attach(Box::new(WsTx(sink)), Box::new(WsRx(stream)));
                })
                .await
        }
    }
}

struct WsTx(SplitSink<WebSocket, Message>);
struct WsRx(SplitStream<WebSocket>);

#[async_trait]
impl SocketTx for WsTx {
    async fn send(&mut self, msg: SocketMessage) -> std::io::Result<()> {
        let message = match msg {
            SocketMessage::Binary(bytes) => Message::binary(bytes.to_vec()),
            SocketMessage::Text(text) => Message::text(text),
            // Control messages are driven by the websocket layer itself.
            SocketMessage::Ping | SocketMessage::Pong => return Ok(()),
            SocketMessage::Close => Message::close(),
        };
        self.0.send(message).await.map_err(std::io::Error::other)
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::close()).await;
        let _ = self.0.close().await;
    }
}

#[async_trait]
impl SocketRx for WsRx {
    async fn recv(&mut self) -> Option<std::io::Result<SocketMessage>> {
        match self.0.next().await? {
            Ok(msg) => Some(Ok(convert(msg))),
            Err(e) => Some(Err(std::io::Error::other(e))),
        }
    }
}

fn convert(msg: Message) -> SocketMessage {
    if msg.is_binary() {
        SocketMessage::Binary(Bytes::copy_from_slice(msg.as_bytes()))
    } else if msg.is_text() {
        SocketMessage::Text(String::from_utf8_lossy(msg.as_bytes()).into_owned())
    } else if msg.is_ping() {
        SocketMessage::Ping
    } else if msg.is_pong() {
        SocketMessage::Pong
    } else {
        SocketMessage::Close
    }
}
