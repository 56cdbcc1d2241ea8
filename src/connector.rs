//! Ingress dialer: connects the tunnel outward, publishes the session
//! identity, and re-dials with `?id=<uuid>` after transport loss so the
//! egress peer re-binds the session inside its grace window.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::link::{LinkEvent, SocketMessage, SocketRx, SocketTx};
use crate::mux::TunnelClient;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Dials and re-dials the egress peer until the client closes. The
/// first connect opens a new session; later ones carry the session id.
pub async fn run(client: Arc<TunnelClient>, server_url: String, connect_path: String) {
    let base = endpoint_url(&server_url, &connect_path);
    let mut connected_before = false;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let url = if connected_before {
            format!("{base}?id={}", client.uuid())
        } else {
            base.clone()
        };
        match connect_async(url.as_str()).await {
            Ok((socket, _response)) => {
                info!(url = %base, reattach = connected_before, "tunnel connected");
                backoff = INITIAL_BACKOFF;
                if connected_before {
                    client.reconnects.fetch_add(1, Ordering::Relaxed);
                }

                // Subscribe before attaching so the disconnect of a
                // short-lived socket cannot be missed.
                let mut events = client.link().subscribe();
                let (sink, stream) = socket.split();
                client
                    .link()
                    .attach(Box::new(TungsteniteTx(sink)), Box::new(TungsteniteRx(stream)));
                connected_before = true;

                // Identity goes out immediately after connect.
                let _ = client
                    .link()
                    .send_text(format!("SET UUID {}", client.uuid()));

                loop {
                    match events.recv().await {
                        Ok(LinkEvent::Disconnected) | Ok(LinkEvent::TimedOut) => break,
                        Ok(LinkEvent::Closed) => return,
                        Ok(LinkEvent::Connected) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
            Err(e) => {
                warn!(url = %base, error = %e, "tunnel connect failed");
            }
        }
        if matches!(client.link().state(), crate::link::LinkState::Closed) {
            return;
        }
        debug!(delay = ?backoff, "retrying tunnel connect");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

fn endpoint_url(server_url: &str, connect_path: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let path = connect_path.trim_start_matches('/');
    if path.is_empty() {
        format!("{base}/")
    } else {
        format!("{base}/{path}")
    }
}

struct TungsteniteTx(SplitSink<WsStream, WsMessage>);
struct TungsteniteRx(SplitStream<WsStream>);

#[async_trait]
impl SocketTx for TungsteniteTx {
    async fn send(&mut self, msg: SocketMessage) -> std::io::Result<()> {
        let message = match msg {
            SocketMessage::Binary(bytes) => WsMessage::binary(bytes),
            SocketMessage::Text(text) => WsMessage::text(text),
            // tungstenite answers pings on its own.
            SocketMessage::Ping | SocketMessage::Pong => return Ok(()),
            SocketMessage::Close => WsMessage::Close(None),
        };
        self.0.send(message).await.map_err(std::io::Error::other)
    }

    async fn close(&mut self) {
        let _ = self.0.send(WsMessage::Close(None)).await;
        let _ = self.0.close().await;
    }
}

#[async_trait]
impl SocketRx for TungsteniteRx {
    async fn recv(&mut self) -> Option<std::io::Result<SocketMessage>> {
        loop {
            let converted = match self.0.next().await? {
                Ok(WsMessage::Binary(bytes)) => SocketMessage::Binary(bytes),
                Ok(WsMessage::Text(text)) => SocketMessage::Text(text.as_str().to_owned()),
                Ok(WsMessage::Ping(_)) => SocketMessage::Ping,
                Ok(WsMessage::Pong(_)) => SocketMessage::Pong,
                Ok(WsMessage::Close(_)) => SocketMessage::Close,
                // Raw frames never surface outside tungstenite itself.
                Ok(WsMessage::Frame(_)) => continue,
                Err(e) => return Some(Err(std::io::Error::other(e))),
            };
            return Some(Ok(converted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_joins_base_and_path() {
        assert_eq!(
            endpoint_url("ws://h:1", "/"),
            "ws://h:1/".to_owned()
        );
        assert_eq!(
            endpoint_url("ws://h:1/", "/tunnel"),
            "ws://h:1/tunnel".to_owned()
        );
        assert_eq!(
            endpoint_url("wss://h", "deep/path"),
            "wss://h/deep/path".to_owned()
        );
    }
}
