//! Egress TCP relay: connects outward on behalf of the ingress peer and
//! pipes bytes both ways, one read loop and one write task per stream.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::link::Link;
use crate::proto::wire::ConnectTarget;
use crate::proto::{Frame, Kind, MAX_WS_BUFFERED, TCP_READ_BUFFER, timeouts};

struct TcpEntry {
    writer: mpsc::Sender<Bytes>,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct TcpEngine {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    link: Arc<Link>,
    streams: DashMap<u32, TcpEntry>,
}

impl TcpEngine {
    pub fn new(link: Arc<Link>) -> TcpEngine {
        TcpEngine {
            inner: Arc::new(TcpInner {
                link,
                streams: DashMap::new(),
            }),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.streams.len()
    }

    /// Reserves the stream slot immediately — an in-flight connect
    /// counts toward the capacity bound for its whole lifetime — then
    /// dials in the background. On success the stream is acked and its
    /// pipe loops start; failures release the slot with an `ERROR`
    /// frame for this stream only.
    pub fn connect(&self, id: u32, target: ConnectTarget) {
        let token = CancellationToken::new();
        let (writer_tx, writer_rx) = mpsc::channel(64);
        self.inner.streams.insert(
            id,
            TcpEntry {
                writer: writer_tx,
                token: token.clone(),
            },
        );
        tokio::spawn(self.clone().dial(id, target, writer_rx, token));
    }

    async fn dial(
        self,
        id: u32,
        target: ConnectTarget,
        writer_rx: mpsc::Receiver<Bytes>,
        token: CancellationToken,
    ) {
        let attempt = tokio::select! {
            // The peer closed the stream while we were still dialing.
            _ = token.cancelled() => return,
            attempt = tokio::time::timeout(
                timeouts::CONNECT_TIMEOUT,
                TcpStream::connect((target.host.as_str(), target.port)),
            ) => attempt,
        };
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(resource_id = id, host = %target.host, port = target.port, error = %e, "tcp connect failed");
                self.fail_dial(id, &e.to_string());
                return;
            }
            Err(_) => {
                debug!(resource_id = id, host = %target.host, "tcp connect timed out");
                self.fail_dial(id, "TCP connect timeout");
                return;
            }
        };
        if !self.inner.streams.contains_key(&id) {
            // Closed between the dial resolving and now; the close path
            // already notified the peer.
            return;
        }

        let (read_half, write_half) = stream.into_split();
        let _ = self
            .inner
            .link
            .send_frame(Frame::empty(Kind::TcpConnectAck, id));

        tokio::spawn(self.clone().read_loop(id, read_half, token.clone()));
        tokio::spawn(self.clone().write_loop(id, write_half, writer_rx, token));
    }

    /// A failed dial releases the reserved slot, unless the peer
    /// already closed the stream.
    fn fail_dial(&self, id: u32, message: &str) {
        if self.inner.streams.remove(&id).is_some() {
            let _ = self.inner.link.send_frame(Frame::error(id, message));
        }
    }

    /// Forwards one inbound slice to the native socket. Returns `false`
    /// when the stream is unknown.
    pub async fn data(&self, id: u32, payload: Bytes) -> bool {
        let sender = self.inner.streams.get(&id).map(|e| e.writer.clone());
        let Some(sender) = sender else {
            return false;
        };
        if sender.send(payload).await.is_err() {
            self.close(id, true);
        }
        true
    }

    /// Tears one stream down. The atomic removal is the idempotence
    /// guard: whichever caller wins sends the single close frame.
    pub fn close(&self, id: u32, notify_peer: bool) {
        let Some((_, entry)) = self.inner.streams.remove(&id) else {
            return;
        };
        entry.token.cancel();
        if notify_peer {
            let _ = self.inner.link.send_frame(Frame::empty(Kind::TcpClose, id));
        }
        debug!(resource_id = id, "tcp stream closed");
    }

    /// Releases every stream without notifying the peer. Used when the
    /// session is destroyed after the grace window.
    pub fn close_all(&self) {
        let ids: Vec<u32> = self.inner.streams.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.close(id, false);
        }
    }

    async fn read_loop(self, id: u32, mut read_half: OwnedReadHalf, token: CancellationToken) {
        let mut buf = BytesMut::with_capacity(TCP_READ_BUFFER);
        loop {
            // Yield before reading another burst while the transport is
            // above its backpressure threshold.
            while self.inner.link.buffered_bytes() > MAX_WS_BUFFERED {
                if token.is_cancelled() {
                    return;
                }
                tokio::time::sleep(timeouts::BACKPRESSURE_POLL).await;
            }
            buf.reserve(TCP_READ_BUFFER);
            tokio::select! {
                _ = token.cancelled() => return,
                result = read_half.read_buf(&mut buf) => match result {
                    Ok(0) => {
                        self.close(id, true);
                        return;
                    }
                    Ok(_) => {
                        let payload = buf.split().freeze();
                        let _ = self
                            .inner
                            .link
                            .send_frame(Frame::new(Kind::TcpData, id, payload));
                    }
                    Err(e) => {
                        if is_teardown_error(&e) {
                            debug!(resource_id = id, error = %e, "tcp read ended");
                        } else {
                            warn!(resource_id = id, error = %e, "tcp read failed");
                        }
                        self.close(id, true);
                        return;
                    }
                }
            }
        }
    }

    async fn write_loop(
        self,
        id: u32,
        mut write_half: OwnedWriteHalf,
        mut writer_rx: mpsc::Receiver<Bytes>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = write_half.shutdown().await;
                    return;
                }
                data = writer_rx.recv() => match data {
                    Some(bytes) => {
                        if let Err(e) = write_half.write_all(&bytes).await {
                            debug!(resource_id = id, error = %e, "tcp write failed");
                            self.close(id, true);
                            return;
                        }
                    }
                    None => {
                        let _ = write_half.shutdown().await;
                        return;
                    }
                }
            }
        }
    }
}

/// Errors expected during normal teardown are swallowed at debug level.
fn is_teardown_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    ) || e.to_string().contains("closed")
}
