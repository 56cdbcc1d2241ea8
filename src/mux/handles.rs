//! Consumer-side handles for tunneled streams. Each handle owns its
//! resource id's data channel; dropping a handle closes the stream and
//! notifies the peer at most once.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use super::pending::PendingTable;
use crate::error::{TunnelError, TunnelResult};
use crate::link::Link;
use crate::proto::wire::{HttpResponseMeta, UdpEndpoint, UdpPacket};
use crate::proto::{Frame, Kind, MAX_HTTP_BUFFERED, MAX_WS_BUFFERED, timeouts};

/// One tunneled TCP connection.
pub struct TcpTunnel {
    id: u32,
    data: mpsc::Receiver<TunnelResult<Bytes>>,
    link: Arc<Link>,
    pending: Arc<PendingTable>,
    closed: bool,
}

impl std::fmt::Debug for TcpTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTunnel")
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl TcpTunnel {
    pub(crate) fn new(
        id: u32,
        data: mpsc::Receiver<TunnelResult<Bytes>>,
        link: Arc<Link>,
        pending: Arc<PendingTable>,
    ) -> TcpTunnel {
        TcpTunnel {
            id,
            data,
            link,
            pending,
            closed: false,
        }
    }

    pub fn resource_id(&self) -> u32 {
        self.id
    }

    /// Next slice of inbound bytes, in arrival order. `None` once the
    /// stream ended.
    pub async fn recv(&mut self) -> Option<TunnelResult<Bytes>> {
        self.data.recv().await
    }

    pub async fn send(&self, data: Bytes) -> TunnelResult<()> {
        if self.closed {
            return Err(TunnelError::ConnectionClosed);
        }
        self.link.yield_while_buffered(MAX_WS_BUFFERED).await;
        self.link.send_frame(Frame::new(Kind::TcpData, self.id, data))
    }

    /// Idempotent: the close frame goes out once, and only if the peer
    /// has not already terminated the stream.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.pending.remove(self.id).is_some() {
            let _ = self.link.send_frame(Frame::empty(Kind::TcpClose, self.id));
        }
    }
}

impl Drop for TcpTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

/// One tunneled UDP socket, bound on the egress side.
pub struct UdpTunnel {
    id: u32,
    /// The address the egress peer actually bound.
    pub local: UdpEndpoint,
    data: mpsc::Receiver<TunnelResult<UdpPacket>>,
    link: Arc<Link>,
    pending: Arc<PendingTable>,
    closed: bool,
}

impl UdpTunnel {
    pub(crate) fn new(
        id: u32,
        local: UdpEndpoint,
        data: mpsc::Receiver<TunnelResult<UdpPacket>>,
        link: Arc<Link>,
        pending: Arc<PendingTable>,
    ) -> UdpTunnel {
        UdpTunnel {
            id,
            local,
            data,
            link,
            pending,
            closed: false,
        }
    }

    pub fn resource_id(&self) -> u32 {
        self.id
    }

    pub async fn send_to(&self, host: &str, port: u16, data: Bytes) -> TunnelResult<()> {
        if self.closed {
            return Err(TunnelError::ConnectionClosed);
        }
        let packet = UdpPacket {
            host: host.to_owned(),
            port,
            data,
        };
        let payload = packet.encode()?;
        self.link.yield_while_buffered(MAX_WS_BUFFERED).await;
        self.link
            .send_frame(Frame::new(Kind::UdpData, self.id, payload))
    }

    /// Next datagram, framed with its sender's address.
    pub async fn recv_from(&mut self) -> Option<TunnelResult<UdpPacket>> {
        self.data.recv().await
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.pending.remove(self.id).is_some() {
            let _ = self.link.send_frame(Frame::empty(Kind::UdpClose, self.id));
        }
    }
}

impl Drop for UdpTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

/// An HTTP exchange in flight. The request metadata is already on the
/// wire; the caller may stream a request body, then await the response.
pub struct HttpCall {
    id: u32,
    reply: Option<oneshot::Receiver<TunnelResult<HttpResponseMeta>>>,
    body: Option<mpsc::Receiver<TunnelResult<Bytes>>>,
    link: Arc<Link>,
    pending: Arc<PendingTable>,
    body_finished: bool,
    armed: bool,
}

impl HttpCall {
    pub(crate) fn new(
        id: u32,
        reply: oneshot::Receiver<TunnelResult<HttpResponseMeta>>,
        body: mpsc::Receiver<TunnelResult<Bytes>>,
        link: Arc<Link>,
        pending: Arc<PendingTable>,
    ) -> HttpCall {
        HttpCall {
            id,
            reply: Some(reply),
            body: Some(body),
            link,
            pending,
            body_finished: false,
            armed: true,
        }
    }

    pub fn resource_id(&self) -> u32 {
        self.id
    }

    /// Streams one slice of the request body.
    pub async fn send_body_chunk(&self, chunk: Bytes) -> TunnelResult<()> {
        if self.body_finished {
            return Err(TunnelError::Aborted);
        }
        self.link.yield_while_buffered(MAX_HTTP_BUFFERED).await;
        self.link
            .send_frame(Frame::new(Kind::HttpBodyChunk, self.id, chunk))
    }

    /// Ends the request body. Sent at most once.
    pub fn finish_body(&mut self) -> TunnelResult<()> {
        if self.body_finished {
            return Ok(());
        }
        self.body_finished = true;
        self.link
            .send_frame(Frame::empty(Kind::HttpBodyEnd, self.id))
    }

    /// Awaits the response metadata and yields the streaming body.
    pub async fn response(mut self) -> TunnelResult<HttpResponse> {
        let reply = self.reply.take().expect("response polled once");
        let body = self.body.take().expect("response polled once");
        self.armed = false;
        match tokio::time::timeout(timeouts::REQUEST_TIMEOUT, reply).await {
            Ok(Ok(Ok(meta))) => Ok(HttpResponse {
                id: self.id,
                meta,
                body,
                link: self.link.clone(),
                pending: self.pending.clone(),
            }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TunnelError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(self.id);
                let _ = self
                    .link
                    .send_frame(Frame::empty(Kind::HttpBodyEnd, self.id));
                Err(TunnelError::Timeout)
            }
        }
    }

    /// Cancels the exchange: drops the pending entry and tells the peer
    /// to clean up.
    pub fn abort(mut self) {
        self.abort_inner();
    }

    fn abort_inner(&mut self) {
        self.armed = false;
        if self.pending.remove(self.id).is_some() {
            let _ = self
                .link
                .send_frame(Frame::empty(Kind::HttpBodyEnd, self.id));
        }
    }
}

impl Drop for HttpCall {
    fn drop(&mut self) {
        if self.armed {
            self.abort_inner();
        }
    }
}

/// Response metadata plus its streaming body.
pub struct HttpResponse {
    id: u32,
    pub meta: HttpResponseMeta,
    body: mpsc::Receiver<TunnelResult<Bytes>>,
    link: Arc<Link>,
    pending: Arc<PendingTable>,
}

impl HttpResponse {
    /// Next body slice, in order. `None` after the final chunk.
    pub async fn chunk(&mut self) -> Option<TunnelResult<Bytes>> {
        self.body.recv().await
    }

    /// Collects the remaining body into one buffer.
    pub async fn bytes(mut self) -> TunnelResult<Bytes> {
        let mut out = Vec::new();
        while let Some(chunk) = self.chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(out))
    }
}

impl Drop for HttpResponse {
    fn drop(&mut self) {
        // Cancelling the body consumer ends the stream; the peer is told
        // to stop exactly once, and only if it has not already finished.
        if self.pending.remove(self.id).is_some() {
            let _ = self
                .link
                .send_frame(Frame::empty(Kind::HttpBodyEnd, self.id));
        }
    }
}
