//! Egress UDP relay: one ephemeral datagram socket per stream, framing
//! each received datagram with its sender's address. UDP is lossy by
//! contract, so send failures are logged at debug level and never tear
//! the socket down.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::link::Link;
use crate::proto::wire::{UdpEndpoint, UdpPacket};
use crate::proto::{Frame, Kind, MAX_UDP_PACKET_SIZE, MAX_WS_BUFFERED};

struct UdpEntry {
    socket: Arc<UdpSocket>,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct UdpEngine {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    link: Arc<Link>,
    sockets: DashMap<u32, UdpEntry>,
}

impl UdpEngine {
    pub fn new(link: Arc<Link>) -> UdpEngine {
        UdpEngine {
            inner: Arc::new(UdpInner {
                link,
                sockets: DashMap::new(),
            }),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.sockets.len()
    }

    /// Allocates the local socket and reports the bound address. The
    /// address requested by the peer is advisory and ignored: binding is
    /// always ephemeral on all interfaces.
    pub async fn bind(&self, id: u32) {
        let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                debug!(resource_id = id, error = %e, "udp bind failed");
                let _ = self.inner.link.send_frame(Frame::error(id, &e.to_string()));
                return;
            }
        };
        let local = match socket.local_addr() {
            Ok(addr) => UdpEndpoint {
                host: addr.ip().to_string(),
                port: addr.port(),
            },
            Err(e) => {
                let _ = self.inner.link.send_frame(Frame::error(id, &e.to_string()));
                return;
            }
        };

        let token = CancellationToken::new();
        self.inner.sockets.insert(
            id,
            UdpEntry {
                socket: socket.clone(),
                token: token.clone(),
            },
        );
        let _ = self
            .inner
            .link
            .send_frame(Frame::new(Kind::UdpBindAck, id, local.encode()));

        tokio::spawn(self.clone().recv_loop(id, socket, token));
    }

    /// Sends one datagram toward the decoded target. Returns `false`
    /// when the stream is unknown.
    pub async fn send(&self, id: u32, packet: UdpPacket) -> bool {
        let socket = self.inner.sockets.get(&id).map(|e| e.socket.clone());
        let Some(socket) = socket else {
            return false;
        };
        if packet.data.len() > MAX_UDP_PACKET_SIZE {
            debug!(resource_id = id, len = packet.data.len(), "dropping oversized datagram");
            return true;
        }
        if let Err(e) = socket
            .send_to(&packet.data, (packet.host.as_str(), packet.port))
            .await
        {
            debug!(resource_id = id, error = %e, "udp send failed");
        }
        true
    }

    pub fn close(&self, id: u32, notify_peer: bool) {
        let Some((_, entry)) = self.inner.sockets.remove(&id) else {
            return;
        };
        entry.token.cancel();
        if notify_peer {
            let _ = self.inner.link.send_frame(Frame::empty(Kind::UdpClose, id));
        }
        debug!(resource_id = id, "udp socket released");
    }

    pub fn close_all(&self) {
        let ids: Vec<u32> = self.inner.sockets.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.close(id, false);
        }
    }

    async fn recv_loop(self, id: u32, socket: Arc<UdpSocket>, token: CancellationToken) {
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
        loop {
            self.inner
                .link
                .yield_while_buffered(MAX_WS_BUFFERED)
                .await;
            tokio::select! {
                _ = token.cancelled() => return,
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => {
                        let packet = UdpPacket {
                            host: from.ip().to_string(),
                            port: from.port(),
                            data: Bytes::copy_from_slice(&buf[..len]),
                        };
                        match packet.encode() {
                            Ok(payload) => {
                                let _ = self
                                    .inner
                                    .link
                                    .send_frame(Frame::new(Kind::UdpData, id, payload));
                            }
                            Err(e) => {
                                debug!(resource_id = id, error = %e, "dropping datagram")
                            }
                        }
                    }
                    Err(e) => {
                        debug!(resource_id = id, error = %e, "udp receive ended");
                        self.close(id, true);
                        return;
                    }
                }
            }
        }
    }
}
