//! Egress-side engines and their frame dispatcher.
//!
//! The dispatcher routes each inbound frame to the engine owning that
//! stream class. Frames for unknown resource ids are answered with the
//! matching terminal so the ingress peer cleans up; frames addressed to
//! the wrong side are treated the same way. Per-stream failures are
//! `ERROR` frames, never transport faults.

pub mod dns;
pub mod http;
pub mod tcp;
pub mod udp;

use std::sync::Arc;

use tracing::debug;

use crate::link::Link;
use crate::proto::wire::{ConnectTarget, UdpPacket};
use crate::proto::{Frame, Kind, MAX_PENDING_REQUESTS};

pub struct Engines {
    pub tcp: tcp::TcpEngine,
    pub udp: udp::UdpEngine,
    pub dns: dns::DnsEngine,
    pub http: http::HttpEngine,
    link: Arc<Link>,
}

impl Engines {
    pub fn new(link: Arc<Link>, http_client: reqwest::Client) -> Arc<Engines> {
        Arc::new(Engines {
            tcp: tcp::TcpEngine::new(link.clone()),
            udp: udp::UdpEngine::new(link.clone()),
            dns: dns::DnsEngine::new(link.clone()),
            http: http::HttpEngine::new(link.clone(), http_client),
            link,
        })
    }

    /// Live streams across all engines, for `STATS`.
    pub fn stream_count(&self) -> usize {
        self.tcp.count() + self.udp.count() + self.dns.count() + self.http.count()
    }

    /// Destroys every stream without notifying the peer. Called when
    /// the grace window elapses or the session is closed for good.
    pub fn close_all(&self) {
        self.tcp.close_all();
        self.udp.close_all();
        self.dns.close_all();
        self.http.close_all();
    }

    /// Cancels whatever stream lives under this id, in any engine.
    fn abort_stream(&self, id: u32) {
        self.tcp.close(id, false);
        self.udp.close(id, false);
        self.dns.cancel(id);
        self.http.abort(id);
    }

    pub async fn handle_frame(self: &Arc<Self>, frame: Frame) {
        let id = frame.resource_id;
        let opens_stream = matches!(
            frame.kind,
            Kind::TcpConnect | Kind::UdpBind | Kind::DnsQuery | Kind::HttpRequest
        );
        if opens_stream && self.stream_count() >= MAX_PENDING_REQUESTS {
            let _ = self.link.send_frame(Frame::error(id, "too many streams"));
            return;
        }
        match frame.kind {
            // The slot is reserved synchronously so the capacity gate
            // above sees in-flight connects; the dial itself runs off
            // the dispatcher.
            Kind::TcpConnect => match ConnectTarget::decode(&frame.payload) {
                Ok(target) => self.tcp.connect(id, target),
                Err(e) => {
                    let _ = self.link.send_frame(Frame::error(id, &e.to_string()));
                }
            },
            Kind::TcpData => {
                if !self.tcp.data(id, frame.payload).await {
                    self.late_frame(Kind::TcpData, id);
                }
            }
            // The close path acks with this side's own terminal, once.
            Kind::TcpClose => self.tcp.close(id, true),
            Kind::UdpBind => self.udp.bind(id).await,
            Kind::UdpData => match UdpPacket::decode(&frame.payload) {
                Ok(packet) => {
                    if !self.udp.send(id, packet).await {
                        self.late_frame(Kind::UdpData, id);
                    }
                }
                Err(e) => debug!(resource_id = id, error = %e, "bad udp payload"),
            },
            Kind::UdpClose => self.udp.close(id, true),
            Kind::DnsQuery => self.dns.query(id, frame.payload),
            Kind::HttpRequest => self.http.request(id, frame.payload),
            Kind::HttpBodyChunk => {
                if !self.http.body_chunk(id, frame.payload).await {
                    self.late_frame(Kind::HttpBodyChunk, id);
                }
            }
            Kind::HttpBodyEnd => {
                // A late end is silently dropped.
                let _ = self.http.body_end(id);
            }
            Kind::Error => {
                let message = String::from_utf8_lossy(&frame.payload);
                debug!(resource_id = id, error = %message, "peer reported stream error");
                self.abort_stream(id);
            }
            // Replies addressed to the ingress side are bogus here and
            // mean the peer leaked a stream.
            Kind::TcpConnectAck | Kind::UdpBindAck | Kind::DnsResponse | Kind::HttpResponse => {
                self.late_frame(frame.kind, id);
            }
            // Heartbeats and unknown kinds are consumed by the link.
            Kind::Heartbeat | Kind::Unknown(_) => {}
        }
    }

    fn late_frame(&self, kind: Kind, id: u32) {
        debug!(?kind, resource_id = id, "frame for unknown stream");
        if let Some(terminal) = kind.late_reply() {
            let _ = self.link.send_frame(Frame::empty(terminal, id));
        }
    }
}
