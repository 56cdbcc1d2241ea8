//! The pending-request table: joins each in-flight resource id to its
//! awaiter and, for stream classes, to the consumer's data channel.
//!
//! Every entry carries one one-shot reply channel (taken when the first
//! reply arrives) and, except for DNS, one bounded data channel feeding
//! the consumer. An entry whose reply has been taken is *established*:
//! it stays in the table so its id cannot be reused and its data keeps
//! flowing, and it is exempt from the reaper, which only sweeps awaiters
//! whose first reply never came.

use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::{TunnelError, TunnelResult};
use crate::proto::wire::{HttpResponseMeta, UdpEndpoint, UdpPacket};

pub(crate) struct TcpPending {
    pub reply: Option<oneshot::Sender<TunnelResult<()>>>,
    pub data: mpsc::Sender<TunnelResult<Bytes>>,
    pub created: Instant,
}

pub(crate) struct UdpPending {
    pub reply: Option<oneshot::Sender<TunnelResult<UdpEndpoint>>>,
    pub data: mpsc::Sender<TunnelResult<UdpPacket>>,
    pub created: Instant,
}

pub(crate) struct DnsPending {
    pub reply: Option<oneshot::Sender<TunnelResult<Vec<String>>>>,
    pub created: Instant,
}

pub(crate) struct HttpPending {
    pub reply: Option<oneshot::Sender<TunnelResult<HttpResponseMeta>>>,
    /// Installed before `HTTP_REQUEST` is sent, so chunks racing the
    /// response metadata are never lost.
    pub body: mpsc::Sender<TunnelResult<Bytes>>,
    pub created: Instant,
}

pub(crate) enum Pending {
    Tcp(TcpPending),
    Udp(UdpPending),
    Dns(DnsPending),
    Http(HttpPending),
}

impl Pending {
    fn created(&self) -> Instant {
        match self {
            Pending::Tcp(p) => p.created,
            Pending::Udp(p) => p.created,
            Pending::Dns(p) => p.created,
            Pending::Http(p) => p.created,
        }
    }

    /// Whether the first reply already arrived.
    pub fn is_replied(&self) -> bool {
        match self {
            Pending::Tcp(p) => p.reply.is_none(),
            Pending::Udp(p) => p.reply.is_none(),
            Pending::Dns(p) => p.reply.is_none(),
            Pending::Http(p) => p.reply.is_none(),
        }
    }

    /// Fails the entry: the awaiter gets the error, an established
    /// stream sees it on its data channel before end-of-stream.
    pub fn reject(self, error: TunnelError) {
        match self {
            Pending::Tcp(mut p) => match p.reply.take() {
                Some(tx) => {
                    let _ = tx.send(Err(error));
                }
                None => {
                    let _ = p.data.try_send(Err(error));
                }
            },
            Pending::Udp(mut p) => match p.reply.take() {
                Some(tx) => {
                    let _ = tx.send(Err(error));
                }
                None => {
                    let _ = p.data.try_send(Err(error));
                }
            },
            Pending::Dns(mut p) => {
                if let Some(tx) = p.reply.take() {
                    let _ = tx.send(Err(error));
                }
            }
            Pending::Http(mut p) => match p.reply.take() {
                Some(tx) => {
                    let _ = tx.send(Err(error));
                }
                None => {
                    let _ = p.body.try_send(Err(error));
                }
            },
        }
        // Dropping the entry drops its data sender, which terminates the
        // consumer's stream after the error above.
    }

    /// Ends the entry without an error: channels close cleanly; an
    /// unreplied awaiter is told the peer closed first.
    pub fn finalize(self) {
        if !self.is_replied() {
            self.reject(TunnelError::Upstream("closed by peer".into()));
        }
    }
}

pub(crate) struct PendingTable {
    entries: DashMap<u32, Pending>,
    limit: usize,
}

impl PendingTable {
    pub fn new(limit: usize) -> PendingTable {
        PendingTable {
            entries: DashMap::new(),
            limit,
        }
    }

    /// Fails fast once the table is at capacity.
    pub fn insert(&self, id: u32, pending: Pending) -> TunnelResult<()> {
        if self.entries.len() >= self.limit {
            return Err(TunnelError::TooManyRequests);
        }
        self.entries.insert(id, pending);
        Ok(())
    }

    pub fn remove(&self, id: u32) -> Option<Pending> {
        self.entries.remove(&id).map(|(_, pending)| pending)
    }

    pub fn get_mut(&self, id: u32) -> Option<RefMut<'_, u32, Pending>> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Rejects and drops every entry. Used on transport loss.
    pub fn reject_all(&self, error: impl Fn() -> TunnelError) {
        let ids: Vec<u32> = self.entries.iter().map(|e| *e.key()).collect();
        let mut purged = 0usize;
        for id in ids {
            if let Some((_, pending)) = self.entries.remove(&id) {
                pending.reject(error());
                purged += 1;
            }
        }
        if purged > 0 {
            debug!(purged, "purged pending table");
        }
    }

    /// Rejects awaiters whose first reply has not arrived. Established
    /// streams survive a transport drop: their egress counterparts live
    /// on through the grace window and resume after a reattach.
    pub fn reject_unreplied(&self, error: impl Fn() -> TunnelError) {
        let ids: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_replied())
            .map(|e| *e.key())
            .collect();
        for id in ids {
            if let Some(pending) = self
                .entries
                .remove_if(&id, |_, p| !p.is_replied())
                .map(|(_, p)| p)
            {
                pending.reject(error());
            }
        }
    }

    /// Sweeps awaiters whose first reply never arrived within `max_age`.
    pub fn reap(&self, max_age: Duration) -> usize {
        let stale: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_replied() && e.value().created().elapsed() > max_age)
            .map(|e| *e.key())
            .collect();
        let mut reaped = 0usize;
        for id in stale {
            // Re-check under removal: the reply may have landed since.
            if let Some(pending) = self
                .entries
                .remove_if(&id, |_, p| !p.is_replied() && p.created().elapsed() > max_age)
                .map(|(_, p)| p)
            {
                debug!(resource_id = id, "reaping stale pending entry");
                pending.reject(TunnelError::Timeout);
                reaped += 1;
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_entry() -> (Pending, oneshot::Receiver<TunnelResult<()>>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (data_tx, _data_rx) = mpsc::channel(4);
        (
            Pending::Tcp(TcpPending {
                reply: Some(reply_tx),
                data: data_tx,
                created: Instant::now(),
            }),
            reply_rx,
        )
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let table = PendingTable::new(2);
        let (a, _ra) = tcp_entry();
        let (b, _rb) = tcp_entry();
        let (c, _rc) = tcp_entry();
        table.insert(1, a).unwrap();
        table.insert(2, b).unwrap();
        assert!(matches!(
            table.insert(3, c),
            Err(TunnelError::TooManyRequests)
        ));
    }

    #[tokio::test]
    async fn reject_all_reaches_every_awaiter() {
        let table = PendingTable::new(16);
        let (a, ra) = tcp_entry();
        let (b, rb) = tcp_entry();
        table.insert(1, a).unwrap();
        table.insert(2, b).unwrap();
        table.reject_all(|| TunnelError::ConnectionClosed);
        assert!(matches!(ra.await, Ok(Err(TunnelError::ConnectionClosed))));
        assert!(matches!(rb.await, Ok(Err(TunnelError::ConnectionClosed))));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn reject_unreplied_spares_established_streams() {
        let table = PendingTable::new(16);

        let (awaiting, awaiting_rx) = tcp_entry();
        table.insert(1, awaiting).unwrap();

        let (data_tx, mut data_rx) = mpsc::channel(4);
        table
            .insert(
                2,
                Pending::Tcp(TcpPending {
                    reply: None,
                    data: data_tx,
                    created: Instant::now(),
                }),
            )
            .unwrap();

        table.reject_unreplied(|| TunnelError::ConnectionClosed);
        assert!(matches!(
            awaiting_rx.await,
            Ok(Err(TunnelError::ConnectionClosed))
        ));
        assert!(table.contains(2), "established stream survives the drop");
        assert!(
            data_rx.try_recv().is_err(),
            "no error reaches the surviving stream"
        );
    }

    #[tokio::test]
    async fn reaper_skips_established_entries() {
        let table = PendingTable::new(16);

        let (unreplied, unreplied_rx) = tcp_entry();
        table.insert(1, unreplied).unwrap();

        let (data_tx, _data_rx) = mpsc::channel(4);
        table
            .insert(
                2,
                Pending::Tcp(TcpPending {
                    reply: None,
                    data: data_tx,
                    created: Instant::now(),
                }),
            )
            .unwrap();

        assert_eq!(table.reap(Duration::ZERO), 1);
        assert!(matches!(
            unreplied_rx.await,
            Ok(Err(TunnelError::Timeout))
        ));
        assert!(table.contains(2), "established entry must survive");
    }
}
