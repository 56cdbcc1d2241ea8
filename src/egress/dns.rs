//! Egress DNS engine: resolves names on the egress network with the
//! system resolver, one bounded lookup per stream.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::RecordType as HickoryRecordType;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::link::Link;
use crate::proto::wire::{DnsQuery, DnsResponse, RecordType};
use crate::proto::{Frame, Kind, timeouts};

#[derive(Clone)]
pub struct DnsEngine {
    inner: Arc<DnsInner>,
}

struct DnsInner {
    link: Arc<Link>,
    resolver: TokioAsyncResolver,
    inflight: DashMap<u32, CancellationToken>,
}

impl DnsEngine {
    pub fn new(link: Arc<Link>) -> DnsEngine {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            debug!(error = %e, "no system resolver config, using defaults");
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        });
        DnsEngine {
            inner: Arc::new(DnsInner {
                link,
                resolver,
                inflight: DashMap::new(),
            }),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Parses and runs one query; the reply (or an `ERROR`) is sent from
    /// a spawned task so the dispatcher never waits on the resolver.
    pub fn query(&self, id: u32, payload: Bytes) {
        let query = match DnsQuery::decode(&payload) {
            Ok(query) => query,
            Err(e) => {
                let _ = self.inner.link.send_frame(Frame::error(id, &e.to_string()));
                return;
            }
        };
        let token = CancellationToken::new();
        self.inner.inflight.insert(id, token.clone());

        let engine = self.clone();
        tokio::spawn(async move {
            let lookup = engine.inner.resolver.lookup(
                query.name.as_str(),
                to_hickory_type(query.record_type),
            );
            tokio::select! {
                _ = token.cancelled() => {}
                result = tokio::time::timeout(timeouts::DNS_QUERY_TIMEOUT, lookup) => {
                    let frame = match result {
                        Ok(Ok(lookup)) => {
                            let response = DnsResponse {
                                addresses: lookup.iter().map(|r| r.to_string()).collect(),
                            };
                            Frame::new(Kind::DnsResponse, id, response.encode())
                        }
                        Ok(Err(e)) => {
                            debug!(resource_id = id, name = %query.name, error = %e, "dns lookup failed");
                            Frame::error(id, &e.to_string())
                        }
                        Err(_) => Frame::error(id, "DNS query timeout"),
                    };
                    let _ = engine.inner.link.send_frame(frame);
                }
            }
            engine.inner.inflight.remove(&id);
        });
    }

    pub fn cancel(&self, id: u32) {
        if let Some((_, token)) = self.inner.inflight.remove(&id) {
            token.cancel();
        }
    }

    pub fn close_all(&self) {
        let ids: Vec<u32> = self.inner.inflight.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.cancel(id);
        }
    }
}

fn to_hickory_type(record_type: RecordType) -> HickoryRecordType {
    match record_type {
        RecordType::A => HickoryRecordType::A,
        RecordType::Aaaa => HickoryRecordType::AAAA,
        RecordType::Aname => HickoryRecordType::ANAME,
        RecordType::Cname => HickoryRecordType::CNAME,
        RecordType::Ns => HickoryRecordType::NS,
        RecordType::Ptr => HickoryRecordType::PTR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_wire_record_type_maps_to_a_resolver_type() {
        for (wire, resolver) in [
            (RecordType::A, HickoryRecordType::A),
            (RecordType::Aaaa, HickoryRecordType::AAAA),
            (RecordType::Aname, HickoryRecordType::ANAME),
            (RecordType::Cname, HickoryRecordType::CNAME),
            (RecordType::Ns, HickoryRecordType::NS),
            (RecordType::Ptr, HickoryRecordType::PTR),
        ] {
            assert_eq!(to_hickory_type(wire), resolver);
        }
    }
}
