//! Egress HTTP engine: performs the real fetch, streaming the request
//! body in from the tunnel and the response body back out through it.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::link::Link;
use crate::proto::wire::{HttpRequestMeta, HttpResponseMeta};
use crate::proto::{Frame, Kind, MAX_HTTP_BUFFERED, MAX_RESPONSE_SIZE, timeouts};

/// Request headers the egress client manages itself.
const SKIPPED_REQUEST_HEADERS: &[&str] = &["host", "content-length", "transfer-encoding"];

#[derive(Clone)]
pub struct HttpEngine {
    inner: Arc<HttpInner>,
}

struct HttpInner {
    link: Arc<Link>,
    client: reqwest::Client,
    /// Cancellation token per in-flight exchange.
    requests: DashMap<u32, CancellationToken>,
    /// Request-body sinks for streamed uploads.
    body_sinks: DashMap<u32, mpsc::Sender<Result<Bytes, std::io::Error>>>,
}

impl HttpEngine {
    pub fn new(link: Arc<Link>, client: reqwest::Client) -> HttpEngine {
        HttpEngine {
            inner: Arc::new(HttpInner {
                link,
                client,
                requests: DashMap::new(),
                body_sinks: DashMap::new(),
            }),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.requests.len()
    }

    /// Validates and launches one exchange. Anything wrong with the
    /// metadata is an `ERROR` for this stream, never a transport fault.
    pub fn request(&self, id: u32, payload: Bytes) {
        let meta = match HttpRequestMeta::decode(&payload) {
            Ok(meta) => meta,
            Err(e) => {
                let _ = self.inner.link.send_frame(Frame::error(id, &e.to_string()));
                return;
            }
        };
        let url = match url::Url::parse(&meta.url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            Ok(url) => {
                let _ = self.inner.link.send_frame(Frame::error(
                    id,
                    &format!("unsupported scheme: {}", url.scheme()),
                ));
                return;
            }
            Err(e) => {
                let _ = self.inner.link.send_frame(Frame::error(id, &e.to_string()));
                return;
            }
        };

        let token = CancellationToken::new();
        self.inner.requests.insert(id, token.clone());

        // A request has a body when the headers promise one; the sink
        // must exist before any HTTP_BODY_CHUNK can arrive.
        let body = if has_request_body(&meta.headers) {
            let (body_tx, body_rx) = mpsc::channel(64);
            self.inner.body_sinks.insert(id, body_tx);
            Some(reqwest::Body::wrap_stream(ReceiverStream::new(body_rx)))
        } else {
            None
        };

        tokio::spawn(self.clone().run(id, meta, url, body, token));
    }

    /// Appends one slice to the request-body sink. Returns `false` when
    /// the stream is unknown to this engine.
    pub async fn body_chunk(&self, id: u32, data: Bytes) -> bool {
        let sender = self.inner.body_sinks.get(&id).map(|e| e.value().clone());
        match sender {
            Some(sender) => {
                if sender.send(Ok(data)).await.is_err() {
                    // The fetch finished or failed; stop feeding it.
                    self.inner.body_sinks.remove(&id);
                }
                true
            }
            // A chunk for a body-less exchange is tolerated while the
            // exchange itself is alive.
            None => self.inner.requests.contains_key(&id),
        }
    }

    /// Ends the request body. Returns `false` when the stream is
    /// unknown to this engine.
    pub fn body_end(&self, id: u32) -> bool {
        let had_sink = self.inner.body_sinks.remove(&id).is_some();
        had_sink || self.inner.requests.contains_key(&id)
    }

    pub fn abort(&self, id: u32) {
        if let Some((_, token)) = self.inner.requests.remove(&id) {
            token.cancel();
        }
        self.inner.body_sinks.remove(&id);
    }

    pub fn close_all(&self) {
        let ids: Vec<u32> = self.inner.requests.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.abort(id);
        }
        self.inner.body_sinks.clear();
    }

    async fn run(
        self,
        id: u32,
        meta: HttpRequestMeta,
        url: url::Url,
        body: Option<reqwest::Body>,
        token: CancellationToken,
    ) {
        let outcome = tokio::select! {
            _ = token.cancelled() => Err("request aborted".to_owned()),
            result = self.fetch(id, &meta, url, body) => result,
        };
        if let Err(message) = outcome {
            let _ = self.inner.link.send_frame(Frame::error(id, &message));
        }
        self.inner.requests.remove(&id);
        self.inner.body_sinks.remove(&id);
    }

    /// The exchange itself: send the request, forward the response
    /// metadata, then stream the body with exactly one terminal end.
    async fn fetch(
        &self,
        id: u32,
        meta: &HttpRequestMeta,
        url: url::Url,
        body: Option<reqwest::Body>,
    ) -> Result<(), String> {
        let method = reqwest::Method::from_bytes(meta.method.as_bytes())
            .map_err(|_| format!("invalid method: {}", meta.method))?;
        let is_head = method == reqwest::Method::HEAD;
        let mut builder = self
            .inner
            .client
            .request(method, url)
            .timeout(timeouts::FETCH_TIMEOUT);
        for (name, value) in &meta.headers {
            if SKIPPED_REQUEST_HEADERS
                .iter()
                .any(|skip| name.eq_ignore_ascii_case(skip))
            {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;

        let status = response.status();
        // HEAD exchanges and bodyless statuses must say so on the wire.
        let has_body = !is_head && !matches!(status.as_u16(), 204 | 304 | 100..=199);
        let response_meta = HttpResponseMeta {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_owned(),
            headers: response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    match value.to_str() {
                        Ok(value) => Some((name.as_str().to_owned(), value.to_owned())),
                        Err(_) => {
                            warn!(resource_id = id, header = %name, "dropping non-utf8 header");
                            None
                        }
                    }
                })
                .collect(),
            url: response.url().to_string(),
            body: has_body,
        };
        let _ = self
            .inner
            .link
            .send_frame(Frame::new(Kind::HttpResponse, id, response_meta.encode()));

        let mut total: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            total += chunk.len() as u64;
            if total > MAX_RESPONSE_SIZE {
                debug!(resource_id = id, total, "response exceeds size cap, aborting");
                return Err("response too large".to_owned());
            }
            self.inner
                .link
                .yield_while_buffered(MAX_HTTP_BUFFERED)
                .await;
            let _ = self
                .inner
                .link
                .send_frame(Frame::new(Kind::HttpBodyChunk, id, chunk));
        }
        let _ = self
            .inner
            .link
            .send_frame(Frame::empty(Kind::HttpBodyEnd, id));
        Ok(())
    }
}

fn has_request_body(headers: &[(String, String)]) -> bool {
    headers.iter().any(|(name, value)| {
        (name.eq_ignore_ascii_case("content-length") && value.trim() != "0")
            || name.eq_ignore_ascii_case("transfer-encoding")
    })
}
