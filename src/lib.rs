//! warren: a stream-multiplexing tunnel transported over HTTP WebSocket.
//!
//! Many independent logical streams — TCP connections, UDP sockets, DNS
//! lookups, HTTP exchanges — ride one WebSocket per client. The ingress
//! peer allocates streams and exposes the typed client API; the egress
//! peer performs the real network I/O. Both speak the framed protocol in
//! [`proto`], and sessions survive transport drops through the egress
//! grace window.

pub mod command;
pub mod config;
pub mod connector;
pub mod egress;
pub mod error;
pub mod link;
pub mod mux;
pub mod proto;
pub mod server;
pub mod session;

pub use error::{TunnelError, TunnelResult};
pub use mux::TunnelClient;
