//! The framed multiplexing protocol spoken on the tunnel transport.
//!
//! Every binary transport message is a [`Frame`]: a 5-byte envelope
//! (`kind: u8`, `resource_id: u32` big-endian) followed by an opaque
//! payload whose length is implied by the transport message boundary.
//! Multi-byte integers inside sub-payloads are little-endian; the
//! envelope's `resource_id` is big-endian. Both ends rely on this
//! asymmetry for interoperability, so it is fixed here and nowhere else.

use thiserror::Error;

mod frame;
pub mod value;
pub mod wire;

pub use frame::{Frame, HEADER_LEN, Kind};

/// Protocol revision reported by `GET VERSION`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Resource id used by heartbeats and control traffic.
pub const CONTROL_RESOURCE_ID: u32 = 0;

/// Outbound frames buffered while the socket is away.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// In-flight requests allowed per peer before new ones fail fast.
pub const MAX_PENDING_REQUESTS: usize = 10_000;

/// Send-buffer depth above which the TCP/UDP engines yield.
pub const MAX_WS_BUFFERED: usize = 1024 * 1024;

/// Send-buffer depth above which the HTTP engine yields.
pub const MAX_HTTP_BUFFERED: usize = 4 * 1024 * 1024;

/// Hard cap on one proxied HTTP response body.
pub const MAX_RESPONSE_SIZE: u64 = 100 * 1024 * 1024;

/// Largest datagram the UDP relay will carry.
pub const MAX_UDP_PACKET_SIZE: usize = 65_535;

/// Longest DNS name accepted on the wire.
pub const MAX_DNS_NAME_LENGTH: usize = 253;

/// Read buffer driven by the egress TCP relay loop.
pub const TCP_READ_BUFFER: usize = 64 * 1024;

pub mod timeouts {
    use std::time::Duration;

    /// Interval between outbound heartbeats.
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    /// Watchdog: no inbound frame for this long drops the socket.
    pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
    /// Grace window during which a dropped session stays addressable.
    pub const RECONNECT_TIMEOUT: Duration = Duration::from_secs(60);
    /// Egress-side TCP connect bound.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Egress-side DNS resolution bound.
    pub const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
    /// Egress-side HTTP fetch bound. Deliberately shorter than the
    /// ingress awaiter's bound so the server surfaces the error first.
    pub const FETCH_TIMEOUT: Duration = Duration::from_secs(25);
    /// Ingress-side bound on any first reply.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    /// Unreplied pending entries older than this are reaped.
    pub const PENDING_REAPER: Duration = Duration::from_secs(120);
    /// Poll interval while waiting out transport backpressure.
    pub const BACKPRESSURE_POLL: Duration = Duration::from_millis(5);
}

/// Errors produced while decoding frames or sub-payloads.
///
/// None of these are fatal to the transport: the receiver logs the
/// offending frame and drops it, or answers with a terminal frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer than the 5 envelope bytes were present.
    #[error("frame shorter than the {HEADER_LEN}-byte header")]
    Short,

    /// A sub-payload record ended before its declared length.
    #[error("truncated payload record")]
    Truncated,

    /// A length-prefixed string was not valid UTF-8.
    #[error("payload string is not valid utf-8")]
    InvalidUtf8,

    /// A DNS name exceeded [`MAX_DNS_NAME_LENGTH`].
    #[error("dns name longer than {MAX_DNS_NAME_LENGTH} bytes")]
    NameTooLong,

    /// An unknown DNS record type octet.
    #[error("unknown dns record type {0:#04x}")]
    UnknownRecordType(u8),

    /// A datagram larger than [`MAX_UDP_PACKET_SIZE`].
    #[error("datagram exceeds {MAX_UDP_PACKET_SIZE} bytes")]
    DatagramTooLarge,

    /// An unknown tag octet in the opaque value codec.
    #[error("unknown value tag {0:#04x}")]
    UnknownTag(u8),

    /// A varint ran past the 64-bit range.
    #[error("varint overflows 64 bits")]
    VarintOverflow,

    /// Bytes remained after a complete top-level value.
    #[error("trailing bytes after value")]
    TrailingBytes,

    /// A structured payload decoded to an unexpected shape.
    #[error("unexpected payload shape: {0}")]
    UnexpectedShape(&'static str),
}
