use thiserror::Error;

use crate::proto::DecodeError;

/// Errors surfaced to awaiters of tunnel operations.
///
/// Per-stream failures never take down the transport: they terminate one
/// resource id and reach the caller through its reply or data channel.
/// Transport loss resets in-flight streams only; the session itself may
/// survive through the reconnect grace window.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The egress peer reported a failure for this stream.
    #[error("{0}")]
    Upstream(String),

    /// The operation outlived its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The transport dropped while the operation was in flight.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The link's bounded send queue was full; the frame was dropped.
    #[error("send queue full")]
    QueueFull,

    /// The pending-request table is at capacity.
    #[error("too many in-flight requests")]
    TooManyRequests,

    /// The caller aborted the stream.
    #[error("aborted")]
    Aborted,

    /// A URL did not parse or used a scheme other than http/https.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
