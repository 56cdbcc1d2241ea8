use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{CONTROL_RESOURCE_ID, DecodeError};

/// Envelope header length: kind octet plus big-endian resource id.
pub const HEADER_LEN: usize = 5;

/// Message taxonomy of the tunnel protocol.
///
/// The octet mapping is the wire contract. Octets outside the table
/// survive decoding as [`Kind::Unknown`] so the receiver can log and
/// drop them without treating the transport as corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    TcpConnect,
    TcpConnectAck,
    TcpData,
    TcpClose,
    UdpBind,
    UdpBindAck,
    UdpData,
    UdpClose,
    DnsQuery,
    DnsResponse,
    HttpRequest,
    HttpResponse,
    HttpBodyChunk,
    HttpBodyEnd,
    Error,
    Heartbeat,
    Unknown(u8),
}

impl Kind {
    pub fn from_u8(octet: u8) -> Kind {
        match octet {
            0x01 => Kind::TcpConnect,
            0x02 => Kind::TcpConnectAck,
            0x03 => Kind::TcpData,
            0x04 => Kind::TcpClose,
            0x11 => Kind::UdpBind,
            0x12 => Kind::UdpBindAck,
            0x13 => Kind::UdpData,
            0x14 => Kind::UdpClose,
            0x21 => Kind::DnsQuery,
            0x22 => Kind::DnsResponse,
            0x31 => Kind::HttpRequest,
            0x32 => Kind::HttpResponse,
            0x33 => Kind::HttpBodyChunk,
            0x34 => Kind::HttpBodyEnd,
            0xFE => Kind::Error,
            0xFF => Kind::Heartbeat,
            other => Kind::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Kind::TcpConnect => 0x01,
            Kind::TcpConnectAck => 0x02,
            Kind::TcpData => 0x03,
            Kind::TcpClose => 0x04,
            Kind::UdpBind => 0x11,
            Kind::UdpBindAck => 0x12,
            Kind::UdpData => 0x13,
            Kind::UdpClose => 0x14,
            Kind::DnsQuery => 0x21,
            Kind::DnsResponse => 0x22,
            Kind::HttpRequest => 0x31,
            Kind::HttpResponse => 0x32,
            Kind::HttpBodyChunk => 0x33,
            Kind::HttpBodyEnd => 0x34,
            Kind::Error => 0xFE,
            Kind::Heartbeat => 0xFF,
            Kind::Unknown(other) => other,
        }
    }

    /// Whether this message ends its stream. After a terminal message no
    /// further frames for the same resource id may be sent.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Kind::TcpClose | Kind::UdpClose | Kind::HttpBodyEnd | Kind::Error
        )
    }

    /// The terminal to answer with when a non-terminal frame arrives for
    /// a resource id the receiver no longer tracks. Forces the sender to
    /// clean up a leaked stream. `None` for frames that are themselves
    /// terminal, for heartbeats, and for DNS (a lost reply just times
    /// the awaiter out; there is no DNS close message).
    pub fn late_reply(self) -> Option<Kind> {
        match self {
            Kind::TcpConnect | Kind::TcpConnectAck | Kind::TcpData => Some(Kind::TcpClose),
            Kind::UdpBind | Kind::UdpBindAck | Kind::UdpData => Some(Kind::UdpClose),
            Kind::HttpRequest | Kind::HttpResponse | Kind::HttpBodyChunk => {
                Some(Kind::HttpBodyEnd)
            }
            _ => None,
        }
    }
}

/// One binary transport message.
///
/// The payload is kept as [`Bytes`] because per-stream handlers retain
/// it past the lifetime of the transport read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: Kind,
    pub resource_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: Kind, resource_id: u32, payload: impl Into<Bytes>) -> Frame {
        Frame {
            kind,
            resource_id,
            payload: payload.into(),
        }
    }

    pub fn empty(kind: Kind, resource_id: u32) -> Frame {
        Frame::new(kind, resource_id, Bytes::new())
    }

    pub fn heartbeat() -> Frame {
        Frame::empty(Kind::Heartbeat, CONTROL_RESOURCE_ID)
    }

    pub fn error(resource_id: u32, message: &str) -> Frame {
        Frame::new(
            Kind::Error,
            resource_id,
            Bytes::copy_from_slice(message.as_bytes()),
        )
    }

    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        dst.put_u8(self.kind.as_u8());
        dst.put_u32(self.resource_id);
        dst.extend_from_slice(&self.payload);
        dst.freeze()
    }

    /// Parse one transport message. The payload is everything after the
    /// header; the transport frame carries the boundary.
    pub fn decode(mut src: Bytes) -> Result<Frame, DecodeError> {
        if src.len() < HEADER_LEN {
            return Err(DecodeError::Short);
        }
        let kind = Kind::from_u8(src.get_u8());
        let resource_id = src.get_u32();
        Ok(Frame {
            kind,
            resource_id,
            payload: src,
        })
    }
}
