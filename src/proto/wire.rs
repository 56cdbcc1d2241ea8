//! Sub-payload codecs for the egress sub-protocols.
//!
//! DNS and UDP records are little-endian length-prefixed structs; TCP
//! connect targets and HTTP metadata ride the tagged [`Value`] codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::Value;
use super::{DecodeError, MAX_DNS_NAME_LENGTH, MAX_UDP_PACKET_SIZE};

/// DNS record classes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
    Aname,
    Cname,
    Ns,
    Ptr,
}

impl RecordType {
    pub fn from_u8(octet: u8) -> Result<RecordType, DecodeError> {
        match octet {
            0 => Ok(RecordType::A),
            1 => Ok(RecordType::Aaaa),
            2 => Ok(RecordType::Aname),
            3 => Ok(RecordType::Cname),
            4 => Ok(RecordType::Ns),
            5 => Ok(RecordType::Ptr),
            other => Err(DecodeError::UnknownRecordType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RecordType::A => 0,
            RecordType::Aaaa => 1,
            RecordType::Aname => 2,
            RecordType::Cname => 3,
            RecordType::Ns => 4,
            RecordType::Ptr => 5,
        }
    }
}

/// `DNS_QUERY` payload: `nameLen u16 LE | name | recordType u8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub name: String,
    pub record_type: RecordType,
}

impl DnsQuery {
    pub fn encode(&self) -> Result<Bytes, DecodeError> {
        if self.name.len() > MAX_DNS_NAME_LENGTH {
            return Err(DecodeError::NameTooLong);
        }
        let mut dst = BytesMut::with_capacity(3 + self.name.len());
        dst.put_u16_le(self.name.len() as u16);
        dst.put_slice(self.name.as_bytes());
        dst.put_u8(self.record_type.as_u8());
        Ok(dst.freeze())
    }

    pub fn decode(src: &[u8]) -> Result<DnsQuery, DecodeError> {
        let mut buf = src;
        let name = get_lstring(&mut buf)?;
        if name.len() > MAX_DNS_NAME_LENGTH {
            return Err(DecodeError::NameTooLong);
        }
        if buf.remaining() < 1 {
            return Err(DecodeError::Truncated);
        }
        let record_type = RecordType::from_u8(buf.get_u8())?;
        Ok(DnsQuery { name, record_type })
    }
}

/// `DNS_RESPONSE` payload: `count u16 LE | (ipLen u16 LE | ip)*`.
///
/// Addresses are textual, in the resolver's native form (IPv4 dotted,
/// IPv6 canonical, names for CNAME/NS/PTR records).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponse {
    pub addresses: Vec<String>,
}

impl DnsResponse {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        dst.put_u16_le(self.addresses.len() as u16);
        for address in &self.addresses {
            dst.put_u16_le(address.len() as u16);
            dst.put_slice(address.as_bytes());
        }
        dst.freeze()
    }

    pub fn decode(src: &[u8]) -> Result<DnsResponse, DecodeError> {
        let mut buf = src;
        if buf.remaining() < 2 {
            return Err(DecodeError::Truncated);
        }
        let count = buf.get_u16_le();
        let mut addresses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            addresses.push(get_lstring(&mut buf)?);
        }
        Ok(DnsResponse { addresses })
    }
}

/// One `host, port` pair as framed in UDP bind/ack payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpEndpoint {
    pub host: String,
    pub port: u16,
}

impl UdpEndpoint {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(4 + self.host.len());
        put_endpoint(&mut dst, &self.host, self.port);
        dst.freeze()
    }

    pub fn decode(src: &[u8]) -> Result<UdpEndpoint, DecodeError> {
        let mut buf = src;
        let (host, port) = get_endpoint(&mut buf)?;
        Ok(UdpEndpoint { host, port })
    }
}

/// `UDP_DATA` payload: endpoint prefix plus one datagram.
///
/// Toward the egress peer the endpoint is the target address; toward the
/// ingress peer it is the sender address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub host: String,
    pub port: u16,
    pub data: Bytes,
}

impl UdpPacket {
    pub fn encode(&self) -> Result<Bytes, DecodeError> {
        if self.data.len() > MAX_UDP_PACKET_SIZE {
            return Err(DecodeError::DatagramTooLarge);
        }
        let mut dst = BytesMut::with_capacity(4 + self.host.len() + self.data.len());
        put_endpoint(&mut dst, &self.host, self.port);
        dst.extend_from_slice(&self.data);
        Ok(dst.freeze())
    }

    pub fn decode(src: &Bytes) -> Result<UdpPacket, DecodeError> {
        let mut buf = &src[..];
        let (host, port) = get_endpoint(&mut buf)?;
        if buf.len() > MAX_UDP_PACKET_SIZE {
            return Err(DecodeError::DatagramTooLarge);
        }
        // Slice out of the original buffer so the datagram is not copied.
        let data = src.slice(src.len() - buf.len()..);
        Ok(UdpPacket { host, port, data })
    }
}

/// `TCP_CONNECT` payload: a `[host, port]` pair in the tagged codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    pub fn encode(&self) -> Bytes {
        Value::Array(vec![
            Value::string(&self.host),
            Value::Integer(i64::from(self.port)),
        ])
        .encode()
    }

    pub fn decode(src: &[u8]) -> Result<ConnectTarget, DecodeError> {
        let value = Value::decode(src)?;
        let Value::Array(items) = value else {
            return Err(DecodeError::UnexpectedShape("connect target is not a pair"));
        };
        let [host, port] = items.as_slice() else {
            return Err(DecodeError::UnexpectedShape("connect target is not a pair"));
        };
        let host = host
            .as_str()
            .ok_or(DecodeError::UnexpectedShape("connect host is not a string"))?;
        let port = port
            .as_i64()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or(DecodeError::UnexpectedShape("connect port out of range"))?;
        Ok(ConnectTarget {
            host: host.to_owned(),
            port,
        })
    }
}

/// `HTTP_REQUEST` payload: `{method, url, headers}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestMeta {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequestMeta {
    pub fn encode(&self) -> Bytes {
        Value::Object(vec![
            ("method".into(), Value::string(&self.method)),
            ("url".into(), Value::string(&self.url)),
            ("headers".into(), headers_to_value(&self.headers)),
        ])
        .encode()
    }

    pub fn decode(src: &[u8]) -> Result<HttpRequestMeta, DecodeError> {
        let value = Value::decode(src)?;
        Ok(HttpRequestMeta {
            method: require_str(&value, "method")?,
            url: require_str(&value, "url")?,
            headers: headers_from_value(value.get("headers"))?,
        })
    }
}

/// `HTTP_RESPONSE` payload: `{status, statusText, headers, url, body}`.
///
/// `transfer-encoding` is stripped at encode time: the tunnel itself
/// frames body chunks, and the receiving proxy adapter re-synthesizes
/// transfer framing if it needs to expose an HTTP/1.1 stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseMeta {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub url: String,
    pub body: bool,
}

impl HttpResponseMeta {
    pub fn encode(&self) -> Bytes {
        let headers: Vec<_> = self
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("transfer-encoding"))
            .cloned()
            .collect();
        Value::Object(vec![
            ("status".into(), Value::Integer(i64::from(self.status))),
            ("statusText".into(), Value::string(&self.status_text)),
            ("headers".into(), headers_to_value(&headers)),
            ("url".into(), Value::string(&self.url)),
            ("body".into(), Value::Bool(self.body)),
        ])
        .encode()
    }

    pub fn decode(src: &[u8]) -> Result<HttpResponseMeta, DecodeError> {
        let value = Value::decode(src)?;
        let status = value
            .get("status")
            .and_then(Value::as_i64)
            .and_then(|s| u16::try_from(s).ok())
            .ok_or(DecodeError::UnexpectedShape("response status out of range"))?;
        Ok(HttpResponseMeta {
            status,
            status_text: require_str(&value, "statusText")?,
            headers: headers_from_value(value.get("headers"))?,
            url: require_str(&value, "url")?,
            body: value.get("body").and_then(Value::as_bool).unwrap_or(false),
        })
    }
}

fn headers_to_value(headers: &[(String, String)]) -> Value {
    Value::Object(
        headers
            .iter()
            .map(|(name, val)| (name.clone(), Value::string(val)))
            .collect(),
    )
}

fn headers_from_value(value: Option<&Value>) -> Result<Vec<(String, String)>, DecodeError> {
    let Some(Value::Object(entries)) = value else {
        return Err(DecodeError::UnexpectedShape("headers are not an object"));
    };
    entries
        .iter()
        .map(|(name, val)| {
            val.as_str()
                .map(|v| (name.clone(), v.to_owned()))
                .ok_or(DecodeError::UnexpectedShape("header value is not a string"))
        })
        .collect()
}

fn require_str(value: &Value, key: &'static str) -> Result<String, DecodeError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(DecodeError::UnexpectedShape("missing string field"))
}

fn put_endpoint(dst: &mut BytesMut, host: &str, port: u16) {
    dst.put_u16_le(host.len() as u16);
    dst.put_slice(host.as_bytes());
    dst.put_u16_le(port);
}

fn get_endpoint(buf: &mut &[u8]) -> Result<(String, u16), DecodeError> {
    let host = get_lstring(buf)?;
    if buf.remaining() < 2 {
        return Err(DecodeError::Truncated);
    }
    Ok((host, buf.get_u16_le()))
}

fn get_lstring(buf: &mut &[u8]) -> Result<String, DecodeError> {
    if buf.remaining() < 2 {
        return Err(DecodeError::Truncated);
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| DecodeError::InvalidUtf8)?
        .to_owned();
    buf.advance(len);
    Ok(s)
}
