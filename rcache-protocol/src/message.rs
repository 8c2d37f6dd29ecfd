//! Request and Reply message types.
//!
//! A message on the wire is `header (fixed width) || payload (variable
//! width, sizes declared in the header)`. The request payload is a fixed
//! sequence of length-prefixed fields followed by an opaque cache-key blob;
//! the reply payload is either a deflated cache entry or raw bytes.

use crate::error::ProtocolError;
use crate::header::{Header, StatusType};
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{Duration, Instant};

/// Persistence-mode flag byte for persistent connections.
const FLAG_PERSISTENT: u8 = b'P';
/// Historical-mode flag byte.
const FLAG_HISTORICAL: u8 = b'H';
/// Flag byte used when the mode is off.
const FLAG_OFF: u8 = b'N';

/// A parsed replication request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Header as received.
    pub header: Header,
    /// Client uses persistent connections.
    pub persistent: bool,
    /// Client's build baseline label.
    pub baseline: String,
    /// Requested table (data type) name.
    pub data_type: String,
    /// Client requests historical ("as of" a past date) data.
    pub historical: bool,
    /// Client's current database identity.
    pub database: String,
    /// Opaque cache-key blob, consumed verbatim by the cache controller.
    pub key: Bytes,
}

impl Request {
    /// Parses a request payload read off the wire.
    ///
    /// Field order: persistence flag, baseline, table name, historical
    /// flag, database identity, then the cache-key blob (all remaining
    /// bytes).
    pub fn parse(header: Header, payload: Bytes) -> Result<Self, ProtocolError> {
        let mut buf = payload;

        let persistent = get_flag(&mut buf)? == FLAG_PERSISTENT;
        let baseline = get_string(&mut buf)?;
        let data_type = get_string(&mut buf)?;
        let historical = get_flag(&mut buf)? == FLAG_HISTORICAL;
        let database = get_string(&mut buf)?;
        let key = buf;

        Ok(Self {
            header,
            persistent,
            baseline,
            data_type,
            historical,
            database,
            key,
        })
    }

    /// Encodes the request payload; inverse of [`Request::parse`].
    pub fn encode_payload(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(
            2 + 12 + self.baseline.len() + self.data_type.len() + self.database.len()
                + self.key.len(),
        );
        buf.put_u8(if self.persistent { FLAG_PERSISTENT } else { FLAG_OFF });
        put_string(&mut buf, &self.baseline);
        put_string(&mut buf, &self.data_type);
        buf.put_u8(if self.historical { FLAG_HISTORICAL } else { FLAG_OFF });
        put_string(&mut buf, &self.database);
        buf.put_slice(&self.key);
        buf
    }
}

fn get_flag(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    if !buf.has_remaining() {
        return Err(ProtocolError::TruncatedPayload { needed: 1 });
    }
    Ok(buf.get_u8())
}

fn get_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::TruncatedPayload {
            needed: 4 - buf.remaining(),
        });
    }
    let len = buf.get_u32() as usize;
    if len > MAX_PAYLOAD_SIZE as usize {
        return Err(ProtocolError::PayloadTooLarge {
            size: len as u32,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    if buf.remaining() < len {
        return Err(ProtocolError::TruncatedPayload {
            needed: len - buf.remaining(),
        });
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// A deflated cache payload together with its decompressed size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deflated {
    pub bytes: Bytes,
    pub inflated_size: u32,
}

/// A reply under construction or ready to send.
///
/// Invariant: exactly one of {deflated, raw payload, empty} is populated,
/// and the header `payload_size`/`inflated_size` always match the populated
/// variant.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Header to send.
    pub header: Header,
    /// Compressed payload, if any.
    deflated: Option<Deflated>,
    /// Raw uncompressed payload, if any.
    payload: Bytes,
    /// Monotonic start timestamp for latency accounting.
    start: Instant,
}

impl Reply {
    /// Creates an empty reply echoing the request's correlation id.
    pub fn new(request_id: u64) -> Self {
        Self {
            header: Header {
                request_id,
                ..Default::default()
            },
            deflated: None,
            payload: Bytes::new(),
            start: Instant::now(),
        }
    }

    /// Turns this reply into a stock reply: the status and, as the payload,
    /// exactly its string form. A second call overwrites the first
    /// completely.
    pub fn stock(&mut self, status: StatusType) {
        self.header.status = status;
        self.deflated = None;
        self.set_raw(Bytes::from(status.to_string()));
    }

    /// Populates the compressed arm and the matching header sizes.
    pub fn set_deflated(&mut self, deflated: Deflated) {
        self.payload = Bytes::new();
        self.header.payload_size = deflated.bytes.len() as u32;
        self.header.inflated_size = deflated.inflated_size;
        self.deflated = Some(deflated);
    }

    /// Populates the raw arm and the matching header sizes.
    pub fn set_payload(&mut self, payload: Bytes) {
        self.set_raw(payload);
    }

    fn set_raw(&mut self, payload: Bytes) {
        self.deflated = None;
        self.header.payload_size = payload.len() as u32;
        self.header.inflated_size = 0;
        self.payload = payload;
    }

    /// Returns the compressed payload, if populated.
    pub fn deflated(&self) -> Option<&Deflated> {
        self.deflated.as_ref()
    }

    /// Returns the raw payload (empty unless the raw arm is populated).
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Elapsed time since the reply was started, for latency accounting.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Assembles the outgoing byte ranges: encoded header first, then the
    /// deflated bytes or the raw payload or nothing. Returns the ranges and
    /// the total byte count.
    pub fn to_buffers(&self) -> (Vec<Bytes>, usize) {
        let header = self.header.encode_to_vec().freeze();
        let mut total = header.len();
        let mut buffers = vec![header];

        if let Some(ref deflated) = self.deflated {
            total += deflated.bytes.len();
            buffers.push(deflated.bytes.clone());
        } else if !self.payload.is_empty() {
            total += self.payload.len();
            buffers.push(self.payload.clone());
        }

        (buffers, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HEADER_SIZE;

    fn sample_request() -> Request {
        Request {
            header: Header::request(42, 3),
            persistent: true,
            baseline: "ATSEV2.2024.01".to_string(),
            data_type: "TAXCODE".to_string(),
            historical: false,
            database: "FUNC".to_string(),
            key: Bytes::from_static(b"\x01\x02nation=US"),
        }
    }

    #[test]
    fn test_request_payload_roundtrip() {
        let request = sample_request();
        let payload = request.encode_payload().freeze();
        let parsed = Request::parse(request.header, payload).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_request_flags() {
        let mut request = sample_request();
        request.persistent = false;
        request.historical = true;

        let parsed =
            Request::parse(request.header, request.encode_payload().freeze()).unwrap();
        assert!(!parsed.persistent);
        assert!(parsed.historical);
    }

    #[test]
    fn test_request_empty_key() {
        let mut request = sample_request();
        request.key = Bytes::new();

        let parsed =
            Request::parse(request.header, request.encode_payload().freeze()).unwrap();
        assert!(parsed.key.is_empty());
    }

    #[test]
    fn test_request_truncated_field() {
        let request = sample_request();
        let payload = request.encode_payload();

        // Cut the payload in the middle of the table-name field.
        let truncated = payload.freeze().slice(..8);
        let result = Request::parse(request.header, truncated);
        assert!(matches!(
            result,
            Err(ProtocolError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn test_request_bogus_length_prefix() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'P');
        buf.put_u32(u32::MAX); // length prefix far past the buffer end
        buf.put_slice(b"x");

        let result = Request::parse(Header::default(), buf.freeze());
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_stock_reply_sets_status_string() {
        let mut reply = Reply::new(7);
        reply.stock(StatusType::NotFound);

        assert_eq!(reply.header.status, StatusType::NotFound);
        assert_eq!(reply.payload().as_ref(), b"RC_NOT_FOUND");
        assert_eq!(reply.header.payload_size, b"RC_NOT_FOUND".len() as u32);
        assert_eq!(reply.header.inflated_size, 0);
        assert!(reply.deflated().is_none());
    }

    #[test]
    fn test_stock_reply_overwrite() {
        let mut reply = Reply::new(7);
        reply.set_deflated(Deflated {
            bytes: Bytes::from_static(b"zzz"),
            inflated_size: 30,
        });

        reply.stock(StatusType::BaselineMismatch);
        reply.stock(StatusType::DatabaseMismatch);

        assert_eq!(reply.header.status, StatusType::DatabaseMismatch);
        assert_eq!(reply.payload().as_ref(), b"RC_DATABASE_MISMATCH");
        assert!(reply.deflated().is_none());
        assert_eq!(reply.header.inflated_size, 0);
    }

    #[test]
    fn test_reply_deflated_sizes_match() {
        let mut reply = Reply::new(1);
        reply.header.status = StatusType::CompressedValue;
        reply.set_deflated(Deflated {
            bytes: Bytes::from_static(b"\x05\x06\x07"),
            inflated_size: 99,
        });

        assert_eq!(reply.header.payload_size, 3);
        assert_eq!(reply.header.inflated_size, 99);
        assert!(reply.payload().is_empty());
    }

    #[test]
    fn test_to_buffers_empty_reply() {
        let reply = Reply::new(5);
        let (buffers, total) = reply.to_buffers();

        assert_eq!(buffers.len(), 1);
        assert_eq!(total, HEADER_SIZE);
    }

    #[test]
    fn test_to_buffers_with_payload() {
        let mut reply = Reply::new(5);
        reply.stock(StatusType::ServerError);
        let (buffers, total) = reply.to_buffers();

        assert_eq!(buffers.len(), 2);
        assert_eq!(total, HEADER_SIZE + b"RC_SERVER_ERROR".len());

        // Header range decodes back to the reply header.
        let header = Header::decode(&buffers[0]).unwrap();
        assert_eq!(header, reply.header);
        assert_eq!(buffers[1].as_ref(), b"RC_SERVER_ERROR");
    }

    #[test]
    fn test_to_buffers_with_deflated() {
        let mut reply = Reply::new(5);
        reply.header.status = StatusType::CompressedValue;
        reply.set_deflated(Deflated {
            bytes: Bytes::from_static(b"deflate-bytes"),
            inflated_size: 64,
        });

        let (buffers, total) = reply.to_buffers();
        assert_eq!(buffers.len(), 2);
        assert_eq!(total, HEADER_SIZE + 13);
        assert_eq!(buffers[1].as_ref(), b"deflate-bytes");
    }
}
