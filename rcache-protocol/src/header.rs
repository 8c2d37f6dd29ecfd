//! Fixed-layout binary message header.
//!
//! Header layout (24 bytes, big-endian, written first in every message):
//!
//! ```text
//! +------------+--------+-------------+--------------+---------------+
//! | request_id | status | dao_version | payload_size | inflated_size |
//! |  8 bytes   | 4 bytes|   4 bytes   |   4 bytes    |    4 bytes    |
//! +------------+--------+-------------+--------------+---------------+
//! ```
//!
//! All variability lives in the payload; the header itself never carries
//! variable-length fields.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

/// Size of the fixed message header in bytes (8+4+4+4+4 = 24).
pub const HEADER_SIZE: usize = 24;

/// Replication call outcome carried in the header status field.
///
/// The wire values and `RC_*` names are part of the protocol contract and
/// must remain stable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StatusType {
    #[default]
    None,
    CompressedValue,
    UncompressedValue,
    NotFound,
    DaoVersionMismatch,
    DatabaseMismatch,
    BaselineMismatch,
    IncompatibleMode,
    MasterNonhistorical,
    MasterCacheUpdateStopped,
    RequestFromSameHost,
    ServerError,
    UnknownError,
}

impl StatusType {
    /// Returns the wire value of this status.
    pub fn as_u32(self) -> u32 {
        match self {
            StatusType::None => 0,
            StatusType::CompressedValue => 1,
            StatusType::UncompressedValue => 2,
            StatusType::NotFound => 3,
            StatusType::DaoVersionMismatch => 4,
            StatusType::DatabaseMismatch => 5,
            StatusType::BaselineMismatch => 6,
            StatusType::IncompatibleMode => 7,
            StatusType::MasterNonhistorical => 8,
            StatusType::MasterCacheUpdateStopped => 9,
            StatusType::RequestFromSameHost => 10,
            StatusType::ServerError => 11,
            StatusType::UnknownError => 12,
        }
    }

    /// Parses a wire value into a status.
    pub fn from_u32(value: u32) -> Result<Self, ProtocolError> {
        Ok(match value {
            0 => StatusType::None,
            1 => StatusType::CompressedValue,
            2 => StatusType::UncompressedValue,
            3 => StatusType::NotFound,
            4 => StatusType::DaoVersionMismatch,
            5 => StatusType::DatabaseMismatch,
            6 => StatusType::BaselineMismatch,
            7 => StatusType::IncompatibleMode,
            8 => StatusType::MasterNonhistorical,
            9 => StatusType::MasterCacheUpdateStopped,
            10 => StatusType::RequestFromSameHost,
            11 => StatusType::ServerError,
            12 => StatusType::UnknownError,
            other => return Err(ProtocolError::UnknownStatus(other)),
        })
    }

    /// Returns whether this status carries a cache value.
    pub fn is_value(self) -> bool {
        matches!(self, StatusType::CompressedValue | StatusType::UncompressedValue)
    }

    /// Returns whether this status is a client-correctable incompatibility.
    pub fn is_mismatch(self) -> bool {
        matches!(
            self,
            StatusType::DaoVersionMismatch
                | StatusType::DatabaseMismatch
                | StatusType::BaselineMismatch
                | StatusType::IncompatibleMode
                | StatusType::MasterNonhistorical
        )
    }
}

impl fmt::Display for StatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusType::None => "RC_NONE",
            StatusType::CompressedValue => "RC_COMPRESSED_VALUE",
            StatusType::UncompressedValue => "RC_UNCOMPRESSED_VALUE",
            StatusType::NotFound => "RC_NOT_FOUND",
            StatusType::DaoVersionMismatch => "RC_DAO_VERSION_MISMATCH",
            StatusType::DatabaseMismatch => "RC_DATABASE_MISMATCH",
            StatusType::BaselineMismatch => "RC_BASELINE_MISMATCH",
            StatusType::IncompatibleMode => "RC_INCOMPATIBLE_MODE",
            StatusType::MasterNonhistorical => "RC_MASTER_NONHISTORICAL",
            StatusType::MasterCacheUpdateStopped => "RC_MASTER_CACHE_UPDATE_STOPPED",
            StatusType::RequestFromSameHost => "RC_REQUEST_FROM_SAME_HOST",
            StatusType::ServerError => "RC_SERVER_ERROR",
            StatusType::UnknownError => "RC_UNKNOWN_ERROR",
        };
        f.write_str(s)
    }
}

/// A parsed message header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Opaque correlation id chosen by the client; echoed unchanged in the reply.
    pub request_id: u64,
    /// Call outcome; `RC_NONE` until set.
    pub status: StatusType,
    /// Client's expected schema version on request, server's authoritative
    /// version on a mismatch reply.
    pub dao_version: u32,
    /// Size of the (possibly compressed) payload that follows the header.
    pub payload_size: u32,
    /// Decompressed size of a compressed payload; zero otherwise.
    pub inflated_size: u32,
}

impl Header {
    /// Creates a request header with the given correlation id and version.
    pub fn request(request_id: u64, dao_version: u32) -> Self {
        Self {
            request_id,
            dao_version,
            ..Default::default()
        }
    }

    /// Encodes the header into the buffer. Pure and deterministic.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE);
        buf.put_u64(self.request_id);
        buf.put_u32(self.status.as_u32());
        buf.put_u32(self.dao_version);
        buf.put_u32(self.payload_size);
        buf.put_u32(self.inflated_size);
    }

    /// Encodes the header into a fresh buffer of exactly `HEADER_SIZE` bytes.
    pub fn encode_to_vec(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        self.encode(&mut buf);
        buf
    }

    /// Decodes a header from a buffer of at least `HEADER_SIZE` bytes.
    ///
    /// Exact inverse of [`Header::encode`]: `decode(encode(h)) == h` for all
    /// valid headers.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::TruncatedPayload {
                needed: HEADER_SIZE - buf.len(),
            });
        }

        let mut buf = &buf[..HEADER_SIZE];
        let request_id = buf.get_u64();
        let status = StatusType::from_u32(buf.get_u32())?;
        let dao_version = buf.get_u32();
        let payload_size = buf.get_u32();
        let inflated_size = buf.get_u32();

        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            request_id,
            status,
            dao_version,
            payload_size,
            inflated_size,
        })
    }
}
