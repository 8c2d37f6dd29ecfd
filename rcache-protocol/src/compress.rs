//! Deflate helpers for cache payloads.
//!
//! Cache entries travel compressed; the header carries the original
//! ("inflated") size so the receiving side can validate the decompressed
//! result.

use crate::error::ProtocolError;
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use std::io::Read;

/// Compresses a buffer with deflate at the default level.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder = DeflateEncoder::new(data, Compression::default());
    let mut out = Vec::with_capacity(data.len() / 2 + 16);
    encoder
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    Ok(out)
}

/// Decompresses a deflated buffer, validating against the declared size.
pub fn inflate(data: &[u8], inflated_size: u32) -> Result<Vec<u8>, ProtocolError> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(inflated_size as usize);
    decoder
        .take(u64::from(inflated_size) + 1)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;

    if out.len() != inflated_size as usize {
        return Err(ProtocolError::InflatedSizeMismatch {
            expected: inflated_size,
            actual: out.len() as u32,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_inflate_roundtrip() {
        let data = b"TAXCODE reference rows, repeated: US1 US2 XF ZP AY US1 US2 XF ZP AY";
        let compressed = deflate(data).unwrap();
        assert!(compressed.len() < data.len());

        let restored = inflate(&compressed, data.len() as u32).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_inflate_size_mismatch() {
        let data = b"some cache entry bytes";
        let compressed = deflate(data).unwrap();

        let result = inflate(&compressed, data.len() as u32 + 5);
        assert!(matches!(
            result,
            Err(ProtocolError::InflatedSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_inflate_garbage() {
        let result = inflate(b"\xFF\xFE\xFD\xFC not deflate data", 10);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_roundtrip() {
        let compressed = deflate(b"").unwrap();
        let restored = inflate(&compressed, 0).unwrap();
        assert!(restored.is_empty());
    }
}
