//! Remote Tier Payload Codec
//!
//! Binary envelope for entries stored in the shared tier, with LZ4
//! compression of the body and automatic fallback to raw on failure.
//!
//! ```text
//! ┌──────┬─────┬───────┬─────────┬─────────┬──────┬──────────────────┬──────┐
//! │ "CE" │ ver │ codec │ created │ expires │ ntag │ (len, tag, gen)* │ body │
//! │  2B  │ 1B  │  1B   │  u64    │  u64    │ u16  │                  │      │
//! └──────┴─────┴───────┴─────────┴─────────┴──────┴──────────────────┴──────┘
//! ```

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::entry::CacheEntry;
use crate::error::{Error, Result};

const MAGIC: &[u8; 2] = b"CE";
const VERSION: u8 = 1;

/// Body encoding inside the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadCodec {
    /// Stored as-is
    Raw,
    /// LZ4 block with prepended size
    Lz4,
}

impl PayloadCodec {
    fn id(self) -> u8 {
        match self {
            PayloadCodec::Raw => 0,
            PayloadCodec::Lz4 => 1,
        }
    }

    fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(PayloadCodec::Raw),
            1 => Some(PayloadCodec::Lz4),
            _ => None,
        }
    }
}

fn lz4_compress(data: &[u8]) -> Result<Vec<u8>> {
    lz4::block::compress(
        data,
        Some(lz4::block::CompressionMode::HIGHCOMPRESSION(4)),
        true,
    )
    .map_err(|e| Error::CompressionFailed {
        algorithm: "LZ4".into(),
        reason: e.to_string(),
    })
}

fn lz4_decompress(data: &[u8]) -> Result<Vec<u8>> {
    lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
        algorithm: "LZ4".into(),
        reason: e.to_string(),
    })
}

/// Encode an entry for the remote tier.
///
/// Bodies of at least `compress_min_bytes` are LZ4-compressed when that makes
/// them smaller; otherwise the body is stored raw.
pub fn encode_entry(entry: &CacheEntry, compress_min_bytes: usize) -> Bytes {
    let value = entry.value();
    let (codec, body) = if value.len() >= compress_min_bytes {
        match lz4_compress(value) {
            Ok(compressed) if compressed.len() < value.len() => {
                (PayloadCodec::Lz4, Bytes::from(compressed))
            }
            Ok(_) => (PayloadCodec::Raw, value.clone()),
            Err(e) => {
                tracing::warn!("Compression failed, storing raw: {}", e);
                (PayloadCodec::Raw, value.clone())
            }
        }
    } else {
        (PayloadCodec::Raw, value.clone())
    };

    let tags = entry.tag_generations();
    let tag_bytes: usize = tags.keys().map(|t| 2 + t.len() + 8).sum();
    let mut buf = BytesMut::with_capacity(22 + tag_bytes + body.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(codec.id());
    buf.put_u64(entry.created_at_ms());
    buf.put_u64(entry.expires_at_ms());
    buf.put_u16(tags.len() as u16);
    for (tag, gen) in tags {
        buf.put_u16(tag.len() as u16);
        buf.put_slice(tag.as_bytes());
        buf.put_u64(*gen);
    }
    buf.put_slice(&body);
    buf.freeze()
}

/// Decode an entry read from the remote tier
pub fn decode_entry(key: &str, payload: Bytes) -> Result<CacheEntry> {
    let corrupt = |reason: &str| Error::CorruptEntry {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    let mut buf = payload;
    if buf.remaining() < 22 || &buf[..2] != MAGIC {
        return Err(corrupt("bad header"));
    }
    buf.advance(2);
    if buf.get_u8() != VERSION {
        return Err(corrupt("unsupported version"));
    }
    let codec = PayloadCodec::from_id(buf.get_u8()).ok_or_else(|| corrupt("unknown codec"))?;
    let created = buf.get_u64();
    let expires = buf.get_u64();
    let tag_count = buf.get_u16();

    let mut tags = BTreeMap::new();
    for _ in 0..tag_count {
        if buf.remaining() < 2 {
            return Err(corrupt("truncated tag"));
        }
        let len = buf.get_u16() as usize;
        if buf.remaining() < len + 8 {
            return Err(corrupt("truncated tag"));
        }
        let name = String::from_utf8(buf.split_to(len).to_vec())
            .map_err(|_| corrupt("tag is not utf-8"))?;
        tags.insert(name, buf.get_u64());
    }

    let value = match codec {
        PayloadCodec::Raw => buf,
        PayloadCodec::Lz4 => Bytes::from(lz4_decompress(&buf)?),
    };

    Ok(CacheEntry::with_timestamps(key, value, tags, created, expires))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    const TEST_DATA: &[u8] = b"Hello, this is test data that should compress well. \
        It has some repetition: Hello, this is test data that should compress well.";

    fn entry_with(value: &[u8]) -> CacheEntry {
        let mut tags = BTreeMap::new();
        tags.insert("venues".to_string(), 3);
        tags.insert("location:galle".to_string(), 0);
        CacheEntry::new(
            "venues:{location:galle}",
            Bytes::copy_from_slice(value),
            Duration::from_secs(120),
            tags,
        )
    }

    #[test]
    fn test_small_payload_stored_raw() {
        let entry = entry_with(b"tiny");
        let encoded = encode_entry(&entry, 1024);
        assert_eq!(encoded[3], PayloadCodec::Raw.id());

        let decoded = decode_entry(entry.key(), encoded).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_compressible_payload_uses_lz4() {
        let body = TEST_DATA.repeat(20);
        let entry = entry_with(&body);
        let encoded = encode_entry(&entry, 64);
        assert_eq!(encoded[3], PayloadCodec::Lz4.id());
        assert!(encoded.len() < body.len());

        let decoded = decode_entry(entry.key(), encoded).unwrap();
        assert_eq!(decoded.value().as_ref(), body.as_slice());
        assert_eq!(decoded.tag_generations().get("venues"), Some(&3));
        assert_eq!(decoded.expires_at_ms(), entry.expires_at_ms());
    }

    #[test]
    fn test_rejects_garbage() {
        let result = decode_entry("k", Bytes::from_static(b"not an envelope at all!!"));
        assert_matches!(result, Err(Error::CorruptEntry { .. }));

        let result = decode_entry("k", Bytes::from_static(b"CE"));
        assert_matches!(result, Err(Error::CorruptEntry { .. }));
    }

    #[test]
    fn test_rejects_truncated_tags() {
        let entry = entry_with(b"v");
        let encoded = encode_entry(&entry, 1024);
        let truncated = encoded.slice(..26);
        assert_matches!(decode_entry("k", truncated), Err(Error::CorruptEntry { .. }));
    }
}
