//! Content Encodings
//!
//! Accept-Encoding negotiation and the compressors behind each coding.

use std::io::{Read, Write};

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Supported content codings, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Zstd,
    Gzip,
    Deflate,
    Identity,
}

impl Encoding {
    /// Preference order used to break q-value ties
    pub const PREFERENCE: [Encoding; 3] = [Encoding::Zstd, Encoding::Gzip, Encoding::Deflate];

    /// Token used in Accept-Encoding / Content-Encoding
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Zstd => "zstd",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Identity => "identity",
        }
    }

    fn matches_token(&self, token: &str) -> bool {
        token.eq_ignore_ascii_case(self.name())
            || (*self == Encoding::Gzip && token.eq_ignore_ascii_case("x-gzip"))
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Compression levels per coding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionLevels {
    pub zstd: i32,
    pub gzip: u32,
    pub deflate: u32,
}

impl Default for CompressionLevels {
    fn default() -> Self {
        Self {
            zstd: 3,
            gzip: 6,
            deflate: 6,
        }
    }
}

/// Parse `gzip;q=0.8, zstd, *;q=0.1` into (token, q) pairs.
/// Entries with unparseable q-values are dropped.
fn parse_accept_encoding(header: &str) -> Vec<(&str, f32)> {
    header
        .split(',')
        .filter_map(|part| {
            let mut params = part.split(';');
            let token = params.next()?.trim();
            if token.is_empty() {
                return None;
            }
            let mut q = 1.0f32;
            for param in params {
                if let Some((name, value)) = param.split_once('=') {
                    if name.trim().eq_ignore_ascii_case("q") {
                        q = value.trim().parse::<f32>().ok().filter(|q| (0.0..=1.0).contains(q))?;
                    }
                }
            }
            Some((token, q))
        })
        .collect()
}

/// Choose the coding for a response.
///
/// Highest q-value wins; ties go to the stronger coding. A coding not listed
/// takes the `*` q-value if present. Falls back to identity when nothing
/// supported is acceptable or the header is absent.
pub fn select_encoding(accept_encoding: Option<&str>) -> Encoding {
    let Some(header) = accept_encoding else {
        return Encoding::Identity;
    };
    let offered = parse_accept_encoding(header);
    let wildcard = offered.iter().find(|(t, _)| *t == "*").map(|(_, q)| *q);

    let mut best = Encoding::Identity;
    let mut best_q = 0.0f32;
    for encoding in Encoding::PREFERENCE {
        let q = offered
            .iter()
            .find(|(token, _)| encoding.matches_token(token))
            .map(|(_, q)| *q)
            .or(wildcard)
            .unwrap_or(0.0);
        if q > best_q {
            best = encoding;
            best_q = q;
        }
    }
    best
}

fn failed(encoding: Encoding, e: impl std::fmt::Display) -> Error {
    Error::CompressionFailed {
        algorithm: encoding.name().to_string(),
        reason: e.to_string(),
    }
}

/// Encode `data` with `encoding`
pub fn compress(encoding: Encoding, data: &[u8], levels: &CompressionLevels) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Identity => Ok(data.to_vec()),
        Encoding::Zstd => zstd::encode_all(data, levels.zstd).map_err(|e| failed(encoding, e)),
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::new(levels.gzip));
            encoder.write_all(data).map_err(|e| failed(encoding, e))?;
            encoder.finish().map_err(|e| failed(encoding, e))
        }
        // HTTP "deflate" is the zlib format
        Encoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(levels.deflate));
            encoder.write_all(data).map_err(|e| failed(encoding, e))?;
            encoder.finish().map_err(|e| failed(encoding, e))
        }
    }
}

/// Decode `data` that was encoded with `encoding`
pub fn decompress(encoding: Encoding, data: &[u8]) -> Result<Vec<u8>> {
    let decode_failed = |e: std::io::Error| Error::DecompressionFailed {
        algorithm: encoding.name().to_string(),
        reason: e.to_string(),
    };
    let mut output = Vec::new();
    match encoding {
        Encoding::Identity => output.extend_from_slice(data),
        Encoding::Zstd => output = zstd::decode_all(data).map_err(decode_failed)?,
        Encoding::Gzip => {
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut output)
                .map_err(decode_failed)?;
        }
        Encoding::Deflate => {
            flate2::read::ZlibDecoder::new(data)
                .read_to_end(&mut output)
                .map_err(decode_failed)?;
        }
    }
    Ok(output)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_preference_order() {
        assert_eq!(select_encoding(Some("gzip, deflate, zstd")), Encoding::Zstd);
        assert_eq!(select_encoding(Some("gzip, deflate")), Encoding::Gzip);
        assert_eq!(select_encoding(Some("deflate")), Encoding::Deflate);
        assert_eq!(select_encoding(Some("br")), Encoding::Identity);
        assert_eq!(select_encoding(None), Encoding::Identity);
        assert_eq!(select_encoding(Some("")), Encoding::Identity);
    }

    #[test]
    fn test_q_values() {
        assert_eq!(select_encoding(Some("zstd;q=0.5, gzip;q=0.9")), Encoding::Gzip);
        assert_eq!(select_encoding(Some("zstd;q=0, gzip")), Encoding::Gzip);
        assert_eq!(select_encoding(Some("gzip;q=0, deflate;q=0")), Encoding::Identity);
        assert_eq!(select_encoding(Some("GZIP ; Q=0.7")), Encoding::Gzip);
        // Malformed q drops only that entry
        assert_eq!(select_encoding(Some("zstd;q=high, deflate")), Encoding::Deflate);
    }

    #[test]
    fn test_wildcard() {
        assert_eq!(select_encoding(Some("*")), Encoding::Zstd);
        assert_eq!(select_encoding(Some("zstd;q=0, *")), Encoding::Gzip);
        assert_eq!(select_encoding(Some("*;q=0")), Encoding::Identity);
        assert_eq!(select_encoding(Some("x-gzip")), Encoding::Gzip);
    }

    #[test]
    fn test_compress_roundtrip_each_coding() {
        let data = br#"{"items":[{"id":"v1","location":"Galle"}]}"#.repeat(40);
        let levels = CompressionLevels::default();
        for encoding in Encoding::PREFERENCE {
            let compressed = compress(encoding, &data, &levels).unwrap();
            assert!(compressed.len() < data.len(), "{} did not shrink", encoding);
            assert_eq!(decompress(encoding, &compressed).unwrap(), data);
        }
    }

    #[test]
    fn test_decompress_garbage_fails() {
        assert_matches!(
            decompress(Encoding::Gzip, b"not gzip"),
            Err(Error::DecompressionFailed { .. })
        );
    }
}
