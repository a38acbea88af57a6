//! Response Optimizer
//!
//! Negotiates the content coding for a payload and attaches the caching
//! metadata intermediaries need: `Cache-Control`, an `ETag` validator, and
//! `Vary: Accept-Encoding`. Compression failures fall back to the identity
//! coding and never fail the response.

mod encoding;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use encoding::{compress, decompress, select_encoding, CompressionLevels, Encoding};

use crate::query::fingerprint;

/// Response optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    /// Payloads smaller than this are sent uncompressed
    pub min_compress_bytes: usize,
    pub levels: CompressionLevels,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            min_compress_bytes: 256,
            levels: CompressionLevels::default(),
        }
    }
}

/// Payload in its negotiated coding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub body: Bytes,
    pub encoding: Encoding,
}

/// Where the payload came from, reported in `X-Cache`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn header_value(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Conditional-request inputs taken from the client request
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestHeaders<'a> {
    pub accept_encoding: Option<&'a str>,
    pub if_none_match: Option<&'a str>,
}

/// Fully prepared response
#[derive(Debug, Clone)]
pub struct PreparedResponse {
    /// 200, or 304 when the client's validator matched
    pub status: u16,
    pub body: Bytes,
    pub headers: Vec<(&'static str, String)>,
}

impl PreparedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Compression negotiation plus cache metadata
#[derive(Debug, Clone, Default)]
pub struct ResponseOptimizer {
    config: ResponseConfig,
}

impl ResponseOptimizer {
    pub fn new(config: ResponseConfig) -> Self {
        Self { config }
    }

    /// Encode `payload` with the strongest coding the client accepts.
    ///
    /// The compressed form is used only when it is smaller.
    pub fn negotiate(&self, accept_encoding: Option<&str>, payload: Bytes) -> Negotiated {
        let identity = |body: Bytes| Negotiated {
            body,
            encoding: Encoding::Identity,
        };
        if payload.len() < self.config.min_compress_bytes {
            return identity(payload);
        }

        let encoding = select_encoding(accept_encoding);
        if encoding == Encoding::Identity {
            return identity(payload);
        }

        match compress(encoding, &payload, &self.config.levels) {
            Ok(compressed) if compressed.len() < payload.len() => Negotiated {
                body: Bytes::from(compressed),
                encoding,
            },
            Ok(_) => identity(payload),
            Err(e) => {
                warn!("{}; sending uncompressed", e);
                identity(payload)
            }
        }
    }

    /// Build the full response for a cacheable payload
    pub fn prepare(
        &self,
        request: RequestHeaders<'_>,
        payload: Bytes,
        ttl_secs: u64,
        cache_status: CacheStatus,
    ) -> PreparedResponse {
        let tag = etag(&payload);
        let mut headers = vec![
            ("cache-control", cache_control(ttl_secs)),
            ("etag", tag.clone()),
            ("vary", "Accept-Encoding".to_string()),
            ("x-cache", cache_status.header_value().to_string()),
        ];

        if request
            .if_none_match
            .is_some_and(|candidates| etag_matches(candidates, &tag))
        {
            return PreparedResponse {
                status: 304,
                body: Bytes::new(),
                headers,
            };
        }

        let negotiated = self.negotiate(request.accept_encoding, payload);
        headers.push(("content-type", "application/json".to_string()));
        if negotiated.encoding != Encoding::Identity {
            headers.push(("content-encoding", negotiated.encoding.name().to_string()));
        }

        PreparedResponse {
            status: 200,
            body: negotiated.body,
            headers,
        }
    }
}

/// `Cache-Control` value for a TTL
pub fn cache_control(ttl_secs: u64) -> String {
    format!("public, max-age={}, s-maxage={}", ttl_secs, ttl_secs)
}

/// Weak validator over the identity payload; every coding of the same
/// payload shares it
pub fn etag(payload: &[u8]) -> String {
    format!("W/\"{}\"", fingerprint(payload))
}

/// Weak comparison of an `If-None-Match` list against `etag`
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let opaque = |tag: &str| tag.trim().trim_start_matches("W/").to_string();
    let wanted = opaque(etag);
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| candidate == "*" || opaque(candidate) == wanted)
}

// =============================================================================
// Tests
// =============================================================================
