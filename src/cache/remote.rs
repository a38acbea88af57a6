//! Remote Tier - Shared Cache Backend
//!
//! Shared across processes; the store itself serializes concurrent writers.
//!
//! # Design
//!
//! - Pluggable backend behind an async trait (Redis, in-memory)
//! - Payloads are opaque envelopes produced by the codec module
//! - Every failure surfaces as `Error::CacheUnavailable` so callers can degrade

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::entry::now_millis;
use crate::error::{Error, Result};

/// Remote tier backend
#[async_trait]
pub trait RemoteTier: Send + Sync {
    /// Fetch a payload
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a payload with a TTL
    async fn set(&self, key: &str, payload: Bytes, ttl: Duration) -> Result<()>;

    /// Delete a payload, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete many payloads, returning how many existed
    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Backend name for logs and stats
    fn name(&self) -> &'static str;
}

// =============================================================================
// In-memory backend
// =============================================================================

/// In-memory remote tier for tests and single-node deployments.
///
/// Availability can be toggled to simulate an outage.
pub struct InMemoryRemoteTier {
    storage: DashMap<String, (Bytes, u64)>,
    available: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl Default for InMemoryRemoteTier {
    fn default() -> Self {
        Self {
            storage: DashMap::new(),
            available: AtomicBool::new(true),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }
}

impl InMemoryRemoteTier {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored payloads (including expired ones not yet read)
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Total reads served
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Total writes accepted
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::CacheUnavailable("in-memory remote tier offline".into()))
        }
    }
}

#[async_trait]
impl RemoteTier for InMemoryRemoteTier {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        let now = now_millis();
        let removed = self.storage.remove_if(key, |_, (_, expires)| now >= *expires);
        if removed.is_some() {
            return Ok(None);
        }
        Ok(self.storage.get(key).map(|v| v.0.clone()))
    }

    async fn set(&self, key: &str, payload: Bytes, ttl: Duration) -> Result<()> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::Relaxed);

        let expires = now_millis().saturating_add((ttl.as_millis() as u64).max(1));
        self.storage.insert(key.to_string(), (payload, expires));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.storage.remove(key).is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// =============================================================================
// Redis backend
// =============================================================================

/// Redis-backed remote tier
pub struct RedisRemoteTier {
    conn: ConnectionManager,
    prefix: String,
    op_timeout: Duration,
}

impl RedisRemoteTier {
    /// Connect to Redis. Keys are stored under `prefix`.
    pub async fn connect(url: &str, prefix: impl Into<String>, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::CacheUnavailable(format!("invalid redis url: {}", e)))?;
        let conn = tokio::time::timeout(op_timeout, client.get_connection_manager())
            .await
            .map_err(|_| Error::CacheUnavailable("redis connect timed out".into()))?
            .map_err(|e| Error::CacheUnavailable(format!("redis connect failed: {}", e)))?;

        tracing::info!("Connected to redis remote tier at {}", url);
        Ok(Self {
            conn,
            prefix: prefix.into(),
            op_timeout,
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn with_timeout<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::CacheUnavailable(format!("redis {} failed: {}", op, e))),
            Err(_) => Err(Error::CacheUnavailable(format!("redis {} timed out", op))),
        }
    }
}

#[async_trait]
impl RemoteTier for RedisRemoteTier {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.conn.clone();
        let full = self.full_key(key);
        let value: Option<Vec<u8>> = self.with_timeout("GET", conn.get(full)).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, payload: Bytes, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let full = self.full_key(key);
        // SET EX takes whole seconds
        let secs = ttl.as_secs().max(1);
        self.with_timeout("SET", conn.set_ex::<_, _, ()>(full, payload.to_vec(), secs))
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let full = self.full_key(key);
        let removed: i64 = self.with_timeout("DEL", conn.del(full)).await?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let full: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let removed: i64 = self.with_timeout("DEL", conn.del(full)).await?;
        Ok(removed.max(0) as usize)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// =============================================================================
// Tests
// =============================================================================
