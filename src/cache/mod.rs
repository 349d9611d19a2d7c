//! Lookup cache keyed by (provider, address)
//!
//! Caching is best-effort: callers treat every [`CacheError`] as a miss and
//! carry on without storing.

use async_trait::async_trait;
use moka::future::Cache;
use sha2::{Digest, Sha256};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::geo::GeoRecord;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

#[async_trait]
pub trait GeoCache: Send + Sync {
    /// Fetch a live entry. Expired entries are reported as a miss.
    async fn get(&self, provider: &str, ip: &str) -> CacheResult<Option<GeoRecord>>;

    /// Store a record for `ttl`, replacing any previous entry
    async fn put(&self, provider: &str, ip: &str, record: GeoRecord, ttl: Duration) -> CacheResult<()>;
}

/// Deterministic key for a (provider, address) pair
pub fn fingerprint(prefix: &str, provider: &str, ip: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}", provider, ip).as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}", prefix, hex)
}

#[derive(Clone)]
struct CacheEntry {
    record: GeoRecord,
    expires_at: Instant,
}

/// In-process cache backed by Moka
pub struct MemoryCache {
    prefix: String,
    entries: Cache<String, CacheEntry>,
}

impl MemoryCache {
    /// `max_ttl` bounds how long Moka keeps any entry; per-entry expiry is
    /// checked on read.
    pub fn new(prefix: impl Into<String>, max_entries: u64, max_ttl: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(max_ttl)
            .build();

        Self {
            prefix: prefix.into(),
            entries,
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

#[async_trait]
impl GeoCache for MemoryCache {
    async fn get(&self, provider: &str, ip: &str) -> CacheResult<Option<GeoRecord>> {
        let key = fingerprint(&self.prefix, provider, ip);

        match self.entries.get(&key).await {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.record)),
            Some(_) => {
                self.entries.invalidate(&key).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, provider: &str, ip: &str, record: GeoRecord, ttl: Duration) -> CacheResult<()> {
        let key = fingerprint(&self.prefix, provider, ip);
        let entry = CacheEntry {
            record,
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key, entry).await;
        Ok(())
    }
}
