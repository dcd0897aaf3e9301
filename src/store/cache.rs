//! Masked-metadata token cache.
//!
//! The cache deliberately never holds raw secrets: cached values carry masked
//! tokens and timestamps only, so a cache hit tells you a record exists but
//! every secret read still decrypts from persistent storage. This keeps the
//! cache from becoming a second at-rest exposure surface.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;

/// Cache key: `oauth:tokens:<provider>:<tenantId>`.
pub fn cache_key(provider: &str, tenant_id: &str) -> String {
    format!("oauth:tokens:{provider}:{tenant_id}")
}

/// Non-secret view of a stored token record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTokenMeta {
    pub access_token_masked: String,
    pub refresh_token_masked: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub cached_at: DateTime<Utc>,
}

/// `get`/`setex`/`del` cache surface (Redis-shaped).
pub trait TokenCache: Send + Sync {
    fn get(&self, key: &str) -> Option<CachedTokenMeta>;
    fn setex(&self, key: &str, value: CachedTokenMeta, ttl_secs: u64);
    fn del(&self, key: &str);
}

/// In-process cache over a concurrent map with clock-checked expiry.
pub struct InMemoryTokenCache {
    entries: DashMap<String, (CachedTokenMeta, DateTime<Utc>)>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTokenCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }
}

impl TokenCache for InMemoryTokenCache {
    fn get(&self, key: &str) -> Option<CachedTokenMeta> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                let (meta, expires) = entry.value();
                if self.clock.now() < *expires {
                    return Some(meta.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn setex(&self, key: &str, value: CachedTokenMeta, ttl_secs: u64) {
        let expires = self.clock.now() + Duration::seconds(ttl_secs as i64);
        self.entries.insert(key.to_string(), (value, expires));
    }

    fn del(&self, key: &str) {
        self.entries.remove(key);
    }
}
