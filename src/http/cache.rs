//! Short-lived content cache for idempotent listing requests.

use std::collections::HashMap;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::FetchResponse;

struct CachedEntry {
    stored_at: Instant,
    response: FetchResponse,
}

/// Responses keyed by the SHA-256 of their URL.
pub struct ContentCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedEntry>>,
}

impl ContentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn key(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    /// Fresh entry for `url`. A stale entry is evicted and reported as a miss.
    pub async fn get(&self, url: &str) -> Option<FetchResponse> {
        let key = Self::key(url);
        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                None => return None,
                Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                    let mut response = entry.response.clone();
                    response.from_cache = true;
                    return Some(response);
                }
                Some(_) => {}
            }
        }
        self.entries.write().await.remove(&key);
        debug!("Evicted stale cache entry for {}", url);
        None
    }

    pub async fn put(&self, url: &str, response: &FetchResponse) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.write().await.insert(
            Self::key(url),
            CachedEntry {
                stored_at: Instant::now(),
                response: response.clone(),
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
