//! Read-through/write-through response caching.

use super::{Next, Request, Response, Stage};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Byte-level storage backing the cache stage.
pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>);
}

/// In-process cache without expiry.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: Vec<u8>) {
        self.entries.insert(key.to_string(), value);
    }
}

/// Serves the last resolved response for `host:method:uri` and refreshes it
/// in the background.
///
/// Concurrent refreshes of one key are not coordinated; the last one to
/// finish wins.
pub struct CacheStage {
    cache: Arc<dyn ResponseCache>,
}

impl CacheStage {
    pub fn new(cache: Arc<dyn ResponseCache>) -> Self {
        Self { cache }
    }

    pub fn key(request: &Request) -> String {
        format!("{}:{}:{}", request.host, request.method, request.uri)
    }

    fn refresh_in_background(&self, key: String, request: Request, next: Next) {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            match next.run(&request).await {
                Some(fresh) => store(cache.as_ref(), &key, &fresh),
                None => warn!(key = %key, "Cache refresh produced no response"),
            }
        });
    }
}

fn store(cache: &dyn ResponseCache, key: &str, response: &Response) {
    match serde_json::to_vec(response) {
        Ok(bytes) => cache.set(key, bytes),
        Err(e) => warn!(key = %key, error = %e, "Failed to serialize response for cache"),
    }
}

#[async_trait]
impl Stage for CacheStage {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn handle(&self, request: &Request, next: Next) -> Option<Response> {
        let key = Self::key(request);

        if let Some(bytes) = self.cache.get(&key) {
            match serde_json::from_slice::<Response>(&bytes) {
                Ok(cached) => {
                    debug!(correlation_id = %request.correlation_id, key = %key, "Cache hit");
                    self.refresh_in_background(key, request.clone(), next);
                    return Some(cached);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Unreadable cache entry, treating as miss");
                }
            }
        }

        let fresh = next.run(request).await?;
        store(self.cache.as_ref(), &key, &fresh);
        Some(fresh)
    }
}
