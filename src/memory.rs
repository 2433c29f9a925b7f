//! Per-user memory API: similarity retrieval, recency listing, and the
//! signal that new extraction work exists.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::debug;

use crate::error::MaisonError;
use crate::extraction::queue::ExtractionQueue;
use crate::llm::LlmGateway;
use crate::store::{Memory, ScoredMemory};
use crate::{db_call, SharedStore};

/// Small LRU for query embeddings so repeated retrieval of the same text
/// doesn't re-hit the embedding API.
#[derive(Clone)]
pub struct EmbedCache {
    inner: Arc<parking_lot::Mutex<EmbedCacheInner>>,
}

struct EmbedCacheInner {
    cache: LruCache<String, Vec<f32>>,
    hits: u64,
    misses: u64,
}

impl EmbedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(parking_lot::Mutex::new(EmbedCacheInner {
                cache: LruCache::new(
                    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(128).unwrap()),
                ),
                hits: 0,
                misses: 0,
            })),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut inner = self.inner.lock();
        let val = inner.cache.get(key).cloned();
        if val.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        val
    }

    pub fn insert(&self, key: String, value: Vec<f32>) {
        self.inner.lock().cache.put(key, value);
    }

    pub fn stats(&self) -> (usize, u64, u64) {
        let inner = self.inner.lock();
        (inner.cache.len(), inner.hits, inner.misses)
    }
}

#[derive(Clone)]
pub struct MemoryService {
    store: SharedStore,
    gateway: Arc<dyn LlmGateway>,
    queue: ExtractionQueue,
    cache: EmbedCache,
    user_id: String,
}

impl MemoryService {
    pub fn new(
        store: SharedStore,
        gateway: Arc<dyn LlmGateway>,
        queue: ExtractionQueue,
        cache: EmbedCache,
        user_id: String,
    ) -> Self {
        Self { store, gateway, queue, cache, user_id }
    }

    async fn query_embedding(&self, text: &str) -> Result<Vec<f32>, MaisonError> {
        if let Some(v) = self.cache.get(text) {
            return Ok(v);
        }
        let mut vectors = self.gateway.embed(std::slice::from_ref(&text.to_string())).await?;
        let v = vectors
            .pop()
            .ok_or_else(|| MaisonError::LlmBackend("empty embedding batch".into()))?;
        self.cache.insert(text.to_string(), v.clone());
        Ok(v)
    }

    /// Memories within similarity `threshold` of the query text, nearest
    /// first. `threshold = 0` returns the nearest `limit` regardless.
    pub async fn related_memories(
        &self,
        query: &str,
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<ScoredMemory>, MaisonError> {
        let embedding = self.query_embedding(query).await?;
        let d_max = 1.0 - threshold;
        let user = self.user_id.clone();
        let hits = db_call(&self.store, move |s| {
            s.find_nearby_memories(&user, &embedding, d_max, limit)
        })
        .await??;
        debug!(user_id = %self.user_id, hits = hits.len(), "related memories");
        Ok(hits)
    }

    pub async fn recent_memories(&self, limit: usize) -> Result<Vec<Memory>, MaisonError> {
        let user = self.user_id.clone();
        db_call(&self.store, move |s| s.list_recent_memories(&user, limit)).await?
    }

    /// Enqueue a debounced extraction run for this user. Fire-and-forget;
    /// bursts within the debounce window collapse into one run.
    pub fn signal_extraction(&self) {
        self.queue.signal(&self.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_cache_hit_miss_accounting() {
        let cache = EmbedCache::new(2);
        assert!(cache.get("a").is_none());
        cache.insert("a".into(), vec![1.0]);
        assert_eq!(cache.get("a"), Some(vec![1.0]));
        let (len, hits, misses) = cache.stats();
        assert_eq!((len, hits, misses), (1, 1, 1));
    }

    #[test]
    fn embed_cache_evicts_lru() {
        let cache = EmbedCache::new(2);
        cache.insert("a".into(), vec![1.0]);
        cache.insert("b".into(), vec![2.0]);
        cache.get("a");
        cache.insert("c".into(), vec![3.0]);
        assert!(cache.get("b").is_none(), "least recently used evicted");
        assert!(cache.get("a").is_some());
    }
}
