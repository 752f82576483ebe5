//! Classification cache to avoid repeating identical inference calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use crate::provider::{Classification, TaskKind};

/// Cache entry for a classification.
#[derive(Debug, Clone)]
struct CacheEntry {
    classification: Classification,
    /// Insertion sequence, used for oldest-first eviction.
    inserted: u64,
}

/// In-memory cache keyed by (task, labels, text).
#[derive(Clone)]
pub struct ClassificationCache {
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    counter: Arc<AtomicU64>,
    max_entries: usize,
}

impl ClassificationCache {
    /// Create a new in-memory cache.
    pub fn new(max_entries: usize) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            counter: Arc::new(AtomicU64::new(0)),
            max_entries: max_entries.max(1),
        }
    }

    /// Compute a hash for cache lookup.
    fn hash_key(text: &str, task: TaskKind, labels: &[String]) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        task.hash(&mut hasher);
        labels.hash(&mut hasher);
        format!("{:x}", hasher.finish())
    }

    /// Get a classification from the cache.
    pub async fn get(&self, text: &str, task: TaskKind, labels: &[String]) -> Option<Classification> {
        let key = Self::hash_key(text, task, labels);
        let cache = self.cache.read().await;
        cache.get(&key).map(|e| e.classification.clone())
    }

    /// Put a classification in the cache.
    pub async fn put(
        &self,
        text: &str,
        task: TaskKind,
        labels: &[String],
        classification: Classification,
    ) {
        let key = Self::hash_key(text, task, labels);
        let inserted = self.counter.fetch_add(1, Ordering::Relaxed);

        let mut cache = self.cache.write().await;

        if cache.len() >= self.max_entries && !cache.contains_key(&key) {
            if let Some(oldest_key) = cache
                .iter()
                .min_by_key(|(_, v)| v.inserted)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest_key);
            }
        }

        cache.insert(
            key,
            CacheEntry {
                classification,
                inserted,
            },
        );
        debug!(task = task.as_str(), "Cached classification");
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Whether the cache is empty.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}
