use crate::config::CacheConfig;
use crate::database::EmbeddingProviderKind;
use crate::utils::error::ApiError;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Bounded in-memory cache of `(provider, text) → vector`.
///
/// Concurrent callers for the same fingerprint deduplicate: the first runs
/// the compute closure, the rest await the same cell. A background task
/// purges entries idle past the TTL and trims beyond the size cap in LRU
/// order.
pub struct EmbeddingCache {
    entries: DashMap<String, Arc<CacheEntry>>,
    config: CacheConfig,
}

struct CacheEntry {
    cell: OnceCell<Vec<f32>>,
    /// Unix seconds of the most recent read, for LRU eviction.
    last_used: AtomicI64,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            last_used: AtomicI64::new(now_secs()),
        }
    }

    fn touch(&self) {
        self.last_used.store(now_secs(), Ordering::Relaxed);
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Fingerprint of a cache key: hash of provider and whitespace-normalized
/// text.
fn fingerprint(provider: EmbeddingProviderKind, text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(provider.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

impl EmbeddingCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub async fn get_or_compute<F, Fut>(
        &self,
        provider: EmbeddingProviderKind,
        text: &str,
        compute: F,
    ) -> Result<Vec<f32>, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<f32>, ApiError>>,
    {
        let key = fingerprint(provider, text);

        let entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CacheEntry::new()))
            .clone();

        entry.touch();

        let hit = entry.cell.initialized();
        let vector = entry.cell.get_or_try_init(compute).await?.clone();

        if hit {
            debug!("Embedding cache hit ({:.12}…)", key);
        }

        Ok(vector)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One eviction pass: drop idle entries, then trim to the size cap,
    /// oldest-read first. Entries whose compute failed (empty cells) go too.
    pub fn evict(&self) {
        let cutoff = now_secs() - self.config.idle_ttl_seconds as i64;
        let before = self.entries.len();

        self.entries.retain(|_, entry| {
            entry.cell.initialized() && entry.last_used.load(Ordering::Relaxed) >= cutoff
        });

        if self.entries.len() > self.config.max_entries {
            let mut by_age: Vec<(String, i64)> = self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().last_used.load(Ordering::Relaxed)))
                .collect();
            by_age.sort_by_key(|(_, used)| *used);

            let excess = self.entries.len() - self.config.max_entries;
            for (key, _) in by_age.into_iter().take(excess) {
                self.entries.remove(&key);
            }
        }

        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            info!("Embedding cache evicted {} entries", removed);
        }
    }

    /// Background eviction on a fixed timer.
    pub fn spawn_cleanup(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        let period = Duration::from_secs(self.config.cleanup_interval_seconds);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // immediate first tick is a no-op
            loop {
                ticker.tick().await;
                cache.evict();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> CacheConfig {
        CacheConfig {
            cleanup_interval_seconds: 3600,
            idle_ttl_seconds: 3600,
            max_entries: 4,
        }
    }

    #[tokio::test]
    async fn repeated_lookups_are_byte_equal_and_computed_once() {
        let cache = EmbeddingCache::new(test_config());
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_or_compute(EmbeddingProviderKind::Remote, "hello world", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![0.25, -0.5, 1.0])
            })
            .await
            .unwrap();

        let second = cache
            .get_or_compute(EmbeddingProviderKind::Remote, "hello world", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![9.0, 9.0, 9.0])
            })
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_deduplicate() {
        let cache = Arc::new(EmbeddingCache::new(test_config()));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_compute(EmbeddingProviderKind::Local, "same text", || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(vec![1.0, 2.0])
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), vec![1.0, 2.0]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn providers_do_not_share_fingerprints() {
        let cache = EmbeddingCache::new(test_config());

        let remote = cache
            .get_or_compute(EmbeddingProviderKind::Remote, "text", || async {
                Ok(vec![1.0; 4])
            })
            .await
            .unwrap();
        let local = cache
            .get_or_compute(EmbeddingProviderKind::Local, "text", || async {
                Ok(vec![2.0; 2])
            })
            .await
            .unwrap();

        assert_ne!(remote, local);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn whitespace_normalization_collapses_keys() {
        let cache = EmbeddingCache::new(test_config());

        cache
            .get_or_compute(EmbeddingProviderKind::Remote, "  a   b  ", || async {
                Ok(vec![1.0])
            })
            .await
            .unwrap();
        let hit = cache
            .get_or_compute(EmbeddingProviderKind::Remote, "a b", || async {
                Ok(vec![5.0])
            })
            .await
            .unwrap();

        assert_eq!(hit, vec![1.0]);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn eviction_trims_to_cap_in_lru_order() {
        let cache = EmbeddingCache::new(test_config());

        for i in 0..6 {
            let text = format!("text {}", i);
            cache
                .get_or_compute(EmbeddingProviderKind::Remote, &text, || async move {
                    Ok(vec![i as f32])
                })
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 6);

        cache.evict();
        assert_eq!(cache.len(), 4);
    }

    #[tokio::test]
    async fn failed_compute_is_not_cached() {
        let cache = EmbeddingCache::new(test_config());

        let err = cache
            .get_or_compute(EmbeddingProviderKind::Remote, "flaky", || async {
                Err(ApiError::UpstreamTimeout("boom".into()))
            })
            .await;
        assert!(err.is_err());

        let ok = cache
            .get_or_compute(EmbeddingProviderKind::Remote, "flaky", || async {
                Ok(vec![3.0])
            })
            .await
            .unwrap();
        assert_eq!(ok, vec![3.0]);
    }
}
