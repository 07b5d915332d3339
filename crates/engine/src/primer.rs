//! Primer micro-cache
//!
//! Caches the synthesized PCM of short first segments keyed by
//! `(text, voice, speed, lang)`. Read-mostly; a miss builds once and
//! concurrent misses on the same key await the winner.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;

use lyra_core::SpeechError;

/// Cache key fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrimerKey(u64);

impl PrimerKey {
    pub fn new(text: &str, voice: &str, speed: f32, lang: &str) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        voice.hash(&mut hasher);
        speed.to_bits().hash(&mut hasher);
        lang.hash(&mut hasher);
        Self(hasher.finish())
    }
}

struct Entry {
    cell: OnceCell<Arc<Vec<f32>>>,
    created: Instant,
}

/// LRU-bounded primer cache with per-key single-flight builds
pub struct PrimerCache {
    entries: DashMap<PrimerKey, Arc<Entry>>,
    /// Insertion/recency order for eviction
    order: Mutex<VecDeque<PrimerKey>>,
    max_entries: usize,
}

impl PrimerCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Fetch the PCM for `key`, building it with `build` on first use
    ///
    /// Losers of a concurrent miss await the winner's cell; a failed build
    /// leaves the cell empty so the next caller retries.
    pub async fn get_or_build<F, Fut>(
        &self,
        key: PrimerKey,
        build: F,
    ) -> Result<Arc<Vec<f32>>, SpeechError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<f32>, SpeechError>>,
    {
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Entry {
                    cell: OnceCell::new(),
                    created: Instant::now(),
                })
            })
            .clone();

        let hit = entry.cell.initialized();
        let pcm = entry
            .cell
            .get_or_try_init(|| async { build().await.map(Arc::new) })
            .await?
            .clone();

        self.touch(key);
        if hit {
            metrics::counter!("lyra_primer_cache_hits_total").increment(1);
        } else {
            metrics::counter!("lyra_primer_cache_builds_total").increment(1);
            self.evict_over_capacity();
        }
        Ok(pcm)
    }

    /// Peek without building
    pub fn get(&self, key: PrimerKey) -> Option<Arc<Vec<f32>>> {
        let pcm = self.entries.get(&key)?.cell.get().cloned()?;
        self.touch(key);
        Some(pcm)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Age of the entry, for diagnostics
    pub fn age_of(&self, key: PrimerKey) -> Option<std::time::Duration> {
        self.entries.get(&key).map(|e| e.created.elapsed())
    }

    fn touch(&self, key: PrimerKey) {
        let mut order = self.order.lock();
        if let Some(pos) = order.iter().position(|k| *k == key) {
            order.remove(pos);
        }
        order.push_back(key);
    }

    fn evict_over_capacity(&self) {
        let mut order = self.order.lock();
        while self.entries.len() > self.max_entries {
            let Some(oldest) = order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key(text: &str) -> PrimerKey {
        PrimerKey::new(text, "af_heart", 1.0, "en-us")
    }

    #[test]
    fn test_key_varies_on_all_fields() {
        let base = PrimerKey::new("Hi.", "af_heart", 1.0, "en-us");
        assert_ne!(base, PrimerKey::new("Yo.", "af_heart", 1.0, "en-us"));
        assert_ne!(base, PrimerKey::new("Hi.", "am_adam", 1.0, "en-us"));
        assert_ne!(base, PrimerKey::new("Hi.", "af_heart", 1.25, "en-us"));
        assert_ne!(base, PrimerKey::new("Hi.", "af_heart", 1.0, "en-gb"));
        assert_eq!(base, PrimerKey::new("Hi.", "af_heart", 1.0, "en-us"));
    }

    #[tokio::test]
    async fn test_builds_once_per_key() {
        let cache = PrimerCache::new(8);
        let builds = AtomicU32::new(0);

        for _ in 0..3 {
            let pcm = cache
                .get_or_build(key("Hello."), || async {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![0.1f32; 100])
                })
                .await
                .unwrap();
            assert_eq!(pcm.len(), 100);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_coalesce() {
        let cache = Arc::new(PrimerCache::new(8));
        let builds = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let builds = Arc::clone(&builds);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_build(key("race"), move || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(vec![0.0f32; 10])
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_build_retries() {
        let cache = PrimerCache::new(8);

        let err = cache
            .get_or_build(key("flaky"), || async {
                Err(SpeechError::Internal("boom".into()))
            })
            .await;
        assert!(err.is_err());

        let ok = cache
            .get_or_build(key("flaky"), || async { Ok(vec![0.5f32; 4]) })
            .await
            .unwrap();
        assert_eq!(ok.len(), 4);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = PrimerCache::new(2);
        for text in ["a", "b", "c"] {
            cache
                .get_or_build(key(text), || async { Ok(vec![0.0f32; 1]) })
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 2);
        // Oldest key evicted
        assert!(cache.get(key("a")).is_none());
        assert!(cache.get(key("c")).is_some());
    }
}
