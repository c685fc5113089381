use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::errors::GenerationError;
use super::models::{CacheKey, Layout};

type PendingLayout = Shared<BoxFuture<'static, Result<Arc<Layout>, GenerationError>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Requests that joined a computation already in flight
    pub coalesced: u64,
    pub evictions: u64,
}

struct CacheEntry {
    layout: Arc<Layout>,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    in_flight: HashMap<CacheKey, PendingLayout>,
    tick: u64,
    stats: CacheStats,
}

impl CacheState {
    fn touch(&mut self, key: CacheKey) -> Option<Arc<Layout>> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(&key).map(|entry| {
            entry.last_used = tick;
            Arc::clone(&entry.layout)
        })
    }

    fn insert(&mut self, key: CacheKey, layout: Arc<Layout>, max_entries: usize) {
        self.tick += 1;
        self.entries.insert(
            key,
            CacheEntry {
                layout,
                last_used: self.tick,
            },
        );

        while self.entries.len() > max_entries {
            // Layouts still held by a lobby are pinned
            let victim = self
                .entries
                .iter()
                .filter(|(_, entry)| Arc::strong_count(&entry.layout) == 1)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| *key);

            match victim {
                Some(victim) => {
                    self.entries.remove(&victim);
                    self.stats.evictions += 1;
                    debug!(cache_key = %victim, "Evicted layout from cache");
                }
                None => {
                    debug!(
                        entries = self.entries.len(),
                        max_entries, "Every cached layout is pinned, cache over capacity"
                    );
                    break;
                }
            }
        }
    }
}

/// Bounded LRU cache of validated layouts with per-key request coalescing
#[derive(Clone)]
pub struct LayoutCache {
    state: Arc<Mutex<CacheState>>,
    max_entries: usize,
}

impl LayoutCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            max_entries: max_entries.max(1),
        }
    }

    /// Returns the cached layout for `key`, or runs `compute` to produce it.
    ///
    /// Concurrent callers for the same key share a single computation. The
    /// computation runs in its own task, so dropping a caller never cancels it,
    /// and a successful result is cached before any caller observes it.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> Result<Arc<Layout>, GenerationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Layout, GenerationError>> + Send + 'static,
    {
        let pending = {
            let mut state = self.state.lock().await;

            if let Some(layout) = state.touch(key) {
                state.stats.hits += 1;
                debug!(cache_key = %key, "Layout cache hit");
                return Ok(layout);
            }

            if let Some(pending) = state.in_flight.get(&key) {
                let pending = pending.clone();
                state.stats.coalesced += 1;
                debug!(cache_key = %key, "Joining in-flight layout generation");
                pending
            } else {
                state.stats.misses += 1;
                debug!(cache_key = %key, "Layout cache miss");

                let pending = self.spawn_computation(key, compute());
                state.in_flight.insert(key, pending.clone());
                pending
            }
        };

        pending.await
    }

    fn spawn_computation<Fut>(&self, key: CacheKey, computation: Fut) -> PendingLayout
    where
        Fut: Future<Output = Result<Layout, GenerationError>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let max_entries = self.max_entries;

        let task = tokio::spawn(async move {
            let result = computation.await.map(Arc::new);

            let mut state = state.lock().await;
            state.in_flight.remove(&key);
            if let Ok(layout) = &result {
                state.insert(key, Arc::clone(layout), max_entries);
            }
            result
        });

        let state = Arc::clone(&self.state);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(cache_key = %key, error = %e, "Layout computation task failed");
                    state.lock().await.in_flight.remove(&key);
                    Err(GenerationError::WorkerFailed(e.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }

    pub async fn get(&self, key: CacheKey) -> Option<Arc<Layout>> {
        self.state.lock().await.touch(key)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        self.state.lock().await.stats
    }

    /// Drops every cached entry. In-flight computations are unaffected.
    pub async fn clear(&self) {
        self.state.lock().await.entries.clear();
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::errors::RejectionReason;
    use crate::layout::models::{Difficulty, GenerationParameters, LayoutId, Rect, Room};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn layout(seed: i64) -> Layout {
        let parameters = GenerationParameters::new(seed, 10, 10, 1, Difficulty::Easy).unwrap();
        Layout {
            id: LayoutId::derive(parameters.cache_key(), 0),
            parameters,
            rooms: vec![Room::new(0, Rect::new(0, 0, 3, 3))],
            entry_room_id: 0,
            exit_room_id: 0,
            placement_shortfall: 0,
            salt: 0,
            created_at: Utc::now(),
        }
    }

    fn key(seed: i64) -> CacheKey {
        layout(seed).cache_key()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = LayoutCache::new(4);

        let first = cache
            .get_or_compute(key(1), || async { Ok(layout(1)) })
            .await
            .unwrap();
        let second = cache
            .get_or_compute(key(1), || async { Ok(layout(2)) })
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_computation() {
        let cache = LayoutCache::new(4);
        let calls = Arc::new(AtomicUsize::new(0));

        let request = |cache: LayoutCache, calls: Arc<AtomicUsize>| async move {
            cache
                .get_or_compute(key(7), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(layout(7))
                })
                .await
        };

        let (a, b, c) = tokio::join!(
            request(cache.clone(), calls.clone()),
            request(cache.clone(), calls.clone()),
            request(cache.clone(), calls.clone()),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(cache.stats().await.coalesced, 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = LayoutCache::new(4);
        let failure = GenerationError::Exhausted {
            attempts: 1,
            last_rejection: RejectionReason::Empty,
        };

        let result = cache
            .get_or_compute(key(3), {
                let failure = failure.clone();
                move || async move { Err(failure) }
            })
            .await;
        assert_eq!(result.unwrap_err(), failure);
        assert!(cache.is_empty().await);

        let retried = cache.get_or_compute(key(3), || async { Ok(layout(3)) }).await;
        assert!(retried.is_ok());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let cache = LayoutCache::new(2);
        for seed in 1..=2 {
            let _ = cache
                .get_or_compute(key(seed), move || async move { Ok(layout(seed)) })
                .await
                .unwrap();
        }
        // Refresh seed 1 so seed 2 becomes least recently used
        assert!(cache.get(key(1)).await.is_some());

        let _ = cache
            .get_or_compute(key(3), || async { Ok(layout(3)) })
            .await
            .unwrap();

        assert_eq!(cache.len().await, 2);
        assert!(cache.get(key(1)).await.is_some());
        assert!(cache.get(key(2)).await.is_none());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_pinned_layouts_are_not_evicted() {
        let cache = LayoutCache::new(1);
        let pinned = cache
            .get_or_compute(key(1), || async { Ok(layout(1)) })
            .await
            .unwrap();

        let other = cache
            .get_or_compute(key(2), || async { Ok(layout(2)) })
            .await
            .unwrap();

        // Both are held outside the cache, so neither may go
        assert_eq!(cache.len().await, 2);
        drop(other);

        let _ = cache
            .get_or_compute(key(3), || async { Ok(layout(3)) })
            .await
            .unwrap();

        assert!(cache.get(key(1)).await.is_some());
        assert!(cache.get(key(2)).await.is_none());
        drop(pinned);
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_cancel_computation() {
        let cache = LayoutCache::new(4);
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(key(9), || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(layout(9))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        waiter.abort();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get(key(9)).await.is_some());
    }
}
