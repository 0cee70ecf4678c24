//! Response cache contract and the in-process LRU implementation.

use std::path::Path;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::config::CachePolicy;
use crate::errors::FederationResult;
use crate::models::FederatedResponse;

/// Where an entry lives: cache keys are only meaningful within one repo set.
#[derive(Debug, Clone, Copy)]
pub struct CacheScope<'a> {
    pub repo_set_id: &'a str,
    /// Workspace cache root, used by persistent caches.
    pub cache_root: Option<&'a Path>,
}

/// Memoized federated responses.
///
/// Implementations only store and evict. Whether a response may be written
/// at all is decided by the coordinator.
pub trait QueryCache: Send + Sync {
    /// Entry for `key`, provided it was stored under the same manifest hash.
    fn get(
        &self,
        scope: &CacheScope<'_>,
        key: &str,
        manifest_hash: &str,
    ) -> FederationResult<Option<FederatedResponse>>;

    /// Insert or replace an entry, then apply the eviction policy.
    fn put(
        &self,
        scope: &CacheScope<'_>,
        key: &str,
        manifest_hash: &str,
        response: &FederatedResponse,
    ) -> FederationResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheEntry {
    response: FederatedResponse,
    manifest_hash: String,
    /// `None` when the deadline is beyond what `Instant` can represent.
    expires_at: Option<Instant>,
    bytes: usize,
}

#[derive(Default)]
struct MemoryState {
    entries: IndexMap<String, CacheEntry>,
    bytes: usize,
    hits: u64,
    misses: u64,
}

impl MemoryState {
    fn remove_index(&mut self, index: usize) {
        if let Some((_, entry)) = self.entries.shift_remove_index(index) {
            self.bytes = self.bytes.saturating_sub(entry.bytes);
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        let mut freed = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.expires_at.map_or(true, |at| at > now);
            if !keep {
                freed += entry.bytes;
            }
            keep
        });
        self.bytes = self.bytes.saturating_sub(freed);
    }

    /// Least recently used entries sit at the front.
    fn evict_over_capacity(&mut self, max_entries: usize, max_bytes: usize) {
        while self.entries.len() > max_entries
            || (self.bytes > max_bytes && !self.entries.is_empty())
        {
            self.remove_index(0);
        }
    }
}

/// Bounded in-memory cache with TTL and LRU eviction.
pub struct MemoryQueryCache {
    max_entries: usize,
    max_bytes: usize,
    ttl: Option<Duration>,
    state: Mutex<MemoryState>,
}

impl MemoryQueryCache {
    pub fn new(policy: &CachePolicy) -> Self {
        Self {
            max_entries: policy.max_entries.max(1),
            max_bytes: policy.max_bytes.max(1),
            ttl: Duration::try_from_secs_f64(policy.effective_ttl_seconds()).ok(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn scoped_key(scope: &CacheScope<'_>, key: &str) -> String {
        format!("{}:{key}", scope.repo_set_id)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            bytes: state.bytes,
            hits: state.hits,
            misses: state.misses,
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.bytes = 0;
    }
}

impl QueryCache for MemoryQueryCache {
    fn get(
        &self,
        scope: &CacheScope<'_>,
        key: &str,
        manifest_hash: &str,
    ) -> FederationResult<Option<FederatedResponse>> {
        let scoped = Self::scoped_key(scope, key);
        let mut state = self.state.lock();
        state.evict_expired(Instant::now());
        let Some(index) = state.entries.get_index_of(&scoped) else {
            state.misses += 1;
            return Ok(None);
        };
        let fresh = state
            .entries
            .get_index(index)
            .is_some_and(|(_, entry)| entry.manifest_hash == manifest_hash);
        if !fresh {
            state.misses += 1;
            return Ok(None);
        }
        // Move to end for LRU
        let Some((scoped, entry)) = state.entries.shift_remove_index(index) else {
            return Ok(None);
        };
        let response = entry.response.clone();
        state.entries.insert(scoped, entry);
        state.hits += 1;
        Ok(Some(response))
    }

    fn put(
        &self,
        scope: &CacheScope<'_>,
        key: &str,
        manifest_hash: &str,
        response: &FederatedResponse,
    ) -> FederationResult<()> {
        let bytes = serde_json::to_vec(response)?.len();
        let scoped = Self::scoped_key(scope, key);
        let now = Instant::now();
        let expires_at = self.ttl.and_then(|ttl| now.checked_add(ttl));
        let mut state = self.state.lock();
        if let Some(previous) = state.entries.shift_remove(&scoped) {
            state.bytes = state.bytes.saturating_sub(previous.bytes);
        }
        state.entries.insert(
            scoped,
            CacheEntry {
                response: response.clone(),
                manifest_hash: manifest_hash.to_string(),
                expires_at,
                bytes,
            },
        );
        state.bytes += bytes;
        state.evict_expired(now);
        state.evict_over_capacity(self.max_entries, self.max_bytes);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{LimitsMeta, ResponseMeta, SelectionMeta, WorkspaceMeta, FEDERATED_BACKEND};
    use crate::query::federated::cohorts::CohortSelection;

    pub(crate) fn response(name: &str) -> FederatedResponse {
        FederatedResponse {
            ok: true,
            backend: FEDERATED_BACKEND.to_string(),
            code: Vec::new(),
            prose: Vec::new(),
            extracted_prose: Vec::new(),
            records: Vec::new(),
            repos: Vec::new(),
            warnings: Vec::new(),
            meta: ResponseMeta {
                repo_set_id: "ws1-x".to_string(),
                manifest_hash: "wm1-x".to_string(),
                workspace: WorkspaceMeta {
                    name: name.to_string(),
                    workspace_id: "ws1-x".to_string(),
                },
                selection: SelectionMeta::default(),
                cohorts: CohortSelection::default(),
                limits: LimitsMeta {
                    top: 10,
                    per_repo_top: 20,
                    concurrency: 4,
                    merge: "rrf".to_string(),
                    rrf_k: 60,
                },
                cache: None,
            },
        }
    }

    const SCOPE: CacheScope<'static> = CacheScope {
        repo_set_id: "ws1-x",
        cache_root: None,
    };

    fn policy(max_entries: usize) -> CachePolicy {
        CachePolicy {
            max_entries,
            ..CachePolicy::default()
        }
    }

    #[test]
    fn round_trips_under_matching_manifest() {
        let cache = MemoryQueryCache::new(&policy(4));
        cache.put(&SCOPE, "k", "m1", &response("a")).unwrap();
        assert_eq!(cache.get(&SCOPE, "k", "m1").unwrap(), Some(response("a")));
        assert_eq!(cache.get(&SCOPE, "k", "m2").unwrap(), None);
        let other = CacheScope {
            repo_set_id: "ws1-y",
            cache_root: None,
        };
        assert_eq!(cache.get(&other, "k", "m1").unwrap(), None);
        let stats = cache.stats();
        assert_eq!((stats.entries, stats.hits, stats.misses), (1, 1, 2));
        cache.clear();
        assert_eq!(cache.get(&SCOPE, "k", "m1").unwrap(), None);
        assert_eq!(cache.stats().bytes, 0);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = MemoryQueryCache::new(&policy(2));
        cache.put(&SCOPE, "a", "m", &response("a")).unwrap();
        cache.put(&SCOPE, "b", "m", &response("b")).unwrap();
        assert!(cache.get(&SCOPE, "a", "m").unwrap().is_some());
        cache.put(&SCOPE, "c", "m", &response("c")).unwrap();
        assert!(cache.get(&SCOPE, "a", "m").unwrap().is_some());
        assert!(cache.get(&SCOPE, "b", "m").unwrap().is_none());
        assert!(cache.get(&SCOPE, "c", "m").unwrap().is_some());
    }

    #[test]
    fn entries_expire() {
        let cache = MemoryQueryCache::new(&CachePolicy {
            ttl_seconds: 0.1,
            ..CachePolicy::default()
        });
        cache.put(&SCOPE, "k", "m", &response("a")).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert!(cache.get(&SCOPE, "k", "m").unwrap().is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn unbounded_ttl_keeps_entries() {
        for ttl_seconds in [1e19, f64::INFINITY] {
            let cache = MemoryQueryCache::new(&CachePolicy {
                ttl_seconds,
                ..CachePolicy::default()
            });
            cache.put(&SCOPE, "k", "m", &response("a")).unwrap();
            assert_eq!(cache.get(&SCOPE, "k", "m").unwrap(), Some(response("a")));
        }
    }

    #[test]
    fn byte_budget_keeps_newest() {
        let size = serde_json::to_vec(&response("a")).unwrap().len();
        let cache = MemoryQueryCache::new(&CachePolicy {
            max_bytes: size + size / 2,
            ..CachePolicy::default()
        });
        cache.put(&SCOPE, "a", "m", &response("a")).unwrap();
        cache.put(&SCOPE, "b", "m", &response("b")).unwrap();
        assert!(cache.get(&SCOPE, "a", "m").unwrap().is_none());
        assert!(cache.get(&SCOPE, "b", "m").unwrap().is_some());
        assert_eq!(cache.stats().bytes, size);
    }
}
