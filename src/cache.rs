//! In-process TTL+LRU cache (C2). A performance hint only: every lookup
//! method returns `Option<T>` and a miss always falls through to the
//! caller's slow path against C1.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
    inserted_at: Instant,
}

/// Bounds the per-window TTL used for `aggregate:*` keys (§4.2).
pub const AGGREGATE_TTL_MIN: Duration = Duration::from_secs(30);
pub const AGGREGATE_TTL_MAX: Duration = Duration::from_secs(10 * 60);
pub const DEVICE_LATEST_TTL: Duration = Duration::from_secs(60);
pub const RULES_ENABLED_TTL: Duration = Duration::from_secs(10 * 60);

/// Clamp a time window to the aggregate cache's bounded TTL (window / 2).
pub fn aggregate_ttl(window: Duration) -> Duration {
    (window / 2).clamp(AGGREGATE_TTL_MIN, AGGREGATE_TTL_MAX)
}

/// `dashmap`-backed cache. Enabled only when `CACHE_URL` is set; when
/// disabled, every method is a guaranteed miss/no-op so callers don't need
/// to branch (§4.2 "tolerates unavailability").
pub struct Cache {
    enabled: bool,
    entries: DashMap<String, Entry>,
    max_entries: usize,
    len_hint: AtomicUsize,
}

impl Cache {
    pub fn new(enabled: bool, max_entries: usize) -> Self {
        Self {
            enabled,
            entries: DashMap::new(),
            max_entries,
            len_hint: AtomicUsize::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 0)
    }

    pub fn device_latest_key(tenant: Uuid, device: Uuid) -> String {
        format!("device:{tenant}:{device}:latest")
    }

    pub fn rules_enabled_key(tenant: Uuid) -> String {
        format!("rules:{tenant}:enabled")
    }

    pub fn aggregate_key(tenant: Uuid, device: Uuid, metric: &str, window_secs: u32) -> String {
        format!("aggregate:{tenant}:{device}:{metric}:{window_secs}")
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }
        let entry = self.entries.get(key)?;
        if entry.expires_at < Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        serde_json::from_slice(&entry.value).ok()
    }

    pub fn set<T: Serialize>(&self, key: String, value: &T, ttl: Duration) {
        if !self.enabled {
            return;
        }
        let Ok(bytes) = serde_json::to_vec(value) else {
            return;
        };
        self.evict_if_full();
        self.entries.insert(
            key,
            Entry {
                value: bytes,
                expires_at: Instant::now() + ttl,
                inserted_at: Instant::now(),
            },
        );
        self.len_hint.store(self.entries.len(), Ordering::Relaxed);
    }

    /// Emitted by any writer to a cached entity before returning success
    /// (§4.2). Invalidation never fails the write — it's a best-effort
    /// hint, so this never returns an error.
    pub fn invalidate(&self, key: &str) {
        if !self.enabled {
            return;
        }
        self.entries.remove(key);
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        if !self.enabled {
            return;
        }
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    /// Evict the oldest-inserted entry once the cache is at capacity. A
    /// true LRU (access-order) eviction would need an intrusive list; this
    /// insertion-order approximation is adequate for a TTL-dominated
    /// workload where entries naturally expire well before the cap is hit.
    fn evict_if_full(&self) {
        if self.max_entries == 0 || self.entries.len() < self.max_entries {
            return;
        }
        if let Some(oldest_key) = self
            .entries
            .iter()
            .min_by_key(|e| e.inserted_at)
            .map(|e| e.key().clone())
        {
            self.entries.remove(&oldest_key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_cache_always_misses() {
        let cache = Cache::disabled();
        cache.set("k".to_string(), &42i32, Duration::from_secs(60));
        assert_eq!(cache.get::<i32>("k"), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let cache = Cache::new(true, 100);
        cache.set("k".to_string(), &vec![1, 2, 3], Duration::from_secs(60));
        assert_eq!(cache.get::<Vec<i32>>("k"), Some(vec![1, 2, 3]));
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache = Cache::new(true, 100);
        cache.set("k".to_string(), &1i32, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get::<i32>("k"), None);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = Cache::new(true, 100);
        cache.set("k".to_string(), &1i32, Duration::from_secs(60));
        cache.invalidate("k");
        assert_eq!(cache.get::<i32>("k"), None);
    }

    #[test]
    fn aggregate_ttl_is_clamped() {
        assert_eq!(aggregate_ttl(Duration::from_secs(10)), AGGREGATE_TTL_MIN);
        assert_eq!(aggregate_ttl(Duration::from_secs(3600)), AGGREGATE_TTL_MAX);
        assert_eq!(aggregate_ttl(Duration::from_secs(120)), Duration::from_secs(60));
    }
}
