//! Step-output cache
//!
//! In-memory LRU with per-entry TTL. Keys are stable fingerprints of
//! `(step type, step id, canonical params)`, so identical invocations hit
//! regardless of parameter ordering in the document. Writes happen only on
//! successful executions of cacheable step types; a per-key single-flight
//! guard keeps concurrent builds of the same fingerprint down to one.

use flowpilot_core::types::StepOutput;
use lru::LruCache;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone)]
struct CacheEntry {
    output: StepOutput,
    created_at: Instant,
    ttl: Duration,
    access_count: u64,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// Cache counters for observability
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct StepCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    inflight: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    default_ttl: Duration,
    stats: Mutex<CacheStats>,
}

impl StepCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero capacity");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            inflight: AsyncMutex::new(HashMap::new()),
            default_ttl,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Stable fingerprint: sha256 over the step type, step id and the
    /// canonical (key-sorted) serialization of the resolved params
    pub fn fingerprint(step_type: &str, step_id: &str, params: &Map<String, Value>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(step_type.as_bytes());
        hasher.update(b":");
        hasher.update(step_id.as_bytes());
        hasher.update(b":");
        hasher.update(canonical_json(&Value::Object(params.clone())).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<StepOutput> {
        let mut entries = self.entries.lock().expect("cache lock");
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.access_count += 1;
                let output = entry.output.clone();
                drop(entries);
                self.update_stats(|stats| stats.hits += 1);
                Some(output)
            }
            Some(_) => {
                entries.pop(key);
                drop(entries);
                self.update_stats(|stats| {
                    stats.misses += 1;
                    stats.evictions += 1;
                });
                None
            }
            None => {
                drop(entries);
                self.update_stats(|stats| stats.misses += 1);
                None
            }
        }
    }

    pub fn put(&self, key: &str, output: StepOutput, ttl: Option<Duration>) {
        let entry = CacheEntry {
            output,
            created_at: Instant::now(),
            ttl: ttl.unwrap_or(self.default_ttl),
            access_count: 0,
        };
        let mut entries = self.entries.lock().expect("cache lock");
        if entries.len() == usize::from(entries.cap()) && !entries.contains(key) {
            self.update_stats(|stats| stats.evictions += 1);
        }
        entries.put(key.to_string(), entry);
    }

    /// Acquire the single-flight guard for a fingerprint. The caller holds
    /// the guard across probe-build-store; concurrent builders of the same
    /// key queue behind it.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop completed single-flight guards that nobody waits on
    pub async fn release_key(&self, key: &str) {
        let mut inflight = self.inflight.lock().await;
        if let Some(lock) = inflight.get(key) {
            if Arc::strong_count(lock) == 1 {
                inflight.remove(key);
            }
        }
    }

    pub fn clear(&self) {
        self.entries.lock().expect("cache lock").clear();
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.lock().expect("stats lock").clone();
        stats.entries = self.entries.lock().expect("cache lock").len();
        stats
    }

    fn update_stats<F: FnOnce(&mut CacheStats)>(&self, apply: F) {
        apply(&mut self.stats.lock().expect("stats lock"));
    }
}

/// Serialize with recursively sorted object keys so fingerprints do not
/// depend on document ordering
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(object) => {
                let mut keys: Vec<&String> = object.keys().collect();
                keys.sort();
                out.push('{');
                for (index, key) in keys.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&object[key.as_str()], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            scalar => out.push_str(&serde_json::to_string(scalar).unwrap_or_default()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowpilot_core::types::StepMetadata;
    use serde_json::json;

    fn output(step_id: &str, data: Value) -> StepOutput {
        StepOutput::new(step_id, "test", "run", data, StepMetadata::success(1))
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = StepCache::fingerprint("action", "s1", &params(json!({"a": 1, "b": [2, 3]})));
        let b = StepCache::fingerprint("action", "s1", &params(json!({"b": [2, 3], "a": 1})));
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_steps() {
        let p = params(json!({"a": 1}));
        assert_ne!(
            StepCache::fingerprint("action", "s1", &p),
            StepCache::fingerprint("action", "s2", &p)
        );
        assert_ne!(
            StepCache::fingerprint("action", "s1", &p),
            StepCache::fingerprint("transform", "s1", &p)
        );
    }

    #[test]
    fn test_hit_returns_identical_output() {
        let cache = StepCache::new(10, Duration::from_secs(60));
        let stored = output("s1", json!({"rows": [1, 2]}));
        cache.put("k", stored.clone(), None);
        let hit = cache.get("k").unwrap();
        assert_eq!(
            serde_json::to_string(&hit).unwrap(),
            serde_json::to_string(&stored).unwrap()
        );
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = StepCache::new(10, Duration::from_millis(0));
        cache.put("k", output("s1", json!(1)), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = StepCache::new(2, Duration::from_secs(60));
        cache.put("a", output("a", json!(1)), None);
        cache.put("b", output("b", json!(2)), None);
        // touch `a` so `b` is the least recent
        cache.get("a");
        cache.put("c", output("c", json!(3)), None);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[tokio::test]
    async fn test_single_flight_serializes_builders() {
        let cache = Arc::new(StepCache::new(10, Duration::from_secs(60)));
        let builds = Arc::new(Mutex::new(0u32));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let builds = builds.clone();
            handles.push(tokio::spawn(async move {
                let guard = cache.lock_key("shared").await;
                if cache.get("shared").is_none() {
                    *builds.lock().unwrap() += 1;
                    cache.put("shared", output("s", json!(42)), None);
                }
                drop(guard);
                cache.release_key("shared").await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*builds.lock().unwrap(), 1);
    }

    #[test]
    fn test_canonical_json_sorts_nested() {
        let value = json!({"b": {"y": 1, "x": 2}, "a": [3, {"k": 1, "j": 2}]});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[3,{"j":2,"k":1}],"b":{"x":2,"y":1}}"#
        );
    }
}
