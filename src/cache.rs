//! Response cache.
//!
//! Keyed on a SHA-256 fingerprint of `systemPrompt | userPrompt |
//! sort(toolNames) | model`, so reordering the tool list never produces a
//! spurious miss. Backed by `cached::TimedSizedCache`, which evicts both by
//! size (LRU) and by TTL; wrapped in a `Mutex` since the cache crate's
//! structures are not internally synchronized.

use cached::{Cached, TimedSizedCache};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::Duration;

/// A cached response's payload.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub content: String,
    pub tools_used: Vec<String>,
    pub cached_at_millis: u64,
}

/// Compute the 64-char lowercase hex cache key for a would-be request.
/// `tool_names` is sorted internally so call order never affects the key.
pub fn cache_key(system_prompt: &str, user_prompt: &str, tool_names: &[String], model: &str) -> String {
    let mut sorted = tool_names.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    hasher.update(system_prompt.as_bytes());
    hasher.update(b"|");
    hasher.update(user_prompt.as_bytes());
    hasher.update(b"|");
    hasher.update(sorted.join(",").as_bytes());
    hasher.update(b"|");
    hasher.update(model.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Size- and TTL-bounded response cache. Default: 1000 entries, 60 minute TTL.
pub struct ResponseCache {
    inner: Mutex<TimedSizedCache<String, CachedResponse>>,
}

impl ResponseCache {
    pub fn new(size: usize, ttl: Duration) -> Self {
        Self { inner: Mutex::new(TimedSizedCache::with_size_and_lifespan(size, ttl.as_secs())) }
    }

    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        self.inner.lock().expect("cache mutex poisoned").cache_get(&key.to_string()).cloned()
    }

    pub fn put(&self, key: String, value: CachedResponse) {
        self.inner.lock().expect("cache mutex poisoned").cache_set(key, value);
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(1000, Duration::from_secs(60 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_64_char_lowercase_hex() {
        let key = cache_key("sys", "hello", &["b".into(), "a".into()], "gpt-4");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_key_stable_under_tool_reordering() {
        let a = cache_key("sys", "hello", &["weather".into(), "search".into()], "gpt-4");
        let b = cache_key("sys", "hello", &["search".into(), "weather".into()], "gpt-4");
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_differs_on_model() {
        let a = cache_key("sys", "hello", &[], "gpt-4");
        let b = cache_key("sys", "hello", &[], "gpt-4o");
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_differs_on_prompt() {
        let a = cache_key("sys", "hello", &[], "gpt-4");
        let b = cache_key("sys", "goodbye", &[], "gpt-4");
        assert_ne!(a, b);
    }

    #[test]
    fn test_put_then_get_roundtrip() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        let key = cache_key("sys", "hi", &[], "m");
        cache.put(
            key.clone(),
            CachedResponse { content: "hello".into(), tools_used: vec![], cached_at_millis: 0 },
        );
        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.content, "hello");
    }

    #[test]
    fn test_miss_returns_none() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        assert!(cache.get("nonexistent").is_none());
    }
}
