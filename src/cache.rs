//! Handler-aware response caching.
//!
//! Cache keys fold in the handler fingerprint, so two requests for the same
//! URL that transform the response differently never share an entry.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{RequestConfig, RequestError, Result};

/// Key/value store holding cached request results.
///
/// A TTL of `None` leaves retention to the store.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;
}

/// In-process [`CacheStore`]. Concurrent writers to one key: last one wins.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        match self.entries.lock() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, (_, expires)| expires.map_or(true, |at| at > now));
                before - entries.len()
            }
            Err(_) => 0,
        }
    }

    /// Number of stored entries, expired ones included until read or purged.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| RequestError::Cache("memory store is poisoned".to_owned()))?;
        let expired = match entries.get(key) {
            Some((_, Some(expires))) => *expires <= Instant::now(),
            Some((_, None)) => false,
            None => return Ok(None),
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        // A TTL too far out to represent as an instant never expires.
        let expires = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.entries
            .lock()
            .map_err(|_| RequestError::Cache("memory store is poisoned".to_owned()))?
            .insert(key.to_owned(), (value, expires));
        Ok(())
    }
}

/// Envelope written to the store around each cached value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    /// Unix time in milliseconds after which the entry is dead.
    pub expires_at_ms: Option<u64>,
}

impl CacheEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(false, |expires| expires <= now_ms)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Activation {
    /// Store attached by the caller: cache every request.
    Always,
    /// Private fallback store: cache only requests with a TTL.
    WhenTtlSet,
}

/// Cache lookup and population around a request.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    activation: Activation,
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("activation", &self.activation)
            .finish()
    }
}

impl ResponseCache {
    /// Caches every request in `store`; requests without a TTL are kept for
    /// as long as the store retains them.
    pub fn attached(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            activation: Activation::Always,
        }
    }

    /// Caches in a private [`MemoryStore`], only for requests with a TTL.
    pub fn private() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            activation: Activation::WhenTtlSet,
        }
    }

    /// Whether requests under `config` go through the cache.
    pub fn is_active(&self, config: &RequestConfig) -> bool {
        match self.activation {
            Activation::Always => true,
            Activation::WhenTtlSet => config.cache_ttl().is_some(),
        }
    }

    /// Key identifying `method url` under `config`.
    ///
    /// Lowercase hex SHA-256 over the method, the URL, the headers sorted by
    /// lower-cased name and the handler fingerprint (`-` without a handler).
    pub fn key(method: &Method, url: &str, config: &RequestConfig) -> String {
        let mut headers: Vec<(String, &str)> = config
            .headers()
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
            .collect();
        headers.sort();

        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(url.as_bytes());
        hasher.update(b"\n");
        for (name, value) in headers {
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        match config.handler() {
            Some(handler) => hasher.update(handler.fingerprint().to_string().as_bytes()),
            None => hasher.update(b"-"),
        }
        hex::encode(hasher.finalize())
    }

    /// Returns the cached value for the request, or runs `do_request` and
    /// caches what it produces.
    ///
    /// Store failures never fail the request: a failed read is a miss and a
    /// failed write only loses the entry.
    pub async fn execute<F, Fut>(
        &self,
        method: &Method,
        url: &str,
        config: &RequestConfig,
        do_request: F,
    ) -> Result<serde_json::Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value>>,
    {
        if !self.is_active(config) {
            return do_request().await;
        }

        let key = Self::key(method, url, config);
        if let Some(value) = self.lookup(&key).await {
            #[cfg(feature = "tracing")]
            tracing::trace!(%method, url, key = %key, "cache hit");
            return Ok(value);
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(%method, url, key = %key, "cache miss");

        let value = do_request().await?;
        self.store(&key, &value, config.cache_ttl()).await;
        Ok(value)
    }

    async fn lookup(&self, key: &str) -> Option<serde_json::Value> {
        let raw = match self.store.get(key).await {
            Ok(raw) => raw?,
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "cache read failed");
                return None;
            }
        };
        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "discarding undecodable cache entry");
                return None;
            }
        };
        (!entry.is_expired(now_ms())).then_some(entry.value)
    }

    async fn store(&self, key: &str, value: &serde_json::Value, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value: value.clone(),
            expires_at_ms: ttl.map(|ttl| now_ms().saturating_add(millis_u64(ttl))),
        };
        let result = match serde_json::to_string(&entry) {
            Ok(raw) => self.store.set(key, raw, ttl).await,
            Err(err) => Err(err.into()),
        };
        match result {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(key, ttl_ms = ttl.map(millis_u64), "cached result");
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "cache write failed");
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(millis_u64)
        .unwrap_or(0)
}

fn millis_u64(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::Method;
    use serde_json::json;

    use super::{CacheEntry, CacheStore, MemoryStore, ResponseCache};
    use crate::{Handler, RequestConfig, RequestError, Response, Result};

    struct BrokenStore;

    #[async_trait]
    impl CacheStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(RequestError::Cache("offline".to_owned()))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Option<Duration>) -> Result<()> {
            Err(RequestError::Cache("offline".to_owned()))
        }
    }

    fn with_ttl(millis: u64) -> RequestConfig {
        RequestConfig::new()
            .set_cache_ttl(Duration::from_millis(millis))
            .expect("valid ttl")
    }

    #[tokio::test]
    async fn memory_store_expires_entries() {
        let store = MemoryStore::new();
        store
            .set("short", "a".to_owned(), Some(Duration::from_millis(20)))
            .await
            .expect("set succeeds");
        store
            .set("forever", "b".to_owned(), None)
            .await
            .expect("set succeeds");
        assert_eq!(store.get("short").await.expect("get"), Some("a".to_owned()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("short").await.expect("get"), None);
        assert_eq!(store.get("forever").await.expect("get"), Some("b".to_owned()));
        assert_eq!(store.purge_expired(), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn key_depends_on_method_url_headers_and_handler() {
        let config = RequestConfig::new();
        let base = ResponseCache::key(&Method::GET, "http://h/a", &config);

        assert_eq!(base.len(), 64);
        assert_eq!(base, ResponseCache::key(&Method::GET, "http://h/a", &config));
        assert_ne!(base, ResponseCache::key(&Method::POST, "http://h/a", &config));
        assert_ne!(base, ResponseCache::key(&Method::GET, "http://h/b", &config));

        let with_header = config.clone().set_header("Accept", "text/plain").expect("valid");
        assert_ne!(base, ResponseCache::key(&Method::GET, "http://h/a", &with_header));

        let status = Handler::path("app::status", |r: &Response| Ok(r.status)).expect("valid");
        let body = Handler::path("app::body", |r: &Response| Ok(r.body.clone())).expect("valid");
        let by_status = ResponseCache::key(&Method::GET, "http://h/a", &config.clone().set_handler(status));
        let by_body = ResponseCache::key(&Method::GET, "http://h/a", &config.set_handler(body));
        assert_ne!(base, by_status);
        assert_ne!(by_status, by_body);
    }

    #[test]
    fn key_ignores_header_order_and_case() {
        let first = RequestConfig::new()
            .set_header("Accept", "a")
            .and_then(|config| config.set_header("X-Id", "1"))
            .expect("valid");
        let second = RequestConfig::new()
            .set_header("x-id", "1")
            .and_then(|config| config.set_header("accept", "a"))
            .expect("valid");
        assert_eq!(
            ResponseCache::key(&Method::GET, "http://h/", &first),
            ResponseCache::key(&Method::GET, "http://h/", &second)
        );
    }

    #[tokio::test]
    async fn hit_skips_the_request_until_expiry() {
        let cache = ResponseCache::private();
        let config = with_ttl(80);
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let run = move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(n))
        };

        let first = cache.execute(&Method::GET, "http://h/", &config, run).await.expect("ok");
        let second = cache.execute(&Method::GET, "http://h/", &config, run).await.expect("ok");
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let third = cache.execute(&Method::GET, "http://h/", &config, run).await.expect("ok");
        assert_ne!(first, third);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn private_cache_is_bypassed_without_ttl() {
        let cache = ResponseCache::private();
        let config = RequestConfig::new();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let run = move || async move { Ok(json!(counter.fetch_add(1, Ordering::SeqCst))) };

        cache.execute(&Method::GET, "http://h/", &config, run).await.expect("ok");
        cache.execute(&Method::GET, "http://h/", &config, run).await.expect("ok");
        assert!(!cache.is_active(&config));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn attached_store_caches_without_ttl() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::attached(store.clone());
        let config = RequestConfig::new();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let run = move || async move { Ok(json!(counter.fetch_add(1, Ordering::SeqCst))) };

        cache.execute(&Method::GET, "http://h/", &config, run).await.expect("ok");
        cache.execute(&Method::GET, "http://h/", &config, run).await.expect("ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn expired_envelope_is_never_served() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::attached(store.clone());
        let config = RequestConfig::new();
        let key = ResponseCache::key(&Method::GET, "http://h/", &config);
        let stale = CacheEntry {
            value: json!("stale"),
            expires_at_ms: Some(1),
        };
        store
            .set(&key, serde_json::to_string(&stale).expect("encodes"), None)
            .await
            .expect("set succeeds");

        let value = cache
            .execute(&Method::GET, "http://h/", &config, || async { Ok(json!("fresh")) })
            .await
            .expect("ok");
        assert_eq!(value, json!("fresh"));
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = ResponseCache::private();
        let config = with_ttl(10_000);
        let err = cache
            .execute(&Method::GET, "http://h/", &config, || async {
                Err(RequestError::Response {
                    status: 500,
                    body: String::new(),
                })
            })
            .await
            .expect_err("request fails");
        assert_eq!(err.status(), Some(500));

        let value = cache
            .execute(&Method::GET, "http://h/", &config, || async { Ok(json!(1)) })
            .await
            .expect("ok");
        assert_eq!(value, json!(1));
    }

    #[tokio::test]
    async fn unbounded_ttl_is_cached_without_overflow() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("far", "x".to_owned(), Some(Duration::MAX))
            .await
            .expect("set succeeds");
        assert_eq!(store.get("far").await.expect("get"), Some("x".to_owned()));

        let cache = ResponseCache::attached(store.clone());
        let config = RequestConfig::new()
            .set_cache_ttl(u64::MAX)
            .expect("integer seconds are accepted");
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let run = move || async move { Ok(json!(counter.fetch_add(1, Ordering::SeqCst))) };

        cache.execute(&Method::GET, "http://h/", &config, run).await.expect("ok");
        cache.execute(&Method::GET, "http://h/", &config, run).await.expect("ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let key = ResponseCache::key(&Method::GET, "http://h/", &config);
        let raw = store.get(&key).await.expect("get").expect("entry is stored");
        let entry: CacheEntry = serde_json::from_str(&raw).expect("entry decodes");
        assert_eq!(entry.expires_at_ms, Some(u64::MAX));
    }

    #[tokio::test]
    async fn concurrent_writers_leave_one_decodable_entry() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::attached(store.clone());
        let config = with_ttl(10_000);

        let mut writers = Vec::new();
        for n in 0..16u64 {
            let cache = cache.clone();
            let config = config.clone();
            writers.push(tokio::spawn(async move {
                cache
                    .execute(&Method::GET, "http://h/shared", &config, move || async move {
                        tokio::task::yield_now().await;
                        Ok(json!({ "writer": n }))
                    })
                    .await
            }));
        }
        for writer in writers {
            writer
                .await
                .expect("writer task completes")
                .expect("execute succeeds");
        }

        assert_eq!(store.len(), 1);
        let key = ResponseCache::key(&Method::GET, "http://h/shared", &config);
        let raw = store.get(&key).await.expect("get").expect("entry is stored");
        let entry: CacheEntry = serde_json::from_str(&raw).expect("entry decodes");
        assert!(entry.value["writer"].as_u64().is_some_and(|n| n < 16));
    }

    #[tokio::test]
    async fn broken_store_degrades_to_uncached_requests() {
        let cache = ResponseCache::attached(Arc::new(BrokenStore));
        let value = cache
            .execute(&Method::GET, "http://h/", &RequestConfig::new(), || async {
                Ok(json!("live"))
            })
            .await
            .expect("store errors do not fail the request");
        assert_eq!(value, json!("live"));
    }
}
