//! Cache of discovered endpoints.
//!
//! Entries are evicted least-recently-read first once `max_entries` is
//! reached, and expire lazily: [`EndpointCache::is_fresh`] drops an expired
//! entry when it sees one. In active mode a background task per key keeps
//! discovering until a fresh endpoint is cached; at most `max_threads` such
//! tasks run, the oldest being cancelled to make room.
//!
//! The lock is never held while discovering: [`EndpointCache::update`]
//! releases it during the discovery call and commits the result afterwards.
//! Concurrent updates of the same key are all committed, the last one wins.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use rigging_core::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EndpointCacheOptions;
use crate::{RequestContext, Result};

/// An endpoint returned by a discovery call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    /// Host, optionally with scheme and port.
    pub address: String,
    /// How long the endpoint may be used.
    pub cache_period: Duration,
}

impl DiscoveredEndpoint {
    /// Create a discovered endpoint.
    #[must_use]
    pub fn new(address: impl Into<String>, cache_period: Duration) -> Self {
        Self {
            address: address.into(),
            cache_period,
        }
    }
}

/// A cached endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEndpoint {
    address: String,
    created_at: Instant,
    ttl: Duration,
}

impl CachedEndpoint {
    /// Endpoint address as returned by discovery.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Time to live.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns `true` once the time to live has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// Source of discovered endpoints, usually a call to the service's discovery
/// operation.
pub trait Discover: Send + Sync {
    /// Discover endpoints for the request described by `ctx`.
    fn discover(&self, ctx: &RequestContext) -> BoxFuture<'static, Result<Vec<DiscoveredEndpoint>>>;
}

impl<F, Fut> Discover for F
where
    F: Fn(RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<DiscoveredEndpoint>>> + Send + 'static,
{
    fn discover(&self, ctx: &RequestContext) -> BoxFuture<'static, Result<Vec<DiscoveredEndpoint>>> {
        Box::pin(self(ctx.clone()))
    }
}

#[derive(Debug)]
struct PollingTask {
    token: CancellationToken,
    started: u64,
}

#[derive(Debug)]
struct CacheState {
    entries: LruCache<String, CachedEndpoint>,
    polling: HashMap<String, PollingTask>,
    polling_seq: u64,
}

impl CacheState {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN)),
            polling: HashMap::new(),
            polling_seq: 0,
        }
    }

    fn next_polling_seq(&mut self) -> u64 {
        self.polling_seq += 1;
        self.polling_seq
    }

    fn stop_polling(&mut self, key: &str) {
        if let Some(task) = self.polling.remove(key) {
            debug!(key, "stopping endpoint polling");
            task.token.cancel();
        }
    }

    /// Drop `key` if its entry has expired, returning whether a fresh entry remains.
    fn expire(&mut self, key: &str, stop_polling: bool) -> bool {
        let Some(expired) = self.entries.peek(key).map(CachedEndpoint::is_expired) else {
            return false;
        };
        if expired {
            debug!(key, "endpoint expired");
            self.entries.pop(key);
            if stop_polling {
                self.stop_polling(key);
            }
        }
        !expired
    }
}

/// LRU cache of discovered endpoints with background refresh.
pub struct EndpointCache {
    options: EndpointCacheOptions,
    state: Mutex<CacheState>,
}

impl EndpointCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(options: EndpointCacheOptions) -> Self {
        let state = Mutex::new(CacheState::new(options.max_entries));
        Self { options, state }
    }

    /// Cache options.
    #[must_use]
    pub const fn options(&self) -> &EndpointCacheOptions {
        &self.options
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read an entry, marking it most recently used. Expired entries are returned too.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CachedEndpoint> {
        self.lock().entries.get(key).cloned()
    }

    /// Insert or replace an entry.
    ///
    /// When the cache is full and `key` is new, the least recently read entry
    /// is dropped along with its polling task. A cache with `max_entries` of
    /// zero stores nothing.
    pub fn insert(&self, key: &str, endpoint: DiscoveredEndpoint) {
        if self.options.max_entries == 0 {
            debug!(key, "endpoint cache disabled, not caching");
            return;
        }

        let mut state = self.lock();
        debug!(key, address = %endpoint.address, ttl = ?endpoint.cache_period, "caching endpoint");
        let cached = CachedEndpoint {
            address: endpoint.address,
            created_at: Instant::now(),
            ttl: endpoint.cache_period,
        };
        if let Some((evicted, _)) = state.entries.push(key.to_string(), cached)
            && evicted != key
        {
            debug!(key = %evicted, "evicting least recently used endpoint");
            state.stop_polling(&evicted);
        }
    }

    /// Returns `true` if a non-expired entry exists. An expired entry is
    /// removed and its polling task stopped.
    pub fn is_fresh(&self, key: &str) -> bool {
        self.lock().expire(key, true)
    }

    /// Remove an entry and stop its polling task.
    pub fn delete(&self, key: &str) {
        let mut state = self.lock();
        state.entries.pop(key);
        state.stop_polling(key);
    }

    /// Number of cached entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Discover endpoints for `ctx` and cache each of them under `key`.
    pub async fn update(&self, key: &str, ctx: &RequestContext, discover: &dyn Discover) -> Result<()> {
        let endpoints = discover.discover(ctx).await?;
        debug!(key, count = endpoints.len(), "discovered endpoints");
        for endpoint in endpoints {
            self.insert(key, endpoint);
        }
        Ok(())
    }

    /// Cache key for `ctx`: the credential identity, followed by the operation
    /// name and the discovery identifier values when the operation declares any.
    #[must_use]
    pub fn extract_key(&self, ctx: &RequestContext) -> String {
        let mut parts = vec![
            ctx.credentials()
                .map(|credentials| credentials.identity())
                .unwrap_or_default(),
        ];

        let identifiers = ctx.operation().discovery_identifiers();
        if !identifiers.is_empty() {
            parts.push(ctx.operation_name().to_string());
            parts.extend(identifiers.iter().map(|name| ctx.param(name).unwrap_or_default()));
        }
        parts.join("_")
    }

    /// Returns `true` if a polling task runs for `key`.
    #[must_use]
    pub fn is_polling(&self, key: &str) -> bool {
        self.lock().polling.contains_key(key)
    }

    /// Number of running polling tasks.
    #[must_use]
    pub fn polling_count(&self) -> usize {
        self.lock().polling.len()
    }

    /// Start a background task discovering endpoints for `key` until one is
    /// cached and fresh.
    ///
    /// Does nothing when a task already polls `key`. Must be called within a
    /// tokio runtime.
    pub fn start_polling(self: &Arc<Self>, key: &str, ctx: RequestContext, discover: Arc<dyn Discover>) {
        let token = CancellationToken::new();
        let started = {
            let mut state = self.lock();
            if state.polling.contains_key(key) {
                return;
            }
            if self.options.max_threads == 0 {
                return;
            }
            if state.polling.len() >= self.options.max_threads {
                let oldest = state
                    .polling
                    .iter()
                    .min_by_key(|(_, task)| task.started)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    state.stop_polling(&oldest);
                }
            }
            let started = state.next_polling_seq();
            state.polling.insert(
                key.to_string(),
                PollingTask {
                    token: token.clone(),
                    started,
                },
            );
            started
        };

        debug!(key, "starting endpoint polling");
        let cache = Arc::clone(self);
        let key = key.to_string();
        let interval = self.options.poll_interval;
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = cache.poll(&key, &ctx, discover.as_ref(), interval) => {
                    cache.finish_polling(&key, started);
                }
            }
        });
    }

    async fn poll(&self, key: &str, ctx: &RequestContext, discover: &dyn Discover, interval: Duration) {
        while !self.polled_fresh(key) {
            if let Err(error) = self.update(key, ctx, discover).await {
                warn!(key, error = %error, "endpoint discovery failed");
            }
            if self.polled_fresh(key) {
                break;
            }
            tokio::time::sleep(interval).await;
        }
    }

    // Expires like `is_fresh` but leaves the calling poller running.
    fn polled_fresh(&self, key: &str) -> bool {
        self.lock().expire(key, false)
    }

    fn finish_polling(&self, key: &str, started: u64) {
        let mut state = self.lock();
        if state.polling.get(key).is_some_and(|task| task.started == started) {
            state.polling.remove(key);
        }
    }

    /// Stop a running polling task for `key`, if any.
    pub fn stop_polling_key(&self, key: &str) {
        self.lock().stop_polling(key);
    }

    /// Stop every polling task.
    pub fn stop_polling(&self) {
        let mut state = self.lock();
        for (key, task) in state.polling.drain() {
            debug!(key = %key, "stopping endpoint polling");
            task.token.cancel();
        }
    }
}

impl fmt::Debug for EndpointCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("EndpointCache")
            .field("options", &self.options)
            .field("entries", &state.entries.len())
            .field("polling", &state.polling.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use rigging_core::{DiscoveryMode, Error, Method, Operation, Request, StaticCredentials};

    use super::*;

    fn cache(max_entries: usize, max_threads: usize) -> Arc<EndpointCache> {
        Arc::new(EndpointCache::new(EndpointCacheOptions {
            max_entries,
            max_threads,
            poll_interval: Duration::from_secs(60),
            active: true,
        }))
    }

    fn endpoint(address: &str) -> DiscoveredEndpoint {
        DiscoveredEndpoint::new(address, Duration::from_secs(600))
    }

    fn context(operation: Operation, params: serde_json::Value) -> RequestContext {
        let url = url::Url::parse("https://streams.example.com/").expect("url");
        RequestContext::new(Arc::new(operation), Request::builder(Method::POST, url).build())
            .with_params(params)
            .with_credentials(Arc::new(StaticCredentials::new("AKID", "SECRET")))
    }

    #[test]
    fn evicts_least_recently_read() {
        let cache = cache(3, 1);
        cache.insert("a", endpoint("a.example.com"));
        cache.insert("b", endpoint("b.example.com"));
        cache.insert("c", endpoint("c.example.com"));

        // `a` was inserted first but read last.
        assert!(cache.get("a").is_some());
        cache.insert("d", endpoint("d.example.com"));

        assert_eq!(cache.len(), 3);
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a").map(|e| e.address().to_string()).as_deref(), Some("a.example.com"));
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
    }

    #[test]
    fn replacing_a_key_does_not_evict() {
        let cache = cache(2, 1);
        cache.insert("a", endpoint("a1.example.com"));
        cache.insert("b", endpoint("b.example.com"));
        cache.insert("a", endpoint("a2.example.com"));

        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.get("a").map(|e| e.address().to_string()).as_deref(),
            Some("a2.example.com")
        );
        assert!(cache.get("b").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_dropped_lazily() {
        let cache = cache(10, 1);
        cache.insert("short", DiscoveredEndpoint::new("short.example.com", Duration::from_secs(60)));
        assert!(cache.is_fresh("short"));

        tokio::time::advance(Duration::from_secs(61)).await;

        // Still present until checked.
        assert!(cache.get("short").is_some_and(|e| e.is_expired()));
        assert!(!cache.is_fresh("short"));
        assert!(cache.get("short").is_none());
    }

    #[test]
    fn key_from_identity_only() {
        let cache = cache(10, 1);
        let ctx = context(Operation::new("ListStreams"), serde_json::Value::Null);
        assert_eq!(cache.extract_key(&ctx), "AKID");
    }

    #[test]
    fn key_with_discovery_identifiers() {
        let cache = cache(10, 1);
        let operation = Operation::new("GetRecords")
            .with_discovery(DiscoveryMode::Required)
            .with_discovery_identifiers(["StreamName", "Shard"]);
        let ctx = context(operation, serde_json::json!({"StreamName": "orders", "Shard": 7}));
        assert_eq!(cache.extract_key(&ctx), "AKID_GetRecords_orders_7");
    }

    #[test]
    fn key_keeps_position_of_missing_identifiers() {
        let cache = cache(10, 1);
        let operation = || {
            Operation::new("GetRecords")
                .with_discovery(DiscoveryMode::Required)
                .with_discovery_identifiers(["StreamName", "Shard"])
        };
        let stream_only = context(operation(), serde_json::json!({"StreamName": "x"}));
        let shard_only = context(operation(), serde_json::json!({"StreamName": null, "Shard": "x"}));

        assert_eq!(cache.extract_key(&stream_only), "AKID_GetRecords_x_");
        assert_eq!(cache.extract_key(&shard_only), "AKID_GetRecords__x");
    }

    #[test]
    fn zero_capacity_caches_nothing() {
        let cache = cache(0, 1);
        cache.insert("k", endpoint("k.example.com"));

        assert_eq!(cache.len(), 0);
        assert!(!cache.is_fresh("k"));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn single_entry_capacity_keeps_latest() {
        let cache = cache(1, 1);
        cache.insert("a", endpoint("a.example.com"));
        cache.insert("b", endpoint("b.example.com"));

        assert_eq!(cache.len(), 1);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[tokio::test]
    async fn update_caches_discovered_endpoints() {
        let cache = cache(10, 1);
        let ctx = context(Operation::new("ListStreams"), serde_json::Value::Null);
        let discover = |_ctx: RequestContext| async { Ok::<_, Error>(vec![endpoint("discovered.example.com")]) };

        cache.update("AKID", &ctx, &discover).await.expect("update");

        assert!(cache.is_fresh("AKID"));
        assert_eq!(
            cache.get("AKID").map(|e| e.address().to_string()).as_deref(),
            Some("discovered.example.com")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_once_fresh() {
        let cache = cache(10, 2);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let discover: Arc<dyn Discover> = Arc::new(move |_ctx: RequestContext| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Ok::<_, Error>(Vec::new())
                } else {
                    Ok(vec![endpoint("polled.example.com")])
                }
            }
        });
        let ctx = context(Operation::new("ListStreams"), serde_json::Value::Null);

        cache.start_polling("AKID", ctx, discover);
        assert!(cache.is_polling("AKID"));

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_fresh("AKID"));
        assert!(!cache.is_polling("AKID"));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_is_bounded() {
        let cache = cache(10, 2);
        let never: Arc<dyn Discover> = Arc::new(|_ctx: RequestContext| async { Ok::<_, Error>(Vec::new()) });
        let ctx = context(Operation::new("ListStreams"), serde_json::Value::Null);

        cache.start_polling("first", ctx.clone(), Arc::clone(&never));
        cache.start_polling("second", ctx.clone(), Arc::clone(&never));
        cache.start_polling("second", ctx.clone(), Arc::clone(&never));
        assert_eq!(cache.polling_count(), 2);

        cache.start_polling("third", ctx, never);

        assert_eq!(cache.polling_count(), 2);
        assert!(!cache.is_polling("first"));
        assert!(cache.is_polling("second"));
        assert!(cache.is_polling("third"));

        cache.stop_polling();
        assert_eq!(cache.polling_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_stops_polling() {
        let cache = cache(1, 2);
        let never: Arc<dyn Discover> = Arc::new(|_ctx: RequestContext| async { Ok::<_, Error>(Vec::new()) });
        let ctx = context(Operation::new("ListStreams"), serde_json::Value::Null);

        cache.insert("old", endpoint("old.example.com"));
        cache.start_polling("old", ctx, never);
        assert!(cache.is_polling("old"));

        cache.insert("new", endpoint("new.example.com"));

        assert!(!cache.is_polling("old"));
        assert!(cache.get("old").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_stops_polling() {
        let cache = cache(10, 2);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let never: Arc<dyn Discover> = Arc::new(move |_ctx: RequestContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Error>(Vec::new()) }
        });
        let ctx = context(Operation::new("ListStreams"), serde_json::Value::Null);

        cache.start_polling("AKID", ctx, never);
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Cached by another caller while the poller sleeps, then left to expire.
        cache.insert("AKID", DiscoveredEndpoint::new("short.example.com", Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.is_polling("AKID"));

        assert!(!cache.is_fresh("AKID"));
        assert!(!cache.is_polling("AKID"));
    }
}
