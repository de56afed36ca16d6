//! Client configuration types.
//!
//! [`ClientConfigBuilder::build`] is the resolution pass: explicit overrides
//! are applied first, then defaults are filled in. Defaults that depend on
//! other fields (the backoff function, the endpoint discovery switch) are
//! resolved after the fields they read.

use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rustls::RootCertStore;
use url::Url;

use crate::retry::{Backoff, Jitter};

/// Networking options of a [`ConnectionPool`](crate::ConnectionPool).
///
/// Two pools built from equal options are the same pool: see
/// [`ConnectionPool::for_options`](crate::ConnectionPool::for_options).
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Proxy every request goes through.
    pub http_proxy: Option<Url>,
    /// Timeout for opening a connection, TLS handshake included.
    pub http_open_timeout: Duration,
    /// Timeout for reading a response, per read.
    pub http_read_timeout: Duration,
    /// Idle sessions older than this are closed.
    pub http_idle_timeout: Duration,
    /// How long to wait for `100 Continue` before sending a body.
    pub http_continue_timeout: Option<Duration>,
    /// Log request and response lines and headers on the `rigging::wire` target.
    pub http_wire_trace: bool,
    /// Verify the server certificate.
    pub ssl_verify_peer: bool,
    /// PEM file of trusted certificates.
    pub ssl_ca_bundle: Option<PathBuf>,
    /// Directory of PEM files of trusted certificates.
    pub ssl_ca_directory: Option<PathBuf>,
    /// Pre-built trust store.
    pub ssl_ca_store: Option<Arc<RootCertStore>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            http_proxy: None,
            http_open_timeout: Duration::from_secs(15),
            http_read_timeout: Duration::from_secs(60),
            http_idle_timeout: Duration::from_secs(5),
            http_continue_timeout: Some(Duration::from_secs(1)),
            http_wire_trace: false,
            ssl_verify_peer: true,
            ssl_ca_bundle: None,
            ssl_ca_directory: None,
            ssl_ca_store: None,
        }
    }
}

impl PartialEq for PoolOptions {
    fn eq(&self, other: &Self) -> bool {
        let same_store = match (&self.ssl_ca_store, &other.ssl_ca_store) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_store
            && self.http_proxy == other.http_proxy
            && self.http_open_timeout == other.http_open_timeout
            && self.http_read_timeout == other.http_read_timeout
            && self.http_idle_timeout == other.http_idle_timeout
            && self.http_continue_timeout == other.http_continue_timeout
            && self.http_wire_trace == other.http_wire_trace
            && self.ssl_verify_peer == other.ssl_verify_peer
            && self.ssl_ca_bundle == other.ssl_ca_bundle
            && self.ssl_ca_directory == other.ssl_ca_directory
    }
}

impl Eq for PoolOptions {}

// Trust stores are compared by identity.
impl Hash for PoolOptions {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.http_proxy.as_ref().map(Url::as_str).hash(state);
        self.http_open_timeout.hash(state);
        self.http_read_timeout.hash(state);
        self.http_idle_timeout.hash(state);
        self.http_continue_timeout.hash(state);
        self.http_wire_trace.hash(state);
        self.ssl_verify_peer.hash(state);
        self.ssl_ca_bundle.hash(state);
        self.ssl_ca_directory.hash(state);
        self.ssl_ca_store.as_ref().map(Arc::as_ptr).hash(state);
    }
}

/// Retry options.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Maximum number of resends; `0` disables retries.
    pub retry_limit: u32,
    /// Delay before the first resend.
    pub retry_base_delay: Duration,
    /// Upper bound of the computed delay; zero means unbounded.
    pub retry_max_delay: Duration,
    /// Randomization applied to the computed delay.
    pub retry_jitter: Jitter,
    /// Delay function actually used between attempts.
    pub retry_backoff: Backoff,
}

impl Default for RetryOptions {
    fn default() -> Self {
        let retry_base_delay = Duration::from_millis(300);
        let retry_max_delay = Duration::ZERO;
        let retry_jitter = Jitter::None;
        Self {
            retry_limit: 3,
            retry_base_delay,
            retry_max_delay,
            retry_jitter,
            retry_backoff: Backoff::exponential(retry_base_delay, retry_max_delay, retry_jitter),
        }
    }
}

/// Endpoint cache options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCacheOptions {
    /// Maximum number of cached endpoints.
    pub max_entries: usize,
    /// Maximum number of background polling tasks.
    pub max_threads: usize,
    /// Delay between two discovery attempts of a polling task.
    pub poll_interval: Duration,
    /// Refresh missing endpoints in the background instead of inline.
    pub active: bool,
}

impl Default for EndpointCacheOptions {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_threads: 10,
            poll_interval: Duration::from_secs(60),
            active: false,
        }
    }
}

/// Resolved client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Connection pool options.
    pub pool: PoolOptions,
    /// Retry options.
    pub retry: RetryOptions,
    /// Endpoint cache options.
    pub endpoint_cache: EndpointCacheOptions,
    /// Use discovered endpoints for operations that support them.
    pub endpoint_discovery: bool,
}

impl ClientConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    http_proxy: Option<Url>,
    http_open_timeout: Option<Duration>,
    http_read_timeout: Option<Duration>,
    http_idle_timeout: Option<Duration>,
    http_continue_timeout: Option<Option<Duration>>,
    http_wire_trace: Option<bool>,
    ssl_verify_peer: Option<bool>,
    ssl_ca_bundle: Option<PathBuf>,
    ssl_ca_directory: Option<PathBuf>,
    ssl_ca_store: Option<Arc<RootCertStore>>,

    retry_limit: Option<u32>,
    retry_base_delay: Option<Duration>,
    retry_max_delay: Option<Duration>,
    retry_jitter: Option<Jitter>,
    retry_backoff: Option<Backoff>,

    endpoint_cache_max_entries: Option<usize>,
    endpoint_cache_max_threads: Option<usize>,
    endpoint_cache_poll_interval: Option<Duration>,
    active_endpoint_cache: Option<bool>,
    endpoint_discovery: Option<bool>,
}

impl ClientConfigBuilder {
    /// Route every request through a proxy.
    #[must_use]
    pub fn http_proxy(mut self, proxy: Url) -> Self {
        self.http_proxy = Some(proxy);
        self
    }

    /// Set the connection open timeout.
    #[must_use]
    pub const fn http_open_timeout(mut self, timeout: Duration) -> Self {
        self.http_open_timeout = Some(timeout);
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub const fn http_read_timeout(mut self, timeout: Duration) -> Self {
        self.http_read_timeout = Some(timeout);
        self
    }

    /// Set the idle timeout of pooled sessions.
    #[must_use]
    pub const fn http_idle_timeout(mut self, timeout: Duration) -> Self {
        self.http_idle_timeout = Some(timeout);
        self
    }

    /// Set the `100 Continue` timeout; `None` disables waiting.
    #[must_use]
    pub const fn http_continue_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.http_continue_timeout = Some(timeout);
        self
    }

    /// Enable wire tracing.
    #[must_use]
    pub const fn http_wire_trace(mut self, enabled: bool) -> Self {
        self.http_wire_trace = Some(enabled);
        self
    }

    /// Enable or disable server certificate verification.
    #[must_use]
    pub const fn ssl_verify_peer(mut self, verify: bool) -> Self {
        self.ssl_verify_peer = Some(verify);
        self
    }

    /// Trust the certificates of a PEM file.
    #[must_use]
    pub fn ssl_ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssl_ca_bundle = Some(path.into());
        self
    }

    /// Trust the certificates of every PEM file of a directory.
    #[must_use]
    pub fn ssl_ca_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssl_ca_directory = Some(path.into());
        self
    }

    /// Use a pre-built trust store.
    #[must_use]
    pub fn ssl_ca_store(mut self, store: Arc<RootCertStore>) -> Self {
        self.ssl_ca_store = Some(store);
        self
    }

    /// Set the maximum number of resends.
    #[must_use]
    pub const fn retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    /// Set the base retry delay.
    #[must_use]
    pub const fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = Some(delay);
        self
    }

    /// Set the maximum retry delay; zero means unbounded.
    #[must_use]
    pub const fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = Some(delay);
        self
    }

    /// Set the retry jitter.
    #[must_use]
    pub const fn retry_jitter(mut self, jitter: Jitter) -> Self {
        self.retry_jitter = Some(jitter);
        self
    }

    /// Replace the delay function; base delay, max delay and jitter are then ignored.
    #[must_use]
    pub fn retry_backoff(mut self, backoff: Backoff) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    /// Set the maximum number of cached endpoints.
    #[must_use]
    pub const fn endpoint_cache_max_entries(mut self, max: usize) -> Self {
        self.endpoint_cache_max_entries = Some(max);
        self
    }

    /// Set the maximum number of background polling tasks.
    #[must_use]
    pub const fn endpoint_cache_max_threads(mut self, max: usize) -> Self {
        self.endpoint_cache_max_threads = Some(max);
        self
    }

    /// Set the polling interval.
    #[must_use]
    pub const fn endpoint_cache_poll_interval(mut self, interval: Duration) -> Self {
        self.endpoint_cache_poll_interval = Some(interval);
        self
    }

    /// Refresh missing endpoints in the background; implies endpoint discovery.
    #[must_use]
    pub const fn active_endpoint_cache(mut self, active: bool) -> Self {
        self.active_endpoint_cache = Some(active);
        self
    }

    /// Enable endpoint discovery.
    #[must_use]
    pub const fn endpoint_discovery(mut self, enabled: bool) -> Self {
        self.endpoint_discovery = Some(enabled);
        self
    }

    /// Enable endpoint discovery from an externally supplied flag value.
    ///
    /// `"true"` and `"false"` are accepted, case-insensitively; any other
    /// value, or `None`, leaves the setting untouched.
    #[must_use]
    pub fn endpoint_discovery_from_env(self, value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(flag) if flag.eq_ignore_ascii_case("true") => self.endpoint_discovery(true),
            Some(flag) if flag.eq_ignore_ascii_case("false") => self.endpoint_discovery(false),
            _ => self,
        }
    }

    /// Resolve the configuration.
    #[must_use]
    pub fn build(self) -> ClientConfig {
        let pool_defaults = PoolOptions::default();
        let pool = PoolOptions {
            http_proxy: self.http_proxy,
            http_open_timeout: self
                .http_open_timeout
                .unwrap_or(pool_defaults.http_open_timeout),
            http_read_timeout: self
                .http_read_timeout
                .unwrap_or(pool_defaults.http_read_timeout),
            http_idle_timeout: self
                .http_idle_timeout
                .unwrap_or(pool_defaults.http_idle_timeout),
            http_continue_timeout: self
                .http_continue_timeout
                .unwrap_or(pool_defaults.http_continue_timeout),
            http_wire_trace: self
                .http_wire_trace
                .unwrap_or(pool_defaults.http_wire_trace),
            ssl_verify_peer: self
                .ssl_verify_peer
                .unwrap_or(pool_defaults.ssl_verify_peer),
            ssl_ca_bundle: self.ssl_ca_bundle,
            ssl_ca_directory: self.ssl_ca_directory,
            ssl_ca_store: self.ssl_ca_store,
        };

        let retry_defaults = RetryOptions::default();
        let retry_base_delay = self
            .retry_base_delay
            .unwrap_or(retry_defaults.retry_base_delay);
        let retry_max_delay = self
            .retry_max_delay
            .unwrap_or(retry_defaults.retry_max_delay);
        let retry_jitter = self.retry_jitter.unwrap_or(retry_defaults.retry_jitter);
        let retry = RetryOptions {
            retry_limit: self.retry_limit.unwrap_or(retry_defaults.retry_limit),
            retry_base_delay,
            retry_max_delay,
            retry_jitter,
            retry_backoff: self.retry_backoff.unwrap_or_else(|| {
                Backoff::exponential(retry_base_delay, retry_max_delay, retry_jitter)
            }),
        };

        let cache_defaults = EndpointCacheOptions::default();
        let endpoint_cache = EndpointCacheOptions {
            max_entries: self
                .endpoint_cache_max_entries
                .unwrap_or(cache_defaults.max_entries),
            max_threads: self
                .endpoint_cache_max_threads
                .unwrap_or(cache_defaults.max_threads),
            poll_interval: self
                .endpoint_cache_poll_interval
                .unwrap_or(cache_defaults.poll_interval),
            active: self.active_endpoint_cache.unwrap_or(cache_defaults.active),
        };
        let endpoint_discovery = endpoint_cache.active || self.endpoint_discovery.unwrap_or(false);

        ClientConfig {
            pool,
            retry,
            endpoint_cache,
            endpoint_discovery,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use rigging_core::{Method, Operation, Request, RequestContext};

    use super::*;

    fn after_retries(retries: u32) -> RequestContext {
        let url = Url::parse("https://service.example.com/").expect("url");
        let mut ctx = RequestContext::new(
            Arc::new(Operation::new("DescribeTable")),
            Request::builder(Method::POST, url).build(),
        );
        for _ in 0..retries {
            ctx.increment_retries();
        }
        ctx
    }

    fn hash_of(options: &PoolOptions) -> u64 {
        let mut hasher = DefaultHasher::new();
        options.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn default_config() {
        let config = ClientConfig::builder().build();

        assert_eq!(config.pool.http_open_timeout, Duration::from_secs(15));
        assert_eq!(config.pool.http_read_timeout, Duration::from_secs(60));
        assert_eq!(config.pool.http_idle_timeout, Duration::from_secs(5));
        assert_eq!(config.pool.http_continue_timeout, Some(Duration::from_secs(1)));
        assert!(config.pool.ssl_verify_peer);
        assert!(!config.pool.http_wire_trace);

        assert_eq!(config.retry.retry_limit, 3);
        assert_eq!(config.retry.retry_base_delay, Duration::from_millis(300));
        assert_eq!(config.retry.retry_max_delay, Duration::ZERO);
        assert_eq!(config.retry.retry_jitter, Jitter::None);

        assert_eq!(config.endpoint_cache, EndpointCacheOptions::default());
        assert!(!config.endpoint_discovery);
    }

    #[test]
    fn builder_overrides() {
        let config = ClientConfig::builder()
            .http_read_timeout(Duration::from_secs(5))
            .http_continue_timeout(None)
            .ssl_verify_peer(false)
            .retry_limit(7)
            .endpoint_cache_max_entries(10)
            .build();

        assert_eq!(config.pool.http_read_timeout, Duration::from_secs(5));
        assert_eq!(config.pool.http_continue_timeout, None);
        assert!(!config.pool.ssl_verify_peer);
        assert_eq!(config.retry.retry_limit, 7);
        assert_eq!(config.endpoint_cache.max_entries, 10);
    }

    #[test]
    fn backoff_resolved_from_delays() {
        let config = ClientConfig::builder()
            .retry_base_delay(Duration::from_millis(100))
            .retry_max_delay(Duration::from_millis(250))
            .build();

        let backoff = &config.retry.retry_backoff;
        assert_eq!(backoff.delay(&after_retries(0)), Duration::from_millis(100));
        assert_eq!(backoff.delay(&after_retries(1)), Duration::from_millis(200));
        assert_eq!(backoff.delay(&after_retries(2)), Duration::from_millis(250));
    }

    #[test]
    fn backoff_override_wins() {
        let config = ClientConfig::builder()
            .retry_base_delay(Duration::from_secs(10))
            .retry_backoff(Backoff::new(|_| Duration::from_millis(1)))
            .build();

        assert_eq!(
            config.retry.retry_backoff.delay(&after_retries(5)),
            Duration::from_millis(1)
        );
    }

    #[test]
    fn active_cache_implies_discovery() {
        let config = ClientConfig::builder().active_endpoint_cache(true).build();
        assert!(config.endpoint_cache.active);
        assert!(config.endpoint_discovery);
    }

    #[test]
    fn discovery_flag_from_env() {
        let on = ClientConfig::builder()
            .endpoint_discovery_from_env(Some("TRUE"))
            .build();
        assert!(on.endpoint_discovery);

        let off = ClientConfig::builder()
            .endpoint_discovery(true)
            .endpoint_discovery_from_env(Some("false"))
            .build();
        assert!(!off.endpoint_discovery);

        let untouched = ClientConfig::builder()
            .endpoint_discovery(true)
            .endpoint_discovery_from_env(Some("maybe"))
            .build();
        assert!(untouched.endpoint_discovery);

        let unset = ClientConfig::builder()
            .endpoint_discovery_from_env(None)
            .build();
        assert!(!unset.endpoint_discovery);
    }

    #[test]
    fn pool_options_identity() {
        let a = PoolOptions::default();
        let b = PoolOptions::default();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let store = Arc::new(RootCertStore::empty());
        let with_store = PoolOptions {
            ssl_ca_store: Some(Arc::clone(&store)),
            ..PoolOptions::default()
        };
        let same_store = PoolOptions {
            ssl_ca_store: Some(store),
            ..PoolOptions::default()
        };
        let other_store = PoolOptions {
            ssl_ca_store: Some(Arc::new(RootCertStore::empty())),
            ..PoolOptions::default()
        };
        assert_eq!(with_store, same_store);
        assert_ne!(with_store, other_store);
        assert_ne!(a, with_store);
    }
}
