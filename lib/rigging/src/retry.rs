//! Error classification and retries.
//!
//! [`ErrorInspector`] sorts a failed attempt into an [`ErrorKind`];
//! [`RetryLayer`] resends the request while the kind is retryable, the retry
//! limit is not reached and the response target can be reset.
//!
//! The retry handler is registered at the sign step with priority 99, so it
//! wraps every other sign handler and the transport. Each attempt runs the
//! inner handlers on a fresh copy of the context, which rewinds the request
//! body and resets the buffered response.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use derive_more::Display;
use rand::Rng;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, info, warn};

use crate::endpoint_cache::EndpointCache;
use crate::{DiscoveryMode, Error, RequestContext, Response, Result};

/// Codes meaning the credentials expired or are not recognized.
const EXPIRED_CREDENTIALS: &[&str] = &[
    "InvalidClientTokenId",
    "UnrecognizedClientException",
    "InvalidAccessKeyId",
    "AuthFailure",
    "InvalidIdentityToken",
    "ExpiredToken",
    "ExpiredTokenException",
];

const THROTTLING: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottledException",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "TransactionInProgressException",
    "RequestLimitExceeded",
    "BandwidthLimitExceeded",
    "LimitExceededException",
    "RequestThrottled",
    "SlowDown",
    "PriorRequestNotComplete",
    "EC2ThrottledException",
];

const CHECKSUM: &[&str] = &["CRC32CheckFailed", "BadDigest"];

const NETWORKING: &[&str] = &["RequestTimeout", "RequestTimeoutException"];

const INVALID_ENDPOINT: &str = "InvalidEndpointException";

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ErrorKind {
    /// Credentials expired; retryable when they can be refreshed.
    #[display("expired_credentials")]
    ExpiredCredentials,
    /// The service asked the client to slow down.
    #[display("throttling")]
    Throttling,
    /// The response failed an integrity check.
    #[display("checksum")]
    Checksum,
    /// Transport failure or request timeout.
    #[display("networking")]
    Networking,
    /// HTTP 5xx.
    #[display("server")]
    Server,
    /// The discovered endpoint is no longer valid.
    #[display("endpoint_discovery")]
    EndpointDiscovery,
    /// Anything else.
    #[display("non_retryable")]
    NonRetryable,
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

/// Classifies errors.
///
/// When built with an endpoint cache, an endpoint-discovery failure evicts the
/// cache entry of the failing request so the next attempt discovers again.
#[derive(Debug, Clone, Default)]
pub struct ErrorInspector {
    endpoint_cache: Option<Arc<EndpointCache>>,
}

impl ErrorInspector {
    /// Inspector without endpoint cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspector evicting stale endpoints from `cache`.
    #[must_use]
    pub fn with_endpoint_cache(cache: Arc<EndpointCache>) -> Self {
        Self {
            endpoint_cache: Some(cache),
        }
    }

    /// Classify `error`, raised while executing `ctx`.
    #[must_use]
    pub fn classify(&self, error: &Error, ctx: &RequestContext) -> ErrorKind {
        let code = error.code().unwrap_or_default();
        let status = error.status();

        if Self::is_expired_credentials(code) {
            ErrorKind::ExpiredCredentials
        } else if Self::is_throttling(code, status) {
            ErrorKind::Throttling
        } else if error.is_checksum() || CHECKSUM.contains(&code) {
            ErrorKind::Checksum
        } else if error.is_networking() || NETWORKING.contains(&code) {
            ErrorKind::Networking
        } else if error.is_server_error() {
            ErrorKind::Server
        } else if self.is_endpoint_discovery(error, code, ctx) {
            ErrorKind::EndpointDiscovery
        } else {
            ErrorKind::NonRetryable
        }
    }

    fn is_expired_credentials(code: &str) -> bool {
        EXPIRED_CREDENTIALS.contains(&code) || contains_ignore_case(code, "expired")
    }

    fn is_throttling(code: &str, status: Option<u16>) -> bool {
        THROTTLING.contains(&code) || contains_ignore_case(code, "throttl") || status == Some(429)
    }

    fn is_endpoint_discovery(&self, error: &Error, code: &str, ctx: &RequestContext) -> bool {
        if ctx.operation().discovery() == DiscoveryMode::None {
            return false;
        }
        let matched = error.status() == Some(421)
            || code == INVALID_ENDPOINT
            || matches!(error, Error::EndpointDiscovery(_));

        if matched && let Some(cache) = &self.endpoint_cache {
            let key = cache.extract_key(ctx);
            debug!(key = %key, "evicting rejected endpoint");
            cache.delete(&key);
        }
        matched
    }
}

/// Randomization applied to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum Jitter {
    /// Delay unchanged.
    #[default]
    #[display("none")]
    None,
    /// Half the delay plus a random share of the other half.
    #[display("equal")]
    Equal,
    /// Uniformly random in `[0, delay]`.
    #[display("full")]
    Full,
}

impl Jitter {
    /// Apply the jitter to `delay`.
    #[must_use]
    pub fn apply(self, delay: Duration) -> Duration {
        match self {
            Self::None => delay,
            Self::Full => random_up_to(delay),
            Self::Equal => {
                let half = delay / 2;
                half + random_up_to(half)
            }
        }
    }
}

impl FromStr for Jitter {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(Self::None),
            "equal" => Ok(Self::Equal),
            "full" => Ok(Self::Full),
            other => Err(Error::invalid_request(format!("unknown retry jitter `{other}`"))),
        }
    }
}

fn random_up_to(max: Duration) -> Duration {
    let nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
}

/// `base * 2^attempt`, clamped to `max` unless `max` is zero.
#[must_use]
pub fn exponential_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
    let delay = base.saturating_mul(factor);
    if max.is_zero() { delay } else { delay.min(max) }
}

type BackoffFn = dyn Fn(&RequestContext) -> Duration + Send + Sync;

/// Delay to wait before the next attempt.
///
/// The function receives the context of the failed attempt; its retry count
/// is the number of resends already made.
#[derive(Clone)]
pub struct Backoff(Arc<BackoffFn>);

impl Backoff {
    /// Backoff from an arbitrary function.
    pub fn new(delay: impl Fn(&RequestContext) -> Duration + Send + Sync + 'static) -> Self {
        Self(Arc::new(delay))
    }

    /// Exponential backoff with jitter.
    #[must_use]
    pub fn exponential(base: Duration, max: Duration, jitter: Jitter) -> Self {
        Self::new(move |ctx| jitter.apply(exponential_delay(base, max, ctx.retries())))
    }

    /// Delay before resending `ctx`.
    #[must_use]
    pub fn delay(&self, ctx: &RequestContext) -> Duration {
        (self.0)(ctx)
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Backoff(..)")
    }
}

/// Decides whether and when an attempt is resent.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    limit: u32,
    backoff: Backoff,
    inspector: ErrorInspector,
}

impl RetryPolicy {
    /// Policy allowing `limit` resends.
    #[must_use]
    pub fn new(limit: u32, backoff: Backoff, inspector: ErrorInspector) -> Self {
        Self {
            limit,
            backoff,
            inspector,
        }
    }

    /// Returns `true` if an error of `kind` may be resent for `ctx`.
    #[must_use]
    pub fn should_retry(&self, kind: ErrorKind, ctx: &RequestContext) -> bool {
        let retryable = match kind {
            ErrorKind::ExpiredCredentials => ctx
                .credentials()
                .is_some_and(|credentials| credentials.is_refreshable()),
            ErrorKind::NonRetryable => false,
            ErrorKind::Throttling
            | ErrorKind::Checksum
            | ErrorKind::Networking
            | ErrorKind::Server
            | ErrorKind::EndpointDiscovery => true,
        };
        retryable && ctx.retries() < self.limit && ctx.response_target().is_truncatable()
    }
}

/// Layer resending failed attempts according to a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    /// Create a retry layer.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            policy: self.policy.clone(),
        }
    }
}

/// Service resending failed attempts.
#[derive(Debug, Clone)]
pub struct Retry<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Service<RequestContext> for Retry<S>
where
    S: Service<RequestContext, Response = Response, Error = Error> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut ctx: RequestContext) -> Self::Future {
        let inner = self.inner.clone();
        let policy = self.policy.clone();

        Box::pin(async move {
            loop {
                let error = match inner.clone().oneshot(ctx.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(error) => error,
                };

                let kind = policy.inspector.classify(&error, &ctx);
                if !policy.should_retry(kind, &ctx) {
                    if kind != ErrorKind::NonRetryable {
                        info!(%kind, retries = ctx.retries(), error = %error, "not retrying");
                    }
                    return Err(error);
                }

                let delay = policy.backoff.delay(&ctx);
                // Saturating conversion to u64
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                debug!(%kind, attempt = ctx.retries() + 1, delay_ms, error = %error, "retrying");

                #[cfg(feature = "metrics")]
                metrics::counter!("rigging_retries_total", "kind" => kind.to_string()).increment(1);

                tokio::time::sleep(delay).await;
                ctx.increment_retries();

                if kind == ErrorKind::ExpiredCredentials
                    && let Some(credentials) = ctx.credentials()
                    && let Err(refresh_error) = credentials.refresh().await
                {
                    warn!(error = %refresh_error, "credential refresh failed");
                    return Err(error);
                }
            }
        })
    }
}
