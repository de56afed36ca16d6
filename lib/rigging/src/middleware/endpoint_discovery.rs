//! Endpoint discovery handler.
//!
//! Redirects calls of discovery-enabled operations to the endpoint cached for
//! their key. Operations that require discovery fail with
//! [`Error::EndpointDiscovery`] when no endpoint can be found. Optional
//! discovery is best-effort: a passive cache refreshes inline and swallows
//! failures, an active cache hands the refresh to a polling task.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service, ServiceExt};
use tracing::{debug, warn};
use url::Url;

use crate::endpoint_cache::{Discover, EndpointCache};
use crate::{DiscoveryMode, Error, RequestContext, Response, Result};

/// Layer redirecting requests to discovered endpoints.
#[derive(Clone)]
pub struct EndpointDiscoveryLayer {
    cache: Arc<EndpointCache>,
    discover: Arc<dyn Discover>,
    enabled: bool,
}

impl EndpointDiscoveryLayer {
    /// Create a discovery layer.
    ///
    /// When `enabled` is `false` only operations requiring discovery are
    /// affected, and they fail.
    #[must_use]
    pub fn new(cache: Arc<EndpointCache>, discover: Arc<dyn Discover>, enabled: bool) -> Self {
        Self {
            cache,
            discover,
            enabled,
        }
    }
}

impl fmt::Debug for EndpointDiscoveryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDiscoveryLayer")
            .field("cache", &self.cache)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for EndpointDiscoveryLayer {
    type Service = EndpointDiscovery<S>;

    fn layer(&self, inner: S) -> Self::Service {
        EndpointDiscovery {
            inner,
            cache: Arc::clone(&self.cache),
            discover: Arc::clone(&self.discover),
            enabled: self.enabled,
        }
    }
}

/// Service redirecting requests to discovered endpoints.
#[derive(Clone)]
pub struct EndpointDiscovery<S> {
    inner: S,
    cache: Arc<EndpointCache>,
    discover: Arc<dyn Discover>,
    enabled: bool,
}

impl<S> Service<RequestContext> for EndpointDiscovery<S>
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
        let cache = Arc::clone(&self.cache);
        let discover = Arc::clone(&self.discover);
        let enabled = self.enabled;

        Box::pin(async move {
            if let Some(address) = resolve(&cache, &discover, enabled, &ctx).await? {
                apply_endpoint(&mut ctx, &address)?;
            }
            inner.oneshot(ctx).await
        })
    }
}

async fn resolve(
    cache: &Arc<EndpointCache>,
    discover: &Arc<dyn Discover>,
    enabled: bool,
    ctx: &RequestContext,
) -> Result<Option<String>> {
    let operation = ctx.operation();
    if operation.is_endpoint_operation() {
        return Ok(None);
    }

    match operation.discovery() {
        DiscoveryMode::None => Ok(None),
        DiscoveryMode::Required => {
            if !enabled {
                return Err(Error::endpoint_discovery(format!(
                    "{} requires endpoint discovery, which is disabled",
                    operation.name()
                )));
            }
            let key = cache.extract_key(ctx);
            if !cache.is_fresh(&key) {
                cache
                    .update(&key, ctx, discover.as_ref())
                    .await
                    .map_err(|error| {
                        Error::endpoint_discovery(format!("discovery failed for {}: {error}", operation.name()))
                    })?;
            }
            cache
                .get(&key)
                .map(|endpoint| Some(endpoint.address().to_string()))
                .ok_or_else(|| {
                    Error::endpoint_discovery(format!("no endpoint discovered for {}", operation.name()))
                })
        }
        DiscoveryMode::Optional if enabled => {
            let key = cache.extract_key(ctx);
            if !cache.is_fresh(&key) {
                if cache.options().active {
                    // Identifier-scoped keys get a new discovery request, restart their poller.
                    if key.contains('_') {
                        cache.stop_polling_key(&key);
                    }
                    cache.start_polling(&key, ctx.clone(), Arc::clone(discover));
                } else if let Err(error) = cache.update(&key, ctx, discover.as_ref()).await {
                    warn!(key = %key, error = %error, "endpoint discovery failed, using default endpoint");
                }
            }
            Ok(cache.get(&key).map(|endpoint| endpoint.address().to_string()))
        }
        DiscoveryMode::Optional => Ok(None),
    }
}

/// Point the request of `ctx` at `address`; addresses without a scheme use https.
fn apply_endpoint(ctx: &mut RequestContext, address: &str) -> Result<()> {
    let endpoint = if address.contains("://") {
        Url::parse(address)
    } else {
        Url::parse(&format!("https://{address}"))
    }
    .map_err(|error| Error::endpoint_discovery(format!("unusable endpoint {address}: {error}")))?;

    debug!(%endpoint, "using discovered endpoint");
    ctx.http_request_mut().set_endpoint(&endpoint)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::config::EndpointCacheOptions;
    use crate::endpoint_cache::DiscoveredEndpoint;
    use crate::{BoxedService, Method, Operation, Request, StaticCredentials};

    fn context(operation: Operation) -> RequestContext {
        let url = Url::parse("https://dynamodb.us-east-1.example.com/").expect("url");
        RequestContext::new(Arc::new(operation), Request::builder(Method::POST, url).build())
            .with_credentials(Arc::new(StaticCredentials::new("AKID", "secret")))
    }

    fn echo_host() -> BoxedService {
        BoxedService::new(tower::service_fn(|ctx: RequestContext| async move {
            let url = ctx.http_request().url().to_string();
            Ok::<_, Error>(Response::new(200, Default::default(), Bytes::from(url)))
        }))
    }

    fn counting(calls: Arc<AtomicUsize>, address: &'static str) -> Arc<dyn Discover> {
        Arc::new(move |_ctx: RequestContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, Error>(vec![DiscoveredEndpoint::new(address, Duration::from_secs(60))]) }
        })
    }

    fn failing() -> Arc<dyn Discover> {
        Arc::new(|_ctx: RequestContext| async { Err::<Vec<DiscoveredEndpoint>, _>(Error::networking("connection refused")) })
    }

    fn cache(active: bool) -> Arc<EndpointCache> {
        Arc::new(EndpointCache::new(EndpointCacheOptions {
            active,
            ..EndpointCacheOptions::default()
        }))
    }

    async fn call(layer: &EndpointDiscoveryLayer, ctx: RequestContext) -> Result<String> {
        let response = layer.layer(echo_host()).oneshot(ctx).await?;
        Ok(String::from_utf8_lossy(response.body()).into_owned())
    }

    #[tokio::test]
    async fn required_discovery_redirects() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = EndpointDiscoveryLayer::new(cache(false), counting(Arc::clone(&calls), "discovered.example.com"), true);
        let op = || Operation::new("GetItem").with_discovery(DiscoveryMode::Required);

        let url = call(&layer, context(op())).await.expect("redirected");
        assert_eq!(url, "https://discovered.example.com/");

        call(&layer, context(op())).await.expect("cached");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn required_discovery_disabled_fails() {
        let layer = EndpointDiscoveryLayer::new(cache(false), counting(Arc::default(), "x.example.com"), false);
        let ctx = context(Operation::new("GetItem").with_discovery(DiscoveryMode::Required));

        let err = call(&layer, ctx).await.expect_err("disabled");
        assert!(matches!(err, Error::EndpointDiscovery(_)));
    }

    #[tokio::test]
    async fn required_discovery_failure_is_hard() {
        let layer = EndpointDiscoveryLayer::new(cache(false), failing(), true);
        let ctx = context(Operation::new("GetItem").with_discovery(DiscoveryMode::Required));

        let err = call(&layer, ctx).await.expect_err("discovery failed");
        assert!(matches!(err, Error::EndpointDiscovery(_)));
    }

    #[tokio::test]
    async fn optional_discovery_failure_is_soft() {
        let layer = EndpointDiscoveryLayer::new(cache(false), failing(), true);
        let ctx = context(Operation::new("GetItem").with_discovery(DiscoveryMode::Optional));

        let url = call(&layer, ctx).await.expect("falls back");
        assert_eq!(url, "https://dynamodb.us-east-1.example.com/");
    }

    #[tokio::test]
    async fn optional_discovery_keeps_scheme_and_port() {
        let layer = EndpointDiscoveryLayer::new(cache(false), counting(Arc::default(), "http://local.example.com:8000"), true);
        let ctx = context(Operation::new("Query").with_discovery(DiscoveryMode::Optional));

        let url = call(&layer, ctx).await.expect("redirected");
        assert_eq!(url, "http://local.example.com:8000/");
    }

    #[tokio::test]
    async fn optional_discovery_disabled_is_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = EndpointDiscoveryLayer::new(cache(false), counting(Arc::clone(&calls), "x.example.com"), false);
        let ctx = context(Operation::new("Query").with_discovery(DiscoveryMode::Optional));

        let url = call(&layer, ctx).await.expect("default endpoint");
        assert_eq!(url, "https://dynamodb.us-east-1.example.com/");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn endpoint_operation_is_never_redirected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = EndpointDiscoveryLayer::new(cache(false), counting(Arc::clone(&calls), "x.example.com"), true);
        let ctx = context(
            Operation::new("DescribeEndpoints")
                .with_discovery(DiscoveryMode::Required)
                .as_endpoint_operation(),
        );

        let url = call(&layer, ctx).await.expect("not redirected");
        assert_eq!(url, "https://dynamodb.us-east-1.example.com/");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn active_cache_starts_polling() {
        let cache = cache(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let layer = EndpointDiscoveryLayer::new(Arc::clone(&cache), counting(Arc::clone(&calls), "polled.example.com"), true);
        let ctx = context(Operation::new("Query").with_discovery(DiscoveryMode::Optional));
        let key = cache.extract_key(&ctx);

        let url = call(&layer, ctx.clone()).await.expect("default endpoint");
        assert_eq!(url, "https://dynamodb.us-east-1.example.com/");

        for _ in 0..50 {
            if cache.is_fresh(&key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.is_fresh(&key));

        let url = call(&layer, ctx).await.expect("redirected");
        assert_eq!(url, "https://polled.example.com/");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        cache.stop_polling();
    }
}
