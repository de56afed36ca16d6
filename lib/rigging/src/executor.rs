//! Request executor: builds per-operation chains and runs them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tower::Layer;
use tower_service::Service;
use tracing::debug;
use url::Url;

use crate::config::{ClientConfig, ClientConfigBuilder};
use crate::endpoint_cache::{Discover, EndpointCache};
use crate::middleware::{EndpointDiscoveryLayer, LoggingLayer, SendHandler, StatusErrorLayer};
use crate::pipeline::{BoxedService, Chain, Handler, HandlerOptions, Pipeline, Step};
use crate::pool::ConnectionPool;
use crate::retry::{Backoff, ErrorInspector, Jitter, RetryLayer, RetryPolicy};
use crate::{Error, RequestContext, Response, Result};

/// Runs operations through a handler pipeline.
///
/// # Example
///
/// ```ignore
/// use rigging::{Method, Operation, Request, RequestContext, RequestExecutor};
/// use std::sync::Arc;
///
/// let executor = RequestExecutor::builder().retry_limit(2).build()?;
///
/// let request = Request::builder(Method::POST, url).json(&input)?.build();
/// let ctx = RequestContext::new(Arc::new(Operation::new("ListTables")), request);
/// let response = executor.call(ctx).await?;
/// ```
pub struct RequestExecutor {
    pipeline: Pipeline,
    config: ClientConfig,
    endpoint_cache: Arc<EndpointCache>,
    pool: Arc<ConnectionPool>,
}

impl fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("pipeline", &self.pipeline)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RequestExecutor {
    /// Create a new executor builder.
    #[must_use]
    pub fn builder() -> RequestExecutorBuilder {
        RequestExecutorBuilder::default()
    }

    /// Handler registry; handlers added here apply to chains built afterwards.
    #[must_use]
    pub const fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Cache of discovered endpoints.
    #[must_use]
    pub const fn endpoint_cache(&self) -> &Arc<EndpointCache> {
        &self.endpoint_cache
    }

    /// Pool used by the default send handler.
    #[must_use]
    pub const fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Materialize the chain of handlers applying to `operation`.
    pub fn build_chain(&self, operation: &str) -> Result<Chain> {
        let chain = self.pipeline.for_operation(operation).to_chain()?;
        debug!(operation, handlers = ?chain.handler_names().collect::<Vec<_>>(), "built chain");
        Ok(chain)
    }

    /// Run `ctx` through `chain`. Errors are returned as the handlers left them.
    pub async fn execute(&self, chain: &Chain, ctx: RequestContext) -> Result<Response> {
        chain.call(ctx).await
    }

    /// Build the chain of the context's operation and run it.
    pub async fn call(&self, ctx: RequestContext) -> Result<Response> {
        let chain = self.build_chain(ctx.operation_name())?;
        self.execute(&chain, ctx).await
    }

    /// Stop background endpoint polling.
    pub fn shutdown(&self) {
        self.endpoint_cache.stop_polling();
    }
}

impl Drop for RequestExecutor {
    fn drop(&mut self) {
        self.endpoint_cache.stop_polling();
    }
}

/// Builder for [`RequestExecutor`].
///
/// The default pipeline holds, outermost first:
///
/// - logging (initialize)
/// - endpoint discovery (build, priority 10), when a discoverer is set
/// - retries (sign, priority 99)
/// - status to error translation (sign, priority 50)
/// - the pooled HTTP send handler
///
/// Handlers added with [`handler`](Self::handler) or [`layer`](Self::layer)
/// are registered after the defaults.
#[derive(Default)]
pub struct RequestExecutorBuilder {
    config: ClientConfigBuilder,
    parent: Option<Pipeline>,
    handlers: Vec<(Handler, HandlerOptions)>,
    discover: Option<Arc<dyn Discover>>,
    send_handler: Option<Handler>,
    pool: Option<Arc<ConnectionPool>>,
    without_defaults: bool,
}

impl fmt::Debug for RequestExecutorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestExecutorBuilder")
            .field("config", &self.config)
            .field("handlers_count", &self.handlers.len())
            .field("discovery", &self.discover.is_some())
            .field("without_defaults", &self.without_defaults)
            .finish_non_exhaustive()
    }
}

impl RequestExecutorBuilder {
    // ========================================================================
    // Configuration
    // ========================================================================

    /// Replace the whole configuration builder.
    #[must_use]
    pub fn config(mut self, config: ClientConfigBuilder) -> Self {
        self.config = config;
        self
    }

    /// Route every request through a proxy.
    #[must_use]
    pub fn http_proxy(mut self, proxy: Url) -> Self {
        self.config = self.config.http_proxy(proxy);
        self
    }

    /// Set the connection open timeout.
    #[must_use]
    pub fn http_open_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.http_open_timeout(timeout);
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn http_read_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.http_read_timeout(timeout);
        self
    }

    /// Set the idle timeout of pooled sessions.
    #[must_use]
    pub fn http_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.http_idle_timeout(timeout);
        self
    }

    /// Set the maximum number of resends.
    #[must_use]
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.config = self.config.retry_limit(limit);
        self
    }

    /// Set the base retry delay.
    #[must_use]
    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.config = self.config.retry_base_delay(delay);
        self
    }

    /// Cap each retry delay; zero leaves it unbounded.
    #[must_use]
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.config = self.config.retry_max_delay(delay);
        self
    }

    /// Set the retry jitter.
    #[must_use]
    pub fn retry_jitter(mut self, jitter: Jitter) -> Self {
        self.config = self.config.retry_jitter(jitter);
        self
    }

    /// Replace the retry delay function.
    #[must_use]
    pub fn retry_backoff(mut self, backoff: Backoff) -> Self {
        self.config = self.config.retry_backoff(backoff);
        self
    }

    /// Enable endpoint discovery.
    #[must_use]
    pub fn endpoint_discovery(mut self, enabled: bool) -> Self {
        self.config = self.config.endpoint_discovery(enabled);
        self
    }

    /// Refresh missing endpoints in the background.
    #[must_use]
    pub fn active_endpoint_cache(mut self, active: bool) -> Self {
        self.config = self.config.active_endpoint_cache(active);
        self
    }

    // ========================================================================
    // Pipeline
    // ========================================================================

    /// Start from a copy of `parent` instead of an empty pipeline.
    ///
    /// Later changes to `parent` do not affect the executor.
    #[must_use]
    pub fn pipeline(mut self, parent: &Pipeline) -> Self {
        self.parent = Some(parent.derive());
        self
    }

    /// Register a handler.
    #[must_use]
    pub fn handler(mut self, handler: Handler, options: HandlerOptions) -> Self {
        self.handlers.push((handler, options));
        self
    }

    /// Register a tower layer as a handler.
    #[must_use]
    pub fn layer<L>(self, name: &str, layer: L, options: HandlerOptions) -> Self
    where
        L: Layer<BoxedService> + Send + Sync + 'static,
        L::Service: Service<RequestContext, Response = Response, Error = Error>
            + Clone
            + Send
            + 'static,
        <L::Service as Service<RequestContext>>::Future: Send,
    {
        self.handler(Handler::layer(name, layer), options)
    }

    /// Source of discovered endpoints; enables the endpoint discovery handler.
    #[must_use]
    pub fn discover(mut self, discover: impl Discover + 'static) -> Self {
        self.discover = Some(Arc::new(discover));
        self
    }

    /// Replace the default HTTP send handler.
    #[must_use]
    pub fn send_handler(mut self, handler: Handler) -> Self {
        self.send_handler = Some(handler);
        self
    }

    /// Use `pool` instead of the shared pool of the configured options.
    #[must_use]
    pub fn pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Register no default handler, including the send handler.
    #[must_use]
    pub fn without_defaults(mut self) -> Self {
        self.without_defaults = true;
        self
    }

    /// Build the executor.
    pub fn build(self) -> Result<RequestExecutor> {
        let config = self.config.build();
        let pool = match self.pool {
            Some(pool) => pool,
            None => ConnectionPool::for_options(&config.pool)?,
        };
        let endpoint_cache = Arc::new(EndpointCache::new(config.endpoint_cache.clone()));
        let pipeline = self.parent.unwrap_or_default();

        if !self.without_defaults {
            pipeline.add(
                Handler::layer("logging", LoggingLayer::new()),
                HandlerOptions::new(Step::Initialize),
            )?;

            if let Some(discover) = self.discover {
                pipeline.add(
                    Handler::layer(
                        "endpoint_discovery",
                        EndpointDiscoveryLayer::new(
                            Arc::clone(&endpoint_cache),
                            discover,
                            config.endpoint_discovery,
                        ),
                    ),
                    HandlerOptions::new(Step::Build).priority(10),
                )?;
            }

            let policy = RetryPolicy::new(
                config.retry.retry_limit,
                config.retry.retry_backoff.clone(),
                ErrorInspector::with_endpoint_cache(Arc::clone(&endpoint_cache)),
            );
            pipeline.add(
                Handler::layer("retry", RetryLayer::new(policy)),
                HandlerOptions::new(Step::Sign).priority(99),
            )?;
            pipeline.add(
                Handler::layer("status_errors", StatusErrorLayer::new()),
                HandlerOptions::new(Step::Sign),
            )?;
        }

        match self.send_handler {
            Some(handler) => {
                pipeline.add(handler, HandlerOptions::new(Step::Send))?;
            }
            None if !self.without_defaults => {
                pipeline.add(
                    Handler::send("http", SendHandler::new(Arc::clone(&pool))),
                    HandlerOptions::new(Step::Send),
                )?;
            }
            None => {}
        }

        for (handler, options) in self.handlers {
            pipeline.add(handler, options)?;
        }

        Ok(RequestExecutor {
            pipeline,
            config,
            endpoint_cache,
            pool,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use bytes::Bytes;
    use tower::ServiceExt;

    use super::*;
    use crate::endpoint_cache::DiscoveredEndpoint;
    use crate::{Method, Operation, Request};

    fn context(operation: &str) -> RequestContext {
        let url = Url::parse("https://service.example.com/").expect("url");
        RequestContext::new(
            Arc::new(Operation::new(operation)),
            Request::builder(Method::POST, url).build(),
        )
    }

    fn responding(status: u16, calls: &Arc<AtomicU32>) -> Handler {
        let calls = Arc::clone(calls);
        Handler::send(
            "mock",
            tower::service_fn(move |_ctx: RequestContext| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, Error>(Response::new(status, HashMap::new(), Bytes::new())) }
            }),
        )
    }

    #[test]
    fn default_pipeline() {
        let executor = RequestExecutor::builder().build().expect("executor");

        let chain = executor.build_chain("ListTables").expect("chain");
        let names: Vec<_> = chain.handler_names().collect();
        assert_eq!(names, ["logging", "retry", "status_errors", "http"]);
    }

    #[test]
    fn discovery_handler_registered_with_discoverer() {
        let executor = RequestExecutor::builder()
            .discover(|_ctx: RequestContext| async { Ok::<_, Error>(Vec::<DiscoveredEndpoint>::new()) })
            .build()
            .expect("executor");

        let chain = executor.build_chain("GetItem").expect("chain");
        let names: Vec<_> = chain.handler_names().collect();
        assert_eq!(names, ["logging", "endpoint_discovery", "retry", "status_errors", "http"]);
    }

    #[test]
    fn without_defaults_requires_send_handler() {
        let executor = RequestExecutor::builder()
            .without_defaults()
            .build()
            .expect("executor");

        let err = executor.build_chain("ListTables").expect_err("no send handler");
        assert!(matches!(err, Error::MissingSendHandler));
    }

    #[test]
    fn handlers_scoped_to_operations() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RequestExecutor::builder()
            .send_handler(responding(200, &calls))
            .handler(
                Handler::around("audit", |ctx, next| next.oneshot(ctx)),
                HandlerOptions::new(Step::Validate).operations(["DeleteTable"]),
            )
            .build()
            .expect("executor");

        let names = |op: &str| {
            executor
                .build_chain(op)
                .expect("chain")
                .handler_names()
                .map(str::to_string)
                .collect::<Vec<_>>()
        };
        assert!(names("DeleteTable").contains(&"audit".to_string()));
        assert!(!names("ListTables").contains(&"audit".to_string()));
    }

    #[test]
    fn parent_pipeline_is_copied() {
        let parent = Pipeline::new();
        parent
            .add(
                Handler::around("tracing", |ctx, next| next.oneshot(ctx)),
                HandlerOptions::new(Step::Initialize).priority(90),
            )
            .expect("add");

        let executor = RequestExecutor::builder()
            .pipeline(&parent)
            .build()
            .expect("executor");
        parent
            .add(
                Handler::around("late", |ctx, next| next.oneshot(ctx)),
                HandlerOptions::new(Step::Initialize),
            )
            .expect("add");

        let chain = executor.build_chain("ListTables").expect("chain");
        let names: Vec<_> = chain.handler_names().collect();
        assert_eq!(names.first(), Some(&"tracing"));
        assert!(!names.contains(&"late"));
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RequestExecutor::builder()
            .retry_limit(2)
            .send_handler(responding(503, &calls))
            .build()
            .expect("executor");

        let err = executor.call(context("ListTables")).await.expect_err("unavailable");
        assert_eq!(err.code(), Some("Http503Error"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn short_circuit_skips_send() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RequestExecutor::builder()
            .send_handler(responding(200, &calls))
            .handler(
                Handler::around("stub", |_ctx, _next| async {
                    Ok::<_, Error>(Response::new(204, HashMap::new(), Bytes::new()))
                }),
                HandlerOptions::new(Step::Validate),
            )
            .build()
            .expect("executor");

        let chain = executor.build_chain("ListTables").expect("chain");
        let response = executor.execute(&chain, context("ListTables")).await.expect("stubbed");
        assert_eq!(response.status(), 204);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
