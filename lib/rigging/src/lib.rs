//! Protocol-agnostic RPC client execution engine.
//!
//! Requests travel a chain of handlers built from a [`Pipeline`]: each handler
//! belongs to a lifecycle [`Step`] and may rewrite the request, short-circuit,
//! or delegate to the next handler, down to a terminal send handler.
//!
//! The engine provides:
//! - [`Pipeline`] - handler registration and deterministic ordering
//! - [`ConnectionPool`] - reusable HTTP sessions per endpoint, with idle eviction
//! - [`RetryLayer`] - error classification, backoff and jitter
//! - [`EndpointCache`] - LRU cache of discovered endpoints, with background polling
//! - [`RequestExecutor`] - per-operation chains assembled with sensible defaults
//!
//! # Example
//!
//! ```ignore
//! use rigging::prelude::*;
//!
//! let executor = RequestExecutor::builder()
//!     .retry_limit(5)
//!     .handler(
//!         Handler::around("user-agent", |mut ctx, next| async move {
//!             ctx.http_request_mut()
//!                 .headers_mut()
//!                 .insert("User-Agent".into(), "rigging/0.1".into());
//!             next.oneshot(ctx).await
//!         }),
//!         HandlerOptions::new(Step::Build),
//!     )
//!     .build()?;
//!
//! let request = Request::builder(Method::POST, "https://dynamodb.us-east-1.amazonaws.com/".parse()?)
//!     .header("X-Amz-Target", "DynamoDB_20120810.ListTables")
//!     .body("{}")
//!     .build();
//! let ctx = RequestContext::new(Arc::new(Operation::new("ListTables")), request);
//! let response = executor.call(ctx).await?;
//! ```

use std::future::Future;
use std::pin::Pin;

mod config;
mod connector;
mod endpoint_cache;
mod executor;
pub mod middleware;
mod pipeline;
mod pool;
pub mod prelude;
mod retry;

pub use config::{
    ClientConfig, ClientConfigBuilder, EndpointCacheOptions, PoolOptions, RetryOptions,
};
pub use connector::{HttpConnect, HttpSession, tls_config};
pub use endpoint_cache::{CachedEndpoint, DiscoveredEndpoint, Discover, EndpointCache};
pub use executor::{RequestExecutor, RequestExecutorBuilder};
pub use pipeline::{
    BoxedService, Chain, DEFAULT_PRIORITY, Handler, HandlerOptions, Pipeline, PipelineEntry, Step,
};
pub use pool::{Connect, ConnectionPool, Endpoint, Session};
pub use retry::{
    Backoff, ErrorInspector, ErrorKind, Jitter, Retry, RetryLayer, RetryPolicy, exponential_delay,
};

/// Future returned by a [`Chain`].
pub type ServiceFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send + 'static>>;

// Re-export tower for handler composition
pub use tower;

// Re-export core types
pub use rigging_core::{
    BodySink, BoxFuture, CredentialProvider, DiscoveryMode, Error, Method, Operation, Request,
    RequestBuilder, RequestContext, Response, ResponseTarget, Result, StaticCredentials,
    StatusCode,
};
