//! Request logging handler.
//!
//! Wraps each call in an `rpc_request` span and logs its outcome using the
//! `tracing` crate.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{Instrument, Level, debug, info, span, warn};

use crate::{Error, RequestContext, Response, Result};

/// Layer that adds request logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingLayer {
    level: LogLevel,
}

/// Log level for the logging handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Log at debug level (request details).
    Debug,
    /// Log at info level (summary only).
    #[default]
    Info,
}

impl LoggingLayer {
    /// Create a new logging layer with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a logging layer that logs request details at debug level.
    #[must_use]
    pub fn debug() -> Self {
        Self {
            level: LogLevel::Debug,
        }
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = Logging<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Logging {
            inner,
            level: self.level,
        }
    }
}

/// Service that logs requests.
#[derive(Debug, Clone)]
pub struct Logging<S> {
    inner: S,
    level: LogLevel,
}

impl<S> Service<RequestContext> for Logging<S>
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

    fn call(&mut self, ctx: RequestContext) -> Self::Future {
        let operation = ctx.operation_name().to_string();
        let method = ctx.http_request().method().clone();
        let url = ctx.http_request().url().to_string();
        let level = self.level;

        let span = span!(Level::INFO, "rpc_request", %operation, %url);

        let mut inner = self.inner.clone();
        Box::pin(
            async move {
                let start = Instant::now();

                match level {
                    LogLevel::Debug => {
                        debug!(
                            method = %method,
                            headers = ?ctx.http_request().headers(),
                            "sending request"
                        );
                    }
                    LogLevel::Info => {
                        info!(method = %method, "sending request");
                    }
                }

                let result = inner.call(ctx).await;
                let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

                match &result {
                    Ok(response) => {
                        info!(status = response.status(), elapsed_ms, "request completed");
                    }
                    Err(err) => {
                        warn!(error = %err, elapsed_ms, "request failed");
                    }
                }

                result
            }
            .instrument(span),
        )
    }
}
