//! Terminal transport handler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::Service;

use crate::{ConnectionPool, Error, RequestContext, Response, Result};

/// Sends the request of the context over a pooled session.
///
/// Registered at the send step; it has no next handler.
#[derive(Debug, Clone)]
pub struct SendHandler {
    pool: Arc<ConnectionPool>,
}

impl SendHandler {
    /// Create a send handler using `pool`.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Pool sessions are taken from.
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

impl Service<RequestContext> for SendHandler {
    type Response = Response;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: RequestContext) -> Self::Future {
        let pool = Arc::clone(&self.pool);
        let request = ctx.http_request().clone();
        let target = ctx.response_target().clone();

        Box::pin(async move {
            let url = request.url().clone();
            pool.session_for(&url, move |session| {
                Box::pin(async move { session.send(request, &target).await })
            })
            .await
        })
    }
}
