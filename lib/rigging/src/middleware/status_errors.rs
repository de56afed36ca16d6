//! Translation of non-2xx responses into service errors.
//!
//! The error code is read from the `x-amzn-errortype` header, then from the
//! `__type` or `code` member of a JSON body. When none is present the code is
//! derived from the status, e.g. `Http503Error`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tower::{Layer, Service};

use crate::{Error, RequestContext, Response, Result};

const ERROR_TYPE_HEADER: &str = "x-amzn-errortype";

/// Layer turning error responses into [`Error::Service`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusErrorLayer;

impl StatusErrorLayer {
    /// Create a new status error layer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for StatusErrorLayer {
    type Service = StatusErrors<S>;

    fn layer(&self, inner: S) -> Self::Service {
        StatusErrors { inner }
    }
}

/// Service turning error responses into [`Error::Service`].
#[derive(Debug, Clone)]
pub struct StatusErrors<S> {
    inner: S,
}

impl<S> Service<RequestContext> for StatusErrors<S>
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
        let future = self.inner.call(ctx);
        Box::pin(async move {
            let response = future.await?;
            if response.is_success() {
                Ok(response)
            } else {
                Err(service_error(response))
            }
        })
    }
}

/// Build the service error of a non-2xx response.
#[must_use]
pub fn service_error(response: Response) -> Error {
    let status = response.status();
    let header_code = response
        .header(ERROR_TYPE_HEADER)
        .map(|value| value.split(':').next().unwrap_or(value).trim().to_string());
    let (_, _, body) = response.into_parts();

    let parsed = serde_json::from_slice::<serde_json::Value>(&body).ok();
    let member = |names: &[&str]| {
        parsed.as_ref().and_then(|json| {
            names
                .iter()
                .find_map(|name| json.get(*name).and_then(serde_json::Value::as_str))
                .map(str::to_string)
        })
    };

    let code = header_code
        .filter(|code| !code.is_empty())
        .or_else(|| member(&["__type", "code", "Code"]).map(|code| strip_namespace(&code)))
        .unwrap_or_else(|| format!("Http{status}Error"));
    let message = member(&["message", "Message"]).unwrap_or_else(|| fallback_message(&body));

    Error::service_with_body(status, code, message, body)
}

/// `com.amazonaws.dynamodb.v20120810#ResourceNotFoundException` -> `ResourceNotFoundException`
fn strip_namespace(code: &str) -> String {
    code.rsplit('#').next().unwrap_or(code).to_string()
}

fn fallback_message(body: &Bytes) -> String {
    String::from_utf8_lossy(body).trim().to_string()
}
