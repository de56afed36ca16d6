//! Outbound HTTP request.
//!
//! Use [`Request::builder`] to construct requests with headers, query parameters, and a body.
//!
//! # Example
//!
//! ```
//! use rigging_core::{Method, Request};
//!
//! let request = Request::builder(Method::POST, "https://dynamodb.example.com".parse().unwrap())
//!     .header("Content-Type", "application/x-amz-json-1.0")
//!     .header("X-Amz-Target", "DynamoDB_20120810.ListTables")
//!     .body("{}")
//!     .build();
//! ```

use std::collections::HashMap;

use bytes::Bytes;
use http::Method;
use url::Url;

use crate::{Error, Result};

/// An HTTP request with method, URL, headers, and optional body.
///
/// The body is held as [`Bytes`], so resending the request after a failed
/// attempt always starts from the first byte.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HashMap<String, String>,
    body: Option<Bytes>,
}

impl Request {
    /// Creates a new [`RequestBuilder`].
    #[must_use]
    pub fn builder(method: Method, url: Url) -> RequestBuilder {
        RequestBuilder::new(method, url)
    }

    /// HTTP method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// Request URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Mutable access to the URL.
    #[must_use]
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Request headers.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Mutable access to headers.
    #[must_use]
    pub fn headers_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.headers
    }

    /// Single header value by name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Request body.
    #[must_use]
    pub const fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Body length in bytes, zero when there is no body.
    #[must_use]
    pub fn content_length(&self) -> usize {
        self.body.as_ref().map_or(0, Bytes::len)
    }

    /// Redirect the request to another endpoint.
    ///
    /// Scheme, host and port are taken from `endpoint`; path and query of the
    /// request are kept.
    pub fn set_endpoint(&mut self, endpoint: &Url) -> Result<()> {
        let host = endpoint
            .host_str()
            .ok_or_else(|| Error::invalid_request(format!("endpoint {endpoint} has no host")))?;

        self.url
            .set_scheme(endpoint.scheme())
            .map_err(|()| Error::invalid_request(format!("cannot use scheme of {endpoint}")))?;
        self.url.set_host(Some(host))?;
        self.url
            .set_port(endpoint.port())
            .map_err(|()| Error::invalid_request(format!("cannot use port of {endpoint}")))?;
        Ok(())
    }

    /// Consume into (method, url, headers, body).
    #[must_use]
    pub fn into_parts(self) -> (Method, Url, HashMap<String, String>, Option<Bytes>) {
        (self.method, self.url, self.headers, self.body)
    }
}

/// Builder for constructing [`Request`] instances.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    url: Url,
    headers: HashMap<String, String>,
    body: Option<Bytes>,
}

impl RequestBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Sets a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Appends a query parameter to the URL.
    #[must_use]
    pub fn query(mut self, name: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(name, value);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set a JSON body.
    pub fn json<T: serde::Serialize>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }

    /// Builds the [`Request`].
    #[must_use]
    pub fn build(self) -> Request {
        Request {
            method: self.method,
            url: self.url,
            headers: self.headers,
            body: self.body,
        }
    }
}
