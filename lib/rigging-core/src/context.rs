//! Per-request state carried through the handler chain.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{CredentialProvider, Request, ResponseTarget};

/// Whether an operation needs a discovered endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryMode {
    /// The operation always uses the configured endpoint.
    #[default]
    None,
    /// A discovered endpoint is used when endpoint discovery is enabled.
    Optional,
    /// The operation fails when no endpoint can be discovered.
    Required,
}

/// Static description of an API operation, as far as the engine needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    name: String,
    discovery: DiscoveryMode,
    discovery_identifiers: Vec<String>,
    endpoint_operation: bool,
}

impl Operation {
    /// Create an operation that does not take part in endpoint discovery.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            discovery: DiscoveryMode::None,
            discovery_identifiers: Vec::new(),
            endpoint_operation: false,
        }
    }

    /// Set the discovery mode.
    #[must_use]
    pub fn with_discovery(mut self, discovery: DiscoveryMode) -> Self {
        self.discovery = discovery;
        self
    }

    /// Declare the input parameters whose values identify the discovered endpoint.
    #[must_use]
    pub fn with_discovery_identifiers<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.discovery_identifiers = identifiers.into_iter().map(Into::into).collect();
        self
    }

    /// Mark this operation as the one that answers discovery requests.
    #[must_use]
    pub fn as_endpoint_operation(mut self) -> Self {
        self.endpoint_operation = true;
        self
    }

    /// Operation name, e.g. `GetItem`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Discovery mode.
    #[must_use]
    pub const fn discovery(&self) -> DiscoveryMode {
        self.discovery
    }

    /// Input parameters flagged as discovery identifiers.
    #[must_use]
    pub fn discovery_identifiers(&self) -> &[String] {
        &self.discovery_identifiers
    }

    /// Returns `true` for the discovery operation itself.
    #[must_use]
    pub const fn is_endpoint_operation(&self) -> bool {
        self.endpoint_operation
    }
}

/// Everything a handler may read or rewrite while a request travels the chain.
#[derive(Debug, Clone)]
pub struct RequestContext {
    operation: Arc<Operation>,
    params: serde_json::Value,
    http_request: Request,
    credentials: Option<Arc<dyn CredentialProvider>>,
    response_target: ResponseTarget,
    metadata: HashMap<String, String>,
    retries: u32,
}

impl RequestContext {
    /// Create a context for one call of `operation`.
    #[must_use]
    pub fn new(operation: Arc<Operation>, http_request: Request) -> Self {
        Self {
            operation,
            params: serde_json::Value::Null,
            http_request,
            credentials: None,
            response_target: ResponseTarget::Buffer,
            metadata: HashMap::new(),
            retries: 0,
        }
    }

    /// Attach the operation input parameters.
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Attach credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Choose where the response body is written.
    #[must_use]
    pub fn with_response_target(mut self, target: ResponseTarget) -> Self {
        self.response_target = target;
        self
    }

    /// Operation being called.
    #[must_use]
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Operation name.
    #[must_use]
    pub fn operation_name(&self) -> &str {
        self.operation.name()
    }

    /// Operation input parameters.
    #[must_use]
    pub const fn params(&self) -> &serde_json::Value {
        &self.params
    }

    /// Input parameter rendered as a string, if present.
    ///
    /// String values are returned without quotes; other JSON values use their
    /// compact JSON form.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<String> {
        match self.params.get(name)? {
            serde_json::Value::Null => None,
            serde_json::Value::String(value) => Some(value.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Outbound HTTP request.
    #[must_use]
    pub const fn http_request(&self) -> &Request {
        &self.http_request
    }

    /// Mutable access to the outbound HTTP request.
    #[must_use]
    pub fn http_request_mut(&mut self) -> &mut Request {
        &mut self.http_request
    }

    /// Credentials, if any.
    #[must_use]
    pub fn credentials(&self) -> Option<&Arc<dyn CredentialProvider>> {
        self.credentials.as_ref()
    }

    /// Response body target.
    #[must_use]
    pub const fn response_target(&self) -> &ResponseTarget {
        &self.response_target
    }

    /// Free-form metadata shared between handlers.
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Mutable access to metadata.
    #[must_use]
    pub fn metadata_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.metadata
    }

    /// Number of times this request has been resent.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    /// Record one more resend.
    pub fn increment_retries(&mut self) {
        self.retries = self.retries.saturating_add(1);
    }
}
