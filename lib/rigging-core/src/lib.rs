//! Core types for the rigging RPC client execution engine.
//!
//! This crate provides the leaf types every handler works with:
//! - [`Request`] and [`RequestBuilder`] - outbound HTTP request
//! - [`Response`] and [`ResponseTarget`] - inbound HTTP response and where its body goes
//! - [`RequestContext`] - per-request state travelling the handler chain
//! - [`Operation`] and [`DiscoveryMode`] - operation metadata used by the engine
//! - [`CredentialProvider`] - credentials as an opaque refreshable capability
//! - [`Error`] and [`Result`] - error handling

mod context;
mod credentials;
mod error;
pub mod prelude;
mod request;
mod response;

pub use context::{DiscoveryMode, Operation, RequestContext};
pub use credentials::{BoxFuture, CredentialProvider, StaticCredentials};
pub use error::{Error, Result};
pub use request::{Request, RequestBuilder};
pub use response::{BodySink, Response, ResponseTarget};

// Re-export http crate types for methods and status codes
pub use http::{Method, StatusCode};
