//! Prelude module for convenient imports.
//!
//! ```ignore
//! use rigging::prelude::*;
//! ```

pub use crate::{
    ClientConfig, CredentialProvider, DiscoveryMode, Error, Handler, HandlerOptions, Method,
    Operation, Pipeline, Request, RequestBuilder, RequestContext, RequestExecutor, Response,
    ResponseTarget, Result, Step,
};
pub use std::sync::Arc;
pub use tower::ServiceExt;
