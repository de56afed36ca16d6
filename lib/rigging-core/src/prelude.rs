//! Prelude module for convenient imports.
//!
//! ```ignore
//! use rigging_core::prelude::*;
//! ```

pub use crate::{
    CredentialProvider, DiscoveryMode, Error, Method, Operation, Request, RequestBuilder,
    RequestContext, Response, ResponseTarget, Result,
};
