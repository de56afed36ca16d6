//! Handlers registered by the default pipeline.
//!
//! Each handler is a tower [`Layer`](tower::Layer) over the pipeline's boxed
//! service, except [`SendHandler`] which terminates the chain.
//!
//! | Handler | Step | Priority |
//! |---------|------|----------|
//! | [`LoggingLayer`] | initialize | 50 |
//! | [`EndpointDiscoveryLayer`] | build | 10 |
//! | [`RetryLayer`](crate::RetryLayer) | sign | 99 |
//! | [`StatusErrorLayer`] | sign | 50 |
//! | [`SendHandler`] | send | - |

mod endpoint_discovery;
mod logging;
mod send;
mod status_errors;

pub use endpoint_discovery::{EndpointDiscovery, EndpointDiscoveryLayer};
pub use logging::{LogLevel, Logging, LoggingLayer};
pub use send::SendHandler;
pub use status_errors::{StatusErrorLayer, StatusErrors, service_error};
