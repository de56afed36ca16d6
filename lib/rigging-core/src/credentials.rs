//! Credentials as an opaque, optionally refreshable capability.
//!
//! How credentials are acquired is outside this crate; the engine only needs a
//! stable identity (used to key discovered endpoints) and a way to refresh
//! expired credentials before a request is resent.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::Result;

/// Boxed `Send` future, used where a trait must stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A source of request-signing credentials.
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    /// Stable identifier of the current credentials (an access key id, for instance).
    fn identity(&self) -> String;

    /// Returns `true` if [`refresh`](Self::refresh) can obtain new credentials.
    fn is_refreshable(&self) -> bool {
        false
    }

    /// Replace the current credentials with fresh ones.
    fn refresh(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Fixed credentials that never refresh.
#[derive(Clone)]
pub struct StaticCredentials {
    access_key_id: String,
    secret_access_key: String,
}

impl StaticCredentials {
    /// Create static credentials.
    #[must_use]
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    /// The secret half of the key pair.
    #[must_use]
    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl CredentialProvider for StaticCredentials {
    fn identity(&self) -> String {
        self.access_key_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_credentials_identity() {
        let credentials = StaticCredentials::new("AKID", "SECRET");
        assert_eq!(credentials.identity(), "AKID");
        assert!(!credentials.is_refreshable());
    }

    #[test]
    fn debug_hides_secret() {
        let credentials = StaticCredentials::new("AKID", "SECRET");
        let debug = format!("{credentials:?}");
        assert!(debug.contains("AKID"));
        assert!(!debug.contains("SECRET"));
    }
}
