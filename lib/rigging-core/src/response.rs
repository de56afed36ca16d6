//! Inbound HTTP response and the target its body is written to.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// HTTP response with status, headers, and body.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: HashMap<String, String>,
    body: Bytes,
}

impl Response {
    /// Creates a new response.
    #[must_use]
    pub fn new(status: u16, headers: HashMap<String, String>, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// HTTP status code.
    #[must_use]
    pub const fn status(&self) -> u16 {
        self.status
    }

    /// Response headers.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Single header value by name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Response body. Empty when the body was streamed to a [`ResponseTarget::Sink`].
    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume into (status, headers, body).
    #[must_use]
    pub fn into_parts(self) -> (u16, HashMap<String, String>, Bytes) {
        (self.status, self.headers, self.body)
    }

    /// Status is 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Deserialize the response body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Get the response body as text.
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.to_vec())
    }
}

/// Callback receiving response body chunks as they arrive.
pub type BodySink = Arc<dyn Fn(&Bytes) + Send + Sync>;

/// Where the transport writes the response body.
#[derive(Clone, Default)]
pub enum ResponseTarget {
    /// Buffer the whole body in memory.
    #[default]
    Buffer,
    /// Hand every chunk to a caller-supplied callback.
    ///
    /// Chunks already delivered cannot be taken back, so a request using a
    /// sink is never resent.
    Sink(BodySink),
}

impl ResponseTarget {
    /// Create a sink target from a callback.
    pub fn sink(callback: impl Fn(&Bytes) + Send + Sync + 'static) -> Self {
        Self::Sink(Arc::new(callback))
    }

    /// Returns `true` if a partially received body can be discarded and
    /// received again.
    #[must_use]
    pub const fn is_truncatable(&self) -> bool {
        matches!(self, Self::Buffer)
    }
}

impl fmt::Debug for ResponseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer => f.write_str("Buffer"),
            Self::Sink(_) => f.write_str("Sink(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn response_basic() {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        let response = Response::new(200, headers, Bytes::from(r#"{"id":1}"#));

        assert_eq!(response.status(), 200);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert!(response.is_success());
    }

    #[test]
    fn response_json() {
        #[derive(Debug, PartialEq, serde::Deserialize)]
        struct Table {
            name: String,
        }

        let response = Response::new(200, HashMap::new(), Bytes::from(r#"{"name":"users"}"#));
        let table: Table = response.json().expect("deserialize");
        assert_eq!(
            table,
            Table {
                name: "users".to_string()
            }
        );
    }

    #[test]
    fn response_text() {
        let response = Response::new(200, HashMap::new(), Bytes::from("Hello"));
        assert_eq!(response.text().expect("text"), "Hello");
    }

    #[test]
    fn buffer_target_is_truncatable() {
        assert!(ResponseTarget::default().is_truncatable());
    }

    #[test]
    fn sink_target_receives_chunks() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let target = {
            let received = Arc::clone(&received);
            ResponseTarget::sink(move |chunk| {
                received
                    .lock()
                    .expect("lock")
                    .extend_from_slice(chunk.as_ref());
            })
        };

        assert!(!target.is_truncatable());
        if let ResponseTarget::Sink(sink) = &target {
            sink(&Bytes::from_static(b"ab"));
            sink(&Bytes::from_static(b"cd"));
        }
        assert_eq!(received.lock().expect("lock").as_slice(), b"abcd");
        assert_eq!(format!("{target:?}"), "Sink(..)");
    }
}
