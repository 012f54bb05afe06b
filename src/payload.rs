// src/payload.rs
//! Request/response unit exchanged with workers

use bytes::Bytes;

/// Context a worker sends back, with an empty body, to ask to be restarted
pub const STOP_REQUEST: &str = r#"{"stop":true}"#;

/// A body plus out-of-band context metadata
///
/// Responses have the same shape as requests. Both halves are cheap to clone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    /// Side-channel metadata (headers, routing info, ...)
    pub context: Bytes,

    /// Request or response body
    pub body: Bytes,
}

impl Payload {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            context: Bytes::new(),
            body: body.into(),
        }
    }

    pub fn with_context(context: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            context: context.into(),
            body: body.into(),
        }
    }

    /// Neither body nor context carries any data
    pub fn is_empty(&self) -> bool {
        self.body.is_empty() && self.context.is_empty()
    }

    /// The worker asked to be restarted instead of answering
    pub fn is_stop_request(&self) -> bool {
        self.body.is_empty() && self.context.as_ref() == STOP_REQUEST.as_bytes()
    }

    /// Build the restart-request response
    pub fn stop_request() -> Self {
        Self::with_context(STOP_REQUEST, Bytes::new())
    }

    /// Body as UTF-8, replacing invalid sequences
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_payload() {
        assert!(Payload::default().is_empty());
        assert!(!Payload::new("hello").is_empty());
        assert!(!Payload::with_context("ctx", "").is_empty());
    }

    #[test]
    fn test_stop_request_detection() {
        assert!(Payload::stop_request().is_stop_request());

        // a real answer that happens to carry the marker is not a restart request
        let answer = Payload::with_context(STOP_REQUEST, "body");
        assert!(!answer.is_stop_request());
        assert!(!Payload::new("").is_stop_request());
    }

    #[test]
    fn test_body_str() {
        assert_eq!(Payload::new("hello").body_str(), "hello");
    }
}
