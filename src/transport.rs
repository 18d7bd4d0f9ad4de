//! Injected HTTP transport capability
//!
//! The client does not own an HTTP stack. The host application supplies
//! something that can POST a JSON body to a path with a timeout and hand
//! back the parsed JSON response.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by the injected transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new(description: impl Into<String>) -> Self {
        Self(description.into())
    }
}

/// HTTP POST capability supplied by the host application.
///
/// A `timeout` of [`Duration::ZERO`] means "use the transport default".
/// The response is the parsed JSON body; Bayeux servers reply with an
/// array of message objects.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::new("connection refused");
        assert_eq!(err.to_string(), "connection refused");
    }
}
