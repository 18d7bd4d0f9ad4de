//! Error types for the AMB client

use thiserror::Error;

/// Errors that can occur when using the AMB client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmbError {
    /// Bayeux handshake was rejected or the handshake request failed
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A long-poll connect was rejected by the server or could not be sent
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Channel subscription was rejected or could not be sent
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Channel unsubscription was rejected or could not be sent
    #[error("unsubscribe failed: {0}")]
    UnsubscribeFailed(String),

    /// Publish was rejected or attempted while not connected
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// Server reported the disconnect as unsuccessful
    #[error("disconnect failed")]
    DisconnectFailed,

    /// The underlying HTTP transport reported an error
    #[error("http request failed: {0}")]
    HttpRequestFailed(String),

    /// Server response could not be parsed as a Bayeux message batch
    #[error("message parse failed: {0}")]
    MessageParse(String),

    /// A message arrived for a channel the client never subscribed to
    #[error("unhandled message received for channel {0}")]
    UnhandledMessage(String),
}

/// Result type for AMB client operations
pub type Result<T> = std::result::Result<T, AmbError>;
