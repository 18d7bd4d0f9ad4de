//! Observer surface exposed to the application
//!
//! Events are delivered over an unbounded channel obtained once via
//! [`AmbClient::event_receiver`](crate::AmbClient::event_receiver).

use crate::client::ClientStatus;
use crate::error::AmbError;
use crate::messages::{GlideStatus, Message};

/// Notifications emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The client entered the connected state
    Connected,
    /// The client entered the disconnected state
    Disconnected,
    /// Client status changed (emitted exactly once per change)
    StatusChanged(ClientStatus),
    /// Server acknowledged a channel subscription
    Subscribed { channel: String },
    /// Server acknowledged a channel unsubscription
    Unsubscribed { channel: String },
    /// A message arrived on a subscribed channel with no registered consumer
    Message { channel: String, message: Message },
    /// Session status carried in the `ext` mapping changed
    GlideStatusChanged(GlideStatus),
    /// A recoverable or terminal error occurred
    Error(AmbError),
}
