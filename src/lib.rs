//! Bayeux long-polling pub/sub client for AMB message buses.
//!
//! The client speaks the Bayeux protocol over plain HTTP POST: it performs a
//! handshake, keeps one long-poll connect request outstanding, and routes
//! inbound message batches to channel subscriptions. The HTTP layer itself is
//! injected through the [`Transport`] trait, so the crate carries no opinion
//! about TLS, cookies, or authentication.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use amb_client::{AmbClient, AmbConfig, Transport};
//!
//! # async fn run(transport: Arc<dyn Transport>) {
//! let client = AmbClient::new(AmbConfig::new().endpoint("/amb"), transport);
//! let mut events = client.event_receiver().unwrap();
//!
//! let _subscription = client.subscribe("/chat/room1", |message| {
//!     println!("got {:?}", message.data);
//! });
//!
//! client.connect();
//! while let Some(event) = events.recv().await {
//!     println!("event: {event:?}");
//! }
//! # }
//! ```

mod client;
mod config;
mod error;
mod events;
mod messages;
mod pending;
mod subscriptions;
mod transport;

pub use client::{AmbClient, ClientStatus};
pub use config::AmbConfig;
pub use error::{AmbError, Result};
pub use events::ClientEvent;
pub use messages::{
    Advice, GlideSessionStatus, GlideStatus, Message, MetaChannel, Reconnect,
    BAYEUX_MINIMUM_VERSION, BAYEUX_VERSION, SUPPORTED_CONNECTIONS,
};
pub use pending::PublishHandler;
pub use subscriptions::{MessageHandler, Subscription};
pub use transport::{Transport, TransportError};
