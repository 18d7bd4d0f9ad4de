//! Bayeux wire message types
//!
//! One `Message` is one element of the JSON array a Bayeux server returns
//! per request. The codec is tolerant of missing optional fields and strict
//! about `channel`, which every message must carry.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{AmbError, Result};

/// Bayeux protocol version advertised during handshake
pub const BAYEUX_VERSION: &str = "1.0";
/// Oldest protocol version the client is willing to speak
pub const BAYEUX_MINIMUM_VERSION: &str = "1.0beta";
/// The only connection type this client supports
pub const SUPPORTED_CONNECTIONS: [&str; 1] = ["long-polling"];

/// Reconnection guidance a server may attach to a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    /// Retry the `/meta/connect` request
    Retry,
    /// Session is gone, perform a new handshake
    Handshake,
    /// Stop reconnecting
    None,
}

/// Server-supplied advice on how the client should proceed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,
    /// Delay before the next connect, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// How long the server will hold a long poll open, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// One Bayeux wire unit.
///
/// `successful` defaults to `true` when the server omits the field. That is
/// a documented protocol quirk carried over for compatibility, even though a
/// server could in principle omit it on an actually-failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Sequence number assigned by the client on outbound, echoed back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub channel: String,

    /// Assigned by the server on handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default = "default_true")]
    pub successful: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,

    /// Channel name being (un)subscribed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,

    /// Free-form extension mapping, used for session-status signaling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
}

impl Message {
    /// The server-reported error string, or a placeholder for logging
    pub fn error_string(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }
}

/// Parse one long-poll response body into a batch of messages.
///
/// A malformed array or element aborts the whole batch.
pub fn parse_batch(raw: Value) -> Result<Vec<Message>> {
    let items = match raw {
        Value::Array(items) => items,
        _ => {
            return Err(AmbError::MessageParse(
                "messages are not packaged in an array".to_string(),
            ))
        }
    };

    items
        .into_iter()
        .map(|item| {
            if !item.is_object() {
                return Err(AmbError::MessageParse(
                    "message is not an object".to_string(),
                ));
            }
            serde_json::from_value(item).map_err(|e| AmbError::MessageParse(e.to_string()))
        })
        .collect()
}

/// The reserved Bayeux protocol channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaChannel {
    Handshake,
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
}

impl MetaChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetaChannel::Handshake => "/meta/handshake",
            MetaChannel::Connect => "/meta/connect",
            MetaChannel::Disconnect => "/meta/disconnect",
            MetaChannel::Subscribe => "/meta/subscribe",
            MetaChannel::Unsubscribe => "/meta/unsubscribe",
        }
    }

    pub fn from_channel(channel: &str) -> Option<Self> {
        match channel {
            "/meta/handshake" => Some(MetaChannel::Handshake),
            "/meta/connect" => Some(MetaChannel::Connect),
            "/meta/disconnect" => Some(MetaChannel::Disconnect),
            "/meta/subscribe" => Some(MetaChannel::Subscribe),
            "/meta/unsubscribe" => Some(MetaChannel::Unsubscribe),
            _ => None,
        }
    }
}

/// Map a channel to the HTTP sub-path it is posted under.
///
/// Only handshake and connect get a dedicated segment; everything else,
/// including publish and (un)subscribe traffic, goes to the bare endpoint.
pub fn channel_http_path(channel: &str) -> &'static str {
    match MetaChannel::from_channel(channel) {
        Some(MetaChannel::Handshake) => "handshake",
        Some(MetaChannel::Connect) => "connect",
        _ => "",
    }
}

/// Backend session login state carried in the `ext` mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlideSessionStatus {
    LoggedIn,
    LoggedOut,
    Invalidated,
}

impl GlideSessionStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "session.logged.in" => Some(GlideSessionStatus::LoggedIn),
            "session.logged.out" => Some(GlideSessionStatus::LoggedOut),
            "session.invalidated" => Some(GlideSessionStatus::Invalidated),
            _ => None,
        }
    }
}

/// Session status derived from the `ext` mapping of connect replies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlideStatus {
    pub amb_active: bool,
    pub session_status: Option<GlideSessionStatus>,
}

impl GlideStatus {
    pub fn from_ext(ext: &Map<String, Value>) -> Self {
        Self {
            amb_active: ext
                .get("glide.amb.active")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            session_status: ext
                .get("glide.session.status")
                .and_then(Value::as_str)
                .and_then(GlideSessionStatus::parse),
        }
    }
}

// Outbound request builders. `id` is injected later by the client.

pub fn handshake_request() -> Value {
    json!({
        "channel": MetaChannel::Handshake.as_str(),
        "version": BAYEUX_VERSION,
        "minimumVersion": BAYEUX_MINIMUM_VERSION,
        "supportedConnections": SUPPORTED_CONNECTIONS,
    })
}

pub fn connect_request(client_id: &str) -> Value {
    json!({
        "channel": MetaChannel::Connect.as_str(),
        "clientId": client_id,
        "supportedConnections": SUPPORTED_CONNECTIONS,
    })
}

pub fn subscribe_request(client_id: &str, channel: &str) -> Value {
    json!({
        "channel": MetaChannel::Subscribe.as_str(),
        "clientId": client_id,
        "subscription": channel,
    })
}

pub fn unsubscribe_request(client_id: &str, channel: &str) -> Value {
    json!({
        "channel": MetaChannel::Unsubscribe.as_str(),
        "clientId": client_id,
        "subscription": channel,
    })
}

pub fn publish_request(
    channel: &str,
    client_id: &str,
    data: Value,
    ext: Option<Map<String, Value>>,
) -> Value {
    let mut message = json!({
        "channel": channel,
        "clientId": client_id,
        "data": data,
    });
    if let Some(ext) = ext {
        if !ext.is_empty() {
            message["ext"] = Value::Object(ext);
        }
    }
    message
}
