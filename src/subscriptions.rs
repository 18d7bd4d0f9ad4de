//! Subscription registry and the application-facing subscription handle
//!
//! The registry holds only weak references. The application-visible
//! [`Subscription`] owns the strong lifetime; dropping the last handle for a
//! channel triggers the server-side unsubscribe.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use uuid::Uuid;

use crate::client::ClientInner;
use crate::messages::Message;

/// Handler invoked for every message delivered on a subscribed channel
pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

pub(crate) struct SubscriptionState {
    pub(crate) id: Uuid,
    pub(crate) channel: String,
    /// True only once the server has acknowledged the subscribe
    pub(crate) subscribed: AtomicBool,
    pub(crate) handler: MessageHandler,
}

impl SubscriptionState {
    pub(crate) fn new(channel: &str, handler: MessageHandler) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            channel: channel.to_string(),
            subscribed: AtomicBool::new(false),
            handler,
        })
    }
}

/// One consumer's interest in one channel.
///
/// Dropping the handle unsubscribes automatically; when the last live
/// consumer of a channel is gone, a `/meta/unsubscribe` is sent.
pub struct Subscription {
    pub(crate) state: Arc<SubscriptionState>,
    pub(crate) client: Weak<ClientInner>,
    valid: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(state: Arc<SubscriptionState>, client: Weak<ClientInner>) -> Self {
        Self {
            state,
            client,
            valid: AtomicBool::new(true),
        }
    }

    pub fn channel(&self) -> &str {
        &self.state.channel
    }

    /// Whether the server has acknowledged this subscription
    pub fn is_subscribed(&self) -> bool {
        self.state.subscribed.load(Ordering::SeqCst)
    }

    /// Explicitly unsubscribe. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}

    fn tear_down(&self) {
        if self.valid.swap(false, Ordering::SeqCst) {
            if let Some(client) = self.client.upgrade() {
                client.unsubscribe_state(&self.state);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.tear_down();
    }
}

/// Outcome of registering a new subscription
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AddOutcome {
    /// First consumer for the channel while connected, send `/meta/subscribe`
    SubscribeNow,
    /// First consumer but not connected yet, channel was queued
    Queued,
    /// Channel already has consumers, handle was appended
    Attached,
}

/// Per-channel subscription bookkeeping.
///
/// Pure data operations; the client orchestrates the wire traffic.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    by_channel: HashMap<String, Vec<Weak<SubscriptionState>>>,
    subscribed: HashSet<String>,
    queued: HashSet<String>,
}

impl SubscriptionRegistry {
    /// Drop dead weak references and channel entries with no consumers left.
    pub fn compact(&mut self) {
        self.by_channel.retain(|_, list| {
            list.retain(|weak| weak.strong_count() > 0);
            !list.is_empty()
        });
    }

    pub fn add(&mut self, state: &Arc<SubscriptionState>, connected: bool) -> AddOutcome {
        self.compact();
        let channel = state.channel.clone();
        if let Some(list) = self.by_channel.get_mut(&channel) {
            state
                .subscribed
                .store(self.subscribed.contains(&channel), Ordering::SeqCst);
            list.push(Arc::downgrade(state));
            return AddOutcome::Attached;
        }

        self.by_channel.insert(channel.clone(), vec![Arc::downgrade(state)]);
        if connected {
            AddOutcome::SubscribeNow
        } else {
            self.queued.insert(channel);
            AddOutcome::Queued
        }
    }

    /// Detach one consumer. Returns true when the channel has no subscribed
    /// consumer left and the server-side unsubscribe should be sent.
    pub fn remove(&mut self, state: &SubscriptionState) -> bool {
        self.compact();
        let Some(list) = self.by_channel.get_mut(&state.channel) else {
            return false;
        };
        state.subscribed.store(false, Ordering::SeqCst);
        list.retain(|weak| {
            weak.upgrade()
                .is_some_and(|s| s.id != state.id && s.subscribed.load(Ordering::SeqCst))
        });
        if list.is_empty() {
            self.by_channel.remove(&state.channel);
            true
        } else {
            false
        }
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscribed.contains(channel)
    }

    pub fn queue(&mut self, channel: &str) {
        self.queued.insert(channel.to_string());
    }

    /// Live handlers for a channel, in registration order
    pub fn live_handlers(&self, channel: &str) -> Vec<MessageHandler> {
        self.by_channel
            .get(channel)
            .map(|list| {
                list.iter()
                    .filter_map(Weak::upgrade)
                    .map(|s| s.handler.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record a server subscribe ack: flag every live consumer as subscribed
    /// and return their handlers so the ack can be delivered.
    pub fn mark_subscribed(&mut self, channel: &str) -> Vec<MessageHandler> {
        self.subscribed.insert(channel.to_string());
        self.queued.remove(channel);
        self.compact();
        self.by_channel
            .get(channel)
            .map(|list| {
                list.iter()
                    .filter_map(Weak::upgrade)
                    .map(|s| {
                        s.subscribed.store(true, Ordering::SeqCst);
                        s.handler.clone()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn mark_unsubscribed(&mut self, channel: &str) {
        self.subscribed.remove(channel);
        self.compact();
    }

    /// Channels queued for subscription before the client was connected.
    /// The queue is emptied; each channel gets exactly one subscribe.
    pub fn take_queued(&mut self) -> Vec<String> {
        self.queued.drain().collect()
    }

    /// All channels whose server-side interest must be restated after a
    /// re-handshake. Clears both the subscribed and queued sets.
    pub fn take_for_reopen(&mut self) -> Vec<String> {
        let mut channels: HashSet<String> = self.subscribed.drain().collect();
        channels.extend(self.queued.drain());
        channels.into_iter().collect()
    }

    /// Server confirmed a disconnect; all subscriptions are forgotten.
    pub fn clear_on_disconnect(&mut self) {
        self.subscribed.clear();
        self.by_channel.clear();
    }

    #[cfg(test)]
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    #[cfg(test)]
    pub fn channel_len(&self, channel: &str) -> usize {
        self.by_channel.get(channel).map_or(0, Vec::len)
    }
}
