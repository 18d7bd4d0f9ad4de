//! Pending-publish tracker
//!
//! Correlates an outbound publish's assigned id with the caller's completion
//! handler. Servers are not obligated to echo a correlated reply, so entries
//! are pruned by age whenever a batch is processed rather than on a timer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::messages::Message;

/// Completion callback for a published message
pub type PublishHandler = Box<dyn FnOnce(Result<Message>) + Send>;

struct PendingPublish {
    created: Instant,
    handler: PublishHandler,
}

/// Publishes awaiting a correlated response, keyed by message id
#[derive(Default)]
pub(crate) struct PendingPublishes {
    entries: HashMap<String, PendingPublish>,
}

impl PendingPublishes {
    pub fn insert(&mut self, id: String, handler: PublishHandler, now: Instant) {
        self.entries.insert(
            id,
            PendingPublish {
                created: now,
                handler,
            },
        );
    }

    /// Invoke and remove the entry correlated with `message`, if any.
    pub fn complete(&mut self, message: &Message) -> bool {
        let Some(id) = message.id.as_deref() else {
            return false;
        };
        match self.entries.remove(id) {
            Some(entry) => {
                (entry.handler)(Ok(message.clone()));
                true
            }
            None => false,
        }
    }

    /// Invoke and remove the entry for `id` with a failure.
    pub fn fail(&mut self, id: &str, error: crate::error::AmbError) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                (entry.handler)(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop entries older than twice the long-poll timeout. Their handlers
    /// are never invoked. A zero timeout means no advice has arrived yet, so
    /// nothing is pruned.
    pub fn prune(&mut self, now: Instant, long_poll_timeout: Duration) {
        if long_poll_timeout.is_zero() {
            return;
        }
        let max_age = long_poll_timeout * 2;
        self.entries
            .retain(|_, entry| now.duration_since(entry.created) < max_age);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
