//! AMB client implementation
//!
//! Owns the Bayeux connection state machine: handshake, long-poll connect
//! scheduling, retry/backoff, reconnection advice, and demultiplexing of
//! inbound message batches to subscriptions and the event stream.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::AmbConfig;
use crate::error::AmbError;
use crate::events::ClientEvent;
use crate::messages::{
    channel_http_path, connect_request, handshake_request, parse_batch, publish_request,
    subscribe_request, unsubscribe_request, GlideStatus, Message, MetaChannel, Reconnect,
};
use crate::pending::{PendingPublishes, PublishHandler};
use crate::subscriptions::{
    AddOutcome, Subscription, SubscriptionRegistry, SubscriptionState,
};
use crate::transport::{Transport, TransportError};

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Not connected; initial state and the terminal state after teardown
    Disconnected,
    /// Handshake sent, awaiting the server reply
    Handshake,
    /// Handshaken and long-polling
    Connected,
    /// A connect attempt failed while connected; may recover
    Retrying,
    /// Retry budget exhausted; terminal until an explicit `connect()`
    MaximumRetriesReached,
}

/// Side effects of a status change, applied by the single `set_status` path.
///
/// Kept as data so transition logic is testable without a live client.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StatusEffect {
    ResetRetryCounter,
    FlushQueuedSubscriptions,
    NotifyConnected,
    NotifyDisconnected,
    CancelInFlight,
    ReportRetriesExhausted,
}

pub(crate) fn transition_effects(old: ClientStatus, new: ClientStatus) -> Vec<StatusEffect> {
    if old == new {
        return Vec::new();
    }
    match new {
        ClientStatus::Handshake | ClientStatus::Retrying => {
            vec![StatusEffect::ResetRetryCounter]
        }
        ClientStatus::Connected => vec![
            StatusEffect::FlushQueuedSubscriptions,
            StatusEffect::NotifyConnected,
        ],
        ClientStatus::Disconnected => vec![
            StatusEffect::CancelInFlight,
            StatusEffect::NotifyDisconnected,
        ],
        ClientStatus::MaximumRetriesReached => vec![StatusEffect::ReportRetriesExhausted],
    }
}

/// Internal client state
pub(crate) struct ClientInner {
    config: AmbConfig,
    transport: Arc<dyn Transport>,

    status_tx: watch::Sender<ClientStatus>,
    status_rx: watch::Receiver<ClientStatus>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,

    client_id: Mutex<Option<String>>,
    glide_status: Mutex<GlideStatus>,

    registry: Mutex<SubscriptionRegistry>,
    // Subscription teardown can recurse into unsubscribe; try-lock and skip
    // instead of re-entering.
    unsubscribe_guard: Mutex<()>,
    pending: Mutex<PendingPublishes>,

    // Sequential message id assigned to every outbound message
    message_seq: AtomicU64,
    retry_attempt: AtomicU32,
    long_poll_timeout: Mutex<Duration>,
    reopen_after_connect: AtomicBool,
    paused: AtomicBool,

    // At most one /meta/connect may be outstanding per client
    connect_in_flight: AtomicBool,
    connect_started: Mutex<Option<Instant>>,
    scheduled_connect: Mutex<Option<JoinHandle<()>>>,
    request_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Bayeux long-polling pub/sub client.
///
/// Cheaply cloneable; all clones share one session. The HTTP transport is
/// injected, the client only decides what to post and when.
#[derive(Clone)]
pub struct AmbClient {
    inner: Arc<ClientInner>,
}

impl AmbClient {
    pub fn new(config: AmbConfig, transport: Arc<dyn Transport>) -> Self {
        let (status_tx, status_rx) = watch::channel(ClientStatus::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            config,
            transport,
            status_tx,
            status_rx,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            client_id: Mutex::new(None),
            glide_status: Mutex::new(GlideStatus::default()),
            registry: Mutex::new(SubscriptionRegistry::default()),
            unsubscribe_guard: Mutex::new(()),
            pending: Mutex::new(PendingPublishes::default()),
            message_seq: AtomicU64::new(0),
            retry_attempt: AtomicU32::new(0),
            long_poll_timeout: Mutex::new(Duration::ZERO),
            reopen_after_connect: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            connect_in_flight: AtomicBool::new(false),
            connect_started: Mutex::new(None),
            scheduled_connect: Mutex::new(None),
            request_tasks: Mutex::new(Vec::new()),
        });

        Self { inner }
    }

    /// Current connection status
    pub fn status(&self) -> ClientStatus {
        self.inner.status()
    }

    /// Receiver for connection status changes
    pub fn status_receiver(&self) -> watch::Receiver<ClientStatus> {
        self.inner.status_rx.clone()
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn event_receiver(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.inner.events_rx.lock().take()
    }

    /// The server-assigned client id, once handshaken
    pub fn client_id(&self) -> Option<String> {
        self.inner.client_id.lock().clone()
    }

    /// Last session status derived from connect-reply extensions
    pub fn glide_status(&self) -> GlideStatus {
        *self.inner.glide_status.lock()
    }

    /// Number of publishes still awaiting a correlated response
    pub fn pending_publish_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Start a fresh session: cancels in-flight work, forgets prior publish
    /// correlations and sends a Bayeux handshake.
    pub fn connect(&self) {
        self.inner.send_handshake();
    }

    /// Schedule a long-poll connect if none is in flight or scheduled
    pub fn reconnect_if_needed(&self) {
        self.inner.start_connect_request(Duration::ZERO);
    }

    /// Publish a payload to a channel.
    ///
    /// Requires a connected client with a known client id; otherwise the
    /// completion (and the event stream) gets a publish failure and nothing
    /// reaches the network.
    pub fn publish_message(
        &self,
        data: Value,
        channel: &str,
        ext: Option<Map<String, Value>>,
        completion: Option<PublishHandler>,
    ) {
        self.inner.publish(data, channel, ext, completion);
    }

    /// Register interest in a channel.
    ///
    /// Subscribing before the client is connected queues the channel; the
    /// subscribe is sent once the client reaches `Connected`.
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let state = SubscriptionState::new(channel, Arc::new(handler));
        let outcome = {
            let mut registry = self.inner.registry.lock();
            registry.add(&state, self.inner.status() == ClientStatus::Connected)
        };
        if outcome == AddOutcome::SubscribeNow {
            self.inner.send_subscribe(channel);
        }
        Subscription::new(state, Arc::downgrade(&self.inner))
    }

    /// Drop a subscription handle, unsubscribing its consumer
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Restore interest in a channel after a forced re-handshake. No-op if
    /// the channel is already subscribed.
    pub fn resubscribe(&self, channel: &str) {
        self.inner.resubscribe_channel(channel);
    }

    /// Pause or resume the client.
    ///
    /// Pausing never cancels the in-flight long poll (cancellation leaves
    /// the server session in a bad state); it only suppresses scheduling and
    /// error reporting. Resuming re-handshakes if the poll is presumed dead.
    pub fn set_paused(&self, paused: bool) {
        self.inner.set_paused(paused);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.is_paused()
    }

    /// Cancel all in-flight work and force the client to `Disconnected`
    pub fn tear_down(&self) {
        self.inner.cancel_all_requests();
        self.inner.pending.lock().clear();
        self.inner.set_status(ClientStatus::Disconnected);
    }
}

impl ClientInner {
    fn status(&self) -> ClientStatus {
        *self.status_rx.borrow()
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Report an error through the event stream. Errors while paused are
    /// logged only; the application has intentionally gone inert.
    fn report_error(&self, error: AmbError) {
        if self.is_paused() {
            warn!(%error, "error suppressed while paused");
            return;
        }
        warn!(%error, "client error");
        self.emit(ClientEvent::Error(error));
    }

    fn set_status(self: &Arc<Self>, new: ClientStatus) {
        let old = self.status();
        if old == new {
            return;
        }
        debug!(?old, ?new, "client status changed");
        let _ = self.status_tx.send(new);
        self.emit(ClientEvent::StatusChanged(new));
        for effect in transition_effects(old, new) {
            self.apply_effect(effect);
        }
    }

    fn apply_effect(self: &Arc<Self>, effect: StatusEffect) {
        match effect {
            StatusEffect::ResetRetryCounter => {
                self.retry_attempt.store(0, Ordering::SeqCst);
            }
            StatusEffect::FlushQueuedSubscriptions => {
                let channels = self.registry.lock().take_queued();
                for channel in channels {
                    self.send_subscribe(&channel);
                }
            }
            StatusEffect::NotifyConnected => self.emit(ClientEvent::Connected),
            StatusEffect::NotifyDisconnected => self.emit(ClientEvent::Disconnected),
            StatusEffect::CancelInFlight => self.cancel_all_requests(),
            StatusEffect::ReportRetriesExhausted => {
                self.report_error(AmbError::ConnectFailed(
                    "maximum connect retry attempts have been reached".to_string(),
                ));
            }
        }
    }

    // Request plumbing

    /// Assign the next sequential id, register the completion if any, and
    /// post the message on a spawned task.
    fn post_message(
        self: &Arc<Self>,
        mut message: Value,
        timeout: Duration,
        completion: Option<PublishHandler>,
    ) {
        let Some(channel) = message
            .get("channel")
            .and_then(Value::as_str)
            .map(str::to_owned)
        else {
            let error =
                AmbError::HttpRequestFailed("outbound message is missing a channel".to_string());
            if let Some(handler) = completion {
                handler(Err(error.clone()));
            }
            self.report_error(error);
            return;
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(%channel, "no async runtime, request dropped");
                if let Some(handler) = completion {
                    handler(Err(AmbError::HttpRequestFailed(
                        "no async runtime".to_string(),
                    )));
                }
                return;
            }
        };

        let id = self.message_seq.fetch_add(1, Ordering::SeqCst).to_string();
        message["id"] = Value::String(id.clone());
        if let Some(handler) = completion {
            self.pending.lock().insert(id.clone(), handler, Instant::now());
        }

        let path = format!(
            "{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            channel_http_path(&channel)
        );
        let is_connect = channel == MetaChannel::Connect.as_str();
        if is_connect {
            self.connect_in_flight.store(true, Ordering::SeqCst);
            *self.connect_started.lock() = Some(Instant::now());
        }

        debug!(%channel, %id, %path, "posting bayeux message");
        let inner = Arc::clone(self);
        let task = runtime.spawn(async move {
            let result = inner.transport.post(&path, message, timeout).await;
            if is_connect {
                inner.connect_in_flight.store(false, Ordering::SeqCst);
            }
            match result {
                Ok(raw) => inner.handle_response(raw),
                Err(error) => {
                    inner
                        .pending
                        .lock()
                        .fail(&id, AmbError::HttpRequestFailed(error.to_string()));
                    inner.handle_http_error(error);
                }
            }
        });

        self.request_tasks.lock().push(task);
        self.cleanup_completed_tasks();
    }

    fn cancel_all_requests(&self) {
        if let Some(task) = self.scheduled_connect.lock().take() {
            task.abort();
        }
        let tasks = std::mem::take(&mut *self.request_tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.connect_in_flight.store(false, Ordering::SeqCst);
    }

    fn cleanup_completed_tasks(&self) {
        self.request_tasks.lock().retain(|task| !task.is_finished());
    }

    /// Schedule a long-poll connect after `after`, unless the client is
    /// paused, disconnected, or a connect is already outstanding.
    fn start_connect_request(self: &Arc<Self>, after: Duration) {
        if self.is_paused() {
            debug!("client is paused, connect request skipped");
            return;
        }
        if self.status() == ClientStatus::Disconnected {
            debug!("client is disconnected, handshake must complete first");
            return;
        }
        if self.connect_in_flight.load(Ordering::SeqCst) {
            debug!("connect request still in flight, not scheduling another");
            if self.status() == ClientStatus::Retrying {
                self.set_status(ClientStatus::Connected);
            }
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("no async runtime, connect not scheduled");
                return;
            }
        };

        let weak = Arc::downgrade(self);
        let task = runtime.spawn(async move {
            if !after.is_zero() {
                tokio::time::sleep(after).await;
            }
            if let Some(inner) = weak.upgrade() {
                inner.send_connect();
            }
        });
        if let Some(previous) = self.scheduled_connect.lock().replace(task) {
            previous.abort();
        }
    }

    // Bayeux requests

    pub(crate) fn send_handshake(self: &Arc<Self>) {
        // a fresh session invalidates prior publish correlations
        self.cancel_all_requests();
        *self.connect_started.lock() = None;
        self.pending.lock().clear();

        self.set_status(ClientStatus::Handshake);
        self.post_message(handshake_request(), Duration::ZERO, None);
    }

    fn send_connect(self: &Arc<Self>) {
        let Some(client_id) = self.client_id.lock().clone() else {
            self.report_error(AmbError::ConnectFailed(
                "clientId is not received yet".to_string(),
            ));
            return;
        };
        if self.connect_in_flight.load(Ordering::SeqCst) {
            debug!("connect request already in flight");
            return;
        }

        let timeout = if self.status() == ClientStatus::Retrying {
            self.config.retry_connect_timeout
        } else {
            *self.long_poll_timeout.lock()
        };
        self.post_message(connect_request(&client_id), timeout, None);
    }

    fn send_subscribe(self: &Arc<Self>, channel: &str) {
        let Some(client_id) = self.client_id.lock().clone() else {
            self.report_error(AmbError::SubscribeFailed(format!(
                "subscription for channel {channel} cannot be sent, clientId is not set yet"
            )));
            return;
        };
        self.post_message(subscribe_request(&client_id, channel), Duration::ZERO, None);
    }

    fn send_unsubscribe(self: &Arc<Self>, channel: &str) {
        let Some(client_id) = self.client_id.lock().clone() else {
            self.report_error(AmbError::UnsubscribeFailed(format!(
                "unsubscription for channel {channel} cannot be sent, clientId is not set yet"
            )));
            return;
        };
        self.post_message(
            unsubscribe_request(&client_id, channel),
            Duration::ZERO,
            None,
        );
    }

    pub(crate) fn publish(
        self: &Arc<Self>,
        data: Value,
        channel: &str,
        ext: Option<Map<String, Value>>,
        completion: Option<PublishHandler>,
    ) {
        if self.status() != ClientStatus::Connected {
            let error = AmbError::PublishFailed("client is not connected".to_string());
            if let Some(handler) = completion {
                handler(Err(error.clone()));
            }
            self.report_error(error);
            return;
        }
        let Some(client_id) = self.client_id.lock().clone() else {
            let error = AmbError::PublishFailed("clientId is not set yet".to_string());
            if let Some(handler) = completion {
                handler(Err(error.clone()));
            }
            self.report_error(error);
            return;
        };

        self.post_message(
            publish_request(channel, &client_id, data, ext),
            Duration::ZERO,
            completion,
        );
    }

    // Subscription lifecycle

    pub(crate) fn unsubscribe_state(self: &Arc<Self>, state: &SubscriptionState) {
        let Some(_guard) = self.unsubscribe_guard.try_lock() else {
            return;
        };
        let last_consumer_gone = self.registry.lock().remove(state);
        if last_consumer_gone {
            self.send_unsubscribe(&state.channel);
        }
    }

    fn resubscribe_channel(self: &Arc<Self>, channel: &str) {
        {
            let mut registry = self.registry.lock();
            if registry.is_subscribed(channel) {
                return;
            }
            registry.queue(channel);
        }
        self.send_subscribe(channel);
    }

    /// The server forgets channels across a handshake; restate interest in
    /// everything that was subscribed or queued.
    fn reopen_subscriptions(self: &Arc<Self>) {
        let channels = self.registry.lock().take_for_reopen();
        for channel in channels {
            self.resubscribe_channel(&channel);
        }
    }

    // Pause / resume

    pub(crate) fn set_paused(self: &Arc<Self>, paused: bool) {
        if self.paused.swap(paused, Ordering::SeqCst) == paused {
            return;
        }
        if paused {
            debug!("client paused, in-flight long poll left running");
            return;
        }

        let poll_presumed_dead = {
            let started = *self.connect_started.lock();
            let timeout = *self.long_poll_timeout.lock();
            match started {
                Some(at) if !timeout.is_zero() => at.elapsed() > timeout,
                _ => false,
            }
        };
        if poll_presumed_dead {
            debug!("long poll outlived its timeout while paused, re-handshaking");
            self.set_status(ClientStatus::Disconnected);
            self.send_handshake();
        } else {
            self.start_connect_request(Duration::ZERO);
        }
    }

    // Inbound handling

    fn handle_response(self: &Arc<Self>, raw: Value) {
        let messages = match parse_batch(raw) {
            Ok(messages) => messages,
            Err(error) => {
                self.report_error(error);
                return;
            }
        };

        for message in &messages {
            self.handle_message(message);
        }

        // correlate publish acks, then expire stale entries
        let mut pending = self.pending.lock();
        if !self.is_paused() {
            for message in &messages {
                pending.complete(message);
            }
        }
        let long_poll_timeout = *self.long_poll_timeout.lock();
        pending.prune(Instant::now(), long_poll_timeout);
    }

    fn handle_message(self: &Arc<Self>, message: &Message) {
        match MetaChannel::from_channel(&message.channel) {
            Some(MetaChannel::Handshake) => self.handle_handshake(message),
            Some(MetaChannel::Connect) => self.handle_connect(message),
            Some(MetaChannel::Disconnect) => self.handle_disconnect(message),
            Some(MetaChannel::Subscribe) => self.handle_subscribe(message),
            Some(MetaChannel::Unsubscribe) => self.handle_unsubscribe(message),
            None => self.handle_channel_message(message),
        }
    }

    fn handle_handshake(self: &Arc<Self>, message: &Message) {
        if message.successful {
            self.retry_attempt.store(0, Ordering::SeqCst);
            *self.client_id.lock() = message.client_id.clone();
            self.set_status(ClientStatus::Connected);
        } else {
            self.report_error(AmbError::HandshakeFailed(format!(
                "server rejected handshake: {}",
                message.error_string()
            )));
        }
        // channels must be restated after the next successful connect
        self.reopen_after_connect.store(true, Ordering::SeqCst);
        // even after a rejected handshake the server may recover
        self.start_connect_request(Duration::ZERO);
    }

    fn handle_connect(self: &Arc<Self>, message: &Message) {
        // reconnect advice overrides everything else in the reply
        if let Some(advice) = &message.advice {
            if advice.reconnect == Some(Reconnect::Handshake) {
                self.set_status(ClientStatus::Disconnected);
                self.send_handshake();
                return;
            }
        }

        if message.successful {
            if let Some(task) = self.scheduled_connect.lock().take() {
                drop(task);
            }

            if let Some(ext) = &message.ext {
                let status = GlideStatus::from_ext(ext);
                let changed = {
                    let mut current = self.glide_status.lock();
                    if *current != status {
                        *current = status;
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    self.emit(ClientEvent::GlideStatusChanged(status));
                }
            }

            if self.reopen_after_connect.swap(false, Ordering::SeqCst) {
                self.reopen_subscriptions();
            }

            self.set_status(ClientStatus::Connected);

            if let Some(advice) = &message.advice {
                if let Some(timeout) = advice.timeout {
                    *self.long_poll_timeout.lock() = Duration::from_millis(timeout);
                }
                let interval = advice.interval.unwrap_or(0);
                if interval > 0 {
                    debug!(interval_ms = interval, "delaying next connect per advice");
                    self.start_connect_request(Duration::from_millis(interval));
                    return;
                }
            }
            self.start_connect_request(Duration::ZERO);
        } else if self.status() == ClientStatus::Retrying {
            let attempt = self.retry_attempt.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= self.config.maximum_retry_attempts {
                self.set_status(ClientStatus::MaximumRetriesReached);
            } else {
                self.start_connect_request(Duration::ZERO);
            }
        } else {
            self.report_error(AmbError::ConnectFailed(
                "server reported connect as unsuccessful".to_string(),
            ));
        }
    }

    fn handle_disconnect(self: &Arc<Self>, message: &Message) {
        if message.successful {
            self.cancel_all_requests();
            self.registry.lock().clear_on_disconnect();
        } else {
            self.report_error(AmbError::DisconnectFailed);
        }
    }

    fn handle_subscribe(self: &Arc<Self>, message: &Message) {
        if message.successful {
            let Some(channel) = message.subscription.clone() else {
                return;
            };
            let handlers = self.registry.lock().mark_subscribed(&channel);
            // let every live consumer know the subscription went through
            for handler in &handlers {
                handler(message);
            }
            self.emit(ClientEvent::Subscribed { channel });
        } else {
            self.report_error(AmbError::SubscribeFailed(format!(
                "server rejected subscribe: {}",
                message.error_string()
            )));
        }
    }

    fn handle_unsubscribe(self: &Arc<Self>, message: &Message) {
        if message.successful {
            let Some(channel) = message.subscription.clone() else {
                return;
            };
            self.registry.lock().mark_unsubscribed(&channel);
            self.emit(ClientEvent::Unsubscribed { channel });
        } else {
            self.report_error(AmbError::UnsubscribeFailed(format!(
                "server rejected unsubscribe: {}",
                message.error_string()
            )));
        }
    }

    /// Route a non-meta message: to live subscribers if any, to the event
    /// stream if the channel is subscribed but idle, otherwise surface the
    /// server/client desync as an error.
    fn handle_channel_message(self: &Arc<Self>, message: &Message) {
        if self.is_paused() {
            debug!(channel = %message.channel, "incoming message dropped while paused");
            return;
        }

        let (handlers, is_subscribed) = {
            let registry = self.registry.lock();
            (
                registry.live_handlers(&message.channel),
                registry.is_subscribed(&message.channel),
            )
        };

        if !handlers.is_empty() {
            for handler in &handlers {
                handler(message);
            }
        } else if is_subscribed {
            self.emit(ClientEvent::Message {
                channel: message.channel.clone(),
                message: message.clone(),
            });
        } else {
            self.report_error(AmbError::UnhandledMessage(message.channel.clone()));
        }
    }

    fn handle_http_error(self: &Arc<Self>, error: TransportError) {
        self.cleanup_completed_tasks();

        if self.is_paused() {
            debug!(%error, "http error ignored while paused");
            return;
        }

        self.report_error(AmbError::HttpRequestFailed(error.to_string()));

        match self.status() {
            ClientStatus::Handshake => {
                // handshake is not retried automatically
                self.report_error(AmbError::HandshakeFailed(
                    "handshake request failed".to_string(),
                ));
            }
            status => {
                if status == ClientStatus::Connected {
                    self.set_status(ClientStatus::Retrying);
                }
                self.start_connect_request(self.config.retry_interval);
            }
        }
    }
}
