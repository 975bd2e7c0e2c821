//! Cross-server signaling bridge
//!
//! Every server subscribes to the per-user channel pattern. A message for a
//! user is published once to `voip:user:{id}`; each instance receives it and
//! only the one holding that user's registration forwards it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::{BUS_RESUBSCRIBE_INITIAL, BUS_RESUBSCRIBE_MAX, USER_CHANNEL_PREFIX};
use crate::error::BridgeError;

/// One message received from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Publish/subscribe transport shared by all server instances
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BridgeError>;

    /// Receive every message on channels matching `pattern` (trailing `*` glob)
    async fn subscribe(&self, pattern: &str) -> Result<mpsc::UnboundedReceiver<BusMessage>, BridgeError>;
}

pub fn channel_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

pub fn user_channel(user_id: &str) -> String {
    format!("{USER_CHANNEL_PREFIX}{user_id}")
}

/// Process-local bus. Instances sharing one `InMemoryBus` behave like
/// servers sharing one Redis.
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<BusMessage>)>>,
    published: Mutex<Vec<BusMessage>>,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in order
    pub fn published(&self) -> Vec<BusMessage> {
        self.published.lock().clone()
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Close every open subscription, as a dropped Redis connection would
    pub fn disconnect_subscribers(&self) {
        self.subscribers.lock().clear();
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BridgeError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BridgeError::Publish("bus unavailable".into()));
        }

        let message = BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        self.published.lock().push(message.clone());

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(pattern, tx)| {
            if !channel_matches(pattern, channel) {
                return !tx.is_closed();
            }
            tx.send(message.clone()).is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::UnboundedReceiver<BusMessage>, BridgeError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BridgeError::Subscribe("bus unavailable".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push((pattern.to_string(), tx));
        Ok(rx)
    }
}

/// Delivery callback for a locally connected user
pub type DeliveryHandler = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Default, Clone, Serialize)]
pub struct BridgeStatistics {
    pub published: u64,
    pub publish_failures: u64,
    pub received: u64,
    pub forwarded: u64,
    pub ignored: u64,
    pub subscription_losses: u64,
    pub resubscriptions: u64,
    pub subscribed: bool,
    pub local_users: usize,
}

#[derive(Default)]
struct BridgeCounters {
    published: AtomicU64,
    publish_failures: AtomicU64,
    received: AtomicU64,
    forwarded: AtomicU64,
    ignored: AtomicU64,
    subscription_losses: AtomicU64,
    resubscriptions: AtomicU64,
}

struct BridgeShared {
    local_users: RwLock<HashMap<String, DeliveryHandler>>,
    counters: BridgeCounters,
    // false while the bus subscription is down
    subscribed: AtomicBool,
}

impl BridgeShared {
    fn handle_bus_message(&self, message: BusMessage) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let Some(user_id) = message.channel.strip_prefix(USER_CHANNEL_PREFIX) else {
            tracing::warn!(channel = %message.channel, "Invalid bus channel");
            return;
        };

        let handler = self.local_users.read().get(user_id).cloned();
        match handler {
            Some(handler) => {
                tracing::debug!(user_id = %user_id, "Forwarding bus message to local user");
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                handler(message.payload);
            }
            None => {
                self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Per-instance bridge between local connections and the shared bus
pub struct RedisSignalingBridge {
    bus: Arc<dyn MessageBus>,
    server_id: String,
    running: AtomicBool,
    shared: Arc<BridgeShared>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl RedisSignalingBridge {
    pub fn new(bus: Arc<dyn MessageBus>, server_id: impl Into<String>) -> Self {
        let server_id = server_id.into();
        tracing::info!(server_id = %server_id, "Signaling bridge created");
        Self {
            bus,
            server_id,
            running: AtomicBool::new(false),
            shared: Arc::new(BridgeShared {
                local_users: RwLock::new(HashMap::new()),
                counters: BridgeCounters::default(),
                subscribed: AtomicBool::new(false),
            }),
            subscriber: Mutex::new(None),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Started and currently receiving from the bus
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.shared.subscribed.load(Ordering::Acquire)
    }

    /// Subscribe to all user channels. Idempotent.
    ///
    /// A lost subscription is re-established in the background with
    /// exponential backoff; [`is_running`](Self::is_running) reports false
    /// until it is back.
    pub async fn start(&self) -> Result<(), BridgeError> {
        if self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        let pattern = format!("{USER_CHANNEL_PREFIX}*");
        let rx = self.bus.subscribe(&pattern).await?;
        self.shared.subscribed.store(true, Ordering::Release);

        let handle = tokio::spawn(subscriber_loop(
            Arc::clone(&self.bus),
            Arc::clone(&self.shared),
            self.server_id.clone(),
            pattern.clone(),
            rx,
        ));

        if let Some(previous) = self.subscriber.lock().replace(handle) {
            previous.abort();
        }
        self.running.store(true, Ordering::Release);
        tracing::info!(server_id = %self.server_id, pattern = %pattern, "Signaling bridge started");
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.subscriber.lock().take() {
            handle.abort();
        }
        self.shared.subscribed.store(false, Ordering::Release);
        tracing::info!(server_id = %self.server_id, "Signaling bridge stopped");
    }

    /// Publishing only needs the bridge started; the bus may still accept
    /// messages while this instance's own subscription is recovering.
    pub async fn publish_message(&self, target_user_id: &str, message: &str) -> Result<(), BridgeError> {
        if !self.running.load(Ordering::Acquire) {
            tracing::warn!("Bridge not running, cannot publish");
            return Err(BridgeError::NotRunning);
        }

        let channel = user_channel(target_user_id);
        match self.bus.publish(&channel, message).await {
            Ok(()) => {
                self.shared.counters.published.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(channel = %channel, "Published signaling message");
                Ok(())
            }
            Err(e) => {
                self.shared.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(channel = %channel, "Publish failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn register_local_user<F>(&self, user_id: &str, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.shared
            .local_users
            .write()
            .insert(user_id.to_string(), Arc::new(handler));
        tracing::debug!(user_id = %user_id, "Registered local user");
    }

    pub fn unregister_local_user(&self, user_id: &str) {
        self.shared.local_users.write().remove(user_id);
        tracing::debug!(user_id = %user_id, "Unregistered local user");
    }

    pub fn is_user_local(&self, user_id: &str) -> bool {
        self.shared.local_users.read().contains_key(user_id)
    }

    pub fn statistics(&self) -> BridgeStatistics {
        let c = &self.shared.counters;
        BridgeStatistics {
            published: c.published.load(Ordering::Relaxed),
            publish_failures: c.publish_failures.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            subscription_losses: c.subscription_losses.load(Ordering::Relaxed),
            resubscriptions: c.resubscriptions.load(Ordering::Relaxed),
            subscribed: self.shared.subscribed.load(Ordering::Acquire),
            local_users: self.shared.local_users.read().len(),
        }
    }
}

async fn subscriber_loop(
    bus: Arc<dyn MessageBus>,
    shared: Arc<BridgeShared>,
    server_id: String,
    pattern: String,
    mut rx: mpsc::UnboundedReceiver<BusMessage>,
) {
    tracing::info!(server_id = %server_id, "Bus subscriber started");
    loop {
        while let Some(message) = rx.recv().await {
            shared.handle_bus_message(message);
        }

        shared.subscribed.store(false, Ordering::Release);
        shared.counters.subscription_losses.fetch_add(1, Ordering::Relaxed);
        tracing::error!(server_id = %server_id, "Bus subscription lost, cross-server delivery paused");

        rx = resubscribe(bus.as_ref(), &pattern, &server_id).await;
        shared.subscribed.store(true, Ordering::Release);
        shared.counters.resubscriptions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(server_id = %server_id, pattern = %pattern, "Bus subscription restored");
    }
}

async fn resubscribe(
    bus: &dyn MessageBus,
    pattern: &str,
    server_id: &str,
) -> mpsc::UnboundedReceiver<BusMessage> {
    let mut backoff = BUS_RESUBSCRIBE_INITIAL;
    loop {
        tokio::time::sleep(backoff).await;
        match bus.subscribe(pattern).await {
            Ok(rx) => return rx,
            Err(e) => {
                tracing::warn!(server_id = %server_id, retry_in = ?backoff, "Resubscribe failed: {}", e);
                backoff = (backoff * 2).min(BUS_RESUBSCRIBE_MAX);
            }
        }
    }
}

impl Drop for RedisSignalingBridge {
    fn drop(&mut self) {
        self.stop();
    }
}
