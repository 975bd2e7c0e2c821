//! Signaling router
//!
//! Holds the users connected to this instance and routes each message to
//! its recipient: directly when the recipient is local, otherwise through
//! the bridge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::access::{AllowAll, CallPolicy, UserDirectory};
use super::bridge::{BridgeStatistics, RedisSignalingBridge};
use super::protocol::{self, ErrorCode, MessageType};
use crate::config::SignalingConfig;
use crate::error::{BridgeError, SignalingError};

/// Outbound half of a client connection
pub trait SignalingTransport: Send + Sync {
    /// Queue a message for the client without blocking
    fn send(&self, message: &str) -> Result<(), SignalingError>;
}

/// Transport backed by a bounded channel drained by the connection writer
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<String>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl SignalingTransport for ChannelTransport {
    fn send(&self, message: &str) -> Result<(), SignalingError> {
        self.tx.try_send(message.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SignalingError::WriteFailed("outbound queue full".into()),
            mpsc::error::TrySendError::Closed(_) => SignalingError::TransportClosed,
        })
    }
}

type Connections = Arc<RwLock<HashMap<String, Arc<dyn SignalingTransport>>>>;

/// How a message reached its recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Local,
    Bridged,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SignalingStatistics {
    pub connections: usize,
    pub active_calls: usize,
    pub messages_routed: u64,
    pub local_deliveries: u64,
    pub bridged_deliveries: u64,
    pub delivery_failures: u64,
    pub errors_sent: u64,
    pub bridge: BridgeStatistics,
}

#[derive(Default)]
struct Counters {
    messages_routed: AtomicU64,
    local_deliveries: AtomicU64,
    bridged_deliveries: AtomicU64,
    delivery_failures: AtomicU64,
    errors_sent: AtomicU64,
}

fn deliver_local(
    connections: &Connections,
    counters: &Counters,
    user_id: &str,
    message: &str,
) -> Option<Result<(), SignalingError>> {
    let transport = connections.read().get(user_id).cloned()?;
    let result = transport.send(message);
    match &result {
        Ok(()) => {
            counters.local_deliveries.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(user_id = %user_id, "Failed to write signaling message: {}", e);
        }
    }
    Some(result)
}

pub struct SignalingManager {
    config: SignalingConfig,
    connections: Connections,
    bridge: Arc<RedisSignalingBridge>,
    policy: Arc<dyn CallPolicy>,
    directory: Option<Arc<dyn UserDirectory>>,
    // user id -> peer id for calls in progress
    active_calls: DashMap<String, String>,
    counters: Arc<Counters>,
}

impl SignalingManager {
    pub fn new(config: SignalingConfig, bridge: Arc<RedisSignalingBridge>) -> Self {
        Self {
            config,
            connections: Arc::new(RwLock::new(HashMap::new())),
            bridge,
            policy: Arc::new(AllowAll),
            directory: None,
            active_calls: DashMap::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn CallPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn server_id(&self) -> &str {
        self.bridge.server_id()
    }

    pub async fn initialize(&self) -> Result<(), BridgeError> {
        self.bridge.start().await.map_err(|e| {
            tracing::error!("Failed to start signaling bridge: {}", e);
            e
        })?;
        tracing::info!(server_id = %self.server_id(), "SignalingManager initialized");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.bridge.stop();
        tracing::info!(server_id = %self.server_id(), "SignalingManager shut down");
    }

    /// Resolve a session token to the user id it belongs to
    pub async fn authenticate_connection(&self, token: &str) -> Result<String, ErrorCode> {
        let Some(directory) = &self.directory else {
            return Err(ErrorCode::InvalidToken);
        };
        directory.authenticate(token).await.ok_or_else(|| {
            tracing::warn!("Rejected signaling connection with invalid token");
            ErrorCode::InvalidToken
        })
    }

    /// Attach a user's transport, replacing any previous one
    pub fn register_connection(
        &self,
        user_id: &str,
        transport: Arc<dyn SignalingTransport>,
    ) -> Result<(), SignalingError> {
        let total = {
            let mut connections = self.connections.write();
            if !connections.contains_key(user_id) && connections.len() >= self.config.max_connections {
                tracing::warn!(user_id = %user_id, limit = self.config.max_connections, "Connection limit reached");
                return Err(SignalingError::ConnectionLimit(self.config.max_connections));
            }
            connections.insert(user_id.to_string(), transport);
            connections.len()
        };

        let connections = Arc::clone(&self.connections);
        let counters = Arc::clone(&self.counters);
        let owner = user_id.to_string();
        self.bridge.register_local_user(user_id, move |payload| {
            if deliver_local(&connections, &counters, &owner, &payload).is_none() {
                tracing::debug!(user_id = %owner, "Bus message for user who just left");
            }
        });

        tracing::info!(user_id = %user_id, total, "Registered signaling connection");
        Ok(())
    }

    pub fn unregister_connection(&self, user_id: &str) {
        let removed = self.connections.write().remove(user_id).is_some();
        self.bridge.unregister_local_user(user_id);

        if let Some((_, peer)) = self.active_calls.remove(user_id) {
            self.active_calls.remove_if(&peer, |_, other| other == user_id);
        }

        if removed {
            tracing::info!(user_id = %user_id, "Unregistered signaling connection");
        }
    }

    pub fn is_user_connected(&self, user_id: &str) -> bool {
        self.connections.read().contains_key(user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Peer of the user's current call, if any
    pub fn active_call_peer(&self, user_id: &str) -> Option<String> {
        self.active_calls.get(user_id).map(|peer| peer.value().clone())
    }

    /// Deliver locally if the user is here, otherwise publish once on the bus
    pub async fn send_message(&self, user_id: &str, message: &str) -> Result<Delivery, SignalingError> {
        if let Some(result) = deliver_local(&self.connections, &self.counters, user_id, message) {
            return result.map(|()| Delivery::Local);
        }

        match self.bridge.publish_message(user_id, message).await {
            Ok(()) => {
                self.counters.bridged_deliveries.fetch_add(1, Ordering::Relaxed);
                Ok(Delivery::Bridged)
            }
            Err(e) => {
                self.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(user_id = %user_id, "User not reachable for signaling: {}", e);
                Err(e.into())
            }
        }
    }

    async fn send_error(&self, user_id: &str, code: ErrorCode, message: &str, context: Option<&str>) {
        self.counters.errors_sent.fetch_add(1, Ordering::Relaxed);
        let error = protocol::create_error(code, message, context);
        if let Err(e) = self.send_message(user_id, &error).await {
            tracing::debug!(user_id = %user_id, "Could not deliver call_error: {}", e);
        }
    }

    /// Route one message from an authenticated sender.
    ///
    /// Failures are reported back to the sender as `call_error` and also
    /// returned.
    pub async fn handle_message(&self, from_user_id: &str, raw: &str) -> Result<Delivery, ErrorCode> {
        let mut message = match protocol::parse_message(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(user_id = %from_user_id, "Error handling signaling message: {}", e);
                self.send_error(from_user_id, ErrorCode::InvalidMessage, &format!("Failed to parse message: {e}"), None)
                    .await;
                return Err(ErrorCode::InvalidMessage);
            }
        };

        let Some(kind) = protocol::message_type(&message) else {
            tracing::warn!(user_id = %from_user_id, "Unknown signaling message type");
            self.send_error(from_user_id, ErrorCode::InvalidMessage, "Unknown message type", None)
                .await;
            return Err(ErrorCode::InvalidMessage);
        };
        let context = Some(kind.as_str());

        if !protocol::validate_message(&message, kind) {
            tracing::warn!(user_id = %from_user_id, kind = %kind, "Signaling message missing required fields");
            self.send_error(from_user_id, ErrorCode::InvalidMessage, "Missing required fields", context)
                .await;
            return Err(ErrorCode::InvalidMessage);
        }

        let Some(target) = protocol::extract_target_user(&message) else {
            tracing::warn!(user_id = %from_user_id, "No target user in signaling message");
            self.send_error(from_user_id, ErrorCode::InvalidMessage, "No target user", context)
                .await;
            return Err(ErrorCode::InvalidMessage);
        };

        if target == from_user_id {
            tracing::warn!(user_id = %from_user_id, kind = %kind, "Signaling message addressed to its sender");
            self.send_error(from_user_id, ErrorCode::InvalidMessage, "Message addressed to sender", context)
                .await;
            return Err(ErrorCode::InvalidMessage);
        }

        if kind.opens_call() {
            if let Err(code) = self.admit_call(from_user_id, &target).await {
                tracing::info!(from = %from_user_id, to = %target, code = %code, "Call attempt rejected");
                self.send_error(from_user_id, code, code.default_message(), context)
                    .await;
                return Err(code);
            }
        }

        message.insert("from_user_id".into(), Value::String(from_user_id.to_string()));
        let payload = Value::Object(message).to_string();
        self.counters.messages_routed.fetch_add(1, Ordering::Relaxed);

        match self.send_message(&target, &payload).await {
            Ok(delivery) => {
                match kind {
                    kind if kind.opens_call() => self.pair(from_user_id, &target),
                    MessageType::CallEnd => self.unpair(from_user_id, &target),
                    _ => {}
                }
                tracing::debug!(from = %from_user_id, to = %target, ?delivery, "Routed signaling message");
                Ok(delivery)
            }
            Err(e) => {
                tracing::warn!(from = %from_user_id, to = %target, "Delivery failed: {}", e);
                if kind == MessageType::CallEnd {
                    self.unpair(from_user_id, &target);
                }
                if kind != MessageType::CallError {
                    self.send_error(from_user_id, ErrorCode::UserOffline, ErrorCode::UserOffline.default_message(), context)
                        .await;
                }
                Err(ErrorCode::UserOffline)
            }
        }
    }

    async fn admit_call(&self, caller: &str, callee: &str) -> Result<(), ErrorCode> {
        for (user, other) in [(caller, callee), (callee, caller)] {
            if let Some(peer) = self.active_calls.get(user) {
                if peer.value() != other {
                    return Err(ErrorCode::CallInProgress);
                }
            }
        }
        self.policy.authorize_call(caller, callee).await
    }

    fn pair(&self, a: &str, b: &str) {
        self.active_calls.insert(a.to_string(), b.to_string());
        self.active_calls.insert(b.to_string(), a.to_string());
    }

    fn unpair(&self, a: &str, b: &str) {
        self.active_calls.remove_if(a, |_, peer| peer == b);
        self.active_calls.remove_if(b, |_, peer| peer == a);
    }

    pub fn statistics(&self) -> SignalingStatistics {
        let c = &self.counters;
        SignalingStatistics {
            connections: self.connection_count(),
            active_calls: self.active_calls.len() / 2,
            messages_routed: c.messages_routed.load(Ordering::Relaxed),
            local_deliveries: c.local_deliveries.load(Ordering::Relaxed),
            bridged_deliveries: c.bridged_deliveries.load(Ordering::Relaxed),
            delivery_failures: c.delivery_failures.load(Ordering::Relaxed),
            errors_sent: c.errors_sent.load(Ordering::Relaxed),
            bridge: self.bridge.statistics(),
        }
    }
}

impl Drop for SignalingManager {
    fn drop(&mut self) {
        self.bridge.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::access::testing::StaticDirectory;
    use crate::signaling::access::{DirectoryCallPolicy, VoipAccessControl};
    use crate::signaling::bridge::InMemoryBus;
    use std::time::Duration;

    struct BrokenTransport;

    impl SignalingTransport for BrokenTransport {
        fn send(&self, _message: &str) -> Result<(), SignalingError> {
            Err(SignalingError::TransportClosed)
        }
    }

    async fn manager(bus: Arc<InMemoryBus>, server: &str) -> SignalingManager {
        let bridge = Arc::new(RedisSignalingBridge::new(bus, server));
        let manager = SignalingManager::new(SignalingConfig::default(), bridge);
        manager.initialize().await.unwrap();
        manager
    }

    fn connect(manager: &SignalingManager, user: &str) -> mpsc::Receiver<String> {
        let (transport, rx) = ChannelTransport::new(16);
        manager.register_connection(user, Arc::new(transport)).unwrap();
        rx
    }

    fn parse(raw: &str) -> protocol::Message {
        protocol::parse_message(raw).unwrap()
    }

    #[tokio::test]
    async fn test_local_delivery_skips_bridge() {
        let bus = Arc::new(InMemoryBus::new());
        let manager = manager(bus.clone(), "a").await;
        let mut bob = connect(&manager, "bob");

        let delivery = manager.send_message("bob", "hello").await.unwrap();
        assert_eq!(delivery, Delivery::Local);
        assert_eq!(bob.recv().await.unwrap(), "hello");
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_remote_user_published_exactly_once() {
        let bus = Arc::new(InMemoryBus::new());
        let manager = manager(bus.clone(), "a").await;

        let delivery = manager.send_message("carol", "hello").await.unwrap();
        assert_eq!(delivery, Delivery::Bridged);
        assert_eq!(bus.published().len(), 1);
        assert_eq!(bus.published()[0].channel, "voip:user:carol");
        assert_eq!(bus.published()[0].payload, "hello");
        assert_eq!(manager.statistics().bridged_deliveries, 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_delivery_failure() {
        let bus = Arc::new(InMemoryBus::new());
        let manager = manager(bus.clone(), "a").await;
        manager.register_connection("bob", Arc::new(BrokenTransport)).unwrap();

        assert!(manager.send_message("bob", "x").await.is_err());
        // No fallback to the bus for a local user
        assert!(bus.published().is_empty());
        assert_eq!(manager.statistics().delivery_failures, 1);
    }

    #[tokio::test]
    async fn test_handle_message_stamps_sender() {
        let bus = Arc::new(InMemoryBus::new());
        let manager = manager(bus, "a").await;
        let _alice = connect(&manager, "alice");
        let mut bob = connect(&manager, "bob");

        let spoofed = r#"{"type":"call_offer","caller_id":"alice","callee_id":"bob","offer":"v=0","from_user_id":"mallory"}"#;
        assert_eq!(manager.handle_message("alice", spoofed).await, Ok(Delivery::Local));

        let received = parse(&bob.recv().await.unwrap());
        assert_eq!(received["from_user_id"], "alice");
        assert_eq!(received["offer"], "v=0");
        assert_eq!(manager.active_call_peer("bob").as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_answer_routes_back_to_caller() {
        let bus = Arc::new(InMemoryBus::new());
        let manager = manager(bus, "a").await;
        let mut alice = connect(&manager, "alice");
        let _bob = connect(&manager, "bob");

        let answer = protocol::reply_to_caller(&protocol::create_call_answer("alice", "bob", "v=0"));
        manager.handle_message("bob", &answer).await.unwrap();
        let received = parse(&alice.recv().await.unwrap());
        assert_eq!(received["type"], "call_answer");
        assert_eq!(received["from_user_id"], "bob");
    }

    #[tokio::test]
    async fn test_invalid_messages_not_routed() {
        let bus = Arc::new(InMemoryBus::new());
        let manager = manager(bus.clone(), "a").await;
        let mut alice = connect(&manager, "alice");
        let mut bob = connect(&manager, "bob");

        for raw in [
            r#"{"type":"call_offer","callee_id":"bob"}"#,
            r#"{"type":"bogus","callee_id":"bob"}"#,
            r#"{"callee_id":"bob"}"#,
        ] {
            assert_eq!(manager.handle_message("alice", raw).await, Err(ErrorCode::InvalidMessage), "{raw}");
            let error = parse(&alice.recv().await.unwrap());
            assert_eq!(error["type"], "call_error");
            assert_eq!(error["error_code"], ErrorCode::InvalidMessage.code());
        }

        assert!(bob.try_recv().is_err());
        assert!(bus.published().is_empty());
        assert_eq!(manager.active_call_peer("alice"), None);
        assert_eq!(manager.statistics().messages_routed, 0);
    }

    #[tokio::test]
    async fn test_first_target_field_wins() {
        let bus = Arc::new(InMemoryBus::new());
        let manager = manager(bus, "a").await;
        let mut alice = connect(&manager, "alice");
        let mut bob = connect(&manager, "bob");
        let mut carol = connect(&manager, "carol");

        let conflicting = r#"{"type":"call_init","caller_id":"bob","callee_id":"carol","target_user_id":"alice"}"#;
        assert_eq!(manager.handle_message("bob", conflicting).await, Ok(Delivery::Local));
        assert_eq!(parse(&carol.recv().await.unwrap())["from_user_id"], "bob");
        assert!(alice.try_recv().is_err());

        // callee_id names the sender: rejected rather than rerouted
        let self_addressed = protocol::create_call_answer("alice", "bob", "v=0");
        assert_eq!(manager.handle_message("bob", &self_addressed).await, Err(ErrorCode::InvalidMessage));
        let error = parse(&bob.recv().await.unwrap());
        assert_eq!(error["context"], "call_answer");
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_message_answered_with_error() {
        let bus = Arc::new(InMemoryBus::new());
        let manager = manager(bus, "a").await;
        let mut alice = connect(&manager, "alice");

        assert_eq!(manager.handle_message("alice", "{oops").await, Err(ErrorCode::InvalidMessage));
        let error = parse(&alice.recv().await.unwrap());
        assert_eq!(error["type"], "call_error");
        assert_eq!(error["error_code"], ErrorCode::InvalidMessage.code());

        assert_eq!(
            manager.handle_message("alice", r#"{"type":"call_end"}"#).await,
            Err(ErrorCode::InvalidMessage)
        );
        assert_eq!(parse(&alice.recv().await.unwrap())["context"], "call_end");
    }

    #[tokio::test]
    async fn test_offline_target_reported() {
        let bus = Arc::new(InMemoryBus::new());
        let manager = manager(bus.clone(), "a").await;
        let mut alice = connect(&manager, "alice");
        bus.set_fail_publish(true);

        let offer = protocol::create_call_offer("alice", "dave", "v=0");
        assert_eq!(manager.handle_message("alice", &offer).await, Err(ErrorCode::UserOffline));
        let error = parse(&alice.recv().await.unwrap());
        assert_eq!(error["error"], "user-offline");
        assert_eq!(manager.active_call_peer("alice"), None);
    }

    #[tokio::test]
    async fn test_busy_detection() {
        let bus = Arc::new(InMemoryBus::new());
        let manager = manager(bus, "a").await;
        let _alice = connect(&manager, "alice");
        let _bob = connect(&manager, "bob");
        let mut carol = connect(&manager, "carol");

        let offer = protocol::create_call_offer("alice", "bob", "v=0");
        manager.handle_message("alice", &offer).await.unwrap();

        let intrusion = protocol::create_call_offer("carol", "bob", "v=0");
        assert_eq!(manager.handle_message("carol", &intrusion).await, Err(ErrorCode::CallInProgress));
        assert_eq!(parse(&carol.recv().await.unwrap())["error"], "call-in-progress");

        // Renegotiation inside the same call is fine
        manager.handle_message("alice", &offer).await.unwrap();

        let end = protocol::create_call_end("alice", "bob", "user_ended");
        manager.handle_message("alice", &end).await.unwrap();
        assert_eq!(manager.statistics().active_calls, 0);
        assert!(manager.handle_message("carol", &intrusion).await.is_ok());
    }

    #[tokio::test]
    async fn test_policy_rejection() {
        let directory = StaticDirectory::default()
            .with_user("alice", "2023-01-01 00:00:00+00")
            .with_user("newbie", "2030-01-01 00:00:00+00");
        let policy = DirectoryCallPolicy::new(directory.clone(), VoipAccessControl::new(1_705_314_645, true));

        let bridge = Arc::new(RedisSignalingBridge::new(Arc::new(InMemoryBus::new()), "a"));
        let manager = SignalingManager::new(SignalingConfig::default(), bridge)
            .with_policy(Arc::new(policy))
            .with_directory(Arc::new(directory));
        manager.initialize().await.unwrap();
        let mut newbie = connect(&manager, "newbie");
        let _alice = connect(&manager, "alice");

        let offer = protocol::create_call_offer("newbie", "alice", "v=0");
        assert_eq!(manager.handle_message("newbie", &offer).await, Err(ErrorCode::FeatureLocked));
        let error = parse(&newbie.recv().await.unwrap());
        assert_eq!(error["error"], "feature-locked");
        assert_eq!(error["context"], "call_offer");

        // Non-call messages are not gated
        let ice = protocol::create_call_ice_candidate(
            "newbie",
            "alice",
            &crate::nat::IceCandidate::new("candidate:1", "0", 0),
        );
        assert!(manager.handle_message("newbie", &ice).await.is_ok());

        assert_eq!(manager.authenticate_connection("token-alice").await.as_deref(), Ok("alice"));
        assert_eq!(manager.authenticate_connection("forged").await, Err(ErrorCode::InvalidToken));
    }

    #[tokio::test]
    async fn test_connection_limit_and_unregister() {
        let bridge = Arc::new(RedisSignalingBridge::new(Arc::new(InMemoryBus::new()), "a"));
        let config = SignalingConfig {
            max_connections: 1,
            ..SignalingConfig::default()
        };
        let manager = SignalingManager::new(config, bridge.clone());

        let (first, _rx1) = ChannelTransport::new(1);
        let (second, _rx2) = ChannelTransport::new(1);
        manager.register_connection("alice", Arc::new(first.clone())).unwrap();
        assert!(matches!(
            manager.register_connection("bob", Arc::new(second)),
            Err(SignalingError::ConnectionLimit(1))
        ));
        // Re-registering the same user replaces the transport
        manager.register_connection("alice", Arc::new(first)).unwrap();
        assert_eq!(manager.connection_count(), 1);
        assert!(bridge.is_user_local("alice"));

        manager.unregister_connection("alice");
        assert!(!manager.is_user_connected("alice"));
        assert!(!bridge.is_user_local("alice"));
    }

    #[tokio::test]
    async fn test_bus_message_reaches_local_user() {
        let bus = Arc::new(InMemoryBus::new());
        let server_a = manager(bus.clone(), "a").await;
        let server_b = manager(bus.clone(), "b").await;
        let mut bob = connect(&server_b, "bob");

        server_a.send_message("bob", "via bus").await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), bob.recv()).await.unwrap();
        assert_eq!(received.as_deref(), Some("via bus"));
        assert_eq!(server_b.statistics().local_deliveries, 1);
    }
}
