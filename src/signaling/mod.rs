//! Call signaling: wire protocol, routing and the cross-server bridge

pub mod access;
pub mod bridge;
pub mod manager;
pub mod protocol;
#[cfg(feature = "redis-bus")]
pub mod redis_bus;

pub use access::{AllowAll, CallPolicy, DirectoryCallPolicy, UserDirectory, UserRecord, VoipAccessControl};
pub use bridge::{BusMessage, InMemoryBus, MessageBus, RedisSignalingBridge};
pub use manager::{ChannelTransport, Delivery, SignalingManager, SignalingStatistics, SignalingTransport};
pub use protocol::{ErrorCode, Message, MessageType, SignalingMessage};
#[cfg(feature = "redis-bus")]
pub use redis_bus::RedisBus;
