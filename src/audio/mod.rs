//! Audio subsystem module

pub mod buffer;
pub mod device;
pub mod engine;
pub mod jitter;

pub use buffer::{Consumer, Producer, RingBuffer};
pub use device::{
    list_devices, AudioBackend, AudioDeviceInfo, CpalBackend, DeviceStream, StreamFormat,
};
pub use engine::{AudioEngine, AudioStatistics};
pub use jitter::{JitterBuffer, JitterConfig, JitterStatistics, Packet};
