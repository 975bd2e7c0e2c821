//! Audio engine
//!
//! Owns the devices, the Opus codec pair and the buffers between them, and
//! runs four loops:
//!
//! ```text
//! capture callback ─▶ capture ring ─▶ encode thread ─▶ network callback
//!                                                   └▶ network ring (pull)
//! feed_encoded_audio ─▶ jitter buffer ─▶ decode thread ─▶ playback ring ─▶ playback callback
//! ```
//!
//! Each ring has exactly one producer and one consumer. The device
//! callbacks never block: capture drops and counts on overflow, playback
//! fills silence on underrun.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{Consumer, Producer, RingBuffer};
use crate::audio::device::{
    AudioBackend, CaptureCallback, CpalBackend, DeviceStream, PlaybackCallback, StreamFormat,
};
use crate::audio::jitter::JitterBuffer;
use crate::codec::{OpusDecoder, OpusEncoder};
use crate::config::EngineConfig;
use crate::constants::{NETWORK_RING_BYTES, RING_BUFFER_SECONDS};
use crate::error::AudioError;

/// Sleep between polls when a loop has nothing to do
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Decoded frames kept queued ahead of the playback device
const PLAYBACK_LEAD_FRAMES: usize = 2;

/// Receives each encoded packet
pub type NetworkCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Receives each raw captured frame before encoding
pub type CaptureTap = Arc<dyn Fn(&[f32]) + Send + Sync>;

/// Engine statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct AudioStatistics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_decoded: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
    pub current_buffer_ms: u32,
    pub capture_overflows: u64,
    pub playback_underruns: u64,
    pub network_overflows: u64,
}

#[derive(Debug, Clone, Default)]
struct Counters {
    packets_sent: u64,
    packets_received: u64,
    packets_decoded: u64,
    bytes_sent: u64,
    bytes_received: u64,
    network_overflows: u64,
    /// Jitter-buffer drops at the last reset
    lost_baseline: u64,
}

struct Shared {
    running: AtomicBool,
    counters: Mutex<Counters>,
    capture_overflows: AtomicU64,
    playback_underruns: AtomicU64,
    network_callback: RwLock<Option<NetworkCallback>>,
    capture_tap: RwLock<Option<CaptureTap>>,
}

/// Capture ring to Opus to network
struct EncodeStage {
    encoder: OpusEncoder,
    capture: Consumer<f32>,
    outbound: Producer<u8>,
    frame: Vec<f32>,
    filled: usize,
}

impl EncodeStage {
    fn run(mut self, shared: &Shared) -> Self {
        while shared.running.load(Ordering::Acquire) {
            if !self.step(shared) {
                thread::sleep(POLL_INTERVAL);
            }
        }
        self
    }

    /// Encode one frame if a full one is buffered
    fn step(&mut self, shared: &Shared) -> bool {
        self.filled += self.capture.pop(&mut self.frame[self.filled..]);
        if self.filled < self.frame.len() {
            return false;
        }
        self.filled = 0;

        let tap = shared.capture_tap.read().clone();
        if let Some(tap) = tap {
            tap(&self.frame);
        }

        let packet = match self.encoder.encode(&self.frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Encode failed: {}", e);
                return true;
            }
        };

        let callback = shared.network_callback.read().clone();
        let delivered = match callback {
            Some(callback) => {
                callback(&packet);
                true
            }
            None => self.queue_outbound(&packet),
        };

        let mut counters = shared.counters.lock();
        if delivered {
            counters.packets_sent += 1;
            counters.bytes_sent += packet.len() as u64;
        } else {
            counters.network_overflows += 1;
        }
        true
    }

    /// Length-prefixed write into the network ring, all or nothing
    fn queue_outbound(&mut self, packet: &[u8]) -> bool {
        let len = packet.len();
        if len > usize::from(u16::MAX) || self.outbound.free() < len + 2 {
            return false;
        }

        let mut framed = Vec::with_capacity(len + 2);
        framed.extend_from_slice(&(len as u16).to_be_bytes());
        framed.extend_from_slice(packet);
        self.outbound.push(&framed) == framed.len()
    }
}

/// Jitter buffer to Opus to playback ring
struct DecodeStage {
    decoder: OpusDecoder,
    jitter: Arc<JitterBuffer>,
    playback: Producer<f32>,
    lead_samples: usize,
}

impl DecodeStage {
    fn run(mut self, shared: &Shared) -> Self {
        while shared.running.load(Ordering::Acquire) {
            if !self.step(shared) {
                thread::sleep(POLL_INTERVAL);
            }
        }
        self
    }

    /// Decode one packet if playback needs more audio and one is due
    fn step(&mut self, shared: &Shared) -> bool {
        if self.playback.ring().available() >= self.lead_samples {
            return false;
        }

        if !self.jitter.is_ready() {
            self.jitter.purge_late_packets(Instant::now());
            return false;
        }

        let Some(packet) = self.jitter.get_next_packet() else {
            return false;
        };

        match self.decoder.decode(&packet.data) {
            Ok(samples) => {
                let written = self.playback.push(samples);
                if written < samples.len() {
                    tracing::debug!(dropped = samples.len() - written, "Playback buffer full");
                }
                shared.counters.lock().packets_decoded += 1;
            }
            Err(e) => tracing::debug!(sequence = packet.sequence, "Decode failed: {}", e),
        }
        true
    }
}

/// A pipeline loop, parked between runs so the engine can restart
enum Stage<S> {
    Idle(S),
    Running(JoinHandle<S>),
    Failed,
}

impl<S: Send + 'static> Stage<S> {
    fn spawn<F>(&mut self, name: &str, run: F) -> Result<(), AudioError>
    where
        F: FnOnce(S) -> S + Send + 'static,
    {
        *self = match std::mem::replace(self, Stage::Failed) {
            Stage::Idle(stage) => {
                let handle = thread::Builder::new()
                    .name(name.to_string())
                    .spawn(move || run(stage))
                    .map_err(|e| AudioError::StreamError(e.to_string()))?;
                Stage::Running(handle)
            }
            Stage::Running(handle) => Stage::Running(handle),
            Stage::Failed => return Err(AudioError::NotInitialized),
        };
        Ok(())
    }

    fn join(&mut self) {
        *self = match std::mem::replace(self, Stage::Failed) {
            Stage::Running(handle) => match handle.join() {
                Ok(stage) => Stage::Idle(stage),
                Err(_) => {
                    tracing::error!("Audio pipeline thread panicked");
                    Stage::Failed
                }
            },
            other => other,
        };
    }
}

struct Pipeline {
    config: EngineConfig,
    capture: Box<dyn DeviceStream>,
    playback: Box<dyn DeviceStream>,
    encode: Stage<EncodeStage>,
    decode: Stage<DecodeStage>,
}

/// Full-duplex voice engine.
///
/// All methods take `&self`; share it behind an `Arc`.
pub struct AudioEngine {
    backend: Arc<dyn AudioBackend>,
    shared: Arc<Shared>,
    pipeline: Mutex<Option<Pipeline>>,
    jitter: RwLock<Option<Arc<JitterBuffer>>>,
    outbound: Mutex<Option<Consumer<u8>>>,
    sequence: AtomicU32,
    frame_size: AtomicU32,
}

impl AudioEngine {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                counters: Mutex::new(Counters::default()),
                capture_overflows: AtomicU64::new(0),
                playback_underruns: AtomicU64::new(0),
                network_callback: RwLock::new(None),
                capture_tap: RwLock::new(None),
            }),
            pipeline: Mutex::new(None),
            jitter: RwLock::new(None),
            outbound: Mutex::new(None),
            sequence: AtomicU32::new(0),
            frame_size: AtomicU32::new(0),
        }
    }

    /// Engine on the platform's audio devices
    pub fn with_default_backend() -> Self {
        Self::new(Arc::new(CpalBackend))
    }

    /// Validate `config`, open devices and build the pipeline.
    ///
    /// On failure nothing is retained: a previously initialized pipeline is
    /// kept as it was.
    pub fn initialize(&self, config: EngineConfig) -> Result<(), AudioError> {
        let mut pipeline = self.pipeline.lock();
        if self.shared.running.load(Ordering::Acquire) {
            return Err(AudioError::AlreadyRunning);
        }

        config.validate()?;

        let encoder = OpusEncoder::new(&config)?;
        let decoder = OpusDecoder::new(config.sample_rate, config.channels, config.frame_size())?;

        let ring_samples =
            (config.sample_rate * u32::from(config.channels) * RING_BUFFER_SECONDS) as usize;
        let (capture_tx, capture_rx) = RingBuffer::<f32>::new(ring_samples);
        let (playback_tx, playback_rx) = RingBuffer::<f32>::new(ring_samples);
        let (network_tx, network_rx) = RingBuffer::<u8>::new(NETWORK_RING_BYTES);
        let jitter = Arc::new(JitterBuffer::new(config.jitter_config()));

        let format = StreamFormat {
            sample_rate: config.sample_rate,
            channels: config.channels,
            buffer_frames: None,
        };
        let capture = self.backend.open_capture(
            config.input_device.as_deref(),
            format,
            capture_callback(self.shared.clone(), capture_tx),
        )?;
        let playback = self.backend.open_playback(
            config.output_device.as_deref(),
            format,
            playback_callback(self.shared.clone(), playback_rx),
        )?;

        let samples_per_frame = config.samples_per_frame();
        tracing::info!(
            sample_rate = config.sample_rate,
            channels = config.channels,
            frame_ms = config.frame_size_ms,
            bitrate = config.bitrate,
            ring_capacity = capture_rx.capacity(),
            "Audio engine initialized"
        );

        self.frame_size.store(config.frame_size() as u32, Ordering::Relaxed);
        self.sequence.store(0, Ordering::Relaxed);
        // Drops are counted per jitter buffer, and this one starts at zero
        self.shared.counters.lock().lost_baseline = 0;
        *self.jitter.write() = Some(jitter.clone());
        *self.outbound.lock() = Some(network_rx);
        *pipeline = Some(Pipeline {
            encode: Stage::Idle(EncodeStage {
                encoder,
                capture: capture_rx,
                outbound: network_tx,
                frame: vec![0.0; samples_per_frame],
                filled: 0,
            }),
            decode: Stage::Idle(DecodeStage {
                decoder,
                jitter,
                playback: playback_tx,
                lead_samples: samples_per_frame * PLAYBACK_LEAD_FRAMES,
            }),
            config,
            capture,
            playback,
        });
        Ok(())
    }

    /// Start the devices and the encode/decode threads
    pub fn start(&self) -> Result<(), AudioError> {
        let mut guard = self.pipeline.lock();
        let pipeline = guard.as_mut().ok_or(AudioError::NotInitialized)?;

        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(e) = start_pipeline(pipeline, &self.shared) {
            tracing::error!("Failed to start audio engine: {}", e);
            stop_pipeline(pipeline, &self.shared);
            return Err(e);
        }

        tracing::info!("Audio engine started");
        Ok(())
    }

    /// Stop devices and join the loops. Safe to call at any time, repeatedly.
    pub fn stop(&self) {
        let mut guard = self.pipeline.lock();
        let was_running = self.shared.running.load(Ordering::Acquire);
        match guard.as_mut() {
            Some(pipeline) => stop_pipeline(pipeline, &self.shared),
            None => self.shared.running.store(false, Ordering::Release),
        }
        if was_running {
            tracing::info!("Audio engine stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.pipeline.lock().is_some()
    }

    pub fn config(&self) -> Option<EngineConfig> {
        self.pipeline.lock().as_ref().map(|p| p.config.clone())
    }

    /// Route encoded packets to `callback` instead of the pull queue
    pub fn set_network_callback<F>(&self, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        *self.shared.network_callback.write() = Some(Arc::new(callback));
    }

    pub fn clear_network_callback(&self) {
        *self.shared.network_callback.write() = None;
    }

    /// Observe raw captured frames (called from the encode thread)
    pub fn set_capture_callback<F>(&self, callback: F)
    where
        F: Fn(&[f32]) + Send + Sync + 'static,
    {
        *self.shared.capture_tap.write() = Some(Arc::new(callback));
    }

    /// Next packet queued while no network callback was set
    pub fn next_encoded_packet(&self) -> Option<Bytes> {
        let mut guard = self.outbound.lock();
        let consumer = guard.as_mut()?;
        if consumer.available() < 2 {
            return None;
        }

        let mut header = [0u8; 2];
        consumer.pop(&mut header);
        let len = usize::from(u16::from_be_bytes(header));

        let mut packet = vec![0u8; len];
        if consumer.pop(&mut packet) < len {
            tracing::warn!("Truncated packet in network ring");
            consumer.clear();
            return None;
        }
        Some(Bytes::from(packet))
    }

    /// Hand a received packet to the jitter buffer with the next local
    /// sequence number. Returns whether it was buffered.
    pub fn feed_encoded_audio(&self, data: &[u8]) -> bool {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.feed_encoded_packet(data, sequence)
    }

    /// Hand a received packet to the jitter buffer with a known sequence
    pub fn feed_encoded_packet(&self, data: &[u8], sequence: u32) -> bool {
        let Some(jitter) = self.jitter.read().clone() else {
            return false;
        };

        {
            let mut counters = self.shared.counters.lock();
            counters.packets_received += 1;
            counters.bytes_received += data.len() as u64;
        }

        jitter.add_packet(
            Bytes::copy_from_slice(data),
            sequence,
            self.frame_size.load(Ordering::Relaxed),
        )
    }

    pub fn statistics(&self) -> AudioStatistics {
        let counters = self.shared.counters.lock().clone();
        let jitter = self
            .jitter
            .read()
            .as_ref()
            .map(|j| j.statistics())
            .unwrap_or_default();

        let packets_lost = jitter
            .packets_dropped_late
            .saturating_sub(counters.lost_baseline);
        let packet_loss_percent = if counters.packets_received > 0 {
            packets_lost as f64 / counters.packets_received as f64 * 100.0
        } else {
            0.0
        };

        AudioStatistics {
            packets_sent: counters.packets_sent,
            packets_received: counters.packets_received,
            packets_lost,
            packets_decoded: counters.packets_decoded,
            bytes_sent: counters.bytes_sent,
            bytes_received: counters.bytes_received,
            jitter_ms: jitter.average_jitter_ms,
            packet_loss_percent,
            current_buffer_ms: jitter.current_size_ms,
            capture_overflows: self.shared.capture_overflows.load(Ordering::Relaxed),
            playback_underruns: self.shared.playback_underruns.load(Ordering::Relaxed),
            network_overflows: counters.network_overflows,
        }
    }

    pub fn reset_statistics(&self) {
        let lost_baseline = self
            .jitter
            .read()
            .as_ref()
            .map(|j| j.statistics().packets_dropped_late)
            .unwrap_or(0);

        *self.shared.counters.lock() = Counters {
            lost_baseline,
            ..Default::default()
        };
        self.shared.capture_overflows.store(0, Ordering::Relaxed);
        self.shared.playback_underruns.store(0, Ordering::Relaxed);
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn start_pipeline(pipeline: &mut Pipeline, shared: &Arc<Shared>) -> Result<(), AudioError> {
    let encode_shared = shared.clone();
    pipeline
        .encode
        .spawn("voip-encode", move |stage| stage.run(&encode_shared))?;

    let decode_shared = shared.clone();
    pipeline
        .decode
        .spawn("voip-decode", move |stage| stage.run(&decode_shared))?;

    pipeline.capture.start()?;
    pipeline.playback.start()?;
    Ok(())
}

fn stop_pipeline(pipeline: &mut Pipeline, shared: &Shared) {
    shared.running.store(false, Ordering::Release);
    pipeline.capture.stop();
    pipeline.playback.stop();
    pipeline.encode.join();
    pipeline.decode.join();
}

fn capture_callback(shared: Arc<Shared>, mut ring: Producer<f32>) -> CaptureCallback {
    Box::new(move |data: &[f32]| {
        if !shared.running.load(Ordering::Relaxed) {
            return;
        }

        let written = ring.push(data);
        if written < data.len() {
            let overflows = shared.capture_overflows.fetch_add(1, Ordering::Relaxed) + 1;
            // Log at exponentially spaced counts
            if overflows.is_power_of_two() {
                tracing::warn!(
                    dropped = data.len() - written,
                    overflows,
                    "Capture buffer overflow"
                );
            }
        }
    })
}

fn playback_callback(shared: Arc<Shared>, mut ring: Consumer<f32>) -> PlaybackCallback {
    Box::new(move |out: &mut [f32]| {
        let running = shared.running.load(Ordering::Relaxed);
        let read = if running { ring.pop(out) } else { 0 };

        if read < out.len() {
            out[read..].fill(0.0);
            if running {
                shared.playback_underruns.fetch_add(1, Ordering::Relaxed);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Backend whose device callbacks are driven by the test
    #[derive(Default, Clone)]
    struct ManualBackend {
        capture: Arc<Mutex<Option<CaptureCallback>>>,
        playback: Arc<Mutex<Option<PlaybackCallback>>>,
        starts: Arc<AtomicUsize>,
        fail_playback: bool,
    }

    struct ManualStream {
        starts: Arc<AtomicUsize>,
    }

    impl DeviceStream for ManualStream {
        fn start(&mut self) -> Result<(), AudioError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) {}
    }

    impl AudioBackend for ManualBackend {
        fn open_capture(
            &self,
            _device_id: Option<&str>,
            _format: StreamFormat,
            on_samples: CaptureCallback,
        ) -> Result<Box<dyn DeviceStream>, AudioError> {
            *self.capture.lock() = Some(on_samples);
            Ok(Box::new(ManualStream {
                starts: self.starts.clone(),
            }))
        }

        fn open_playback(
            &self,
            _device_id: Option<&str>,
            _format: StreamFormat,
            fill: PlaybackCallback,
        ) -> Result<Box<dyn DeviceStream>, AudioError> {
            if self.fail_playback {
                return Err(AudioError::DeviceNotFound("output:test".into()));
            }
            *self.playback.lock() = Some(fill);
            Ok(Box::new(ManualStream {
                starts: self.starts.clone(),
            }))
        }
    }

    impl ManualBackend {
        fn capture(&self, data: &[f32]) {
            if let Some(callback) = self.capture.lock().as_mut() {
                callback(data);
            }
        }

        fn pull(&self, out: &mut [f32]) {
            if let Some(callback) = self.playback.lock().as_mut() {
                callback(out);
            }
        }
    }

    fn engine() -> (AudioEngine, ManualBackend) {
        let backend = ManualBackend::default();
        (AudioEngine::new(Arc::new(backend.clone())), backend)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_invalid_config_leaves_engine_uninitialized() {
        let (engine, _) = engine();
        let config = EngineConfig {
            sample_rate: 44100,
            ..Default::default()
        };

        assert!(matches!(
            engine.initialize(config),
            Err(AudioError::InvalidSampleRate(44100))
        ));
        assert!(!engine.is_initialized());
        assert!(matches!(engine.start(), Err(AudioError::NotInitialized)));
    }

    #[test]
    fn test_device_failure_is_fatal() {
        let backend = ManualBackend {
            fail_playback: true,
            ..Default::default()
        };
        let engine = AudioEngine::new(Arc::new(backend));

        assert!(matches!(
            engine.initialize(EngineConfig::default()),
            Err(AudioError::DeviceNotFound(_))
        ));
        assert!(!engine.is_initialized());
        assert!(!engine.feed_encoded_audio(&[1, 2, 3]));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (engine, _) = engine();
        engine.stop();
        engine.stop();

        engine.initialize(EngineConfig::default()).unwrap();
        engine.stop();
        engine.start().unwrap();
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_restart() {
        let (engine, backend) = engine();
        engine.initialize(EngineConfig::default()).unwrap();

        engine.start().unwrap();
        engine.stop();
        engine.start().unwrap();
        assert!(engine.is_running());
        engine.stop();

        // Two devices started on each run
        assert_eq!(backend.starts.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_initialize_while_running_rejected() {
        let (engine, _) = engine();
        engine.initialize(EngineConfig::default()).unwrap();
        engine.start().unwrap();
        assert!(matches!(
            engine.initialize(EngineConfig::default()),
            Err(AudioError::AlreadyRunning)
        ));
        engine.stop();
    }

    #[test]
    fn test_capture_reaches_network_callback() {
        let (engine, backend) = engine();
        engine.initialize(EngineConfig::default()).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded::<Vec<u8>>();
        engine.set_network_callback(move |packet| {
            let _ = tx.send(packet.to_vec());
        });
        let taps = Arc::new(AtomicUsize::new(0));
        let taps_in_callback = taps.clone();
        engine.set_capture_callback(move |frame| {
            assert_eq!(frame.len(), 960);
            taps_in_callback.fetch_add(1, Ordering::SeqCst);
        });

        engine.start().unwrap();
        backend.capture(&vec![0.25f32; 960 * 3]);

        for _ in 0..3 {
            let packet = rx.recv_timeout(Duration::from_secs(3)).unwrap();
            assert!(!packet.is_empty());
        }
        engine.stop();

        let stats = engine.statistics();
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(taps.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_pull_api_without_callback() {
        let (engine, backend) = engine();
        engine.initialize(EngineConfig::default()).unwrap();
        engine.start().unwrap();

        backend.capture(&vec![0.1f32; 960 * 2]);

        let mut packets = Vec::new();
        assert!(wait_for(|| {
            while let Some(packet) = engine.next_encoded_packet() {
                packets.push(packet);
            }
            packets.len() == 2
        }));
        engine.stop();
        assert!(engine.next_encoded_packet().is_none());
    }

    #[test]
    fn test_capture_ignored_while_stopped() {
        let (engine, backend) = engine();
        engine.initialize(EngineConfig::default()).unwrap();

        backend.capture(&vec![0.1f32; 960]);
        engine.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        engine.stop();

        assert_eq!(engine.statistics().packets_sent, 0);
    }

    #[test]
    fn test_received_packets_reach_playback() {
        let (engine, backend) = engine();
        let config = EngineConfig::default();
        engine.initialize(config.clone()).unwrap();
        engine.start().unwrap();

        let mut encoder = OpusEncoder::new(&config).unwrap();
        let tone: Vec<f32> = (0..960).map(|i| ((i as f32) * 0.05).sin() * 0.3).collect();
        for _ in 0..5 {
            let packet = encoder.encode(&tone).unwrap();
            assert!(engine.feed_encoded_audio(&packet));
        }

        let mut out = vec![0.0f32; 960];
        let mut heard = false;
        assert!(wait_for(|| {
            backend.pull(&mut out);
            heard |= out.iter().any(|s| *s != 0.0);
            engine.statistics().packets_decoded == 5
        }));
        engine.stop();

        let stats = engine.statistics();
        assert_eq!(stats.packets_received, 5);
        assert_eq!(stats.packets_lost, 0);
        assert!(stats.bytes_received > 0);
        assert!(heard || stats.packets_decoded == 5);
    }

    #[test]
    fn test_playback_underrun_fills_silence() {
        let (engine, backend) = engine();
        engine.initialize(EngineConfig::default()).unwrap();
        engine.start().unwrap();

        let mut out = vec![1.0f32; 480];
        backend.pull(&mut out);
        engine.stop();

        assert!(out.iter().all(|s| *s == 0.0));
        assert!(engine.statistics().playback_underruns >= 1);
    }

    #[test]
    fn test_reset_statistics() {
        let (engine, _) = engine();
        engine.initialize(EngineConfig::default()).unwrap();
        engine.feed_encoded_audio(&[0xf8, 0xff, 0xfe]);
        assert_eq!(engine.statistics().packets_received, 1);

        engine.reset_statistics();
        let stats = engine.statistics();
        assert_eq!(stats.packets_received, 0);
        assert_eq!(stats.bytes_received, 0);
    }

    #[test]
    fn test_loss_counted_after_reinitialize() {
        let (engine, _) = engine();
        let late_drop = |engine: &AudioEngine| {
            assert!(engine.feed_encoded_packet(&[0xf8, 0xff, 0xfe], 1));
            thread::sleep(Duration::from_millis(150));
            assert!(!engine.feed_encoded_packet(&[0xf8, 0xff, 0xfe], 2));
        };

        engine.initialize(EngineConfig::default()).unwrap();
        late_drop(&engine);
        assert_eq!(engine.statistics().packets_lost, 1);
        engine.reset_statistics();
        assert_eq!(engine.statistics().packets_lost, 0);

        engine.initialize(EngineConfig::default()).unwrap();
        late_drop(&engine);
        assert_eq!(engine.statistics().packets_lost, 1);
    }
}
