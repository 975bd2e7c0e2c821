//! Audio device enumeration and stream ownership
//!
//! The engine talks to devices through [`AudioBackend`], which hands back an
//! owned [`DeviceStream`] per direction. [`CpalBackend`] is the platform
//! implementation: each stream lives on its own thread because cpal streams
//! are not `Send` on every host.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use std::thread::{self, JoinHandle};

use crate::constants::SUPPORTED_SAMPLE_RATES;
use crate::error::AudioError;

/// Receives interleaved samples from a capture device
pub type CaptureCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Fills an interleaved output buffer for a playback device
pub type PlaybackCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Stream format requested from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Preferred callback size in frames, device default when `None`
    pub buffer_frames: Option<u32>,
}

/// An opened device stream. Dropping it releases the device.
pub trait DeviceStream: Send {
    fn start(&mut self) -> Result<(), AudioError>;
    fn stop(&mut self);
}

/// Opens capture and playback streams
pub trait AudioBackend: Send + Sync {
    fn open_capture(
        &self,
        device_id: Option<&str>,
        format: StreamFormat,
        on_samples: CaptureCallback,
    ) -> Result<Box<dyn DeviceStream>, AudioError>;

    fn open_playback(
        &self,
        device_id: Option<&str>,
        format: StreamFormat,
        fill: PlaybackCallback,
    ) -> Result<Box<dyn DeviceStream>, AudioError>;
}

/// Device description for listings
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// Wrapper around cpal device
pub struct AudioDevice {
    inner: cpal::Device,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
}

impl AudioDevice {
    pub fn from_cpal(device: cpal::Device, is_input: bool, is_output: bool) -> Self {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        Self {
            inner: device,
            name,
            is_input,
            is_output,
        }
    }

    pub fn inner(&self) -> &cpal::Device {
        &self.inner
    }

    pub fn into_inner(self) -> cpal::Device {
        self.inner
    }
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices: Vec<AudioDeviceInfo> = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = get_device_capabilities(&device, true);
                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);

                // Duplex devices are listed once
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default |= is_default;
                    continue;
                }

                let (sample_rates, channels) = get_device_capabilities(&device, false);
                devices.push(AudioDeviceInfo {
                    id: format!("output:{}", name),
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

/// Voice sample rates and channel counts a device supports
fn get_device_capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|iter| iter.collect())
            .unwrap_or_default()
    };

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();
    for config in &configs {
        for rate in SUPPORTED_SAMPLE_RATES {
            let sample_rate = cpal::SampleRate(rate);
            if sample_rate >= config.min_sample_rate()
                && sample_rate <= config.max_sample_rate()
                && !sample_rates.contains(&rate)
            {
                sample_rates.push(rate);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }

    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

/// Get a device by its id (`input:<name>` or `output:<name>`)
pub fn get_device_by_id(id: &str) -> Result<AudioDevice, AudioError> {
    let host = cpal::default_host();

    let (is_input, name) = if let Some(name) = id.strip_prefix("input:") {
        (true, name)
    } else if let Some(name) = id.strip_prefix("output:") {
        (false, name)
    } else {
        (true, id)
    };

    let mut devices = if is_input {
        host.input_devices()
    } else {
        host.output_devices()
    }
    .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    devices
        .find(|device| device.name().map(|n| n == name).unwrap_or(false))
        .map(|device| AudioDevice::from_cpal(device, is_input, !is_input))
        .ok_or_else(|| AudioError::DeviceNotFound(id.to_string()))
}

pub fn get_default_input_device() -> Result<AudioDevice, AudioError> {
    cpal::default_host()
        .default_input_device()
        .map(|d| AudioDevice::from_cpal(d, true, false))
        .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))
}

pub fn get_default_output_device() -> Result<AudioDevice, AudioError> {
    cpal::default_host()
        .default_output_device()
        .map(|d| AudioDevice::from_cpal(d, false, true))
        .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))
}

/// Platform audio through cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_capture(
        &self,
        device_id: Option<&str>,
        format: StreamFormat,
        mut on_samples: CaptureCallback,
    ) -> Result<Box<dyn DeviceStream>, AudioError> {
        let device = match device_id {
            Some(id) => get_device_by_id(id)?,
            None => get_default_input_device()?,
        };
        let name = device.name.clone();

        let stream = CpalStream::spawn("capture", move || {
            device.into_inner().build_input_stream(
                &stream_config(format),
                move |data: &[f32], _: &cpal::InputCallbackInfo| on_samples(data),
                |err| tracing::error!("Capture stream error: {}", err),
                None,
            )
        })?;

        tracing::info!(device = %name, sample_rate = format.sample_rate, "Opened capture device");
        Ok(Box::new(stream))
    }

    fn open_playback(
        &self,
        device_id: Option<&str>,
        format: StreamFormat,
        mut fill: PlaybackCallback,
    ) -> Result<Box<dyn DeviceStream>, AudioError> {
        let device = match device_id {
            Some(id) => get_device_by_id(id)?,
            None => get_default_output_device()?,
        };
        let name = device.name.clone();

        let stream = CpalStream::spawn("playback", move || {
            device.into_inner().build_output_stream(
                &stream_config(format),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| fill(data),
                |err| tracing::error!("Playback stream error: {}", err),
                None,
            )
        })?;

        tracing::info!(device = %name, sample_rate = format.sample_rate, "Opened playback device");
        Ok(Box::new(stream))
    }
}

fn stream_config(format: StreamFormat) -> StreamConfig {
    StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: match format.buffer_frames {
            Some(frames) => cpal::BufferSize::Fixed(frames),
            None => cpal::BufferSize::Default,
        },
    }
}

enum StreamCommand {
    Play(Sender<Result<(), AudioError>>),
    Pause,
}

/// A cpal stream owned by a dedicated thread.
///
/// The thread exits, releasing the device, when the handle is dropped.
struct CpalStream {
    commands: Option<Sender<StreamCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn spawn<F>(direction: &'static str, build: F) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<cpal::Stream, cpal::BuildStreamError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let (command_tx, command_rx) = bounded::<StreamCommand>(4);

        let thread = thread::Builder::new()
            .name(format!("voip-{}-device", direction))
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                };
                // Some hosts start streams on build
                let _ = stream.pause();
                let _ = ready_tx.send(Ok(()));
                run_stream(stream, command_rx);
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands: Some(command_tx),
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::StreamError(format!("{} thread exited", direction)))
            }
        }
    }
}

fn run_stream(stream: cpal::Stream, commands: Receiver<StreamCommand>) {
    // Exits when the command sender is dropped
    while let Ok(command) = commands.recv() {
        match command {
            StreamCommand::Play(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| AudioError::StreamError(e.to_string()));
                let _ = reply.send(result);
            }
            StreamCommand::Pause => {
                if let Err(e) = stream.pause() {
                    tracing::warn!("Failed to pause stream: {}", e);
                }
            }
        }
    }
}

impl DeviceStream for CpalStream {
    fn start(&mut self) -> Result<(), AudioError> {
        let commands = self.commands.as_ref().ok_or(AudioError::NotInitialized)?;
        let (reply_tx, reply_rx) = bounded(1);
        commands
            .send(StreamCommand::Play(reply_tx))
            .map_err(|_| AudioError::StreamError("stream thread exited".into()))?;
        reply_rx
            .recv()
            .map_err(|_| AudioError::StreamError("stream thread exited".into()))?
    }

    fn stop(&mut self) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(StreamCommand::Pause);
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.commands.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
