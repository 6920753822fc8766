//! Microphone capture via cpal.
//!
//! The input callback runs on the OS audio thread. It only downmixes to mono
//! into a reusable scratch buffer and pushes into the SPSC ring; it never
//! locks, blocks or performs I/O.
//!
//! `cpal::Stream` is `!Send` on Windows and macOS, so an [`AudioCapture`] must
//! be opened and dropped on the same thread (the frame-source thread).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    SampleFormat, SizedSample, Stream, StreamConfig,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

use crate::buffering::AudioProducer;
#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;
use crate::error::{LevialError, Result};

/// An open input stream feeding the ring buffer.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    running: Arc<AtomicBool>,
    /// Native capture rate of the device.
    pub sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl AudioCapture {
    /// Open the named input device, falling back to the default input and
    /// then to the first input the host lists.
    pub fn open(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device: Option<&str>,
    ) -> Result<Self> {
        let host = cpal::default_host();
        let device = select_device(&host, preferred_device)?;
        let name = device.name().unwrap_or_default();

        let supported = device
            .default_input_config()
            .map_err(|e| LevialError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };
        info!(
            device = name.as_str(),
            sample_rate,
            channels = config.channels,
            format = ?supported.sample_format(),
            "opening input device"
        );

        let flag = Arc::clone(&running);
        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, producer, flag, |s| s),
            SampleFormat::I16 => {
                build_stream::<i16>(&device, &config, producer, flag, |s| s as f32 / 32_768.0)
            }
            SampleFormat::U16 => build_stream::<u16>(&device, &config, producer, flag, |s| {
                (s as f32 - 32_768.0) / 32_768.0
            }),
            SampleFormat::U8 => {
                build_stream::<u8>(&device, &config, producer, flag, |s| (s as f32 - 128.0) / 128.0)
            }
            other => {
                return Err(LevialError::AudioStream(format!(
                    "unsupported sample format {other:?}"
                )))
            }
        }
        .map_err(|e| LevialError::AudioStream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| LevialError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }
}

#[cfg(feature = "audio-cpal")]
fn select_device(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    if let Some(wanted) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(found) =
                    devices.find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                {
                    return Ok(found);
                }
                warn!(device = wanted, "preferred input device not found, using default");
            }
            Err(e) => warn!("cannot enumerate input devices: {e}"),
        }
    }

    if let Some(device) = host.default_input_device() {
        return Ok(device);
    }
    let mut devices = host
        .input_devices()
        .map_err(|e| LevialError::AudioDevice(e.to_string()))?;
    let first = devices.next().ok_or(LevialError::NoDefaultInputDevice)?;
    warn!("no default input device, using first available");
    Ok(first)
}

#[cfg(feature = "audio-cpal")]
fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
    to_f32: fn(T) -> f32,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: SizedSample + 'static,
{
    let channels = config.channels as usize;
    let mut mono: Vec<f32> = Vec::new();
    device.build_input_stream(
        config,
        move |data: &[T], _info| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            downmix(data, channels, to_f32, &mut mono);
            let written = producer.push_slice(&mono);
            if written < mono.len() {
                warn!(dropped = mono.len() - written, "capture ring full");
            }
        },
        |err| error!("audio stream error: {err}"),
        None,
    )
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device: Option<&str>,
    ) -> Result<Self> {
        Err(LevialError::AudioStream(
            "built without the audio-cpal feature".into(),
        ))
    }
}

impl AudioCapture {
    /// Make the callback a no-op from its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Average interleaved `channels` into mono f32, reusing `out`.
pub fn downmix<T: Copy>(data: &[T], channels: usize, to_f32: fn(T) -> f32, out: &mut Vec<f32>) {
    out.clear();
    if channels <= 1 {
        out.extend(data.iter().map(|&s| to_f32(s)));
        return;
    }
    let scale = 1.0 / channels as f32;
    out.extend(
        data.chunks_exact(channels)
            .map(|frame| frame.iter().map(|&s| to_f32(s)).sum::<f32>() * scale),
    );
}
