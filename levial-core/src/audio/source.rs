//! Frame sources feeding the session loop.
//!
//! A source runs on its own thread once started and never waits on the loop:
//! ordinary frames are offered with `try_send` and dropped when the loop's
//! queue is full. Frames carrying a wake hit and the open/failed report are
//! delivered with a blocking send so they are never lost.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::audio::{capture::AudioCapture, resample::RateConverter};
use crate::buffering::{create_audio_ring, frame::AudioFrame, AudioConsumer, Consumer};
use crate::engine::config::AudioConfig;
use crate::engine::event_loop::{CapturedFrame, LoopEvent};
use crate::error::{LevialError, Result};
use crate::wake::WakeWordDetector;

/// Samples drained from the ring per iteration.
const DRAIN_BLOCK: usize = 4_096;
/// Back-off when the ring is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Outcome of offering a frame to the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Queue full; the frame was discarded.
    Dropped,
    /// The loop is gone; the source should exit.
    Closed,
}

/// Handle a running source uses to talk to the session loop.
///
/// Every event is stamped with the source generation so the loop can ignore
/// stragglers from a source it has already stopped.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<LoopEvent>,
    generation: u64,
}

impl FrameSink {
    pub(crate) fn new(tx: mpsc::Sender<LoopEvent>, generation: u64) -> Self {
        Self { tx, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report whether the device opened. Blocking; call from the source
    /// thread, never from async code.
    pub fn opened(&self, result: std::result::Result<(), String>) -> bool {
        self.tx
            .blocking_send(LoopEvent::SourceOpened {
                generation: self.generation,
                result,
            })
            .is_ok()
    }

    /// Offer a frame. Frames with a wake hit block until queued.
    pub fn offer(&self, frame: AudioFrame, wake: Option<String>) -> Delivery {
        let must_deliver = wake.is_some();
        let event = LoopEvent::Frame(CapturedFrame {
            generation: self.generation,
            frame,
            wake,
        });
        if must_deliver {
            return match self.tx.blocking_send(event) {
                Ok(()) => Delivery::Sent,
                Err(_) => Delivery::Closed,
            };
        }
        match self.tx.try_send(event) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Producer of audio frames for the session loop.
pub trait FrameSource: Send + 'static {
    /// Begin producing into `sink`. Must return promptly: the outcome of
    /// opening the device is reported through [`FrameSink::opened`]. An
    /// `Err` here means the source could not even be launched.
    fn start(&mut self, sink: FrameSink) -> Result<()>;

    /// Stop producing. Returns without waiting for the source thread.
    fn stop(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn start(&mut self, sink: FrameSink) -> Result<()> {
        (**self).start(sink)
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}

/// Cuts a continuous sample stream into fixed-size frames.
#[derive(Debug)]
pub struct FrameCutter {
    frame_samples: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameCutter {
    pub fn new(frame_samples: usize, sample_rate: u32) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            sample_rate,
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Append samples and return every complete frame.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.frame_samples;
        let mut frames = Vec::with_capacity(complete);
        for chunk in self.pending.chunks_exact(self.frame_samples) {
            frames.push(AudioFrame::new(chunk.to_vec(), self.sample_rate));
        }
        self.pending.drain(..complete * self.frame_samples);
        frames
    }

    /// Samples waiting for the next frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// The system microphone.
pub struct MicrophoneSource {
    preferred_device: Option<String>,
    audio: AudioConfig,
    wake: Arc<Mutex<Box<dyn WakeWordDetector>>>,
    running: Option<Arc<AtomicBool>>,
}

impl MicrophoneSource {
    pub fn new(
        preferred_device: Option<String>,
        audio: AudioConfig,
        wake: Box<dyn WakeWordDetector>,
    ) -> Self {
        Self {
            preferred_device,
            audio,
            wake: Arc::new(Mutex::new(wake)),
            running: None,
        }
    }
}

impl FrameSource for MicrophoneSource {
    fn start(&mut self, sink: FrameSink) -> Result<()> {
        self.stop();
        let running = Arc::new(AtomicBool::new(true));
        let ctx = CaptureContext {
            sink,
            running: Arc::clone(&running),
            preferred_device: self.preferred_device.clone(),
            audio: self.audio,
            wake: Arc::clone(&self.wake),
        };
        thread::Builder::new()
            .name("levial-capture".into())
            .spawn(move || run_capture(ctx))
            .map_err(LevialError::Io)?;
        self.running = Some(running);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.store(false, Ordering::Release);
            info!("microphone stop requested");
        }
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureContext {
    sink: FrameSink,
    running: Arc<AtomicBool>,
    preferred_device: Option<String>,
    audio: AudioConfig,
    wake: Arc<Mutex<Box<dyn WakeWordDetector>>>,
}

/// Body of the capture thread. The cpal stream is created and dropped here.
fn run_capture(ctx: CaptureContext) {
    let (producer, consumer) = create_audio_ring();
    let capture = match AudioCapture::open(
        producer,
        Arc::clone(&ctx.running),
        ctx.preferred_device.as_deref(),
    ) {
        Ok(capture) => capture,
        Err(e) => {
            error!("microphone unavailable: {e}");
            ctx.running.store(false, Ordering::Release);
            ctx.sink.opened(Err(e.to_string()));
            return;
        }
    };

    let block = (capture.sample_rate / 100).max(1) as usize;
    let converter = match RateConverter::new(capture.sample_rate, ctx.audio.target_sample_rate, block) {
        Ok(converter) => converter,
        Err(e) => {
            error!("cannot convert capture rate: {e}");
            ctx.running.store(false, Ordering::Release);
            ctx.sink.opened(Err(e.to_string()));
            return;
        }
    };

    if !ctx.sink.opened(Ok(())) {
        return;
    }
    ctx.wake.lock().reset();
    info!(
        generation = ctx.sink.generation(),
        capture_rate = capture.sample_rate,
        "frame source started"
    );

    pump(&ctx, consumer, converter);

    capture.stop();
    drop(capture);
    info!(generation = ctx.sink.generation(), "frame source stopped");
}

fn pump(ctx: &CaptureContext, mut consumer: AudioConsumer, mut converter: RateConverter) {
    let mut cutter = FrameCutter::new(ctx.audio.frame_samples, ctx.audio.target_sample_rate);
    let mut raw = vec![0f32; DRAIN_BLOCK];
    let mut dropped = 0u64;

    while ctx.running.load(Ordering::Acquire) {
        let n = consumer.pop_slice(&mut raw);
        if n == 0 {
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        for frame in cutter.push(&converter.process(&raw[..n])) {
            let wake = ctx.wake.lock().process(&frame);
            if let Some(word) = &wake {
                info!(wake_word = word.as_str(), "wake word heard");
            }
            match ctx.sink.offer(frame, wake) {
                Delivery::Sent => {}
                Delivery::Dropped => {
                    dropped += 1;
                    if dropped.is_power_of_two() {
                        warn!(dropped, "session loop behind, dropping frames");
                    }
                }
                Delivery::Closed => {
                    debug!("session loop closed, capture exiting");
                    return;
                }
            }
        }
    }
}
