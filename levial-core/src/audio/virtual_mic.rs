//! A frame source with no hardware behind it.
//!
//! Frames are pushed through a [`MicrophoneFeed`]; whenever nothing has been
//! fed for one `pace` interval the source emits a silent frame instead, like a
//! quiet room. Used for development without a microphone and by tests that
//! script a conversation.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use crate::audio::source::{Delivery, FrameSink, FrameSource};
use crate::buffering::frame::AudioFrame;
use crate::error::{LevialError, Result};

struct Fed {
    frame: AudioFrame,
    wake: Option<String>,
}

/// Producer side of a [`VirtualMicrophone`].
#[derive(Clone)]
pub struct MicrophoneFeed {
    tx: Sender<Fed>,
    sample_rate: u32,
    frame_samples: usize,
}

impl MicrophoneFeed {
    /// Queue a frame as-is.
    pub fn push(&self, frame: AudioFrame) -> bool {
        self.tx.send(Fed { frame, wake: None }).is_ok()
    }

    /// Queue a frame on which the wake detector fired.
    pub fn push_wake(&self, frame: AudioFrame, wake_word: impl Into<String>) -> bool {
        self.tx
            .send(Fed {
                frame,
                wake: Some(wake_word.into()),
            })
            .is_ok()
    }

    /// Queue `count` frames of a constant-amplitude signal.
    pub fn push_tone(&self, amplitude: f32, count: usize) -> bool {
        (0..count).all(|_| self.push(self.frame(amplitude)))
    }

    /// A single frame of the configured size at `amplitude`.
    pub fn frame(&self, amplitude: f32) -> AudioFrame {
        AudioFrame::new(vec![amplitude; self.frame_samples], self.sample_rate)
    }
}

pub struct VirtualMicrophone {
    rx: Receiver<Fed>,
    sample_rate: u32,
    frame_samples: usize,
    pace: Duration,
    running: Option<Arc<AtomicBool>>,
}

impl VirtualMicrophone {
    /// `pace` is the wall-clock gap before a silent filler frame is emitted.
    pub fn new(sample_rate: u32, frame_samples: usize, pace: Duration) -> (Self, MicrophoneFeed) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let feed = MicrophoneFeed {
            tx,
            sample_rate,
            frame_samples,
        };
        let source = Self {
            rx,
            sample_rate,
            frame_samples,
            pace,
            running: None,
        };
        (source, feed)
    }
}

impl FrameSource for VirtualMicrophone {
    fn start(&mut self, sink: FrameSink) -> Result<()> {
        self.stop();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let rx = self.rx.clone();
        let silence = vec![0.0f32; self.frame_samples];
        let sample_rate = self.sample_rate;
        let pace = self.pace;

        thread::Builder::new()
            .name("levial-virtual-mic".into())
            .spawn(move || {
                if !sink.opened(Ok(())) {
                    return;
                }
                info!(generation = sink.generation(), "virtual microphone started");
                while flag.load(Ordering::Acquire) {
                    let (frame, wake) = match rx.recv_timeout(pace) {
                        Ok(fed) => (fed.frame, fed.wake),
                        Err(RecvTimeoutError::Timeout) => {
                            (AudioFrame::new(silence.clone(), sample_rate), None)
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            thread::sleep(pace);
                            (AudioFrame::new(silence.clone(), sample_rate), None)
                        }
                    };
                    if sink.offer(frame, wake) == Delivery::Closed {
                        break;
                    }
                }
                debug!("virtual microphone exiting");
            })
            .map_err(LevialError::Io)?;

        self.running = Some(running);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.store(false, Ordering::Release);
        }
    }
}

impl Drop for VirtualMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}
