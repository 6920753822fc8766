//! Audio input: device capture, rate conversion and frame production.
//!
//! ```text
//! cpal callback ─► SPSC ring ─► frame-source thread
//!                                 ├─ RateConverter (capture rate → 16 kHz)
//!                                 ├─ FrameCutter   (fixed 80 ms frames + RMS)
//!                                 ├─ WakeWordDetector (every frame)
//!                                 └─ FrameSink ─► session loop queue
//! ```

pub mod capture;
pub mod resample;
pub mod source;
pub mod virtual_mic;

pub use capture::AudioCapture;
pub use resample::RateConverter;
pub use source::{Delivery, FrameCutter, FrameSink, FrameSource, MicrophoneSource};
pub use virtual_mic::{MicrophoneFeed, VirtualMicrophone};
