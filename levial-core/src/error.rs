use thiserror::Error;

/// All errors produced by levial-core outside the service adapters.
///
/// Adapter failures have their own type (`adapters::AdapterError`) because they
/// are converted into loop events rather than propagated.
#[derive(Debug, Error)]
pub enum LevialError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("resampler error: {0}")]
    Resampler(String),

    #[error("profile store error: {0}")]
    ProfileStore(String),

    #[error("event loop has shut down")]
    LoopClosed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LevialError>;
