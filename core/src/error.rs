//! Error type shared by the localization engine, the replay sources and the trial harness.
//!
//! Conditions that a run is expected to survive (degenerate sensor updates, exhausted streams,
//! stale frames, trial timeouts, cancellation) are reported through outcome enums instead:
//! see [`crate::engine::SensorUpdate`], [`crate::replay::FrameStatus`],
//! [`crate::controller::StopReason`] and [`crate::trials::TrialOutcome`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocalizationError {
    /// Invalid parameters, a missing map or manifest, or an unreadable config file.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("particle filter has not been initialized, call reset first")]
    Uninitialized,

    #[error("a background run is already active")]
    RunActive,

    #[error("parameters cannot change while a run is active")]
    ParametersLocked,

    #[error("no frame source is loaded")]
    NoSource,

    #[error("time position {requested:.3}s is past the end of {source_name} ({end:.3}s)")]
    SeekOutOfRange {
        source_name: String,
        requested: f64,
        end: f64,
    },

    #[error("tree detection failed: {0}")]
    Detection(String),

    #[error("background run thread panicked")]
    RunPanicked,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LocalizationError {
    pub fn config(msg: impl Into<String>) -> Self {
        LocalizationError::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, LocalizationError>;
