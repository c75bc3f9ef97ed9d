//! Error taxonomy shared by every recognition engine and the runtime around them

use thiserror::Error;

use super::status::AdapterStatus;

/// Errors surfaced by engine adapters, the orchestrator and the settings coordinator
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OcrError {
    /// Backend unreachable, crashed, or not initialized
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Call is illegal for the adapter's current status
    #[error("Engine {adapter} is busy ({status})")]
    EngineBusy {
        adapter: String,
        status: AdapterStatus,
    },

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// A capture is already unresolved on this adapter
    #[error("Recognition already in progress on {0}")]
    RecognitionInProgress(String),

    /// Region geometry that is not a usable normalized rectangle
    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error("Region too small: {width:.4}x{height:.4} (minimum {min})")]
    RegionTooSmall { width: f32, height: f32, min: f32 },

    #[error("Failed to apply settings to {adapter}: {reason}")]
    SettingsApplyFailed { adapter: String, reason: String },

    #[error("Unknown adapter: {0}")]
    UnknownAdapter(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Target region not found: {0}")]
    RegionNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for OcrError {
    fn from(err: serde_json::Error) -> Self {
        OcrError::InvalidSettings(err.to_string())
    }
}
