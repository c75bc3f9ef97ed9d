//! Recognition engine layer
//!
//! Wraps every recognition backend behind the [`OcrAdapter`] contract.
//! Supported backends:
//! - Local recognition service reached over a loopback HTTP API
//! - Google Cloud Vision text detection

pub mod cloud_vision;
pub mod error;
pub mod local_service;
pub mod registry;
pub mod status;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub use cloud_vision::{CloudVisionAdapter, CloudVisionSettings};
pub use error::OcrError;
pub use local_service::{LocalServiceAdapter, LocalServiceSettings};
pub use registry::AdapterRegistry;
pub use status::{AdapterCore, AdapterStatus};

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Shift the rectangle by a crop origin
    pub fn offset(self, dx: u32, dy: u32) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
            ..self
        }
    }

    /// Bounding box of a polygon
    pub fn from_points(points: &[(f32, f32)]) -> Self {
        if points.is_empty() {
            return Self::default();
        }

        let min_x = points.iter().map(|p| p.0).fold(f32::INFINITY, f32::min).max(0.0);
        let min_y = points.iter().map(|p| p.1).fold(f32::INFINITY, f32::min).max(0.0);
        let max_x = points.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max).max(min_x);
        let max_y = points.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max).max(min_y);

        Self {
            x: min_x as u32,
            y: min_y as u32,
            width: (max_x - min_x) as u32,
            height: (max_y - min_y) as u32,
        }
    }
}

/// One recognized span of text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSpan {
    /// Recognized text content
    pub text: String,
    /// Bounding box in capture-image pixels
    pub bounding_box: Rect,
    /// Target region this span was recognized in, if a template was used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
    /// Confidence score (0.0 - 1.0), when the backend reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Ordered recognition output of one capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    /// Recognized spans in reading / region order
    pub spans: Vec<TextSpan>,
    /// Adapter that produced the result
    pub adapter: String,
    /// Processing time in milliseconds
    pub processing_time_ms: u64,
}

impl RecognitionResult {
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// All span texts joined line by line
    pub fn text(&self) -> String {
        self.spans
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Input of a single recognize call
#[derive(Debug, Clone)]
pub struct RecognitionInput {
    /// Encoded image (PNG, JPEG, ...)
    pub image_bytes: Vec<u8>,
    /// Two-letter language code
    pub language_code: String,
}

/// Backend-specific settings, exchanged as JSON through the adapter contract
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineSettings(serde_json::Value);

impl EngineSettings {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn from_typed<T: Serialize>(settings: &T) -> Result<Self, OcrError> {
        Ok(Self(serde_json::to_value(settings)?))
    }

    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, OcrError> {
        Ok(serde_json::from_value(self.0.clone())?)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Overlay the keys of `update` onto these settings (one level deep)
    pub fn merged_with(&self, update: &EngineSettings) -> EngineSettings {
        match (&self.0, &update.0) {
            (serde_json::Value::Object(base), serde_json::Value::Object(changes)) => {
                let mut merged = base.clone();
                for (key, value) in changes {
                    merged.insert(key.clone(), value.clone());
                }
                EngineSettings(serde_json::Value::Object(merged))
            }
            (_, serde_json::Value::Null) => self.clone(),
            _ => update.clone(),
        }
    }
}

/// One user-facing choice for a setting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsOption {
    pub value: String,
    pub display_name: String,
}

/// Enumerated settings choices, used to populate configuration UIs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsOptions {
    pub inference_runtime: Vec<SettingsOption>,
}

/// Outcome of validating a settings update
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsUpdate {
    /// Validated, merged settings
    pub settings: EngineSettings,
    /// Whether applying them requires a full adapter restart
    pub restart: bool,
}

/// Uniform contract over a recognition backend
///
/// `recognize` must not be called concurrently on one adapter; the
/// orchestrator enforces single-flight and the status machine rejects
/// overlapping calls with `EngineBusy`.
#[async_trait]
pub trait OcrAdapter: Send + Sync {
    /// Shared status / restart / language-cache state
    fn core(&self) -> &AdapterCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn status(&self) -> AdapterStatus {
        self.core().status()
    }

    /// Connect to the backend. Re-initializing with the same endpoint is a
    /// no-op; a different endpoint tears down and re-creates the connection.
    async fn initialize(&self, endpoint: Option<String>) -> Result<(), OcrError>;

    /// Recognize text in an image. `Ok(None)` when nothing was found.
    async fn recognize(
        &self,
        input: RecognitionInput,
    ) -> Result<Option<RecognitionResult>, OcrError>;

    /// Two-letter codes the backend can service; cached until restart
    async fn supported_languages(&self) -> Result<BTreeSet<String>, OcrError>;

    /// Validate and merge `update` onto `old` (or the current settings).
    /// Nothing is applied; see [`OcrAdapter::commit_settings`].
    async fn update_settings(
        &self,
        update: EngineSettings,
        old: Option<EngineSettings>,
    ) -> Result<SettingsUpdate, OcrError>;

    /// Store already-validated settings; takes effect live or on next restart
    fn commit_settings(&self, settings: EngineSettings) -> Result<(), OcrError>;

    fn settings(&self) -> EngineSettings;

    fn default_settings(&self) -> EngineSettings;

    fn settings_options(&self) -> SettingsOptions;

    /// Tear down and re-create the backend with the current settings
    async fn restart(&self) -> Result<(), OcrError> {
        self.restart_with(self.settings()).await
    }

    /// Tear down and re-create the backend with `settings`. Queued behind a
    /// restart already in progress; status is `Restarting` for the duration.
    /// `settings` replace the current ones only once the restart succeeded,
    /// so a failed restart leaves the previous settings in place.
    async fn restart_with(&self, settings: EngineSettings) -> Result<(), OcrError>;

    /// Release backend resources (spawned processes, sessions)
    async fn shutdown(&self) {}
}

/// Normalize a language code to its two-letter lowercase form ("ja-JP" -> "ja")
pub fn normalize_language(code: &str) -> String {
    code.trim()
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_lowercase()
}
