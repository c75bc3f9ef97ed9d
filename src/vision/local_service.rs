//! Local recognition service backend
//!
//! Talks to a long-lived recognition process over a loopback HTTP API.
//! The process is either attached to (started separately by the user) or
//! spawned and supervised by the adapter when `service_command` is set.
//!
//! Service API:
//! - `GET  /health` - 200 when ready
//! - `GET  /languages` - `{ "languages": ["ja", "en"] }`
//! - `POST /recognize` - `{ image, language_code, inference_runtime, cpu_threads, text_threshold }`
//!   -> `{ "results": [{ "text", "box": { left, top, width, height }, "score" }] }`

use async_trait::async_trait;
use base64::Engine;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{
    normalize_language, AdapterCore, AdapterStatus, EngineSettings, OcrAdapter, OcrError,
    RecognitionInput, RecognitionResult, Rect, SettingsOption, SettingsOptions, SettingsUpdate,
    TextSpan,
};

/// Registry name of the local service adapter
pub const LOCAL_SERVICE_ADAPTER: &str = "local_service";

/// Interval between health checks while waiting for a spawned service
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Execution runtime used by the recognition service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceRuntime {
    #[default]
    Cpu,
    Cuda,
    DirectMl,
    OpenVino,
}

impl InferenceRuntime {
    pub const ALL: [InferenceRuntime; 4] = [
        InferenceRuntime::Cpu,
        InferenceRuntime::Cuda,
        InferenceRuntime::DirectMl,
        InferenceRuntime::OpenVino,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceRuntime::Cpu => "cpu",
            InferenceRuntime::Cuda => "cuda",
            InferenceRuntime::DirectMl => "direct_ml",
            InferenceRuntime::OpenVino => "open_vino",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            InferenceRuntime::Cpu => "CPU",
            InferenceRuntime::Cuda => "NVIDIA CUDA",
            InferenceRuntime::DirectMl => "DirectML (GPU)",
            InferenceRuntime::OpenVino => "Intel OpenVINO",
        }
    }
}

/// Settings for the local recognition service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalServiceSettings {
    /// Loopback address the service listens on (host:port)
    pub service_address: String,
    /// Executable to spawn; `None` attaches to an already running service
    pub service_command: Option<String>,
    /// Extra arguments for the spawned service
    pub service_args: Vec<String>,
    /// Execution runtime (restart required)
    pub inference_runtime: InferenceRuntime,
    /// Inference threads (restart required)
    pub cpu_threads: u32,
    /// Minimum span confidence kept in results (live)
    pub text_threshold: f32,
    /// Per-request timeout in seconds (live)
    pub request_timeout_secs: u64,
    /// How long to wait for a spawned service to become healthy
    pub startup_timeout_secs: u64,
}

impl Default for LocalServiceSettings {
    fn default() -> Self {
        Self {
            service_address: "127.0.0.1:23456".to_string(),
            service_command: None,
            service_args: Vec::new(),
            inference_runtime: InferenceRuntime::Cpu,
            cpu_threads: 4,
            text_threshold: 0.5,
            request_timeout_secs: 30,
            startup_timeout_secs: 20,
        }
    }
}

impl LocalServiceSettings {
    pub fn validate(&self) -> Result<(), OcrError> {
        let address: SocketAddr = self.service_address.parse().map_err(|_| {
            OcrError::InvalidSettings(format!(
                "service_address `{}` is not a host:port address",
                self.service_address
            ))
        })?;
        if !address.ip().is_loopback() {
            return Err(OcrError::InvalidSettings(format!(
                "service_address `{}` must be a loopback address",
                self.service_address
            )));
        }
        if self.cpu_threads == 0 {
            return Err(OcrError::InvalidSettings("cpu_threads must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.text_threshold) {
            return Err(OcrError::InvalidSettings(
                "text_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(OcrError::InvalidSettings("request_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    /// Whether moving from `previous` to these settings needs the service re-created
    pub fn requires_restart(&self, previous: &LocalServiceSettings) -> bool {
        self.service_address != previous.service_address
            || self.service_command != previous.service_command
            || self.service_args != previous.service_args
            || self.inference_runtime != previous.inference_runtime
            || self.cpu_threads != previous.cpu_threads
    }

    fn base_url(address: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        }
    }
}

/// `host:port` part of a base URL
fn host_port(base_url: &str) -> &str {
    base_url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
}

#[derive(Debug, Serialize)]
struct RecognizeRequest<'a> {
    image: String,
    language_code: &'a str,
    inference_runtime: &'static str,
    cpu_threads: u32,
    text_threshold: f32,
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<ServiceSpan>,
}

#[derive(Debug, Deserialize)]
struct ServiceSpan {
    text: String,
    #[serde(rename = "box")]
    bounds: ServiceBox,
    #[serde(default)]
    score: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ServiceBox {
    left: f32,
    top: f32,
    width: f32,
    height: f32,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    error: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LanguagesResponse {
    languages: Vec<String>,
}

/// Adapter for the locally-run recognition service
pub struct LocalServiceAdapter {
    core: AdapterCore,
    settings: RwLock<LocalServiceSettings>,
    client: reqwest::Client,
    /// Base URL of the connected service, set once it reported healthy
    endpoint: Mutex<Option<String>>,
    /// Base URL given explicitly to `initialize`; replaces the configured
    /// address until the settings move the service elsewhere
    endpoint_override: Mutex<Option<String>>,
    /// Spawned service process, if this adapter owns one
    process: tokio::sync::Mutex<Option<Child>>,
}

impl LocalServiceAdapter {
    pub fn new(settings: LocalServiceSettings) -> Self {
        Self {
            core: AdapterCore::new(LOCAL_SERVICE_ADAPTER),
            settings: RwLock::new(settings),
            // The service is loopback-only; never route it through a proxy
            client: reqwest::Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_default(),
            endpoint: Mutex::new(None),
            endpoint_override: Mutex::new(None),
            process: tokio::sync::Mutex::new(None),
        }
    }

    fn endpoint(&self) -> Result<String, OcrError> {
        self.endpoint.lock().clone().ok_or_else(|| {
            OcrError::EngineUnavailable(format!("{} is not initialized", LOCAL_SERVICE_ADAPTER))
        })
    }

    /// Where the service is expected for `settings`
    fn target_url(&self, settings: &LocalServiceSettings) -> String {
        self.endpoint_override
            .lock()
            .clone()
            .unwrap_or_else(|| LocalServiceSettings::base_url(&settings.service_address))
    }

    /// Spawn the service (if configured) and wait until it reports healthy
    /// at `base_url`. An attached service must already be healthy within the
    /// startup timeout; a spawned one that is still running and healthy is reused.
    async fn start_service(
        &self,
        settings: &LocalServiceSettings,
        base_url: &str,
    ) -> Result<(), OcrError> {
        let Some(command) = settings.service_command.as_deref() else {
            debug!("Attaching to recognition service at {}", base_url);
            return self.wait_until_healthy(settings, base_url).await;
        };

        if self.service_running().await && self.is_healthy(base_url).await {
            debug!("Reusing running recognition service at {}", base_url);
            return Ok(());
        }
        self.stop_service().await;

        info!("Spawning recognition service: {} {:?}", command, settings.service_args);
        let child = Command::new(command)
            .args(&settings.service_args)
            .env("OCR_SERVICE_ADDRESS", host_port(base_url))
            .env("OCR_INFERENCE_RUNTIME", settings.inference_runtime.as_str())
            .env("OCR_CPU_THREADS", settings.cpu_threads.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OcrError::EngineUnavailable(format!("failed to spawn `{}`: {}", command, e))
            })?;
        *self.process.lock().await = Some(child);

        self.wait_until_healthy(settings, base_url).await
    }

    async fn wait_until_healthy(
        &self,
        settings: &LocalServiceSettings,
        base_url: &str,
    ) -> Result<(), OcrError> {
        let deadline = Instant::now() + Duration::from_secs(settings.startup_timeout_secs);
        loop {
            if self.is_healthy(base_url).await {
                info!("Recognition service ready at {}", base_url);
                return Ok(());
            }
            if let Some(child) = self.process.lock().await.as_mut() {
                if let Ok(Some(exit)) = child.try_wait() {
                    return Err(OcrError::EngineUnavailable(format!(
                        "recognition service exited during startup ({})",
                        exit
                    )));
                }
            }
            if Instant::now() >= deadline {
                self.stop_service().await;
                return Err(OcrError::EngineUnavailable(format!(
                    "recognition service at {} did not become ready within {}s",
                    base_url, settings.startup_timeout_secs
                )));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    async fn service_running(&self) -> bool {
        self.process
            .lock()
            .await
            .as_mut()
            .is_some_and(|child| matches!(child.try_wait(), Ok(None)))
    }

    async fn stop_service(&self) {
        if let Some(mut child) = self.process.lock().await.take() {
            info!("Stopping recognition service");
            if let Err(e) = child.kill().await {
                warn!("Failed to stop recognition service: {}", e);
            }
        }
    }

    async fn is_healthy(&self, base_url: &str) -> bool {
        self.client
            .get(format!("{}/health", base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn fetch_languages(&self, base_url: &str) -> Result<BTreeSet<String>, OcrError> {
        let timeout = Duration::from_secs(self.settings.read().request_timeout_secs);
        let response = self
            .client
            .get(format!("{}/languages", base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| OcrError::EngineUnavailable(format!("language query failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(OcrError::EngineUnavailable(format!(
                "language query returned {}",
                response.status()
            )));
        }

        let body: LanguagesResponse = response
            .json()
            .await
            .map_err(|e| OcrError::EngineUnavailable(format!("malformed language list: {}", e)))?;

        Ok(body.languages.iter().map(|l| normalize_language(l)).collect())
    }

    fn translate(&self, response: RecognizeResponse, threshold: f32) -> Vec<TextSpan> {
        response
            .results
            .into_iter()
            .filter(|span| span.score.map_or(true, |s| s >= threshold))
            .filter(|span| !span.text.trim().is_empty())
            .map(|span| TextSpan {
                text: span.text,
                bounding_box: Rect::new(
                    span.bounds.left.max(0.0).round() as u32,
                    span.bounds.top.max(0.0).round() as u32,
                    span.bounds.width.max(0.0).round() as u32,
                    span.bounds.height.max(0.0).round() as u32,
                ),
                region_id: None,
                confidence: span.score,
            })
            .collect()
    }
}

#[async_trait]
impl OcrAdapter for LocalServiceAdapter {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    async fn initialize(&self, endpoint: Option<String>) -> Result<(), OcrError> {
        let settings = self.settings.read().clone();
        if let Some(endpoint) = endpoint {
            *self.endpoint_override.lock() = Some(LocalServiceSettings::base_url(&endpoint));
        }
        let base_url = self.target_url(&settings);

        let current = self.endpoint.lock().clone();
        if current.as_deref() == Some(base_url.as_str())
            && self.core.status() != AdapterStatus::Disabled
        {
            return Ok(());
        }

        if current.as_deref().is_some_and(|c| c != base_url) {
            info!("Re-initializing {} at {}", LOCAL_SERVICE_ADAPTER, base_url);
            self.stop_service().await;
            self.core.invalidate_languages();
        }

        if let Err(e) = self.start_service(&settings, &base_url).await {
            *self.endpoint.lock() = None;
            let _ = self.core.disable();
            return Err(e);
        }

        *self.endpoint.lock() = Some(base_url.clone());
        self.core.enable();
        info!("{} initialized ({})", LOCAL_SERVICE_ADAPTER, base_url);
        Ok(())
    }

    async fn recognize(
        &self,
        input: RecognitionInput,
    ) -> Result<Option<RecognitionResult>, OcrError> {
        let _processing = self.core.begin_processing()?;
        let start = Instant::now();
        let base_url = self.endpoint()?;
        let settings = self.settings.read().clone();
        let language = normalize_language(&input.language_code);

        if let Some(languages) = self.core.cached_languages() {
            if !languages.contains(&language) {
                return Err(OcrError::UnsupportedLanguage(input.language_code));
            }
        }

        image::guess_format(&input.image_bytes)
            .map_err(|e| OcrError::InvalidImage(e.to_string()))?;

        let request = RecognizeRequest {
            image: base64::engine::general_purpose::STANDARD.encode(&input.image_bytes),
            language_code: &language,
            inference_runtime: settings.inference_runtime.as_str(),
            cpu_threads: settings.cpu_threads,
            text_threshold: settings.text_threshold,
        };

        let response = self
            .client
            .post(format!("{}/recognize", base_url))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                OcrError::EngineUnavailable(format!("recognition service unreachable: {}", e))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let body: ServiceError = response.json().await.map_err(|e| {
                OcrError::EngineUnavailable(format!("malformed error response: {}", e))
            })?;
            return Err(match body.error.as_str() {
                "unsupported_language" => OcrError::UnsupportedLanguage(input.language_code),
                "invalid_image" => OcrError::InvalidImage(body.message.unwrap_or(body.error)),
                _ => OcrError::EngineUnavailable(body.message.unwrap_or(body.error)),
            });
        }
        if !status.is_success() {
            return Err(OcrError::EngineUnavailable(format!(
                "recognition service returned {}",
                status
            )));
        }

        let body: RecognizeResponse = response
            .json()
            .await
            .map_err(|e| OcrError::EngineUnavailable(format!("malformed response: {}", e)))?;

        let spans = self.translate(body, settings.text_threshold);
        debug!(
            "{} recognized {} spans in {:?}",
            LOCAL_SERVICE_ADAPTER,
            spans.len(),
            start.elapsed()
        );

        if spans.is_empty() {
            return Ok(None);
        }

        Ok(Some(RecognitionResult {
            spans,
            adapter: LOCAL_SERVICE_ADAPTER.to_string(),
            processing_time_ms: start.elapsed().as_millis() as u64,
        }))
    }

    async fn supported_languages(&self) -> Result<BTreeSet<String>, OcrError> {
        if let Some(languages) = self.core.cached_languages() {
            return Ok(languages);
        }

        let base_url = self.endpoint()?;
        let languages = self.fetch_languages(&base_url).await?;
        self.core.cache_languages(languages.clone());
        Ok(languages)
    }

    async fn update_settings(
        &self,
        update: EngineSettings,
        old: Option<EngineSettings>,
    ) -> Result<SettingsUpdate, OcrError> {
        let base = old.unwrap_or_else(|| self.settings());
        let previous: LocalServiceSettings = base.to_typed()?;
        let merged: LocalServiceSettings = base.merged_with(&update).to_typed()?;
        merged.validate()?;

        Ok(SettingsUpdate {
            restart: merged.requires_restart(&previous),
            settings: EngineSettings::from_typed(&merged)?,
        })
    }

    fn commit_settings(&self, settings: EngineSettings) -> Result<(), OcrError> {
        let settings: LocalServiceSettings = settings.to_typed()?;
        settings.validate()?;
        *self.settings.write() = settings;
        Ok(())
    }

    fn settings(&self) -> EngineSettings {
        // Plain struct of strings and numbers, serialization cannot fail
        EngineSettings::from_typed(&*self.settings.read()).unwrap_or_default()
    }

    fn default_settings(&self) -> EngineSettings {
        EngineSettings::from_typed(&LocalServiceSettings::default()).unwrap_or_default()
    }

    fn settings_options(&self) -> SettingsOptions {
        SettingsOptions {
            inference_runtime: InferenceRuntime::ALL
                .iter()
                .map(|r| SettingsOption {
                    value: r.as_str().to_string(),
                    display_name: r.display_name().to_string(),
                })
                .collect(),
        }
    }

    async fn restart_with(&self, settings: EngineSettings) -> Result<(), OcrError> {
        let staged: LocalServiceSettings = settings.to_typed()?;
        staged.validate()?;

        self.core
            .run_restart(|| async {
                info!("Restarting {}", LOCAL_SERVICE_ADAPTER);
                self.stop_service().await;

                // A new configured address replaces an explicit endpoint
                let moved = staged.service_address != self.settings.read().service_address;
                let base_url = if moved {
                    LocalServiceSettings::base_url(&staged.service_address)
                } else {
                    self.target_url(&staged)
                };

                if let Err(e) = self.start_service(&staged, &base_url).await {
                    *self.endpoint.lock() = None;
                    return Err(e);
                }

                if moved {
                    *self.endpoint_override.lock() = None;
                }
                *self.endpoint.lock() = Some(base_url);
                *self.settings.write() = staged;
                Ok(())
            })
            .await
    }

    async fn shutdown(&self) {
        self.stop_service().await;
    }
}
