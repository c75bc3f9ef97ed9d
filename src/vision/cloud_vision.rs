//! Google Cloud Vision backend
//!
//! Sends captures to the `images:annotate` endpoint with `TEXT_DETECTION`.
//! Authenticates with a service-account key pair: a signed JWT is exchanged
//! for an OAuth access token, which is cached until shortly before expiry.

use async_trait::async_trait;
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{
    normalize_language, AdapterCore, AdapterStatus, EngineSettings, OcrAdapter, OcrError,
    RecognitionInput, RecognitionResult, Rect, SettingsOptions, SettingsUpdate, TextSpan,
};

/// Registry name of the cloud adapter
pub const CLOUD_VISION_ADAPTER: &str = "cloud_vision";

const VISION_SCOPE: &str = "https://www.googleapis.com/auth/cloud-vision";

/// Tokens are refreshed this long before they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Languages accepted as text detection hints
const SUPPORTED_LANGUAGES: &[&str] = &[
    "ar", "bg", "cs", "da", "de", "el", "en", "es", "fi", "fr", "he", "hi", "hu", "id", "it",
    "ja", "ko", "nl", "no", "pl", "pt", "ro", "ru", "sv", "th", "tr", "uk", "vi", "zh",
];

/// Settings for the Cloud Vision adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudVisionSettings {
    /// Service account e-mail (restart required)
    pub client_email: String,
    /// Service account PEM private key (restart required)
    pub private_key: String,
    /// API base URL (restart required)
    pub api_base_url: String,
    /// OAuth token endpoint (restart required)
    pub token_uri: String,
    /// Per-request timeout in seconds (live)
    pub request_timeout_secs: u64,
    /// Send the request language as a detection hint (live)
    pub language_hints: bool,
}

impl Default for CloudVisionSettings {
    fn default() -> Self {
        Self {
            client_email: String::new(),
            private_key: String::new(),
            api_base_url: "https://vision.googleapis.com".to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
            request_timeout_secs: 30,
            language_hints: true,
        }
    }
}

impl CloudVisionSettings {
    pub fn validate(&self) -> Result<(), OcrError> {
        if self.client_email.is_empty() != self.private_key.is_empty() {
            return Err(OcrError::InvalidSettings(
                "client_email and private_key must be set together".into(),
            ));
        }
        for url in [&self.api_base_url, &self.token_uri] {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(OcrError::InvalidSettings(format!("`{}` is not an http(s) URL", url)));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err(OcrError::InvalidSettings("request_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn has_credentials(&self) -> bool {
        !self.client_email.is_empty() && !self.private_key.is_empty()
    }

    pub fn requires_restart(&self, previous: &CloudVisionSettings) -> bool {
        self.client_email != previous.client_email
            || self.private_key != previous.private_key
            || self.api_base_url != previous.api_base_url
            || self.token_uri != previous.token_uri
    }

    fn signing_key(&self) -> Result<EncodingKey, OcrError> {
        EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|e| OcrError::EngineUnavailable(format!("invalid private key: {}", e)))
    }
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct AccessToken {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageRequest {
    image: ImageContent,
    features: Vec<Feature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_context: Option<ImageContext>,
}

#[derive(Debug, Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContext {
    language_hints: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    text_annotations: Vec<EntityAnnotation>,
    error: Option<ApiStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityAnnotation {
    description: String,
    bounding_poly: Option<BoundingPoly>,
}

#[derive(Debug, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<Vertex>,
}

#[derive(Debug, Deserialize)]
struct Vertex {
    #[serde(default)]
    x: f32,
    #[serde(default)]
    y: f32,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

/// gRPC status code for INVALID_ARGUMENT
const STATUS_INVALID_ARGUMENT: i32 = 3;

/// Adapter for Google Cloud Vision text detection
pub struct CloudVisionAdapter {
    core: AdapterCore,
    settings: RwLock<CloudVisionSettings>,
    client: reqwest::Client,
    /// API base URL in use, set by `initialize`
    endpoint: Mutex<Option<String>>,
    /// Base URL given explicitly to `initialize`; replaces `api_base_url`
    /// until the settings change it
    endpoint_override: Mutex<Option<String>>,
    token: tokio::sync::Mutex<Option<AccessToken>>,
}

impl CloudVisionAdapter {
    pub fn new(settings: CloudVisionSettings) -> Self {
        Self {
            core: AdapterCore::new(CLOUD_VISION_ADAPTER),
            settings: RwLock::new(settings),
            client: reqwest::Client::new(),
            endpoint: Mutex::new(None),
            endpoint_override: Mutex::new(None),
            token: tokio::sync::Mutex::new(None),
        }
    }

    fn target_url(&self, settings: &CloudVisionSettings) -> String {
        self.endpoint_override
            .lock()
            .clone()
            .unwrap_or_else(|| settings.api_base_url.trim_end_matches('/').to_string())
    }

    /// Check the credentials can sign a token grant; no network access
    fn check_credentials(settings: &CloudVisionSettings) -> Result<(), OcrError> {
        if !settings.has_credentials() {
            return Err(OcrError::EngineUnavailable(
                "cloud credentials are not configured".into(),
            ));
        }
        settings.signing_key().map(|_| ())
    }

    async fn access_token(&self) -> Result<String, OcrError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.token.clone());
            }
        }

        let settings = self.settings.read().clone();
        let now = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &settings.client_email,
            scope: VISION_SCOPE,
            aud: &settings.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let assertion = jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &settings.signing_key()?,
        )
        .map_err(|e| OcrError::EngineUnavailable(format!("failed to sign token grant: {}", e)))?;

        debug!("Requesting cloud access token for {}", settings.client_email);
        let response = self
            .client
            .post(&settings.token_uri)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| OcrError::EngineUnavailable(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(OcrError::EngineUnavailable(format!(
                "token request rejected ({})",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| OcrError::EngineUnavailable(format!("malformed token response: {}", e)))?;

        *cached = Some(AccessToken {
            token: body.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        });
        Ok(body.access_token)
    }

    fn translate(response: AnnotateImageResponse) -> Vec<TextSpan> {
        // The first annotation is the whole text block; the rest are words
        let words = if response.text_annotations.len() > 1 {
            &response.text_annotations[1..]
        } else {
            &response.text_annotations[..]
        };

        words
            .iter()
            .filter(|a| !a.description.trim().is_empty())
            .map(|a| {
                let points: Vec<(f32, f32)> = a
                    .bounding_poly
                    .as_ref()
                    .map(|poly| poly.vertices.iter().map(|v| (v.x, v.y)).collect())
                    .unwrap_or_default();
                TextSpan {
                    text: a.description.clone(),
                    bounding_box: Rect::from_points(&points),
                    region_id: None,
                    confidence: None,
                }
            })
            .collect()
    }
}

#[async_trait]
impl OcrAdapter for CloudVisionAdapter {
    fn core(&self) -> &AdapterCore {
        &self.core
    }

    async fn initialize(&self, endpoint: Option<String>) -> Result<(), OcrError> {
        let settings = self.settings.read().clone();
        if let Some(endpoint) = endpoint {
            *self.endpoint_override.lock() = Some(endpoint.trim_end_matches('/').to_string());
        }
        let base_url = self.target_url(&settings);

        if self.endpoint.lock().as_deref() == Some(base_url.as_str())
            && self.core.status() != AdapterStatus::Disabled
        {
            return Ok(());
        }

        if let Err(e) = Self::check_credentials(&settings) {
            let _ = self.core.disable();
            return Err(e);
        }

        *self.endpoint.lock() = Some(base_url.clone());
        *self.token.lock().await = None;
        self.core.enable();
        info!("{} initialized ({})", CLOUD_VISION_ADAPTER, base_url);
        Ok(())
    }

    async fn recognize(
        &self,
        input: RecognitionInput,
    ) -> Result<Option<RecognitionResult>, OcrError> {
        let _processing = self.core.begin_processing()?;
        let start = Instant::now();
        let base_url = self.endpoint.lock().clone().ok_or_else(|| {
            OcrError::EngineUnavailable(format!("{} is not initialized", CLOUD_VISION_ADAPTER))
        })?;
        let settings = self.settings.read().clone();

        let language = normalize_language(&input.language_code);
        if !SUPPORTED_LANGUAGES.contains(&language.as_str()) {
            return Err(OcrError::UnsupportedLanguage(input.language_code));
        }

        image::guess_format(&input.image_bytes)
            .map_err(|e| OcrError::InvalidImage(e.to_string()))?;

        let token = self.access_token().await?;
        let request = AnnotateRequest {
            requests: vec![AnnotateImageRequest {
                image: ImageContent {
                    content: base64::engine::general_purpose::STANDARD.encode(&input.image_bytes),
                },
                features: vec![Feature { kind: "TEXT_DETECTION" }],
                image_context: settings.language_hints.then(|| ImageContext {
                    language_hints: vec![language.clone()],
                }),
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/images:annotate", base_url))
            .bearer_auth(token)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .json(&request)
            .send()
            .await
            .map_err(|e| OcrError::EngineUnavailable(format!("cloud request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(OcrError::EngineUnavailable(format!(
                "cloud API returned {}",
                response.status()
            )));
        }

        let body: AnnotateResponse = response
            .json()
            .await
            .map_err(|e| OcrError::EngineUnavailable(format!("malformed cloud response: {}", e)))?;

        let Some(image_response) = body.responses.into_iter().next() else {
            return Ok(None);
        };
        if let Some(error) = &image_response.error {
            return Err(if error.code == STATUS_INVALID_ARGUMENT {
                OcrError::InvalidImage(error.message.clone())
            } else {
                OcrError::EngineUnavailable(error.message.clone())
            });
        }

        let spans = Self::translate(image_response);
        debug!(
            "{} recognized {} spans in {:?}",
            CLOUD_VISION_ADAPTER,
            spans.len(),
            start.elapsed()
        );

        if spans.is_empty() {
            return Ok(None);
        }

        Ok(Some(RecognitionResult {
            spans,
            adapter: CLOUD_VISION_ADAPTER.to_string(),
            processing_time_ms: start.elapsed().as_millis() as u64,
        }))
    }

    async fn supported_languages(&self) -> Result<BTreeSet<String>, OcrError> {
        if let Some(languages) = self.core.cached_languages() {
            return Ok(languages);
        }
        let languages: BTreeSet<String> =
            SUPPORTED_LANGUAGES.iter().map(|l| l.to_string()).collect();
        self.core.cache_languages(languages.clone());
        Ok(languages)
    }

    async fn update_settings(
        &self,
        update: EngineSettings,
        old: Option<EngineSettings>,
    ) -> Result<SettingsUpdate, OcrError> {
        let base = old.unwrap_or_else(|| self.settings());
        let previous: CloudVisionSettings = base.to_typed()?;
        let merged: CloudVisionSettings = base.merged_with(&update).to_typed()?;
        merged.validate()?;

        Ok(SettingsUpdate {
            restart: merged.requires_restart(&previous),
            settings: EngineSettings::from_typed(&merged)?,
        })
    }

    fn commit_settings(&self, settings: EngineSettings) -> Result<(), OcrError> {
        let settings: CloudVisionSettings = settings.to_typed()?;
        settings.validate()?;
        *self.settings.write() = settings;
        Ok(())
    }

    fn settings(&self) -> EngineSettings {
        EngineSettings::from_typed(&*self.settings.read()).unwrap_or_default()
    }

    fn default_settings(&self) -> EngineSettings {
        EngineSettings::from_typed(&CloudVisionSettings::default()).unwrap_or_default()
    }

    fn settings_options(&self) -> SettingsOptions {
        // Inference runs remotely; nothing to choose
        SettingsOptions::default()
    }

    async fn restart_with(&self, settings: EngineSettings) -> Result<(), OcrError> {
        let staged: CloudVisionSettings = settings.to_typed()?;
        staged.validate()?;

        self.core
            .run_restart(|| async {
                info!("Restarting {}", CLOUD_VISION_ADAPTER);
                *self.token.lock().await = None;
                Self::check_credentials(&staged)?;

                // A new configured base URL replaces an explicit endpoint
                let moved = staged.api_base_url != self.settings.read().api_base_url;
                if moved {
                    *self.endpoint_override.lock() = None;
                }
                *self.endpoint.lock() = Some(self.target_url(&staged));
                *self.settings.write() = staged;
                Ok(())
            })
            .await
    }
}
