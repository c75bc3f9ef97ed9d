//! Application Session
//!
//! Owns the adapter registry, the recognition orchestrator, the settings
//! coordinator and the template service for one running session, wired
//! together from the application configuration.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::recognition::{CaptureHandle, Orchestrator, RecognitionRequest};
use crate::settings::{SettingsApplied, SettingsCoordinator};
use crate::storage::Persistence;
use crate::templates::{TemplateService, TemplateTargeting};
use crate::vision::{
    AdapterRegistry, AdapterStatus, CloudVisionAdapter, EngineSettings, LocalServiceAdapter,
    OcrAdapter, OcrError, SettingsOptions,
};

/// Engine summary for listings
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub name: String,
    pub status: AdapterStatus,
    pub active: bool,
    /// A capture is in flight on this engine
    pub busy: bool,
    pub settings: EngineSettings,
    pub defaults: EngineSettings,
    pub options: SettingsOptions,
}

/// Main session context
pub struct OcrApp {
    config: AppConfig,
    registry: Arc<AdapterRegistry>,
    orchestrator: Orchestrator,
    settings: SettingsCoordinator,
    templates: TemplateService,
}

impl OcrApp {
    /// Create a session with the built-in engines configured from `config`
    pub fn new(config: AppConfig, store: Arc<dyn Persistence>) -> Self {
        let adapters: Vec<Arc<dyn OcrAdapter>> = vec![
            Arc::new(LocalServiceAdapter::new(config.local_service.clone())),
            Arc::new(CloudVisionAdapter::new(config.cloud_vision.clone())),
        ];
        Self::with_adapters(config, store, adapters)
    }

    /// Create a session over an explicit set of adapters
    pub fn with_adapters(
        config: AppConfig,
        store: Arc<dyn Persistence>,
        adapters: Vec<Arc<dyn OcrAdapter>>,
    ) -> Self {
        let registry = Arc::new(AdapterRegistry::new());
        for adapter in adapters {
            registry.register(adapter);
        }

        let targeting = TemplateTargeting::new(config.targeting.min_region_size);
        let templates = TemplateService::new(store.clone(), targeting);
        if let Some(template_id) = &config.general.active_template {
            if let Err(e) = templates.set_active(Some(template_id)) {
                warn!("Configured template {} not activated: {}", template_id, e);
            }
        }

        Self {
            orchestrator: Orchestrator::new(registry.clone()),
            settings: SettingsCoordinator::new(registry.clone(), store),
            templates,
            registry,
            config,
        }
    }

    /// Replace the configured engine settings with the persisted ones
    pub async fn load_settings(&self) -> Result<()> {
        self.settings
            .load_persisted()
            .await
            .context("Failed to load persisted engine settings")
    }

    /// Load persisted engine settings and activate the configured engine
    pub async fn start(&self) -> Result<()> {
        self.load_settings().await?;

        let engine = &self.config.general.active_engine;
        self.settings
            .activate(engine)
            .await
            .with_context(|| format!("Failed to activate engine '{}'", engine))?;

        info!("Session started with engine {}", engine);
        Ok(())
    }

    pub fn templates(&self) -> &TemplateService {
        &self.templates
    }

    /// Start recognizing a capture. Without an explicit template the
    /// session's active template (if any) scopes the recognition.
    pub fn capture(
        &self,
        image_bytes: Vec<u8>,
        language_code: Option<&str>,
        template_id: Option<&str>,
    ) -> Result<CaptureHandle, OcrError> {
        let request = self.capture_request(image_bytes, language_code, template_id)?;
        Ok(self.orchestrator.capture(request))
    }

    /// Build a capture request, resolving the template and default language
    fn capture_request(
        &self,
        image_bytes: Vec<u8>,
        language_code: Option<&str>,
        template_id: Option<&str>,
    ) -> Result<RecognitionRequest, OcrError> {
        let template = match template_id {
            Some(id) => Some(self.templates.get(id)?),
            None => self.templates.active()?,
        };

        Ok(RecognitionRequest {
            image_bytes,
            language_code: language_code
                .unwrap_or(&self.config.general.default_language)
                .to_string(),
            template,
        })
    }

    pub fn engines(&self) -> Vec<EngineInfo> {
        let active = self.registry.active_name();
        self.registry
            .names()
            .into_iter()
            .filter_map(|name| self.registry.get(&name).ok())
            .map(|adapter| EngineInfo {
                name: adapter.name().to_string(),
                status: adapter.status(),
                active: active.as_deref() == Some(adapter.name()),
                busy: self.orchestrator.is_in_flight(adapter.name()),
                settings: redact_secrets(adapter.settings()),
                defaults: redact_secrets(adapter.default_settings()),
                options: adapter.settings_options(),
            })
            .collect()
    }

    /// Languages supported by the active engine
    pub async fn languages(&self) -> Result<BTreeSet<String>, OcrError> {
        self.registry.active()?.supported_languages().await
    }

    /// Apply settings to `engine` and make sure they took effect before
    /// returning. The engine is activated first, so a restart-requiring
    /// change runs a real restart and is only persisted once it succeeded.
    /// An engine that cannot start with its current settings gets the new
    /// ones through the restart on activation instead.
    pub async fn configure_engine(
        &self,
        engine: &str,
        update: EngineSettings,
    ) -> Result<SettingsApplied, OcrError> {
        match self.switch_engine(engine).await {
            Ok(()) => {}
            Err(e @ OcrError::UnknownAdapter(_)) => return Err(e),
            Err(e) => warn!("{} did not start with its current settings: {}", engine, e),
        }

        match self.settings.apply(engine, update).await? {
            SettingsApplied::Deferred => {
                self.switch_engine(engine).await?;
                Ok(SettingsApplied::Restarted)
            }
            applied => Ok(applied),
        }
    }

    pub async fn switch_engine(&self, engine: &str) -> Result<(), OcrError> {
        self.settings.activate(engine).await
    }

    /// Restart the active engine with its current settings
    pub async fn restart_engine(&self, engine: &str) -> Result<(), OcrError> {
        self.settings.restart(engine).await
    }

    /// Release every engine's backend resources
    pub async fn shutdown(&self) {
        for name in self.registry.names() {
            match self.registry.get(&name) {
                Ok(adapter) => adapter.shutdown().await,
                Err(e) => warn!("Skipping shutdown of {}: {}", name, e),
            }
        }
        info!("Session shut down");
    }
}

/// Hide credential values from listings
fn redact_secrets(settings: EngineSettings) -> EngineSettings {
    let mut value = settings.as_value().clone();
    if let Some(key) = value.get_mut("private_key") {
        if key.as_str().is_some_and(|k| !k.is_empty()) {
            *key = serde_json::Value::String("<redacted>".into());
        }
    }
    EngineSettings::new(value)
}
