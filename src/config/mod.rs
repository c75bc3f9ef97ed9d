//! Application Configuration
//!
//! User settings and preferences stored in TOML format.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::templates::MIN_REGION_SIZE;
use crate::vision::local_service::LOCAL_SERVICE_ADAPTER;
use crate::vision::{CloudVisionSettings, LocalServiceSettings};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Local recognition service engine
    pub local_service: LocalServiceSettings,
    /// Google Cloud Vision engine
    pub cloud_vision: CloudVisionSettings,
    /// Template targeting settings
    pub targeting: TargetingConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Engine activated at startup
    pub active_engine: String,
    /// Language used when a capture does not name one
    pub default_language: String,
    /// Template activated at startup
    pub active_template: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            active_engine: LOCAL_SERVICE_ADAPTER.to_string(),
            default_language: "ja".to_string(),
            active_template: None,
        }
    }
}

/// Template targeting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetingConfig {
    /// Smallest normalized region width/height accepted
    pub min_region_size: f32,
}

impl Default for TargetingConfig {
    fn default() -> Self {
        Self {
            min_region_size: MIN_REGION_SIZE,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::local_service::InferenceRuntime;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        // Check general defaults
        assert_eq!(config.general.active_engine, "local_service");
        assert_eq!(config.general.default_language, "ja");
        assert!(config.general.active_template.is_none());

        // Check engine defaults
        assert_eq!(config.local_service.service_address, "127.0.0.1:23456");
        assert!(config.local_service.service_command.is_none());
        assert_eq!(config.local_service.inference_runtime, InferenceRuntime::Cpu);
        assert!(config.cloud_vision.client_email.is_empty());

        // Check targeting defaults
        assert!((config.targeting.min_region_size - 0.025).abs() < f32::EPSILON);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = AppConfig::default();

        // Serialize to TOML
        let toml_str = toml::to_string_pretty(&config).unwrap();

        // Deserialize back
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        // Verify values match
        assert_eq!(config.general.active_engine, parsed.general.active_engine);
        assert_eq!(config.local_service, parsed.local_service);
        assert_eq!(config.cloud_vision, parsed.cloud_vision);
    }

    #[test]
    fn test_config_with_custom_values() {
        let mut config = AppConfig::default();
        config.general.active_engine = "cloud_vision".to_string();
        config.local_service.service_command = Some("/opt/ocr/server".to_string());
        config.local_service.inference_runtime = InferenceRuntime::Cuda;
        config.targeting.min_region_size = 0.05;

        // Serialize and deserialize
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.general.active_engine, "cloud_vision");
        assert_eq!(parsed.local_service.service_command, Some("/opt/ocr/server".to_string()));
        assert_eq!(parsed.local_service.inference_runtime, InferenceRuntime::Cuda);
        assert!((parsed.targeting.min_region_size - 0.05).abs() < 0.001);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [local_service]
            cpu_threads = 8
            "#,
        )
        .unwrap();

        assert_eq!(parsed.local_service.cpu_threads, 8);
        assert_eq!(parsed.local_service.service_address, "127.0.0.1:23456");
        assert_eq!(parsed.general.default_language, "ja");
    }

    #[test]
    fn test_save_and_load_config() {
        let config = AppConfig::default();

        // Create a temporary file
        let temp_file = NamedTempFile::new().unwrap();

        // Save config
        save_config(&config, temp_file.path()).unwrap();

        // Load config
        let loaded = load_config(temp_file.path()).unwrap();

        // Verify
        assert_eq!(config.general.default_language, loaded.general.default_language);
        assert_eq!(config.local_service.cpu_threads, loaded.local_service.cpu_threads);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }
}
