//! Storage Layer
//!
//! Handles persistence of templates and applied engine settings.

pub mod templates;

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::templates::{OcrTemplate, TemplateId};
use crate::vision::{EngineSettings, OcrError};

pub use templates::JsonStore;

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "ocrrelay", "OcrRelay")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;

    let data_dir = proj_dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "ocrrelay", "OcrRelay")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    let config_dir = proj_dirs.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Template and settings persistence used by the runtime
pub trait Persistence: Send + Sync {
    /// Load a template, `None` if it does not exist
    fn load(&self, id: &str) -> Result<Option<OcrTemplate>, OcrError>;

    /// Insert or replace a template
    fn save(&self, template: &OcrTemplate) -> Result<(), OcrError>;

    /// Delete a template; returns whether it existed
    fn delete(&self, id: &str) -> Result<bool, OcrError>;

    /// All stored templates, ordered by creation time
    fn list(&self) -> Result<Vec<OcrTemplate>, OcrError>;

    /// Last applied settings of an adapter
    fn load_settings(&self, adapter: &str) -> Result<Option<EngineSettings>, OcrError>;

    fn save_settings(&self, adapter: &str, settings: &EngineSettings) -> Result<(), OcrError>;
}

/// In-memory store, used for tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryStore {
    templates: RwLock<HashMap<TemplateId, OcrTemplate>>,
    settings: RwLock<HashMap<String, EngineSettings>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryStore {
    fn load(&self, id: &str) -> Result<Option<OcrTemplate>, OcrError> {
        Ok(self.templates.read().get(id).cloned())
    }

    fn save(&self, template: &OcrTemplate) -> Result<(), OcrError> {
        self.templates
            .write()
            .insert(template.id.clone(), template.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, OcrError> {
        Ok(self.templates.write().remove(id).is_some())
    }

    fn list(&self) -> Result<Vec<OcrTemplate>, OcrError> {
        let mut templates: Vec<OcrTemplate> = self.templates.read().values().cloned().collect();
        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(templates)
    }

    fn load_settings(&self, adapter: &str) -> Result<Option<EngineSettings>, OcrError> {
        Ok(self.settings.read().get(adapter).cloned())
    }

    fn save_settings(&self, adapter: &str, settings: &EngineSettings) -> Result<(), OcrError> {
        self.settings
            .write()
            .insert(adapter.to_string(), settings.clone());
        Ok(())
    }
}
