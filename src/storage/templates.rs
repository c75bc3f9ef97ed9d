//! File-backed template and settings storage

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::Persistence;
use crate::templates::OcrTemplate;
use crate::vision::{EngineSettings, OcrError};

/// Load a template from file
pub fn load_template(path: &Path) -> Result<OcrTemplate> {
    let content = std::fs::read_to_string(path)?;
    let template: OcrTemplate = serde_json::from_str(&content)?;
    Ok(template)
}

/// Save a template to file
pub fn save_template(template: &OcrTemplate, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(template)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// JSON files under a root directory:
/// `templates/<id>.json` and `settings/<adapter>.json`
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for dir in ["templates", "settings"] {
            std::fs::create_dir_all(root.join(dir))
                .with_context(|| format!("Failed to create {}", root.join(dir).display()))?;
        }
        Ok(Self { root })
    }

    /// Open the store in the platform data directory
    pub fn open_default() -> Result<Self> {
        Self::open(super::get_data_dir()?)
    }

    fn template_path(&self, id: &str) -> Result<PathBuf, OcrError> {
        Ok(self.root.join("templates").join(format!("{}.json", file_key(id)?)))
    }

    fn settings_path(&self, adapter: &str) -> Result<PathBuf, OcrError> {
        Ok(self.root.join("settings").join(format!("{}.json", file_key(adapter)?)))
    }
}

/// Reject keys that would escape the store directory
fn file_key(key: &str) -> Result<&str, OcrError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(key)
    } else {
        Err(OcrError::Storage(format!("invalid storage key '{}'", key)))
    }
}

fn storage_err(e: anyhow::Error) -> OcrError {
    OcrError::Storage(format!("{:#}", e))
}

impl Persistence for JsonStore {
    fn load(&self, id: &str) -> Result<Option<OcrTemplate>, OcrError> {
        let path = self.template_path(id)?;
        if !path.exists() {
            return Ok(None);
        }
        load_template(&path)
            .with_context(|| format!("Failed to load template {}", path.display()))
            .map(Some)
            .map_err(storage_err)
    }

    fn save(&self, template: &OcrTemplate) -> Result<(), OcrError> {
        let path = self.template_path(&template.id)?;
        save_template(template, &path)
            .with_context(|| format!("Failed to save template {}", path.display()))
            .map_err(storage_err)?;
        debug!("Saved template '{}' to {:?}", template.name, path);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, OcrError> {
        let path = self.template_path(id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(OcrError::Storage(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn list(&self) -> Result<Vec<OcrTemplate>, OcrError> {
        let dir = self.root.join("templates");
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| OcrError::Storage(format!("Failed to read {}: {}", dir.display(), e)))?;

        let mut templates = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_template(&path) {
                Ok(template) => templates.push(template),
                Err(e) => warn!("Skipping unreadable template {:?}: {}", path, e),
            }
        }

        templates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(templates)
    }

    fn load_settings(&self, adapter: &str) -> Result<Option<EngineSettings>, OcrError> {
        let path = self.settings_path(adapter)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| OcrError::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
        let settings = serde_json::from_str(&content)
            .map_err(|e| OcrError::Storage(format!("Failed to parse {}: {}", path.display(), e)))?;
        Ok(Some(settings))
    }

    fn save_settings(&self, adapter: &str, settings: &EngineSettings) -> Result<(), OcrError> {
        let path = self.settings_path(adapter)?;
        let content = serde_json::to_string_pretty(settings)
            .map_err(|e| OcrError::Storage(e.to_string()))?;
        std::fs::write(&path, content)
            .map_err(|e| OcrError::Storage(format!("Failed to write {}: {}", path.display(), e)))?;
        debug!("Persisted settings for '{}'", adapter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::test_png;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_template() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let template = OcrTemplate::new("status bar", test_png(20, 10)).unwrap();

        store.save(&template).unwrap();
        let loaded = store.load(&template.id).unwrap().unwrap();
        assert_eq!(loaded, template);
        assert_eq!(loaded.reference_image, template.reference_image);
    }

    #[test]
    fn test_load_missing_template() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        assert!(store.load("does-not-exist").unwrap().is_none());
    }

    #[test]
    fn test_list_skips_corrupt_files() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        let first = OcrTemplate::new("first", test_png(4, 4)).unwrap();
        store.save(&first).unwrap();
        std::fs::write(dir.path().join("templates").join("broken.json"), "{ not json").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, first.id);
    }

    #[test]
    fn test_delete_template() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let template = OcrTemplate::new("gone", test_png(4, 4)).unwrap();

        store.save(&template).unwrap();
        assert!(store.delete(&template.id).unwrap());
        assert!(!store.delete(&template.id).unwrap());
    }

    #[test]
    fn test_rejects_path_traversal_keys() {
        let dir = TempDir::new().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        assert!(matches!(store.load("../secret"), Err(OcrError::Storage(_))));
        assert!(matches!(
            store.save_settings("a/b", &EngineSettings::default()),
            Err(OcrError::Storage(_))
        ));
    }

    #[test]
    fn test_settings_persist_across_instances() {
        let dir = TempDir::new().unwrap();
        let settings = EngineSettings::new(json!({ "inference_runtime": "cuda" }));

        JsonStore::open(dir.path())
            .unwrap()
            .save_settings("local_service", &settings)
            .unwrap();

        let reopened = JsonStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load_settings("local_service").unwrap(), Some(settings));
        assert!(reopened.load_settings("cloud_vision").unwrap().is_none());
    }
}
