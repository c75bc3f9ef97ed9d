//! Template CRUD and the session's active template

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

use super::{OcrTemplate, RegionDraft, TargetRegion, TemplateId, TemplateTargeting};
use crate::storage::Persistence;
use crate::vision::OcrError;

/// Creates, edits and activates templates on top of a [`Persistence`] store
pub struct TemplateService {
    store: Arc<dyn Persistence>,
    targeting: TemplateTargeting,
    /// Session-scoped; not persisted
    active: RwLock<Option<TemplateId>>,
}

impl TemplateService {
    pub fn new(store: Arc<dyn Persistence>, targeting: TemplateTargeting) -> Self {
        Self {
            store,
            targeting,
            active: RwLock::new(None),
        }
    }

    pub fn create(&self, name: &str, reference_image: Vec<u8>) -> Result<OcrTemplate, OcrError> {
        let template = OcrTemplate::new(name, reference_image)?;
        self.store.save(&template)?;
        info!(
            "Created template '{}' ({}x{})",
            template.name, template.image_width, template.image_height
        );
        Ok(template)
    }

    pub fn get(&self, id: &str) -> Result<OcrTemplate, OcrError> {
        self.store
            .load(id)?
            .ok_or_else(|| OcrError::TemplateNotFound(id.to_string()))
    }

    /// All templates, optionally filtered by a case-insensitive name substring
    pub fn list(&self, name_filter: Option<&str>) -> Result<Vec<OcrTemplate>, OcrError> {
        let templates = self.store.list()?;
        let Some(filter) = name_filter.map(str::to_lowercase) else {
            return Ok(templates);
        };
        Ok(templates
            .into_iter()
            .filter(|t| t.name.to_lowercase().contains(&filter))
            .collect())
    }

    /// Replace a stored template; the reference image and its dimensions
    /// are fixed at creation and kept from the stored copy
    pub fn update(&self, template: OcrTemplate) -> Result<OcrTemplate, OcrError> {
        let stored = self.get(&template.id)?;
        let updated = OcrTemplate {
            reference_image: stored.reference_image,
            image_width: stored.image_width,
            image_height: stored.image_height,
            created_at: stored.created_at,
            updated_at: Utc::now(),
            ..template
        };
        self.store.save(&updated)?;
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<(), OcrError> {
        if !self.store.delete(id)? {
            return Err(OcrError::TemplateNotFound(id.to_string()));
        }

        let mut active = self.active.write();
        if active.as_deref() == Some(id) {
            *active = None;
            info!("Deleted active template {}; no template is active", id);
        }
        Ok(())
    }

    /// The active template, if one is set and still stored
    pub fn active(&self) -> Result<Option<OcrTemplate>, OcrError> {
        let id = self.active.read().clone();
        match id {
            Some(id) => self.store.load(&id),
            None => Ok(None),
        }
    }

    pub fn active_id(&self) -> Option<TemplateId> {
        self.active.read().clone()
    }

    /// Activate a template, or clear the active template with `None`
    pub fn set_active(&self, id: Option<&str>) -> Result<(), OcrError> {
        if let Some(id) = id {
            self.get(id)?;
        }
        *self.active.write() = id.map(str::to_string);
        Ok(())
    }

    pub fn add_region(&self, template_id: &str, draft: RegionDraft) -> Result<TargetRegion, OcrError> {
        let mut template = self.get(template_id)?;
        template.target_regions = self.targeting.add_region(&template, draft)?;
        let added = template
            .target_regions
            .last()
            .cloned()
            .ok_or_else(|| OcrError::Storage("region list empty after insert".into()))?;
        self.save_regions(template)?;
        Ok(added)
    }

    pub fn remove_region(&self, template_id: &str, region_id: &str) -> Result<(), OcrError> {
        let mut template = self.get(template_id)?;
        template.target_regions = self.targeting.remove_region(&template, region_id)?;
        self.save_regions(template)
    }

    pub fn update_region(
        &self,
        template_id: &str,
        region_id: &str,
        draft: RegionDraft,
    ) -> Result<TargetRegion, OcrError> {
        let mut template = self.get(template_id)?;
        template.target_regions = self.targeting.update_region(&template, region_id, draft)?;
        let updated = template
            .region(region_id)
            .cloned()
            .ok_or_else(|| OcrError::RegionNotFound(region_id.to_string()))?;
        self.save_regions(template)?;
        Ok(updated)
    }

    fn save_regions(&self, mut template: OcrTemplate) -> Result<(), OcrError> {
        template.updated_at = Utc::now();
        self.store.save(&template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::test_png;
    use crate::storage::MemoryStore;
    use crate::templates::{Position, Size};

    fn service() -> TemplateService {
        TemplateService::new(Arc::new(MemoryStore::new()), TemplateTargeting::default())
    }

    fn draft(width: f32, height: f32) -> RegionDraft {
        RegionDraft {
            position: Position { top: 0.1, left: 0.1 },
            size: Size { width, height },
            angle: 0.0,
        }
    }

    #[test]
    fn test_create_and_get() {
        let service = service();
        let template = service.create("hud", test_png(32, 16)).unwrap();

        let loaded = service.get(&template.id).unwrap();
        assert_eq!(loaded.name, "hud");
        assert_eq!((loaded.image_width, loaded.image_height), (32, 16));
    }

    #[test]
    fn test_create_with_invalid_image() {
        let service = service();
        assert!(matches!(
            service.create("bad", vec![0, 1, 2]),
            Err(OcrError::InvalidImage(_))
        ));
        assert!(service.list(None).unwrap().is_empty());
    }

    #[test]
    fn test_list_filters_by_name() {
        let service = service();
        service.create("Quest Log", test_png(4, 4)).unwrap();
        service.create("Inventory", test_png(4, 4)).unwrap();

        assert_eq!(service.list(None).unwrap().len(), 2);
        let filtered = service.list(Some("quest")).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "Quest Log");
    }

    #[test]
    fn test_delete_clears_active() {
        let service = service();
        let template = service.create("menu", test_png(4, 4)).unwrap();

        service.set_active(Some(&template.id)).unwrap();
        assert_eq!(service.active().unwrap().map(|t| t.id), Some(template.id.clone()));

        service.delete(&template.id).unwrap();
        assert!(service.active_id().is_none());
        assert!(matches!(service.get(&template.id), Err(OcrError::TemplateNotFound(_))));
        assert!(matches!(service.delete(&template.id), Err(OcrError::TemplateNotFound(_))));
    }

    #[test]
    fn test_set_active_unknown_template() {
        let service = service();
        assert!(matches!(
            service.set_active(Some("missing")),
            Err(OcrError::TemplateNotFound(_))
        ));
        service.set_active(None).unwrap();
        assert!(service.active().unwrap().is_none());
    }

    #[test]
    fn test_region_edits_are_saved() {
        let service = service();
        let template = service.create("dialog", test_png(100, 100)).unwrap();

        let region = service.add_region(&template.id, draft(0.3, 0.2)).unwrap();
        assert_eq!(service.get(&template.id).unwrap().target_regions.len(), 1);

        let updated = service.update_region(&template.id, &region.id, draft(0.5, 0.5)).unwrap();
        assert_eq!(updated.size.width, 0.5);

        // Too small leaves the stored template untouched
        assert!(matches!(
            service.add_region(&template.id, draft(0.01, 0.5)),
            Err(OcrError::RegionTooSmall { .. })
        ));
        assert_eq!(service.get(&template.id).unwrap().target_regions.len(), 1);

        service.remove_region(&template.id, &region.id).unwrap();
        assert!(service.get(&template.id).unwrap().target_regions.is_empty());
    }

    #[test]
    fn test_update_keeps_reference_image() {
        let service = service();
        let template = service.create("old name", test_png(8, 8)).unwrap();

        let mut edited = template.clone();
        edited.name = "new name".into();
        edited.reference_image = Vec::new();
        edited.image_width = 1;

        let updated = service.update(edited).unwrap();
        assert_eq!(updated.name, "new name");
        assert_eq!(updated.reference_image, template.reference_image);
        assert_eq!(updated.image_width, 8);
    }
}
