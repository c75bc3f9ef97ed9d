//! OCR templates and target-region geometry
//!
//! A template is a reference image plus an ordered list of target regions.
//! Region geometry is always stored normalized (0.0-1.0) against the
//! reference image, and only converted to pixels once a concrete capture
//! resolution is known.

pub mod service;

use chrono::{DateTime, Utc};
use image::ImageReader;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::vision::{OcrError, Rect};

pub use service::TemplateService;

/// Smallest accepted normalized width or height of a target region
pub const MIN_REGION_SIZE: f32 = 0.025;

pub type TemplateId = String;

/// Normalized top-left corner
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub top: f32,
    pub left: f32,
}

/// Normalized extent
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

/// One normalized rectangular sub-area of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRegion {
    pub id: String,
    pub template_id: TemplateId,
    pub position: Position,
    pub size: Size,
    /// Rotation in degrees; informational, crops stay axis-aligned
    #[serde(default)]
    pub angle: f32,
}

/// Geometry of a region being added or updated
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegionDraft {
    pub position: Position,
    pub size: Size,
    pub angle: f32,
}

/// A saved reference image with its target regions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrTemplate {
    pub id: TemplateId,
    pub name: String,
    /// Encoded reference image captured at creation time
    #[serde(with = "base64_bytes")]
    pub reference_image: Vec<u8>,
    pub image_width: u32,
    pub image_height: u32,
    #[serde(default)]
    pub target_regions: Vec<TargetRegion>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OcrTemplate {
    /// Create a template from a captured reference image
    pub fn new(name: impl Into<String>, reference_image: Vec<u8>) -> Result<Self, OcrError> {
        let (image_width, image_height) = ImageReader::new(Cursor::new(&reference_image))
            .with_guessed_format()
            .map_err(|e| OcrError::InvalidImage(e.to_string()))?
            .into_dimensions()
            .map_err(|e| OcrError::InvalidImage(e.to_string()))?;

        let now = Utc::now();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            reference_image,
            image_width,
            image_height,
            target_regions: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn region(&self, region_id: &str) -> Option<&TargetRegion> {
        self.target_regions.iter().find(|r| r.id == region_id)
    }
}

/// A target region mapped onto a concrete capture
#[derive(Debug, Clone, PartialEq)]
pub struct PixelRegion {
    pub region_id: String,
    /// Axis-aligned crop in capture pixels
    pub rect: Rect,
    /// Rotation carried through for rendering
    pub angle: f32,
}

/// Map every target region onto a capture of `width` x `height` pixels,
/// in the template's stored order
pub fn to_pixel_regions(template: &OcrTemplate, width: u32, height: u32) -> Vec<PixelRegion> {
    template
        .target_regions
        .iter()
        .map(|region| PixelRegion {
            region_id: region.id.clone(),
            rect: to_pixel_rect(region.position, region.size, width, height),
            angle: region.angle,
        })
        .collect()
}

/// Scale a normalized rectangle to pixels, clamped to the image and at
/// least one pixel wide and tall
pub fn to_pixel_rect(position: Position, size: Size, width: u32, height: u32) -> Rect {
    let scale = |value: f32, extent: u32| -> u32 {
        ((value.clamp(0.0, 1.0) as f64) * extent as f64).round() as u32
    };

    let x = scale(position.left, width).min(width.saturating_sub(1));
    let y = scale(position.top, height).min(height.saturating_sub(1));
    let w = scale(size.width, width).clamp(1, (width - x).max(1));
    let h = scale(size.height, height).clamp(1, (height - y).max(1));

    Rect::new(x, y, w, h)
}

/// Inverse of [`to_pixel_rect`]: normalize a pixel rectangle against an image
pub fn normalize_rect(rect: Rect, width: u32, height: u32) -> (Position, Size) {
    let width = width.max(1) as f32;
    let height = height.max(1) as f32;
    (
        Position {
            top: (rect.y as f32 / height).clamp(0.0, 1.0),
            left: (rect.x as f32 / width).clamp(0.0, 1.0),
        },
        Size {
            width: (rect.width as f32 / width).clamp(0.0, 1.0),
            height: (rect.height as f32 / height).clamp(0.0, 1.0),
        },
    )
}

/// Slack for f32 rounding when comparing region extents
const EXTENT_EPSILON: f32 = 1e-6;

/// Shrink `extent` so that `offset + extent` stays within the unit range
fn fit_extent(offset: f32, extent: f32) -> f32 {
    if offset + extent <= 1.0 + EXTENT_EPSILON {
        extent.max(0.0)
    } else {
        (1.0 - offset).max(0.0)
    }
}

/// Region editing rules for templates
#[derive(Debug, Clone, Copy)]
pub struct TemplateTargeting {
    min_region_size: f32,
}

impl Default for TemplateTargeting {
    fn default() -> Self {
        Self::new(MIN_REGION_SIZE)
    }
}

impl TemplateTargeting {
    pub fn new(min_region_size: f32) -> Self {
        Self { min_region_size }
    }

    /// Clamp a draft into the unit square and enforce the minimum size
    fn settle(&self, draft: RegionDraft) -> Result<RegionDraft, OcrError> {
        let values = [
            draft.position.top,
            draft.position.left,
            draft.size.width,
            draft.size.height,
            draft.angle,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(OcrError::InvalidRegion("region geometry must be finite".into()));
        }

        let top = draft.position.top.clamp(0.0, 1.0);
        let left = draft.position.left.clamp(0.0, 1.0);
        let width = fit_extent(left, draft.size.width);
        let height = fit_extent(top, draft.size.height);

        // Tolerates the rounding of `1.0 - offset` for regions flush with an edge
        let min = self.min_region_size - EXTENT_EPSILON;
        if width < min || height < min {
            return Err(OcrError::RegionTooSmall {
                width,
                height,
                min: self.min_region_size,
            });
        }

        Ok(RegionDraft {
            position: Position { top, left },
            size: Size { width, height },
            angle: draft.angle % 360.0,
        })
    }

    /// Next free region id of a template ("<template_id>/<n>", counting up)
    fn next_region_id(template: &OcrTemplate) -> String {
        let next = template
            .target_regions
            .iter()
            .filter_map(|r| r.id.rsplit('/').next()?.parse::<u32>().ok())
            .max()
            .map_or(1, |n| n + 1);
        format!("{}/{}", template.id, next)
    }

    /// Append a region; returns the updated region list
    pub fn add_region(
        &self,
        template: &OcrTemplate,
        draft: RegionDraft,
    ) -> Result<Vec<TargetRegion>, OcrError> {
        let draft = self.settle(draft)?;
        let mut regions = template.target_regions.clone();
        regions.push(TargetRegion {
            id: Self::next_region_id(template),
            template_id: template.id.clone(),
            position: draft.position,
            size: draft.size,
            angle: draft.angle,
        });
        Ok(regions)
    }

    /// Remove a region; returns the updated region list
    pub fn remove_region(
        &self,
        template: &OcrTemplate,
        region_id: &str,
    ) -> Result<Vec<TargetRegion>, OcrError> {
        if template.region(region_id).is_none() {
            return Err(OcrError::RegionNotFound(region_id.to_string()));
        }
        Ok(template
            .target_regions
            .iter()
            .filter(|r| r.id != region_id)
            .cloned()
            .collect())
    }

    /// Replace a region's geometry in place; returns the updated region list
    pub fn update_region(
        &self,
        template: &OcrTemplate,
        region_id: &str,
        draft: RegionDraft,
    ) -> Result<Vec<TargetRegion>, OcrError> {
        let draft = self.settle(draft)?;
        let mut regions = template.target_regions.clone();
        let region = regions
            .iter_mut()
            .find(|r| r.id == region_id)
            .ok_or_else(|| OcrError::RegionNotFound(region_id.to_string()))?;

        region.position = draft.position;
        region.size = draft.size;
        region.angle = draft.angle;
        Ok(regions)
    }
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
