//! Decoded capture image and region cropping

use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

use crate::vision::{OcrError, Rect};

/// A captured screen image, decoded once per capture
#[derive(Debug)]
pub struct CapturedFrame {
    /// Decoded pixel data
    pub image: DynamicImage,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl CapturedFrame {
    /// Decode an encoded capture (PNG, JPEG, BMP, ...)
    pub fn decode(bytes: &[u8]) -> Result<Self, OcrError> {
        let image =
            image::load_from_memory(bytes).map_err(|e| OcrError::InvalidImage(e.to_string()))?;
        Ok(Self::from_image(image))
    }

    pub fn from_image(image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        Self {
            image,
            width,
            height,
        }
    }

    /// Crop `rect` (clamped to the frame) and encode it as PNG
    pub fn crop_png(&self, rect: Rect) -> Result<Vec<u8>, OcrError> {
        let x = rect.x.min(self.width.saturating_sub(1));
        let y = rect.y.min(self.height.saturating_sub(1));
        let width = rect.width.min(self.width - x).max(1);
        let height = rect.height.min(self.height - y).max(1);

        let cropped = self.image.crop_imm(x, y, width, height);
        let mut buf = Cursor::new(Vec::new());
        cropped
            .write_to(&mut buf, ImageFormat::Png)
            .map_err(|e| OcrError::InvalidImage(format!("failed to encode crop: {}", e)))?;
        Ok(buf.into_inner())
    }
}

#[cfg(test)]
pub(crate) fn test_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba([255, 255, 255, 255]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .expect("encode test image");
    buf.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_dimensions() {
        let frame = CapturedFrame::decode(&test_png(64, 32)).unwrap();
        assert_eq!((frame.width, frame.height), (64, 32));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let err = CapturedFrame::decode(b"garbage").unwrap_err();
        assert!(matches!(err, OcrError::InvalidImage(_)));
    }

    #[test]
    fn test_crop_png_clamps_to_frame() {
        let frame = CapturedFrame::decode(&test_png(64, 32)).unwrap();

        let crop = frame.crop_png(Rect::new(60, 30, 50, 50)).unwrap();
        let decoded = image::load_from_memory(&crop).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 2));

        let crop = frame.crop_png(Rect::new(8, 4, 16, 8)).unwrap();
        let decoded = image::load_from_memory(&crop).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }
}
