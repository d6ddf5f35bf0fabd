use image::codecs::jpeg::JpegEncoder;

use crate::config::ImageConfig;
use crate::error::{AppError, Result};

/// Shrinks images before upload so requests stay small.
#[derive(Debug, Clone)]
pub struct ImagePreparer {
    enabled: bool,
    max_dimension: u32,
    jpeg_quality: u8,
}

impl ImagePreparer {
    pub fn new(config: &ImageConfig) -> Self {
        Self {
            enabled: config.resize,
            max_dimension: config.max_dimension,
            jpeg_quality: config.jpeg_quality,
        }
    }

    /// Pass images through unchanged.
    pub fn passthrough() -> Self {
        Self {
            enabled: false,
            max_dimension: 0,
            jpeg_quality: 0,
        }
    }

    /// Fit the image inside `max_dimension` squared (never enlarging),
    /// drop alpha, and re-encode as JPEG.
    pub fn prepare(&self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        if !self.enabled {
            return Ok(bytes);
        }

        let mut decoded = image::load_from_memory(&bytes)
            .map_err(|e| AppError::Image(format!("Failed to decode image: {e}")))?;

        if decoded.width() > self.max_dimension || decoded.height() > self.max_dimension {
            decoded = decoded.thumbnail(self.max_dimension, self.max_dimension);
        }

        let rgb = decoded.to_rgb8();
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.jpeg_quality).encode_image(&rgb)?;
        Ok(out)
    }

    /// Run [`prepare`](Self::prepare) off the async runtime.
    pub async fn prepare_blocking(&self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        if !self.enabled {
            return Ok(bytes);
        }
        let preparer = self.clone();
        tokio::task::spawn_blocking(move || preparer.prepare(bytes))
            .await
            .map_err(|e| AppError::Internal(format!("Image task panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GenericImageView, ImageFormat, RgbaImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(width, height));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
        buf
    }

    fn preparer() -> ImagePreparer {
        ImagePreparer::new(&ImageConfig::default())
    }

    #[test]
    fn test_large_image_is_shrunk_to_jpeg() {
        let out = preparer().prepare(png(600, 400)).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (300, 200));
    }

    #[test]
    fn test_small_image_is_not_enlarged() {
        let out = preparer().prepare(png(120, 80)).unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (120, 80));
    }

    #[test]
    fn test_undecodable_bytes_fail() {
        let result = preparer().prepare(b"definitely not an image".to_vec());
        assert!(matches!(result, Err(AppError::Image(_))));
    }

    #[test]
    fn test_passthrough_keeps_bytes() {
        let bytes = b"raw".to_vec();
        assert_eq!(ImagePreparer::passthrough().prepare(bytes.clone()).unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_prepare_blocking() {
        let out = preparer().prepare_blocking(png(900, 900)).await.unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!(decoded.dimensions(), (300, 300));
    }
}
