//! Image transforms applied between fetch and output storage.
//!
//! Transforms are synchronous CPU work; the processor runs them on the blocking pool.

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

use crate::error::TransformError;

/// Encoded transform output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedImage {
    pub bytes: Vec<u8>,
    pub extension: &'static str,
    pub content_type: &'static str,
}

pub trait ImageTransform: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// True when the transform never changes pixels; such units go to the fast lane
    fn is_pass_through(&self) -> bool;

    fn apply(&self, input: &[u8]) -> Result<TransformedImage, TransformError>;
}

/// Deterministic downscale by a fixed ratio, keeping the input's format when it can be
/// encoded and falling back to PNG otherwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownscaleTransform {
    ratio: f64,
}

impl DownscaleTransform {
    pub fn new(ratio: f64) -> Result<Self, TransformError> {
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(TransformError::InvalidParameters(format!(
                "downscale ratio {ratio} is outside (0, 1]"
            )));
        }
        Ok(Self { ratio })
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    fn scaled(&self, dimension: u32) -> u32 {
        ((dimension as f64 * self.ratio).round() as u32).max(1)
    }
}

fn output_format(input: Option<ImageFormat>) -> ImageFormat {
    match input {
        Some(
            format @ (ImageFormat::Png
            | ImageFormat::Jpeg
            | ImageFormat::Gif
            | ImageFormat::WebP
            | ImageFormat::Bmp),
        ) => format,
        _ => ImageFormat::Png,
    }
}

fn describe(format: ImageFormat) -> (&'static str, &'static str) {
    match format {
        ImageFormat::Jpeg => ("jpg", "image/jpeg"),
        ImageFormat::Gif => ("gif", "image/gif"),
        ImageFormat::WebP => ("webp", "image/webp"),
        ImageFormat::Bmp => ("bmp", "image/bmp"),
        _ => ("png", "image/png"),
    }
}

fn encode(image: DynamicImage, format: ImageFormat) -> Result<Vec<u8>, TransformError> {
    // JPEG has no alpha channel
    let image = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
        _ => image,
    };
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, format)
        .map_err(|e| TransformError::Encode(e.to_string()))?;
    Ok(cursor.into_inner())
}

impl ImageTransform for DownscaleTransform {
    fn name(&self) -> &'static str {
        "downscale"
    }

    fn is_pass_through(&self) -> bool {
        (self.ratio - 1.0).abs() < f64::EPSILON
    }

    fn apply(&self, input: &[u8]) -> Result<TransformedImage, TransformError> {
        let detected = image::guess_format(input).ok();
        let decoded = image::load_from_memory(input)
            .map_err(|e| TransformError::Decode(e.to_string()))?;

        let format = output_format(detected);
        let (extension, content_type) = describe(format);

        if self.is_pass_through() && detected == Some(format) {
            return Ok(TransformedImage {
                bytes: input.to_vec(),
                extension,
                content_type,
            });
        }

        let resized = decoded.resize_exact(
            self.scaled(decoded.width()),
            self.scaled(decoded.height()),
            FilterType::Triangle,
        );

        Ok(TransformedImage {
            bytes: encode(resized, format)?,
            extension,
            content_type,
        })
    }
}
