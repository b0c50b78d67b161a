use crate::error::CompressionError;
use crate::profile::{quality_percent, OutputEncoding};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

/// Largest drawable area the default surface accepts (pixels)
pub const DEFAULT_MAX_SURFACE_PIXELS: u64 = 120_000_000;

/// Drawing and encoding backend used by the compressor.
///
/// The platform picks one implementation up front and hands it to the
/// [`Compressor`](crate::Compressor); the compressor never branches on the
/// backend per call.
pub trait RasterSurface: Send + Sync {
    /// Draws `image` scaled to exactly `width`x`height`
    fn resize(
        &self,
        image: &DynamicImage,
        width: u32,
        height: u32,
    ) -> Result<DynamicImage, CompressionError>;

    /// Encodes `image` at `quality` (0..1)
    fn encode(
        &self,
        image: &DynamicImage,
        encoding: OutputEncoding,
        quality: f32,
    ) -> Result<Vec<u8>, CompressionError>;
}

/// Surface backed by the `image` crate
#[derive(Debug, Clone)]
pub struct ImageSurface {
    filter: FilterType,
    max_pixels: u64,
}

impl ImageSurface {
    pub fn new(filter: FilterType, max_pixels: u64) -> Self {
        Self { filter, max_pixels }
    }
}

impl Default for ImageSurface {
    fn default() -> Self {
        Self::new(FilterType::Triangle, DEFAULT_MAX_SURFACE_PIXELS)
    }
}

impl RasterSurface for ImageSurface {
    fn resize(
        &self,
        image: &DynamicImage,
        width: u32,
        height: u32,
    ) -> Result<DynamicImage, CompressionError> {
        let source_pixels = image.width() as u64 * image.height() as u64;
        if source_pixels > self.max_pixels {
            return Err(CompressionError::Surface(format!(
                "{}x{} exceeds the drawable area of {} pixels",
                image.width(),
                image.height(),
                self.max_pixels
            )));
        }
        if (width, height) == (image.width(), image.height()) {
            return Ok(image.clone());
        }
        Ok(image.resize_exact(width, height, self.filter))
    }

    fn encode(
        &self,
        image: &DynamicImage,
        encoding: OutputEncoding,
        quality: f32,
    ) -> Result<Vec<u8>, CompressionError> {
        let mut out = Vec::new();
        let result = match encoding {
            OutputEncoding::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut out, quality_percent(quality));
                // JPEG has no alpha channel
                match image {
                    DynamicImage::ImageRgb8(_) => image.write_with_encoder(encoder),
                    _ => DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder),
                }
            }
            OutputEncoding::WebP => {
                let encoder = WebPEncoder::new_lossless(&mut out);
                match image {
                    DynamicImage::ImageRgba8(_) | DynamicImage::ImageRgb8(_) => {
                        image.write_with_encoder(encoder)
                    }
                    _ => DynamicImage::ImageRgba8(image.to_rgba8()).write_with_encoder(encoder),
                }
            }
        };
        result.map_err(|e| {
            CompressionError::Encode(format!("Failed to encode {:?}: {}", encoding, e))
        })?;
        Ok(out)
    }
}
