use crate::error::CompressionError;
use crate::orientation::{self, UprightImage};
use crate::profile::{quality_percent, CompressionProfile, OutputEncoding, QUALITY_FLOOR, QUALITY_STEP};
use crate::surface::{ImageSurface, RasterSurface};
use base64::Engine;
use std::sync::Arc;

/// Output of a successful compression run
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedImage {
    pub main: Vec<u8>,
    pub main_size: usize,
    pub thumbnail: Vec<u8>,
    pub thumbnail_size: usize,
    /// Dimensions of the main image
    pub width: u32,
    pub height: u32,
    /// Quality the main image was finally encoded at
    pub quality_used: f32,
    pub encoding: OutputEncoding,
}

impl CompressedImage {
    pub fn content_type(&self) -> &'static str {
        self.encoding.content_type()
    }

    /// Thumbnail as a `data:` URL (Base64) for immediate display
    pub fn thumbnail_data_uri(&self) -> String {
        let b64 = base64::engine::general_purpose::STANDARD.encode(&self.thumbnail);
        format!("data:{};base64,{}", self.content_type(), b64)
    }

    /// Whether quality stepping stopped at the floor rather than at the size limit
    pub fn reached_quality_floor(&self) -> bool {
        quality_percent(self.quality_used) <= quality_percent(QUALITY_FLOOR)
    }
}

/// Scales down (never up) so that the result fits in `max_width`x`max_height`,
/// keeping the aspect ratio
pub fn target_dimensions(
    original_width: u32,
    original_height: u32,
    max_width: u32,
    max_height: u32,
) -> (u32, u32) {
    if original_width == 0 || original_height == 0 {
        return (original_width, original_height);
    }
    let ratio = (original_width as f64 / max_width.max(1) as f64)
        .max(original_height as f64 / max_height.max(1) as f64);

    if ratio > 1.0 {
        let new_width = ((original_width as f64 / ratio).round() as u32).clamp(1, max_width.max(1));
        let new_height =
            ((original_height as f64 / ratio).round() as u32).clamp(1, max_height.max(1));
        (new_width, new_height)
    } else {
        (original_width, original_height)
    }
}

/// Turns raw photo bytes into a size-bounded main image plus thumbnail
#[derive(Clone)]
pub struct Compressor {
    profile: CompressionProfile,
    surface: Arc<dyn RasterSurface>,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

impl Compressor {
    /// Compressor drawing on the default `image`-backed surface
    pub fn new(profile: CompressionProfile) -> Self {
        Self::with_surface(profile, Arc::new(ImageSurface::default()))
    }

    pub fn with_surface(profile: CompressionProfile, surface: Arc<dyn RasterSurface>) -> Self {
        Self { profile, surface }
    }

    pub fn profile(&self) -> &CompressionProfile {
        &self.profile
    }

    /// Runs the full pipeline: orientation, downscale, quality stepping, thumbnail.
    ///
    /// CPU-bound; async callers should run it on a blocking thread.
    pub fn compress(&self, raw: &[u8]) -> Result<CompressedImage, CompressionError> {
        let upright = orientation::normalize(raw)?;
        let profile = &self.profile;

        let (width, height) = target_dimensions(
            upright.width(),
            upright.height(),
            profile.max_width,
            profile.max_height,
        );
        let scaled = self.surface.resize(&upright.image, width, height)?;

        let step = quality_percent(QUALITY_STEP);
        let floor = quality_percent(QUALITY_FLOOR);
        let mut quality = quality_percent(profile.quality);
        let mut main = self.encode_at(&scaled, quality)?;
        while profile.encoding.honors_quality()
            && main.len() > profile.max_file_size
            && quality >= floor + step
        {
            quality -= step;
            log::debug!(
                "Main image {} bytes exceeds {} bytes, re-encoding at quality {}",
                main.len(),
                profile.max_file_size,
                quality
            );
            main = self.encode_at(&scaled, quality)?;
        }
        if main.len() > profile.max_file_size {
            log::warn!(
                "Cannot shrink further, accepting {} bytes over limit of {}",
                main.len(),
                profile.max_file_size
            );
        }

        if self.can_keep_original(&upright, raw, width, height, main.len()) {
            log::debug!(
                "Keeping original {} bytes instead of {} re-encoded bytes",
                raw.len(),
                main.len()
            );
            main = raw.to_vec();
        }

        let (thumb_width, thumb_height) = target_dimensions(
            width,
            height,
            profile.thumbnail_width,
            profile.thumbnail_height,
        );
        let thumb_image = self.surface.resize(&scaled, thumb_width, thumb_height)?;
        let thumbnail =
            self.surface
                .encode(&thumb_image, profile.encoding, profile.thumbnail_quality)?;

        log::debug!(
            "Compressed {} bytes ({}x{}) into {} bytes ({}x{}) at quality {} + {} byte thumbnail",
            raw.len(),
            upright.width(),
            upright.height(),
            main.len(),
            width,
            height,
            quality,
            thumbnail.len()
        );

        Ok(CompressedImage {
            main_size: main.len(),
            main,
            thumbnail_size: thumbnail.len(),
            thumbnail,
            width,
            height,
            quality_used: quality as f32 / 100.0,
            encoding: profile.encoding,
        })
    }

    fn encode_at(
        &self,
        image: &image::DynamicImage,
        quality: u8,
    ) -> Result<Vec<u8>, CompressionError> {
        self.surface
            .encode(image, self.profile.encoding, quality as f32 / 100.0)
    }

    /// An input that already fits the profile is never inflated by re-encoding
    fn can_keep_original(
        &self,
        upright: &UprightImage,
        raw: &[u8],
        width: u32,
        height: u32,
        encoded_len: usize,
    ) -> bool {
        upright.orientation == 1
            && upright.source_format == Some(self.profile.encoding.image_format())
            && (width, height) == (upright.width(), upright.height())
            && raw.len() <= encoded_len
    }
}

/// Compresses with the default surface
pub fn compress(
    raw: &[u8],
    profile: &CompressionProfile,
) -> Result<CompressedImage, CompressionError> {
    Compressor::new(profile.clone()).compress(raw)
}
