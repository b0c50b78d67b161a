use serde::{Deserialize, Serialize};

/// Lowest encode quality the compressor will step down to.
pub const QUALITY_FLOOR: f32 = 0.3;

/// Amount the quality is lowered per re-encode when the output is too large.
pub const QUALITY_STEP: f32 = 0.1;

/// Encoding used for both the main image and the thumbnail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputEncoding {
    #[default]
    Jpeg,
    /// Lossless in the underlying encoder, quality is ignored
    WebP,
}

impl OutputEncoding {
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputEncoding::Jpeg => "image/jpeg",
            OutputEncoding::WebP => "image/webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputEncoding::Jpeg => "jpg",
            OutputEncoding::WebP => "webp",
        }
    }

    /// Whether lowering the quality can shrink the output
    pub fn honors_quality(&self) -> bool {
        matches!(self, OutputEncoding::Jpeg)
    }

    pub fn image_format(&self) -> image::ImageFormat {
        match self {
            OutputEncoding::Jpeg => image::ImageFormat::Jpeg,
            OutputEncoding::WebP => image::ImageFormat::WebP,
        }
    }
}

/// Parameters that bound the size of a transmitted photo and its thumbnail.
///
/// Two canonical profiles exist: [`CompressionProfile::standard`] and
/// [`CompressionProfile::reduced`] (for low-end devices). Custom profiles
/// can be deserialized from configuration; missing fields fall back to the
/// standard values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionProfile {
    pub max_width: u32,
    pub max_height: u32,
    /// Initial encode quality in (0, 1]
    pub quality: f32,
    /// Byte ceiling for the main image
    pub max_file_size: usize,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    pub thumbnail_quality: f32,
    pub encoding: OutputEncoding,
}

impl CompressionProfile {
    pub fn standard() -> Self {
        Self {
            max_width: 1920,
            max_height: 1920,
            quality: 0.8,
            max_file_size: 1024 * 1024,
            thumbnail_width: 300,
            thumbnail_height: 300,
            thumbnail_quality: 0.7,
            encoding: OutputEncoding::Jpeg,
        }
    }

    pub fn reduced() -> Self {
        Self {
            max_width: 1280,
            max_height: 1280,
            quality: 0.7,
            max_file_size: 500 * 1024,
            thumbnail_width: 200,
            thumbnail_height: 200,
            thumbnail_quality: 0.6,
            encoding: OutputEncoding::Jpeg,
        }
    }

    /// Checks the profile for values the compressor cannot work with
    pub fn validate(&self) -> Result<(), String> {
        if self.max_width == 0 || self.max_height == 0 {
            return Err("max_width and max_height must be positive".to_string());
        }
        if self.thumbnail_width == 0 || self.thumbnail_height == 0 {
            return Err("thumbnail dimensions must be positive".to_string());
        }
        for (name, q) in [
            ("quality", self.quality),
            ("thumbnail_quality", self.thumbnail_quality),
        ] {
            if !(q > 0.0 && q <= 1.0) {
                return Err(format!("{} must be in (0, 1], got {}", name, q));
            }
        }
        if self.max_file_size == 0 {
            return Err("max_file_size must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for CompressionProfile {
    fn default() -> Self {
        Self::standard()
    }
}

/// Converts a 0..1 quality into the 1..=100 scale encoders expect
pub(crate) fn quality_percent(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}
