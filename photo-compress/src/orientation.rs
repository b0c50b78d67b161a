//! EXIF orientation handling
//!
//! Cameras store pixels in sensor order and record the intended rotation in
//! the EXIF orientation tag (0x0112). This module reads that tag straight from
//! the JPEG APP1 segment and returns a bitmap that is already upright.
//! Malformed or missing metadata is treated as orientation 1.

use crate::error::CompressionError;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use std::io::Cursor;

const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";
const ORIENTATION_TAG: u16 = 0x0112;
const TYPE_SHORT: u16 = 3;

/// A decoded bitmap with orientation already applied
#[derive(Debug, Clone)]
pub struct UprightImage {
    pub image: DynamicImage,
    /// EXIF orientation value (1..=8) that was applied
    pub orientation: u8,
    /// Container format the bytes were decoded from
    pub source_format: Option<ImageFormat>,
}

impl UprightImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Decodes `bytes` and rotates/flips the pixels according to the EXIF tag.
///
/// Only fails when the bytes cannot be decoded as an image at all.
pub fn normalize(bytes: &[u8]) -> Result<UprightImage, CompressionError> {
    if bytes.is_empty() {
        return Err(CompressionError::Decode("empty input".to_string()));
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CompressionError::Decode(format!("Failed to guess image format: {}", e)))?;
    let source_format = reader.format();
    if source_format.is_none() {
        return Err(CompressionError::Decode(
            "not a recognized still image".to_string(),
        ));
    }

    let image = reader
        .decode()
        .map_err(|e| CompressionError::Decode(format!("Failed to decode image: {}", e)))?;

    let orientation = read_orientation(bytes);
    Ok(UprightImage {
        image: apply_orientation(image, orientation),
        orientation,
        source_format,
    })
}

/// Returns the EXIF orientation of `bytes`, or 1 when none can be read
pub fn read_orientation(bytes: &[u8]) -> u8 {
    if let Some(value) = jpeg_orientation(bytes) {
        return value;
    }

    // Other containers (TIFF, WebP, PNG eXIf) go through the decoder
    let decoder_orientation = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()
        .filter(|r| r.format().is_some_and(|f| f != ImageFormat::Jpeg))
        .and_then(|r| r.into_decoder().ok())
        .and_then(|mut d| d.orientation().ok());

    match decoder_orientation {
        Some(o) => exif_value(o),
        None => 1,
    }
}

/// Applies the transform for an EXIF orientation value.
///
/// Values 5..=8 transpose the image, so width and height swap.
pub fn apply_orientation(mut image: DynamicImage, orientation: u8) -> DynamicImage {
    match Orientation::from_exif(orientation) {
        Some(Orientation::NoTransforms) | None => image,
        Some(o) => {
            log::debug!("Applying EXIF orientation {}", orientation);
            image.apply_orientation(o);
            image
        }
    }
}

/// Whether the orientation swaps width and height
pub fn swaps_dimensions(orientation: u8) -> bool {
    (5..=8).contains(&orientation)
}

fn exif_value(orientation: Orientation) -> u8 {
    match orientation {
        Orientation::NoTransforms => 1,
        Orientation::FlipHorizontal => 2,
        Orientation::Rotate180 => 3,
        Orientation::FlipVertical => 4,
        Orientation::Rotate90FlipH => 5,
        Orientation::Rotate90 => 6,
        Orientation::Rotate270FlipH => 7,
        Orientation::Rotate270 => 8,
        #[allow(unreachable_patterns)]
        _ => 1,
    }
}

/// Walks the JPEG marker segments looking for an EXIF APP1 block
fn jpeg_orientation(bytes: &[u8]) -> Option<u8> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return None;
    }

    let mut pos = 2;
    while pos + 4 <= bytes.len() {
        if bytes[pos] != 0xFF {
            return None;
        }
        let marker = bytes[pos + 1];
        match marker {
            // fill byte
            0xFF => {
                pos += 1;
                continue;
            }
            // standalone markers carry no length
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            // start of scan or end of image: metadata is over
            0xDA | 0xD9 => return None,
            _ => {}
        }

        let length = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
        if length < 2 {
            return None;
        }
        let start = pos + 4;
        let end = (pos + 2 + length).min(bytes.len());
        if marker == 0xE1 && start <= end {
            let segment = &bytes[start..end];
            if let Some(tiff) = segment.strip_prefix(EXIF_HEADER.as_slice()) {
                return tiff_orientation(tiff);
            }
        }
        pos += 2 + length;
    }
    None
}

/// Reads tag 0x0112 from IFD0 of a TIFF structure
fn tiff_orientation(tiff: &[u8]) -> Option<u8> {
    let big_endian = match tiff.get(0..2)? {
        b"II" => false,
        b"MM" => true,
        _ => return None,
    };
    let read_u16 = |offset: usize| -> Option<u16> {
        let b = tiff.get(offset..offset + 2)?;
        Some(if big_endian {
            u16::from_be_bytes([b[0], b[1]])
        } else {
            u16::from_le_bytes([b[0], b[1]])
        })
    };
    let read_u32 = |offset: usize| -> Option<u32> {
        let b = tiff.get(offset..offset + 4)?;
        Some(if big_endian {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        })
    };

    if read_u16(2)? != 42 {
        return None;
    }
    let ifd = read_u32(4)? as usize;
    let entries = read_u16(ifd)? as usize;
    for i in 0..entries {
        let entry = ifd + 2 + i * 12;
        if read_u16(entry)? != ORIENTATION_TAG {
            continue;
        }
        if read_u16(entry + 2)? != TYPE_SHORT {
            return None;
        }
        let value = read_u16(entry + 8)?;
        return u8::try_from(value).ok().filter(|v| (1..=8).contains(v));
    }
    None
}
