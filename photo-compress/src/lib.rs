//! # Photo Compress
//!
//! Adaptive compression for photos captured on mobile devices.
//!
//! This crate turns arbitrary camera output into something cheap to send:
//! - EXIF orientation is applied so pixels are stored upright
//! - The main image is scaled down and re-encoded until it fits a byte ceiling
//! - A separate small thumbnail is produced for previews
//! - The profile (standard or reduced) is chosen from host capabilities
//!
//! It contains no networking and no async code; callers decide where the
//! CPU-bound work runs.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use photo_compress::{select_profile, Compressor};
//!
//! let compressor = Compressor::new(select_profile());
//! let out = compressor.compress(&raw_bytes)?;
//! println!("{}x{} in {} bytes", out.width, out.height, out.main_size);
//! ```

pub mod capability;
pub mod compressor;
pub mod error;
pub mod orientation;
pub mod profile;
pub mod surface;

pub use capability::{select_profile, select_profile_for, DeviceSignals};
pub use compressor::{compress, target_dimensions, CompressedImage, Compressor};
pub use error::CompressionError;
pub use orientation::{normalize, read_orientation, UprightImage};
pub use profile::{CompressionProfile, OutputEncoding, QUALITY_FLOOR, QUALITY_STEP};
pub use surface::{ImageSurface, RasterSurface};
