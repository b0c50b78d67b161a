//! Host capability detection
//!
//! Picks the compression profile for the session from a few cheap device
//! signals. Every signal is optional; a missing or unreadable signal never
//! marks the device as low-end.

use crate::profile::CompressionProfile;
use regex::Regex;
use std::sync::OnceLock;
use sysinfo::System;

/// Devices at or below this many logical CPUs get the reduced profile
pub const LOW_END_CPU_COUNT: usize = 2;

/// Devices at or below this much memory get the reduced profile
pub const LOW_END_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Platform signatures known to struggle with full-size encoding
const SLOW_PLATFORM_PATTERN: &str = r"(?i)(android [2-7][.;\s)]|armv[67]|iphone os (9|10|11)_|windows phone|kaios|opera mini|\bsilk/)";

static SLOW_PLATFORM: OnceLock<Option<Regex>> = OnceLock::new();

fn slow_platform_regex() -> Option<&'static Regex> {
    SLOW_PLATFORM
        .get_or_init(|| match Regex::new(SLOW_PLATFORM_PATTERN) {
            Ok(re) => Some(re),
            Err(e) => {
                log::warn!("Slow platform pattern rejected: {}", e);
                None
            }
        })
        .as_ref()
}

/// Signals read from the host device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSignals {
    pub logical_cpus: Option<usize>,
    pub memory_bytes: Option<u64>,
    /// Free-form platform description (OS, architecture, user agent ...)
    pub platform: Option<String>,
}

impl DeviceSignals {
    /// Reads the signals available on this host
    pub fn detect() -> Self {
        let logical_cpus = std::thread::available_parallelism()
            .ok()
            .map(|n| n.get());

        let mut system = System::new();
        system.refresh_memory();
        let memory_bytes = Some(system.total_memory()).filter(|m| *m > 0);

        let platform = format!(
            "{} {} {}",
            std::env::consts::OS,
            std::env::consts::ARCH,
            System::long_os_version().unwrap_or_default()
        );

        Self {
            logical_cpus,
            memory_bytes,
            platform: Some(platform.trim().to_string()),
        }
    }

    /// Whether the signals indicate a device that should use the reduced profile
    pub fn is_low_end(&self) -> bool {
        let few_cpus = self
            .logical_cpus
            .filter(|n| *n > 0)
            .is_some_and(|n| n <= LOW_END_CPU_COUNT);
        let little_memory = self
            .memory_bytes
            .filter(|m| *m > 0)
            .is_some_and(|m| m <= LOW_END_MEMORY_BYTES);
        let slow_platform = match (&self.platform, slow_platform_regex()) {
            (Some(platform), Some(re)) => re.is_match(platform),
            _ => false,
        };

        few_cpus || little_memory || slow_platform
    }
}

/// Pure profile selection from already gathered signals
pub fn select_profile_for(signals: &DeviceSignals) -> CompressionProfile {
    if signals.is_low_end() {
        log::debug!("Low-end device detected ({:?}), using reduced profile", signals);
        CompressionProfile::reduced()
    } else {
        CompressionProfile::standard()
    }
}

/// Detects the host and returns the profile for this session
pub fn select_profile() -> CompressionProfile {
    select_profile_for(&DeviceSignals::detect())
}
