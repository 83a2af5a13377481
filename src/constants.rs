// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default capture width (1080p)
pub const DEFAULT_WIDTH: u32 = 1920;
/// Default capture height (1080p)
pub const DEFAULT_HEIGHT: u32 = 1080;
/// Default framerate numerator
pub const DEFAULT_FRAMERATE_NUM: u32 = 30;
/// Default framerate denominator
pub const DEFAULT_FRAMERATE_DENOM: u32 = 1;
/// A decent default bitrate for 1080p, in bits per second
pub const DEFAULT_BITRATE: u32 = 17_000_000;
/// Max bitrate we allow for recording (30 Mbit/s)
pub const MAX_BITRATE: u32 = 30_000_000;
/// Default run duration of `record`/`demo` in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;
/// Default interval between demo mode steps
pub const DEFAULT_DEMO_INTERVAL_MS: u64 = 250;

/// Camera output port indices
pub const CAMERA_PREVIEW_PORT: usize = 0;
pub const CAMERA_VIDEO_PORT: usize = 1;
pub const CAMERA_CAPTURE_PORT: usize = 2;

/// Video render needs at least 2 buffers, keep one spare
pub const MIN_CAMERA_OUTPUT_BUFFERS: u32 = 3;

/// Full sensor resolution used for stills
pub const MAX_STILLS_WIDTH: u32 = 2592;
pub const MAX_STILLS_HEIGHT: u32 = 1944;
/// Frames the camera keeps for preview/video
pub const NUM_PREVIEW_VIDEO_FRAMES: u32 = 3;

/// Default JPEG quality factor
pub const DEFAULT_JPEG_QUALITY: u32 = 85;
/// Embedded JPEG thumbnail
pub const DEFAULT_THUMBNAIL_WIDTH: u32 = 64;
pub const DEFAULT_THUMBNAIL_HEIGHT: u32 = 48;
pub const DEFAULT_THUMBNAIL_QUALITY: u32 = 35;

/// Interval at which a still capture wait checks for an abort
pub const ABORT_INTERVAL: Duration = Duration::from_millis(100);
/// Default upper bound on a single still capture
pub const DEFAULT_STILL_TIMEOUT_MS: u64 = 10_000;

/// At most this many user supplied EXIF tags are sent per capture
pub const MAX_USER_EXIF_TAGS: usize = 32;
/// EXIF payload size including the terminator, tags must be shorter
pub const MAX_EXIF_PAYLOAD_LENGTH: usize = 128;
/// Built-in EXIF identity
pub const EXIF_MODEL: &str = "RP_OV5647";
pub const EXIF_MAKE: &str = "RaspberryPi";
/// EXIF date/time layout (`YYYY:MM:DD hh:mm:ss`)
pub const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Folder name used under the user's pictures directory
pub const DEFAULT_SAVE_FOLDER: &str = "rpicam";

/// Round `value` up to the next multiple of `align` (a power of two)
pub const fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// H.264 encoder profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum H264Profile {
    /// Baseline profile - lowest decoder requirements
    Baseline,
    /// Main profile
    Main,
    /// High profile - best compression (default)
    #[default]
    High,
}

impl H264Profile {
    /// Get all profile variants for iteration
    pub const ALL: [H264Profile; 3] = [H264Profile::Baseline, H264Profile::Main, H264Profile::High];

    /// Get display name for the profile
    pub fn display_name(&self) -> &'static str {
        match self {
            H264Profile::Baseline => "baseline",
            H264Profile::Main => "main",
            H264Profile::High => "high",
        }
    }

    /// Parse a profile name as given on the command line
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.display_name().eq_ignore_ascii_case(name))
    }
}

impl std::fmt::Display for H264Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// H.264 levels understood by the encoder
///
/// The hardware encoder only accepts level 4, the others exist so a
/// rejected level can be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum H264Level {
    #[serde(rename = "3.1")]
    Level31,
    #[serde(rename = "4")]
    #[default]
    Level4,
    #[serde(rename = "4.1")]
    Level41,
}

impl H264Level {
    pub const ALL: [H264Level; 3] = [H264Level::Level31, H264Level::Level4, H264Level::Level41];

    pub fn display_name(&self) -> &'static str {
        match self {
            H264Level::Level31 => "3.1",
            H264Level::Level4 => "4",
            H264Level::Level41 => "4.1",
        }
    }
}

impl std::fmt::Display for H264Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}
