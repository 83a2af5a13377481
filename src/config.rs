// SPDX-License-Identifier: GPL-3.0-only

//! Capture configuration
//!
//! Loaded from JSON (`--config <file>` or `<config dir>/rpicam/config.json`).
//! Every field has a default, so a config file only needs the values it
//! changes.

use crate::backends::HardwareBackendType;
use crate::backends::camera_control::CameraParameters;
use crate::backends::types::{Framerate, Rect, ThumbnailConfig};
use crate::constants::*;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Encoder settings, fixed once the pipeline is enabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: Framerate,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    /// Keyframe interval in frames, 0 leaves the encoder default
    pub intra_period: u32,
    pub profile: H264Profile,
    /// Let the encoder reference the camera's input buffers directly
    pub immutable_input: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            framerate: Framerate::new(DEFAULT_FRAMERATE_NUM, DEFAULT_FRAMERATE_DENOM),
            bitrate: DEFAULT_BITRATE,
            intra_period: 0,
            profile: H264Profile::default(),
            immutable_input: true,
        }
    }
}

/// Preview window settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewParameters {
    /// Connect the camera preview output to the renderer
    pub want_preview: bool,
    pub fullscreen: bool,
    /// 0 (transparent) to 255 (opaque)
    pub opacity: u32,
    /// Window placement when not fullscreen
    pub window: Rect,
}

impl Default for PreviewParameters {
    fn default() -> Self {
        Self {
            want_preview: true,
            fullscreen: true,
            opacity: 255,
            window: Rect {
                x: 0,
                y: 0,
                width: 1024,
                height: 768,
            },
        }
    }
}

/// Still capture settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StillConfig {
    /// Directory for captured images, `None` uses the pictures directory
    pub output_dir: Option<PathBuf>,
    pub jpeg_quality: u32,
    pub thumbnail: ThumbnailConfig,
    /// Give up on a capture after this long
    pub timeout_ms: u64,
}

impl Default for StillConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            thumbnail: ThumbnailConfig {
                enable: true,
                width: DEFAULT_THUMBNAIL_WIDTH,
                height: DEFAULT_THUMBNAIL_HEIGHT,
                quality: DEFAULT_THUMBNAIL_QUALITY,
            },
            timeout_ms: DEFAULT_STILL_TIMEOUT_MS,
        }
    }
}

impl StillConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// EXIF tags added to every still
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExifConfig {
    /// Send the built-in and user tags at all
    pub enabled: bool,
    /// User `key=value` tags, sent after the built-in ones
    pub tags: Vec<String>,
}

impl Default for ExifConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tags: Vec::new(),
        }
    }
}

/// What the pipeline does once started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Encode video for the consumer, stills on request
    #[default]
    Streaming,
    /// Cycle through camera settings with capture disabled
    Demo,
}

/// Complete run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub backend: HardwareBackendType,
    pub pipeline: PipelineConfig,
    pub preview: PreviewParameters,
    pub camera: CameraParameters,
    pub still: StillConfig,
    pub exif: ExifConfig,
    pub mode: OperatingMode,
    /// Milliseconds between demo steps
    pub demo_interval_ms: u64,
    /// Run duration in milliseconds, 0 runs until interrupted
    pub timeout_ms: u64,
    /// Dump state while running
    pub verbose: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: HardwareBackendType::default(),
            pipeline: PipelineConfig::default(),
            preview: PreviewParameters::default(),
            camera: CameraParameters::default(),
            still: StillConfig::default(),
            exif: ExifConfig::default(),
            mode: OperatingMode::default(),
            demo_interval_ms: DEFAULT_DEMO_INTERVAL_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            verbose: false,
        }
    }
}

impl CaptureConfig {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rpicam").join("config.json"))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load the given file, else the default file if present, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("No configuration file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let text = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, text).map_err(io_error)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })
    }

    /// Check the values the hardware would refuse
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let p = &self.pipeline;

        if p.width == 0 || p.height == 0 {
            return invalid(format!("resolution {}x{} is empty", p.width, p.height));
        }
        if p.framerate.num == 0 {
            return invalid(format!("framerate {} must be positive", p.framerate));
        }
        if p.bitrate == 0 || p.bitrate > MAX_BITRATE {
            return invalid(format!(
                "bitrate {} must be between 1 and {}",
                p.bitrate, MAX_BITRATE
            ));
        }
        if !(1..=100).contains(&self.still.jpeg_quality) {
            return invalid(format!(
                "JPEG quality {} must be between 1 and 100",
                self.still.jpeg_quality
            ));
        }
        if self.still.timeout_ms == 0 {
            return invalid("still timeout must be positive".to_string());
        }
        if self.preview.opacity > 255 {
            return invalid(format!("preview opacity {} exceeds 255", self.preview.opacity));
        }
        if self.mode == OperatingMode::Demo && self.demo_interval_ms == 0 {
            return invalid("demo interval must be positive".to_string());
        }
        self.camera.validate().map_err(ConfigError::Invalid)
    }

    /// Directory stills are written to
    pub fn photo_dir(&self) -> PathBuf {
        self.still
            .output_dir
            .clone()
            .unwrap_or_else(crate::storage::default_photo_dir)
    }

    pub fn demo_interval(&self) -> Duration {
        Duration::from_millis(self.demo_interval_ms)
    }

    /// Run duration, `None` for unbounded
    pub fn run_duration(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}
