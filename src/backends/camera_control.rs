// SPDX-License-Identifier: GPL-3.0-only

//! Camera tuning parameters
//!
//! The tuning table (exposure, white balance, effects and friends) and the
//! [`CameraControl`] collaborator that pushes it into the camera component.
//! The pipeline hands the whole [`CameraParameters`] block over once per
//! camera enable and never looks inside it.

use super::HardwareBackend;
use super::types::{BackendError, BackendResult, PortId, PortParameter};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Exposure modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureMode {
    Off,
    #[default]
    Auto,
    Night,
    NightPreview,
    Backlight,
    Spotlight,
    Sports,
    Snow,
    Beach,
    VeryLong,
    FixedFps,
    AntiShake,
    Fireworks,
}

impl ExposureMode {
    pub const ALL: [ExposureMode; 13] = [
        ExposureMode::Off,
        ExposureMode::Auto,
        ExposureMode::Night,
        ExposureMode::NightPreview,
        ExposureMode::Backlight,
        ExposureMode::Spotlight,
        ExposureMode::Sports,
        ExposureMode::Snow,
        ExposureMode::Beach,
        ExposureMode::VeryLong,
        ExposureMode::FixedFps,
        ExposureMode::AntiShake,
        ExposureMode::Fireworks,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            ExposureMode::Off => "off",
            ExposureMode::Auto => "auto",
            ExposureMode::Night => "night",
            ExposureMode::NightPreview => "nightpreview",
            ExposureMode::Backlight => "backlight",
            ExposureMode::Spotlight => "spotlight",
            ExposureMode::Sports => "sports",
            ExposureMode::Snow => "snow",
            ExposureMode::Beach => "beach",
            ExposureMode::VeryLong => "verylong",
            ExposureMode::FixedFps => "fixedfps",
            ExposureMode::AntiShake => "antishake",
            ExposureMode::Fireworks => "fireworks",
        }
    }
}

/// Exposure metering modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeteringMode {
    #[default]
    Average,
    Spot,
    #[serde(alias = "backlist")]
    Backlit,
    Matrix,
}

impl MeteringMode {
    pub const ALL: [MeteringMode; 4] = [
        MeteringMode::Average,
        MeteringMode::Spot,
        MeteringMode::Backlit,
        MeteringMode::Matrix,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            MeteringMode::Average => "average",
            MeteringMode::Spot => "spot",
            MeteringMode::Backlit => "backlit",
            MeteringMode::Matrix => "matrix",
        }
    }
}

/// Automatic white balance modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AwbMode {
    Off,
    #[default]
    Auto,
    Sunlight,
    Cloudy,
    Shade,
    Tungsten,
    Fluorescent,
    Incandescent,
    Flash,
    Horizon,
}

impl AwbMode {
    pub const ALL: [AwbMode; 10] = [
        AwbMode::Off,
        AwbMode::Auto,
        AwbMode::Sunlight,
        AwbMode::Cloudy,
        AwbMode::Shade,
        AwbMode::Tungsten,
        AwbMode::Fluorescent,
        AwbMode::Incandescent,
        AwbMode::Flash,
        AwbMode::Horizon,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            AwbMode::Off => "off",
            AwbMode::Auto => "auto",
            AwbMode::Sunlight => "sunlight",
            AwbMode::Cloudy => "cloudy",
            AwbMode::Shade => "shade",
            AwbMode::Tungsten => "tungsten",
            AwbMode::Fluorescent => "fluorescent",
            AwbMode::Incandescent => "incandescent",
            AwbMode::Flash => "flash",
            AwbMode::Horizon => "horizon",
        }
    }
}

/// Image effects applied by the camera ISP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageEffect {
    #[default]
    None,
    Negative,
    Solarize,
    Posterize,
    Whiteboard,
    Blackboard,
    Sketch,
    Denoise,
    Emboss,
    OilPaint,
    Hatch,
    GPen,
    Pastel,
    Watercolour,
    Film,
    Blur,
    Saturation,
    ColourSwap,
    WashedOut,
    Posterise,
    ColourPoint,
    ColourBalance,
    Cartoon,
}

impl ImageEffect {
    pub const ALL: [ImageEffect; 23] = [
        ImageEffect::None,
        ImageEffect::Negative,
        ImageEffect::Solarize,
        ImageEffect::Posterize,
        ImageEffect::Whiteboard,
        ImageEffect::Blackboard,
        ImageEffect::Sketch,
        ImageEffect::Denoise,
        ImageEffect::Emboss,
        ImageEffect::OilPaint,
        ImageEffect::Hatch,
        ImageEffect::GPen,
        ImageEffect::Pastel,
        ImageEffect::Watercolour,
        ImageEffect::Film,
        ImageEffect::Blur,
        ImageEffect::Saturation,
        ImageEffect::ColourSwap,
        ImageEffect::WashedOut,
        ImageEffect::Posterise,
        ImageEffect::ColourPoint,
        ImageEffect::ColourBalance,
        ImageEffect::Cartoon,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            ImageEffect::None => "none",
            ImageEffect::Negative => "negative",
            ImageEffect::Solarize => "solarize",
            ImageEffect::Posterize => "posterize",
            ImageEffect::Whiteboard => "whiteboard",
            ImageEffect::Blackboard => "blackboard",
            ImageEffect::Sketch => "sketch",
            ImageEffect::Denoise => "denoise",
            ImageEffect::Emboss => "emboss",
            ImageEffect::OilPaint => "oilpaint",
            ImageEffect::Hatch => "hatch",
            ImageEffect::GPen => "gpen",
            ImageEffect::Pastel => "pastel",
            ImageEffect::Watercolour => "watercolour",
            ImageEffect::Film => "film",
            ImageEffect::Blur => "blur",
            ImageEffect::Saturation => "saturation",
            ImageEffect::ColourSwap => "colourswap",
            ImageEffect::WashedOut => "washedout",
            ImageEffect::Posterise => "posterise",
            ImageEffect::ColourPoint => "colourpoint",
            ImageEffect::ColourBalance => "colourbalance",
            ImageEffect::Cartoon => "cartoon",
        }
    }
}

/// Mains flicker avoidance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlickerAvoid {
    #[default]
    Off,
    Auto,
    #[serde(rename = "50hz")]
    Hz50,
    #[serde(rename = "60hz")]
    Hz60,
}

impl FlickerAvoid {
    pub const ALL: [FlickerAvoid; 4] = [
        FlickerAvoid::Off,
        FlickerAvoid::Auto,
        FlickerAvoid::Hz50,
        FlickerAvoid::Hz60,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            FlickerAvoid::Off => "off",
            FlickerAvoid::Auto => "auto",
            FlickerAvoid::Hz50 => "50hz",
            FlickerAvoid::Hz60 => "60hz",
        }
    }
}

/// Fixed U/V colour effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColourEffects {
    pub enable: bool,
    pub u: u32,
    pub v: u32,
}

impl Default for ColourEffects {
    fn default() -> Self {
        Self {
            enable: false,
            u: 128,
            v: 128,
        }
    }
}

/// Normalised region of interest (0.0 - 1.0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Default for RegionOfInterest {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            w: 1.0,
            h: 1.0,
        }
    }
}

/// Full tuning set applied to the camera on enable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraParameters {
    /// -100 to 100
    pub sharpness: i32,
    /// -100 to 100
    pub contrast: i32,
    /// 0 to 100
    pub brightness: u32,
    /// -100 to 100
    pub saturation: i32,
    /// 0 means auto
    pub iso: u32,
    pub video_stabilisation: bool,
    /// -10 to 10
    pub exposure_compensation: i32,
    pub exposure_mode: ExposureMode,
    pub metering_mode: MeteringMode,
    pub awb_mode: AwbMode,
    pub image_effect: ImageEffect,
    pub colour_effects: ColourEffects,
    pub flicker_avoid: FlickerAvoid,
    /// Degrees, multiple of 90
    pub rotation: u32,
    pub hflip: bool,
    pub vflip: bool,
    pub roi: RegionOfInterest,
    /// Microseconds, 0 means auto
    pub shutter_speed: u32,
}

impl Default for CameraParameters {
    fn default() -> Self {
        Self {
            sharpness: 0,
            contrast: 0,
            brightness: 50,
            saturation: 0,
            iso: 0,
            video_stabilisation: false,
            exposure_compensation: 0,
            exposure_mode: ExposureMode::default(),
            metering_mode: MeteringMode::default(),
            awb_mode: AwbMode::default(),
            image_effect: ImageEffect::default(),
            colour_effects: ColourEffects::default(),
            flicker_avoid: FlickerAvoid::default(),
            rotation: 0,
            hflip: false,
            vflip: false,
            roi: RegionOfInterest::default(),
            shutter_speed: 0,
        }
    }
}

impl CameraParameters {
    /// Check every value is inside the range the camera accepts
    pub fn validate(&self) -> Result<(), String> {
        let signed = [
            ("sharpness", self.sharpness, -100, 100),
            ("contrast", self.contrast, -100, 100),
            ("saturation", self.saturation, -100, 100),
            ("exposure_compensation", self.exposure_compensation, -10, 10),
        ];
        for (name, value, min, max) in signed {
            if !(min..=max).contains(&value) {
                return Err(format!("{name} {value} is outside {min}..={max}"));
            }
        }
        if self.brightness > 100 {
            return Err(format!("brightness {} is outside 0..=100", self.brightness));
        }
        if self.rotation % 90 != 0 {
            return Err(format!("rotation {} is not a multiple of 90", self.rotation));
        }
        if self.colour_effects.u > 255 || self.colour_effects.v > 255 {
            return Err("colour effect u/v must be 0..=255".to_string());
        }
        let roi = &self.roi;
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !(in_unit(roi.x) && in_unit(roi.y) && in_unit(roi.w) && in_unit(roi.h)) {
            return Err("region of interest must be normalised to 0.0..=1.0".to_string());
        }
        Ok(())
    }

    /// Expand the block into individual camera parameters
    pub fn to_tuning(&self) -> Vec<TuningParameter> {
        vec![
            TuningParameter::Sharpness(self.sharpness),
            TuningParameter::Contrast(self.contrast),
            TuningParameter::Brightness(self.brightness),
            TuningParameter::Saturation(self.saturation),
            TuningParameter::Iso(self.iso),
            TuningParameter::VideoStabilisation(self.video_stabilisation),
            TuningParameter::ExposureCompensation(self.exposure_compensation),
            TuningParameter::ExposureMode(self.exposure_mode),
            TuningParameter::MeteringMode(self.metering_mode),
            TuningParameter::AwbMode(self.awb_mode),
            TuningParameter::ImageEffect(self.image_effect),
            TuningParameter::ColourEffects(self.colour_effects),
            TuningParameter::FlickerAvoid(self.flicker_avoid),
            TuningParameter::Rotation(self.rotation),
            TuningParameter::Flip {
                horizontal: self.hflip,
                vertical: self.vflip,
            },
            TuningParameter::RegionOfInterest(self.roi),
            TuningParameter::ShutterSpeed(self.shutter_speed),
        ]
    }
}

/// A single camera tuning value as sent to the control port
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TuningParameter {
    Sharpness(i32),
    Contrast(i32),
    Brightness(u32),
    Saturation(i32),
    Iso(u32),
    VideoStabilisation(bool),
    ExposureCompensation(i32),
    ExposureMode(ExposureMode),
    MeteringMode(MeteringMode),
    AwbMode(AwbMode),
    ImageEffect(ImageEffect),
    ColourEffects(ColourEffects),
    FlickerAvoid(FlickerAvoid),
    Rotation(u32),
    Flip { horizontal: bool, vertical: bool },
    RegionOfInterest(RegionOfInterest),
    ShutterSpeed(u32),
}

/// Camera tuning collaborator
///
/// Implementations translate [`CameraParameters`] into whatever the hardware
/// understands. The pipeline calls `apply_all` once each time the camera
/// component is enabled and `cycle_test` from demo mode.
pub trait CameraControl: Send + Sync {
    /// Apply the full parameter set to the camera's control port
    fn apply_all(
        &self,
        backend: &dyn HardwareBackend,
        control: PortId,
        params: &CameraParameters,
    ) -> BackendResult<()>;

    /// Apply step `step` of the demo sequence
    fn cycle_test(
        &self,
        backend: &dyn HardwareBackend,
        control: PortId,
        step: usize,
    ) -> BackendResult<()>;
}

/// Marshals tuning values into backend port parameters
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCameraControl;

impl CameraControl for DefaultCameraControl {
    fn apply_all(
        &self,
        backend: &dyn HardwareBackend,
        control: PortId,
        params: &CameraParameters,
    ) -> BackendResult<()> {
        let mut rejected = Vec::new();

        for tuning in params.to_tuning() {
            if let Err(e) = backend.set_parameter(control, PortParameter::Tuning(tuning)) {
                warn!(?tuning, error = %e, "Camera rejected tuning parameter");
                rejected.push(format!("{:?}", tuning));
            }
        }

        if rejected.is_empty() {
            debug!(%control, "Applied camera parameters");
            Ok(())
        } else {
            Err(BackendError::Rejected(rejected.join(", ")))
        }
    }

    fn cycle_test(
        &self,
        backend: &dyn HardwareBackend,
        control: PortId,
        step: usize,
    ) -> BackendResult<()> {
        let (effect, exposure) = demo_step(step);
        debug!(
            step,
            effect = effect.display_name(),
            exposure = exposure.display_name(),
            "Demo step"
        );

        backend.set_parameter(control, PortParameter::Tuning(TuningParameter::ImageEffect(effect)))?;
        backend.set_parameter(
            control,
            PortParameter::Tuning(TuningParameter::ExposureMode(exposure)),
        )
    }
}

/// Effect and exposure mode shown at demo step `step`
///
/// Walks every image effect, moving to the next exposure mode after each lap.
pub fn demo_step(step: usize) -> (ImageEffect, ExposureMode) {
    let effects = ImageEffect::ALL.len();
    let effect = ImageEffect::ALL[step % effects];
    let exposure = ExposureMode::ALL[(step / effects) % ExposureMode::ALL.len()];
    (effect, exposure)
}
