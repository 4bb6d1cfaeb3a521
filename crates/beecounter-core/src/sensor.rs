//! Sensor register control and status.
//!
//! Mirrors the esp32-camera `sensor_t` status block so the same JSON can be
//! produced from real hardware and from the simulated sensor.

use serde::{Deserialize, Serialize};

use crate::camera::CameraError;
use crate::error::DeviceError;

/// Frame sizes understood by the sensor driver, in driver index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameSize {
    R96x96,
    Qqvga,
    Qcif,
    Hqvga,
    R240x240,
    Qvga,
    Cif,
    Hvga,
    Vga,
    Svga,
    Xga,
    Hd,
    Sxga,
    Uxga,
    Fhd,
    PHd,
    P3mp,
    Qxga,
}

const FRAME_SIZES: [(FrameSize, &str, u32, u32); 18] = [
    (FrameSize::R96x96, "96X96", 96, 96),
    (FrameSize::Qqvga, "QQVGA", 160, 120),
    (FrameSize::Qcif, "QCIF", 176, 144),
    (FrameSize::Hqvga, "HQVGA", 240, 176),
    (FrameSize::R240x240, "240X240", 240, 240),
    (FrameSize::Qvga, "QVGA", 320, 240),
    (FrameSize::Cif, "CIF", 400, 296),
    (FrameSize::Hvga, "HVGA", 480, 320),
    (FrameSize::Vga, "VGA", 640, 480),
    (FrameSize::Svga, "SVGA", 800, 600),
    (FrameSize::Xga, "XGA", 1024, 768),
    (FrameSize::Hd, "HD", 1280, 720),
    (FrameSize::Sxga, "SXGA", 1280, 1024),
    (FrameSize::Uxga, "UXGA", 1600, 1200),
    (FrameSize::Fhd, "FHD", 1920, 1080),
    (FrameSize::PHd, "P_HD", 720, 1280),
    (FrameSize::P3mp, "P_3MP", 864, 1536),
    (FrameSize::Qxga, "QXGA", 2048, 1536),
];

impl FrameSize {
    /// Driver index (`framesize_t` value).
    pub fn index(&self) -> u8 {
        FRAME_SIZES
            .iter()
            .position(|(size, ..)| size == self)
            .unwrap_or(0) as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        FRAME_SIZES.get(index as usize).map(|(size, ..)| *size)
    }

    /// Parse a resolution name such as `VGA` or `UXGA` (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        FRAME_SIZES
            .iter()
            .find(|(_, label, ..)| *label == upper)
            .map(|(size, ..)| *size)
    }

    /// Resolution name with SVGA as the fallback for unknown input.
    pub fn from_name_or_default(name: &str) -> Self {
        Self::from_name(name).unwrap_or(FrameSize::Svga)
    }

    pub fn name(&self) -> &'static str {
        FRAME_SIZES[self.index() as usize].1
    }

    /// Width and height in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        let (_, _, w, h) = FRAME_SIZES[self.index() as usize];
        (w, h)
    }
}

/// Snapshot of the sensor's register state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorStatus {
    pub framesize: u8,
    pub quality: u8,
    pub brightness: i8,
    pub contrast: i8,
    pub saturation: i8,
    pub special_effect: u8,
    pub wb_mode: u8,
    pub awb: u8,
    pub awb_gain: u8,
    pub aec: u8,
    pub aec2: u8,
    pub ae_level: i8,
    pub aec_value: u16,
    pub agc: u8,
    pub agc_gain: u8,
    pub gainceiling: u8,
    pub bpc: u8,
    pub wpc: u8,
    pub raw_gma: u8,
    pub lenc: u8,
    pub hmirror: u8,
    pub vflip: u8,
    pub dcw: u8,
    pub colorbar: u8,
}

impl Default for SensorStatus {
    fn default() -> Self {
        Self {
            framesize: FrameSize::Svga.index(),
            quality: 12,
            brightness: 0,
            contrast: 0,
            saturation: 0,
            special_effect: 0,
            wb_mode: 0,
            awb: 1,
            awb_gain: 1,
            aec: 1,
            aec2: 0,
            ae_level: 0,
            aec_value: 300,
            agc: 1,
            agc_gain: 0,
            gainceiling: 0,
            bpc: 0,
            wpc: 1,
            raw_gma: 1,
            lenc: 1,
            hmirror: 0,
            vflip: 0,
            dcw: 1,
            colorbar: 0,
        }
    }
}

impl SensorStatus {
    pub fn frame_size(&self) -> FrameSize {
        FrameSize::from_index(self.framesize).unwrap_or(FrameSize::Svga)
    }

    /// Record a setting in the status block.
    pub fn apply(&mut self, setting: SensorSetting) {
        match setting {
            SensorSetting::FrameSize(size) => self.framesize = size.index(),
            SensorSetting::Quality(v) => self.quality = v,
            SensorSetting::Brightness(v) => self.brightness = v,
            SensorSetting::Contrast(v) => self.contrast = v,
            SensorSetting::Saturation(v) => self.saturation = v,
            SensorSetting::GainCeiling(v) => self.gainceiling = v,
            SensorSetting::Colorbar(v) => self.colorbar = v as u8,
            SensorSetting::WhiteBalance(v) => self.awb = v as u8,
            SensorSetting::GainControl(v) => self.agc = v as u8,
            SensorSetting::ExposureControl(v) => self.aec = v as u8,
            SensorSetting::HMirror(v) => self.hmirror = v as u8,
            SensorSetting::VFlip(v) => self.vflip = v as u8,
            SensorSetting::AwbGain(v) => self.awb_gain = v as u8,
            SensorSetting::AgcGain(v) => self.agc_gain = v,
            SensorSetting::AecValue(v) => self.aec_value = v,
            SensorSetting::Aec2(v) => self.aec2 = v as u8,
            SensorSetting::Dcw(v) => self.dcw = v as u8,
            SensorSetting::Bpc(v) => self.bpc = v as u8,
            SensorSetting::Wpc(v) => self.wpc = v as u8,
            SensorSetting::RawGamma(v) => self.raw_gma = v as u8,
            SensorSetting::LensCorrection(v) => self.lenc = v as u8,
            SensorSetting::SpecialEffect(v) => self.special_effect = v,
            SensorSetting::WbMode(v) => self.wb_mode = v,
            SensorSetting::AeLevel(v) => self.ae_level = v,
        }
    }
}

/// One validated sensor register change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorSetting {
    FrameSize(FrameSize),
    Quality(u8),
    Brightness(i8),
    Contrast(i8),
    Saturation(i8),
    GainCeiling(u8),
    Colorbar(bool),
    WhiteBalance(bool),
    GainControl(bool),
    ExposureControl(bool),
    HMirror(bool),
    VFlip(bool),
    AwbGain(bool),
    AgcGain(u8),
    AecValue(u16),
    Aec2(bool),
    Dcw(bool),
    Bpc(bool),
    Wpc(bool),
    RawGamma(bool),
    LensCorrection(bool),
    SpecialEffect(u8),
    WbMode(u8),
    AeLevel(i8),
}

/// JPEG quality, 0 (best) to 63.
pub fn parse_quality(raw: &str) -> Result<u8, DeviceError> {
    Ok(ranged("quality", raw, 0, 63)? as u8)
}

fn ranged(name: &str, raw: &str, min: i32, max: i32) -> Result<i32, DeviceError> {
    let value: i32 = raw
        .trim()
        .parse()
        .map_err(|_| DeviceError::Validation(format!("{} must be an integer", name)))?;
    if value < min || value > max {
        return Err(DeviceError::Validation(format!(
            "{} must be between {} and {}",
            name, min, max
        )));
    }
    Ok(value)
}

fn flag(name: &str, raw: &str) -> Result<bool, DeviceError> {
    Ok(ranged(name, raw, 0, 1)? == 1)
}

impl SensorSetting {
    /// Parse a `var`/`val` pair from the control endpoint.
    pub fn parse(name: &str, raw: &str) -> Result<Self, DeviceError> {
        let setting = match name {
            "framesize" => {
                let index = ranged(name, raw, 0, FRAME_SIZES.len() as i32 - 1)?;
                SensorSetting::FrameSize(
                    FrameSize::from_index(index as u8).unwrap_or(FrameSize::Svga),
                )
            }
            "quality" => SensorSetting::Quality(parse_quality(raw)?),
            "brightness" => SensorSetting::Brightness(ranged(name, raw, -2, 2)? as i8),
            "contrast" => SensorSetting::Contrast(ranged(name, raw, -2, 2)? as i8),
            "saturation" => SensorSetting::Saturation(ranged(name, raw, -2, 2)? as i8),
            "gainceiling" => SensorSetting::GainCeiling(ranged(name, raw, 0, 6)? as u8),
            "colorbar" => SensorSetting::Colorbar(flag(name, raw)?),
            "awb" => SensorSetting::WhiteBalance(flag(name, raw)?),
            "agc" => SensorSetting::GainControl(flag(name, raw)?),
            "aec" => SensorSetting::ExposureControl(flag(name, raw)?),
            "hmirror" => SensorSetting::HMirror(flag(name, raw)?),
            "vflip" => SensorSetting::VFlip(flag(name, raw)?),
            "awb_gain" => SensorSetting::AwbGain(flag(name, raw)?),
            "agc_gain" => SensorSetting::AgcGain(ranged(name, raw, 0, 30)? as u8),
            "aec_value" => SensorSetting::AecValue(ranged(name, raw, 0, 1200)? as u16),
            "aec2" => SensorSetting::Aec2(flag(name, raw)?),
            "dcw" => SensorSetting::Dcw(flag(name, raw)?),
            "bpc" => SensorSetting::Bpc(flag(name, raw)?),
            "wpc" => SensorSetting::Wpc(flag(name, raw)?),
            "raw_gma" => SensorSetting::RawGamma(flag(name, raw)?),
            "lenc" => SensorSetting::LensCorrection(flag(name, raw)?),
            "special_effect" => SensorSetting::SpecialEffect(ranged(name, raw, 0, 6)? as u8),
            "wb_mode" => SensorSetting::WbMode(ranged(name, raw, 0, 4)? as u8),
            "ae_level" => SensorSetting::AeLevel(ranged(name, raw, -2, 2)? as i8),
            other => {
                return Err(DeviceError::Validation(format!(
                    "Unknown control variable: {}",
                    other
                )))
            }
        };
        Ok(setting)
    }

    /// Register name, as used by the control endpoint.
    pub fn name(&self) -> &'static str {
        match self {
            SensorSetting::FrameSize(_) => "framesize",
            SensorSetting::Quality(_) => "quality",
            SensorSetting::Brightness(_) => "brightness",
            SensorSetting::Contrast(_) => "contrast",
            SensorSetting::Saturation(_) => "saturation",
            SensorSetting::GainCeiling(_) => "gainceiling",
            SensorSetting::Colorbar(_) => "colorbar",
            SensorSetting::WhiteBalance(_) => "awb",
            SensorSetting::GainControl(_) => "agc",
            SensorSetting::ExposureControl(_) => "aec",
            SensorSetting::HMirror(_) => "hmirror",
            SensorSetting::VFlip(_) => "vflip",
            SensorSetting::AwbGain(_) => "awb_gain",
            SensorSetting::AgcGain(_) => "agc_gain",
            SensorSetting::AecValue(_) => "aec_value",
            SensorSetting::Aec2(_) => "aec2",
            SensorSetting::Dcw(_) => "dcw",
            SensorSetting::Bpc(_) => "bpc",
            SensorSetting::Wpc(_) => "wpc",
            SensorSetting::RawGamma(_) => "raw_gma",
            SensorSetting::LensCorrection(_) => "lenc",
            SensorSetting::SpecialEffect(_) => "special_effect",
            SensorSetting::WbMode(_) => "wb_mode",
            SensorSetting::AeLevel(_) => "ae_level",
        }
    }
}

/// Register-level sensor control.
pub trait SensorControl: Send + Sync {
    /// Current register state.
    fn status(&self) -> Result<SensorStatus, CameraError>;

    /// Write one register.
    fn apply(&self, setting: SensorSetting) -> Result<(), CameraError>;

    /// Sensor product id (e.g. 0x3660 for OV3660).
    fn sensor_id(&self) -> u16;
}
