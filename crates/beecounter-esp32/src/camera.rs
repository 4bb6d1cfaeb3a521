//! esp32-camera driver bindings.
//!
//! Frames come from the driver's pool (`esp_camera_fb_get`) and are wrapped
//! as driver-backed [`FrameBuffer`]s whose token is the `camera_fb_t`
//! pointer; [`FrameSource::release`] hands that pointer back with
//! `esp_camera_fb_return`.

use std::sync::Mutex;

use beecounter_core::camera::{CameraError, FrameBuffer, FrameSource, PixelFormat};
use beecounter_core::sensor::{FrameSize, SensorControl, SensorSetting, SensorStatus};
use esp_idf_svc::sys::camera::{
    camera_config_t, camera_config_t__bindgen_ty_1, camera_config_t__bindgen_ty_2,
    camera_fb_location_t_CAMERA_FB_IN_DRAM, camera_fb_location_t_CAMERA_FB_IN_PSRAM, camera_fb_t,
    camera_grab_mode_t_CAMERA_GRAB_WHEN_EMPTY, esp_camera_fb_get, esp_camera_fb_return,
    esp_camera_init, esp_camera_sensor_get, framesize_t, framesize_t_FRAMESIZE_CIF,
    framesize_t_FRAMESIZE_SVGA, ledc_channel_t_LEDC_CHANNEL_0, ledc_timer_t_LEDC_TIMER_0,
    pixformat_t, pixformat_t_PIXFORMAT_GRAYSCALE, pixformat_t_PIXFORMAT_JPEG,
    pixformat_t_PIXFORMAT_RGB565, pixformat_t_PIXFORMAT_RGB888, pixformat_t_PIXFORMAT_YUV422,
    sensor_t,
};
use esp_idf_svc::sys::{esp, esp_err_to_name, EspError};
use log::{info, warn};

/// Sensor product id of the OV3660.
pub const OV3660_PID: u16 = 0x3660;

/// DVP pin assignment. `-1` means not connected.
#[derive(Debug, Clone, Copy)]
pub struct CameraPins {
    pub pwdn: i32,
    pub reset: i32,
    pub xclk: i32,
    pub sda: i32,
    pub scl: i32,
    pub d: [i32; 8],
    pub vsync: i32,
    pub href: i32,
    pub pclk: i32,
}

impl CameraPins {
    /// ESP32-S3-EYE layout (Freenove ESP32-S3-WROOM FNK0085).
    pub const ESP32S3_EYE: CameraPins = CameraPins {
        pwdn: -1,
        reset: -1,
        xclk: 15,
        sda: 4,
        scl: 5,
        d: [11, 9, 8, 10, 12, 18, 17, 16],
        vsync: 6,
        href: 7,
        pclk: 13,
    };
}

#[allow(non_upper_case_globals)]
fn pixel_format(raw: pixformat_t) -> PixelFormat {
    match raw {
        pixformat_t_PIXFORMAT_JPEG => PixelFormat::Jpeg,
        pixformat_t_PIXFORMAT_RGB565 => PixelFormat::Rgb565,
        pixformat_t_PIXFORMAT_RGB888 => PixelFormat::Rgb888,
        pixformat_t_PIXFORMAT_GRAYSCALE => PixelFormat::Grayscale,
        pixformat_t_PIXFORMAT_YUV422 => PixelFormat::Yuv422,
        _ => PixelFormat::Yuv422,
    }
}

fn driver_error(err: EspError) -> CameraError {
    // SAFETY: esp_err_to_name returns a static C string.
    let name = unsafe { std::ffi::CStr::from_ptr(esp_err_to_name(err.code())) };
    CameraError::CaptureFailed(name.to_string_lossy().into_owned())
}

/// The board camera. Only one may exist; the driver is global.
pub struct EspCamera {
    // Serializes register writes against status reads.
    sensor_lock: Mutex<()>,
    sensor_id: u16,
}

impl EspCamera {
    /// Initialize the driver: JPEG, SVGA, quality 12, one frame buffer.
    ///
    /// Without PSRAM the buffer moves to DRAM and the frame size drops to CIF.
    pub fn init(pins: &CameraPins, psram: bool) -> Result<Self, CameraError> {
        let (frame_size, fb_location) = if psram {
            (framesize_t_FRAMESIZE_SVGA, camera_fb_location_t_CAMERA_FB_IN_PSRAM)
        } else {
            warn!("PSRAM not detected, using DRAM frame buffer at CIF");
            (framesize_t_FRAMESIZE_CIF, camera_fb_location_t_CAMERA_FB_IN_DRAM)
        };

        let config = camera_config_t {
            pin_pwdn: pins.pwdn,
            pin_reset: pins.reset,
            pin_xclk: pins.xclk,
            __bindgen_anon_1: camera_config_t__bindgen_ty_1 { pin_sccb_sda: pins.sda },
            __bindgen_anon_2: camera_config_t__bindgen_ty_2 { pin_sccb_scl: pins.scl },
            pin_d7: pins.d[7],
            pin_d6: pins.d[6],
            pin_d5: pins.d[5],
            pin_d4: pins.d[4],
            pin_d3: pins.d[3],
            pin_d2: pins.d[2],
            pin_d1: pins.d[1],
            pin_d0: pins.d[0],
            pin_vsync: pins.vsync,
            pin_href: pins.href,
            pin_pclk: pins.pclk,
            xclk_freq_hz: 20_000_000,
            ledc_timer: ledc_timer_t_LEDC_TIMER_0,
            ledc_channel: ledc_channel_t_LEDC_CHANNEL_0,
            pixel_format: pixformat_t_PIXFORMAT_JPEG,
            frame_size,
            jpeg_quality: 12,
            fb_count: 1,
            fb_location,
            grab_mode: camera_grab_mode_t_CAMERA_GRAB_WHEN_EMPTY,
            ..Default::default()
        };

        esp!(unsafe { esp_camera_init(&config) }).map_err(driver_error)?;

        let sensor = unsafe { esp_camera_sensor_get() };
        if sensor.is_null() {
            return Err(CameraError::NotInitialized);
        }
        // SAFETY: non-null sensor pointer stays valid while the driver is up.
        let sensor_id = unsafe { (*sensor).id.PID };
        if sensor_id == OV3660_PID {
            info!("Camera initialized, OV3660 detected");
        } else {
            warn!("Camera initialized, unexpected sensor PID 0x{:04x}", sensor_id);
        }

        Ok(Self {
            sensor_lock: Mutex::new(()),
            sensor_id,
        })
    }

    fn sensor(&self) -> Result<*mut sensor_t, CameraError> {
        let sensor = unsafe { esp_camera_sensor_get() };
        if sensor.is_null() {
            Err(CameraError::NotInitialized)
        } else {
            Ok(sensor)
        }
    }
}

impl FrameSource for EspCamera {
    fn acquire(&self) -> Result<FrameBuffer, CameraError> {
        let fb = unsafe { esp_camera_fb_get() };
        if fb.is_null() {
            return Err(CameraError::CaptureFailed("esp_camera_fb_get returned null".into()));
        }
        // SAFETY: fb is a live driver buffer until esp_camera_fb_return. The
        // struct carries a packed timestamp, so fields are read unaligned.
        unsafe {
            let buf = std::ptr::addr_of!((*fb).buf).read_unaligned();
            let len = std::ptr::addr_of!((*fb).len).read_unaligned();
            let width = std::ptr::addr_of!((*fb).width).read_unaligned();
            let height = std::ptr::addr_of!((*fb).height).read_unaligned();
            let format = std::ptr::addr_of!((*fb).format).read_unaligned();
            Ok(FrameBuffer::from_driver(
                fb as usize,
                width as u32,
                height as u32,
                pixel_format(format),
                buf,
                len as usize,
            ))
        }
    }

    fn release(&self, frame: FrameBuffer) {
        // SAFETY: the token is the pointer handed out by acquire, and the
        // frame is consumed here so it cannot be returned twice.
        unsafe { esp_camera_fb_return(frame.token() as *mut camera_fb_t) };
    }
}

/// Call one of the `sensor_t` setter function pointers.
macro_rules! set {
    ($sensor:expr, $setter:ident, $value:expr) => {
        match (*$sensor).$setter {
            Some(f) => f($sensor, $value as _),
            None => -1,
        }
    };
}

impl SensorControl for EspCamera {
    fn status(&self) -> Result<SensorStatus, CameraError> {
        let _guard = self.sensor_lock.lock().map_err(|_| CameraError::NotInitialized)?;
        let sensor = self.sensor()?;
        // SAFETY: see `sensor`; status is a plain struct owned by the driver.
        let s = unsafe { (*sensor).status };
        Ok(SensorStatus {
            framesize: s.framesize as u8,
            quality: s.quality,
            brightness: s.brightness,
            contrast: s.contrast,
            saturation: s.saturation,
            special_effect: s.special_effect,
            wb_mode: s.wb_mode,
            awb: s.awb,
            awb_gain: s.awb_gain,
            aec: s.aec,
            aec2: s.aec2,
            ae_level: s.ae_level,
            aec_value: s.aec_value,
            agc: s.agc,
            agc_gain: s.agc_gain,
            gainceiling: s.gainceiling,
            bpc: s.bpc,
            wpc: s.wpc,
            raw_gma: s.raw_gma,
            lenc: s.lenc,
            hmirror: s.hmirror,
            vflip: s.vflip,
            dcw: s.dcw,
            colorbar: s.colorbar,
        })
    }

    fn apply(&self, setting: SensorSetting) -> Result<(), CameraError> {
        let _guard = self.sensor_lock.lock().map_err(|_| CameraError::NotInitialized)?;
        let s = self.sensor()?;
        // SAFETY: setters only touch driver state behind the sensor pointer.
        let rc = unsafe {
            match setting {
                SensorSetting::FrameSize(size) => {
                    set!(s, set_framesize, size.index() as framesize_t)
                }
                SensorSetting::Quality(v) => set!(s, set_quality, v),
                SensorSetting::Brightness(v) => set!(s, set_brightness, v),
                SensorSetting::Contrast(v) => set!(s, set_contrast, v),
                SensorSetting::Saturation(v) => set!(s, set_saturation, v),
                SensorSetting::GainCeiling(v) => set!(s, set_gainceiling, v),
                SensorSetting::Colorbar(v) => set!(s, set_colorbar, v),
                SensorSetting::WhiteBalance(v) => set!(s, set_whitebal, v),
                SensorSetting::GainControl(v) => set!(s, set_gain_ctrl, v),
                SensorSetting::ExposureControl(v) => set!(s, set_exposure_ctrl, v),
                SensorSetting::HMirror(v) => set!(s, set_hmirror, v),
                SensorSetting::VFlip(v) => set!(s, set_vflip, v),
                SensorSetting::AwbGain(v) => set!(s, set_awb_gain, v),
                SensorSetting::AgcGain(v) => set!(s, set_agc_gain, v),
                SensorSetting::AecValue(v) => set!(s, set_aec_value, v),
                SensorSetting::Aec2(v) => set!(s, set_aec2, v),
                SensorSetting::Dcw(v) => set!(s, set_dcw, v),
                SensorSetting::Bpc(v) => set!(s, set_bpc, v),
                SensorSetting::Wpc(v) => set!(s, set_wpc, v),
                SensorSetting::RawGamma(v) => set!(s, set_raw_gma, v),
                SensorSetting::LensCorrection(v) => set!(s, set_lenc, v),
                SensorSetting::SpecialEffect(v) => set!(s, set_special_effect, v),
                SensorSetting::WbMode(v) => set!(s, set_wb_mode, v),
                SensorSetting::AeLevel(v) => set!(s, set_ae_level, v),
            }
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(CameraError::SettingRejected {
                name: setting.name().to_string(),
                reason: format!("driver returned {}", rc),
            })
        }
    }

    fn sensor_id(&self) -> u16 {
        self.sensor_id
    }
}

impl EspCamera {
    /// Current frame size, as the driver reports it.
    pub fn frame_size(&self) -> FrameSize {
        self.status()
            .map(|s| s.frame_size())
            .unwrap_or(FrameSize::Svga)
    }
}
