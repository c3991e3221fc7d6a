use super::CaptureSource;
use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, CameraInfo, FrameFormat, RequestedFormat,
    RequestedFormatType, Resolution,
};
use nokhwa::Camera;

/// Which way the preferred camera faces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacingMode {
    /// Rear camera, pointed at the drawing surface
    #[default]
    Environment,
    /// Front camera
    User,
    /// First enumerated device
    Any,
}

impl FacingMode {
    fn keywords(self) -> &'static [&'static str] {
        match self {
            FacingMode::Environment => &["back", "environment", "rear"],
            FacingMode::User => &["front", "user", "facetime"],
            FacingMode::Any => &[],
        }
    }
}

/// Camera session options
#[derive(Debug, Clone)]
pub struct CameraConfig {
    /// Explicit device index; takes precedence over `facing`
    pub device_index: Option<u32>,
    pub facing: FacingMode,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Allow `switch_device` to cycle through enumerated cameras
    pub allow_switching: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: None,
            facing: FacingMode::Environment,
            width: 1280,
            height: 720,
            fps: 30,
            allow_switching: true,
        }
    }
}

impl CameraConfig {
    /// Format requests tried in order until the device accepts one
    fn format_fallbacks(&self) -> Vec<RequestedFormatType> {
        let resolution = Resolution::new(self.width, self.height);
        vec![
            RequestedFormatType::Closest(CameraFormat::new(
                resolution,
                FrameFormat::MJPEG,
                self.fps,
            )),
            RequestedFormatType::Closest(CameraFormat::new(
                resolution,
                FrameFormat::YUYV,
                self.fps,
            )),
            RequestedFormatType::HighestResolution(resolution),
            RequestedFormatType::AbsoluteHighestResolution,
            RequestedFormatType::None,
        ]
    }
}

/// Picks the device whose name matches the facing preference, else the first
fn pick_device(names: &[String], facing: FacingMode) -> usize {
    names
        .iter()
        .position(|name| {
            let name = name.to_lowercase();
            facing.keywords().iter().any(|k| name.contains(k))
        })
        .unwrap_or(0)
}

pub struct WebcamCapture {
    camera: Option<Camera>,
    devices: Vec<CameraInfo>,
    active: usize,
    config: CameraConfig,
    width: u32,
    height: u32,
}

impl WebcamCapture {
    pub fn new(config: CameraConfig) -> Result<Self> {
        let devices = match nokhwa::query(ApiBackend::Auto) {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("Camera enumeration failed, using default device: {}", e);
                Vec::new()
            }
        };
        tracing::info!("Found {} cameras", devices.len());
        for (i, device) in devices.iter().enumerate() {
            tracing::debug!("Camera {}: {}", i, device.human_name());
        }

        let active = match config.device_index {
            Some(index) => devices
                .iter()
                .position(|d| *d.index() == CameraIndex::Index(index))
                .unwrap_or(0),
            None => {
                let names: Vec<String> = devices.iter().map(|d| d.human_name()).collect();
                pick_device(&names, config.facing)
            }
        };

        let mut capture = Self {
            camera: None,
            devices,
            active,
            config,
            width: 0,
            height: 0,
        };
        capture.open_active()?;
        Ok(capture)
    }

    fn active_index(&self) -> CameraIndex {
        match self.devices.get(self.active) {
            Some(device) => device.index().clone(),
            None => CameraIndex::Index(self.config.device_index.unwrap_or(0)),
        }
    }

    fn open_active(&mut self) -> Result<()> {
        let index = self.active_index();
        tracing::info!(
            "Initializing webcam {} at {}x{}",
            index,
            self.config.width,
            self.config.height
        );

        let mut last_error = None;
        for request in self.config.format_fallbacks() {
            let requested = RequestedFormat::new::<RgbFormat>(request);
            let attempt = Camera::new(index.clone(), requested).and_then(|mut camera| {
                camera.open_stream()?;
                Ok(camera)
            });
            match attempt {
                Ok(camera) => {
                    let actual = camera.resolution();
                    self.width = actual.width();
                    self.height = actual.height();
                    self.camera = Some(camera);
                    tracing::info!(
                        "Webcam streaming at {}x{} ({:?})",
                        self.width,
                        self.height,
                        request
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!("Format {:?} rejected: {}", request, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e).context("Failed to open camera stream"),
            None => Err(anyhow!("No camera formats to try")),
        }
    }

    /// Stops the current stream and opens the next enumerated camera
    pub fn switch_device(&mut self) -> Result<()> {
        if !self.config.allow_switching {
            return Err(anyhow!("Device switching is disabled"));
        }
        if self.devices.len() < 2 {
            return Err(anyhow!("Only {} camera available", self.devices.len()));
        }

        self.release()?;
        self.active = (self.active + 1) % self.devices.len();
        tracing::info!(
            "Switching to camera {}: {}",
            self.active,
            self.devices[self.active].human_name()
        );
        self.open_active()
    }
}

impl CaptureSource for WebcamCapture {
    fn capture_frame(&mut self) -> Result<Option<RgbImage>> {
        let Some(camera) = self.camera.as_mut() else {
            return Ok(None);
        };
        if !camera.is_stream_open() {
            return Ok(None);
        }

        let frame = camera.frame().context("Failed to capture frame")?;
        let decoded = frame
            .decode_image::<RgbFormat>()
            .context("Failed to decode frame")?;

        Ok(Some(decoded))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mut camera) = self.camera.take() {
            tracing::info!("Stopping camera stream");
            camera
                .stop_stream()
                .context("Failed to stop camera stream")?;
        }
        Ok(())
    }

    fn active_tracks(&self) -> usize {
        self.camera
            .as_ref()
            .map_or(0, |camera| usize::from(camera.is_stream_open()))
    }
}

impl Drop for WebcamCapture {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!("Camera release on drop failed: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn prefers_back_camera() {
        let devices = names(&["Front Camera", "Back Camera"]);
        assert_eq!(pick_device(&devices, FacingMode::Environment), 1);
        assert_eq!(pick_device(&devices, FacingMode::User), 0);
    }

    #[test]
    fn falls_back_to_first_device() {
        let devices = names(&["Integrated Webcam", "USB Camera"]);
        assert_eq!(pick_device(&devices, FacingMode::Environment), 0);
        assert_eq!(pick_device(&[], FacingMode::Any), 0);
    }

    #[test]
    fn fallback_order_ends_with_unconstrained_request() {
        let formats = CameraConfig::default().format_fallbacks();
        assert!(matches!(formats[0], RequestedFormatType::Closest(_)));
        assert!(matches!(formats.last(), Some(RequestedFormatType::None)));
    }
}
