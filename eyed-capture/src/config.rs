use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Parser)]
pub struct Opt {
    /// Path to the capture TOML config file.
    #[clap(long, env = "CAPTURE_CONFIG", default_value = "/app/config/capture.toml")]
    pub config: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CaptureConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub quality: QualityConfig,

    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_address")]
    pub address: String,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: default_gateway_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

fn default_gateway_address() -> String {
    "gateway:50051".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_reconnect_base_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Directory,
    Webcam,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_source")]
    pub source: SourceKind,

    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,

    /// Device path or stream URL.
    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_frame_rate_fps")]
    pub frame_rate_fps: u32,

    #[serde(default = "default_eye_side")]
    pub eye_side: String,

    #[serde(default)]
    pub is_nir: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            image_dir: default_image_dir(),
            device: default_device(),
            width: default_width(),
            height: default_height(),
            frame_rate_fps: default_frame_rate_fps(),
            eye_side: default_eye_side(),
            is_nir: false,
        }
    }
}

fn default_source() -> SourceKind {
    SourceKind::Directory
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("/data/Iris/CASIA1")
}

fn default_device() -> String {
    "/dev/video0".to_string()
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

fn default_frame_rate_fps() -> u32 {
    30
}

fn default_eye_side() -> String {
    "left".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Minimum sharpness score in [0, 1].
    #[serde(default = "default_quality_threshold")]
    pub threshold: f32,

    /// JPEG quality in [1, 100].
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            threshold: default_quality_threshold(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

fn default_quality_threshold() -> f32 {
    0.30
}

fn default_jpeg_quality() -> u8 {
    85
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_id")]
    pub id: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: default_device_id(),
            log_level: default_log_level(),
        }
    }
}

fn default_device_id() -> String {
    "capture-01".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CaptureConfig {
    /// Load from the TOML file at `path`, then apply `EYED_*` environment
    /// overrides. Configuration errors are not fatal: a bad or missing file
    /// logs a warning and the defaults stand.
    pub fn load(path: &Path) -> CaptureConfig {
        let mut cfg = match Self::parse_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("Failed to parse config {}: {e}. Using defaults.", path.display());
                CaptureConfig::default()
            }
        };

        cfg.apply_env_overrides();
        cfg.clamp_invalid();
        cfg
    }

    fn parse_file(path: &Path) -> eyre::Result<CaptureConfig> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .build()?;

        Ok(settings.try_deserialize::<CaptureConfig>()?)
    }

    /// Flat `EYED_*` overrides, applied after the file so deployments can
    /// retarget a device without editing the image.
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("EYED_GATEWAY_ADDR") {
            self.gateway.address = addr;
        }
        if let Ok(id) = std::env::var("EYED_DEVICE_ID") {
            self.device.id = id;
        }
        if let Ok(level) = std::env::var("EYED_LOG_LEVEL") {
            self.device.log_level = level;
        }
        if let Ok(source) = std::env::var("EYED_CAMERA_SOURCE") {
            match source.as_str() {
                "directory" => self.camera.source = SourceKind::Directory,
                "webcam" => self.camera.source = SourceKind::Webcam,
                other => {
                    tracing::warn!("EYED_CAMERA_SOURCE '{other}' not supported (use 'directory' or 'webcam')")
                }
            }
        }
        if let Ok(device) = std::env::var("EYED_CAMERA_DEVICE") {
            self.camera.device = device;
        }
        if let Ok(dir) = std::env::var("EYED_IMAGE_DIR") {
            self.camera.image_dir = PathBuf::from(dir);
        }
        if let Ok(threshold) = std::env::var("EYED_QUALITY_THRESHOLD") {
            match threshold.parse::<f32>() {
                Ok(t) => self.quality.threshold = t,
                Err(e) => tracing::warn!("EYED_QUALITY_THRESHOLD '{threshold}' ignored: {e}"),
            }
        }
    }

    /// Out-of-range values are a configuration error: warn and substitute the
    /// default rather than abort.
    fn clamp_invalid(&mut self) {
        if self.camera.frame_rate_fps == 0 {
            tracing::warn!("camera.frame_rate_fps must be > 0, using default");
            self.camera.frame_rate_fps = default_frame_rate_fps();
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            tracing::warn!("camera.width/height must be > 0, using defaults");
            self.camera.width = default_width();
            self.camera.height = default_height();
        }
        if !(0.0..=1.0).contains(&self.quality.threshold) {
            tracing::warn!(
                "quality.threshold {} outside [0, 1], using default",
                self.quality.threshold
            );
            self.quality.threshold = default_quality_threshold();
        }
        if !(1..=100).contains(&self.quality.jpeg_quality) {
            tracing::warn!(
                "quality.jpeg_quality {} outside [1, 100], using default",
                self.quality.jpeg_quality
            );
            self.quality.jpeg_quality = default_jpeg_quality();
        }
        if self.gateway.connect_timeout_ms == 0 {
            tracing::warn!("gateway.connect_timeout_ms must be > 0, using default");
            self.gateway.connect_timeout_ms = default_connect_timeout_ms();
        }
        if self.gateway.reconnect_base_ms == 0
            || self.gateway.reconnect_base_ms > self.gateway.reconnect_max_ms
        {
            tracing::warn!(
                "gateway.reconnect_base_ms {} / reconnect_max_ms {} invalid, using defaults",
                self.gateway.reconnect_base_ms,
                self.gateway.reconnect_max_ms
            );
            self.gateway.reconnect_base_ms = default_reconnect_base_ms();
            self.gateway.reconnect_max_ms = default_reconnect_max_ms();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.gateway.address, "gateway:50051");
        assert_eq!(cfg.gateway.reconnect_base_ms, 500);
        assert_eq!(cfg.gateway.reconnect_max_ms, 30_000);
        assert_eq!(cfg.camera.source, SourceKind::Directory);
        assert_eq!(cfg.camera.frame_rate_fps, 30);
        assert_eq!(cfg.quality.threshold, 0.30);
        assert_eq!(cfg.quality.jpeg_quality, 85);
        assert_eq!(cfg.device.id, "capture-01");
    }

    #[test]
    fn toml_sections_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
            [gateway]
            address = "gw.internal:443"
            reconnect_base_ms = 250

            [camera]
            source = "webcam"
            device = "/dev/video2"
            eye_side = "right"

            [quality]
            threshold = 0.42

            [device]
            id = "capture-07"
            "#
        )
        .unwrap();

        let cfg = CaptureConfig::parse_file(file.path()).unwrap();
        assert_eq!(cfg.gateway.address, "gw.internal:443");
        assert_eq!(cfg.gateway.reconnect_base_ms, 250);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.gateway.reconnect_max_ms, 30_000);
        assert_eq!(cfg.camera.source, SourceKind::Webcam);
        assert_eq!(cfg.camera.eye_side, "right");
        assert_eq!(cfg.quality.threshold, 0.42);
        assert_eq!(cfg.device.id, "capture-07");
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let mut cfg = CaptureConfig::default();
        cfg.camera.frame_rate_fps = 0;
        cfg.quality.threshold = 1.5;
        cfg.quality.jpeg_quality = 0;
        cfg.gateway.reconnect_base_ms = 60_000; // larger than max

        cfg.clamp_invalid();
        assert_eq!(cfg.camera.frame_rate_fps, 30);
        assert_eq!(cfg.quality.threshold, 0.30);
        assert_eq!(cfg.quality.jpeg_quality, 85);
        assert_eq!(cfg.gateway.reconnect_base_ms, 500);
    }
}
