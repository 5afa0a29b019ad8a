//! Unified frame source: an on-disk image directory paced to a target FPS,
//! a V4L2 capture device, or an MJPEG-over-HTTP stream.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use image::{GrayImage, ImageFormat};
use thiserror::Error;
use v4l::buffer::Type;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::config::{CameraConfig, SourceKind};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "bmp", "png"];

/// Growth cap for the MJPEG reassembly buffer; a stream that never produces
/// a frame boundary within this much data is broken.
const MJPEG_BUF_MAX: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CameraError {
    /// Directory source with zero matching files; nothing to cycle.
    #[error("no images with extensions {IMAGE_EXTENSIONS:?} under {0}")]
    EmptyImageDir(PathBuf),
    /// The capture device could not be opened or configured.
    #[error("failed to open camera device '{device}': {source}")]
    DeviceOpen {
        device: String,
        source: std::io::Error,
    },
    /// The device settled on a pixel format we cannot convert.
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(String),
    /// RTSP needs a demuxer this build does not carry.
    #[error("unsupported stream URL '{0}' (only http/https MJPEG streams)")]
    UnsupportedUrl(String),
    /// The network stream could not be opened.
    #[error("failed to open stream: {0}")]
    StreamOpen(#[from] reqwest::Error),
    /// The device or stream was lost irrecoverably.
    #[error("capture stream failed: {0}")]
    StreamLost(std::io::Error),
}

enum Source {
    Directory {
        paths: Vec<PathBuf>,
    },
    Webcam {
        device: Device,
        format: v4l::Format,
    },
    Mjpeg {
        url: String,
        // Connection established at open so startup failures are fatal;
        // frames() takes it, later calls reconnect.
        pending: Option<reqwest::blocking::Response>,
    },
}

pub struct Camera {
    cfg: CameraConfig,
    inner: Source,
}

impl Camera {
    pub fn open(cfg: CameraConfig) -> Result<Self, CameraError> {
        let inner = match cfg.source {
            SourceKind::Directory => {
                let mut paths = Vec::new();
                collect_images(&cfg.image_dir, &mut paths);
                if paths.is_empty() {
                    return Err(CameraError::EmptyImageDir(cfg.image_dir.clone()));
                }
                paths.sort();
                tracing::info!(
                    "Camera: loaded {} images from {}",
                    paths.len(),
                    cfg.image_dir.display()
                );
                Source::Directory { paths }
            }
            SourceKind::Webcam => {
                if cfg.device.starts_with("http://") || cfg.device.starts_with("https://") {
                    tracing::info!("Camera: opening stream URL {}", cfg.device);
                    let resp = reqwest::blocking::get(&cfg.device)?;
                    Source::Mjpeg {
                        url: cfg.device.clone(),
                        pending: Some(resp),
                    }
                } else if cfg.device.contains("://") {
                    return Err(CameraError::UnsupportedUrl(cfg.device.clone()));
                } else {
                    tracing::info!("Camera: opening device {}", cfg.device);
                    let (device, format) = open_v4l2(&cfg)?;
                    tracing::info!(
                        "Camera: webcam opened ({}x{} {})",
                        format.width,
                        format.height,
                        format.fourcc
                    );
                    Source::Webcam { device, format }
                }
            }
        };

        Ok(Self { cfg, inner })
    }

    /// Start yielding frames. Borrows the camera for the lifetime of the
    /// capture loop; for network sources a second call reconnects.
    pub fn frames(&mut self) -> Result<FrameStream<'_>, CameraError> {
        let state = match &mut self.inner {
            Source::Directory { paths } => StreamState::Directory {
                paths: paths.as_slice(),
                index: 0,
                next_due: None,
                interval: Duration::from_micros(1_000_000 / u64::from(self.cfg.frame_rate_fps)),
            },
            Source::Webcam { device, format } => {
                let stream = MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(CameraError::StreamLost)?;
                StreamState::Webcam {
                    stream,
                    format: format.clone(),
                }
            }
            Source::Mjpeg { url, pending } => {
                let resp = match pending.take() {
                    Some(resp) => resp,
                    None => reqwest::blocking::get(url.as_str())?,
                };
                StreamState::Mjpeg {
                    resp,
                    buf: Vec::new(),
                }
            }
        };
        Ok(FrameStream { state })
    }
}

pub struct FrameStream<'a> {
    state: StreamState<'a>,
}

enum StreamState<'a> {
    Directory {
        paths: &'a [PathBuf],
        index: usize,
        next_due: Option<Instant>,
        interval: Duration,
    },
    Webcam {
        stream: MmapStream<'a>,
        format: v4l::Format,
    },
    Mjpeg {
        resp: reqwest::blocking::Response,
        buf: Vec<u8>,
    },
}

impl FrameStream<'_> {
    /// Blocks until the next frame is due, then yields it as 8-bit grayscale
    /// with its acquisition timestamp (µs since the Unix epoch).
    ///
    /// `Ok(None)` is a transient skip (bad file, undecodable frame); the
    /// caller just tries again. `Err` is permanent and should end the
    /// capture thread.
    pub fn next_frame(&mut self) -> Result<Option<(GrayImage, u64)>, CameraError> {
        match &mut self.state {
            StreamState::Directory {
                paths,
                index,
                next_due,
                interval,
            } => {
                pace(next_due, *interval);

                let path = &paths[*index];
                *index = (*index + 1) % paths.len();
                if *index == 0 {
                    tracing::debug!("Camera: wrapped around image directory");
                }

                // A failed read consumed its pacing slot above, so a bad
                // file cannot burn through the directory in a tight loop.
                match image::open(path) {
                    Ok(img) => Ok(Some((img.to_luma8(), unix_micros()))),
                    Err(e) => {
                        tracing::warn!("Failed to read image {}: {e}", path.display());
                        Ok(None)
                    }
                }
            }
            StreamState::Webcam { stream, format } => {
                let (buf, _meta) = stream.next().map_err(CameraError::StreamLost)?;
                if buf.is_empty() {
                    return Ok(None);
                }
                match decode_v4l2_frame(buf, format) {
                    Some(img) => Ok(Some((img, unix_micros()))),
                    None => {
                        tracing::warn!("Camera: failed to decode frame from webcam");
                        Ok(None)
                    }
                }
            }
            StreamState::Mjpeg { resp, buf } => {
                let jpeg = read_mjpeg_part(resp, buf)?;
                match image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg) {
                    Ok(img) => Ok(Some((img.to_luma8(), unix_micros()))),
                    Err(e) => {
                        tracing::warn!("Camera: undecodable MJPEG part: {e}");
                        Ok(None)
                    }
                }
            }
        }
    }
}

/// Sleep until the absolute deadline, then schedule the next one from the
/// deadline rather than from wakeup so jitter does not accumulate. More than
/// one interval behind resyncs to now.
fn pace(next_due: &mut Option<Instant>, interval: Duration) {
    let now = Instant::now();
    match *next_due {
        None => *next_due = Some(now + interval),
        Some(due) => {
            if due > now {
                std::thread::sleep(due - now);
            }
            let mut next = due + interval;
            let now = Instant::now();
            if next < now {
                next = now + interval;
            }
            *next_due = Some(next);
        }
    }
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Camera: cannot read {}: {e}", dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_images(&path, out);
        } else if has_image_extension(&path) {
            out.push(path);
        }
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

fn open_v4l2(cfg: &CameraConfig) -> Result<(Device, v4l::Format), CameraError> {
    let device = Device::with_path(&cfg.device).map_err(|e| CameraError::DeviceOpen {
        device: cfg.device.clone(),
        source: e,
    })?;

    let mut wanted = device.format().map_err(|e| CameraError::DeviceOpen {
        device: cfg.device.clone(),
        source: e,
    })?;
    wanted.width = cfg.width;
    wanted.height = cfg.height;

    // NIR sensors expose GREY directly; otherwise fall back to compressed or
    // packed formats we can convert.
    let mut format = None;
    for fourcc in [b"GREY", b"MJPG", b"YUYV"] {
        wanted.fourcc = FourCC::new(fourcc);
        let actual = device.set_format(&wanted).map_err(|e| CameraError::DeviceOpen {
            device: cfg.device.clone(),
            source: e,
        })?;
        if actual.fourcc == wanted.fourcc {
            format = Some(actual);
            break;
        }
    }
    let format = format.ok_or_else(|| {
        CameraError::UnsupportedFormat(
            device
                .format()
                .map(|f| f.fourcc.to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
        )
    })?;

    if format.width != cfg.width || format.height != cfg.height {
        tracing::warn!(
            "Camera: device chose {}x{} instead of {}x{}",
            format.width,
            format.height,
            cfg.width,
            cfg.height
        );
    }

    if let Err(e) = device.set_params(&Parameters::with_fps(cfg.frame_rate_fps)) {
        tracing::warn!("Camera: could not set {} fps: {e}", cfg.frame_rate_fps);
    }

    Ok((device, format))
}

fn decode_v4l2_frame(buf: &[u8], format: &v4l::Format) -> Option<GrayImage> {
    let (w, h) = (format.width, format.height);
    let pixels = (w as usize) * (h as usize);
    match &format.fourcc.repr {
        b"GREY" => {
            if buf.len() < pixels {
                return None;
            }
            GrayImage::from_raw(w, h, buf[..pixels].to_vec())
        }
        b"MJPG" => image::load_from_memory_with_format(buf, ImageFormat::Jpeg)
            .ok()
            .map(|img| img.to_luma8()),
        b"YUYV" => {
            if buf.len() < pixels * 2 {
                return None;
            }
            let luma = buf[..pixels * 2]
                .chunks_exact(2)
                .map(|yuyv| yuyv[0])
                .collect();
            GrayImage::from_raw(w, h, luma)
        }
        _ => None,
    }
}

/// Pull bytes off the HTTP response until one complete JPEG part
/// (SOI..=EOI) is buffered, then split it off.
fn read_mjpeg_part(
    resp: &mut reqwest::blocking::Response,
    buf: &mut Vec<u8>,
) -> Result<Vec<u8>, CameraError> {
    let mut chunk = [0u8; 8192];
    loop {
        if let Some(jpeg) = split_jpeg_part(buf) {
            return Ok(jpeg);
        }
        if buf.len() > MJPEG_BUF_MAX {
            return Err(CameraError::StreamLost(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "no JPEG frame boundary within buffer cap",
            )));
        }
        let n = resp
            .read(&mut chunk)
            .map_err(CameraError::StreamLost)?;
        if n == 0 {
            return Err(CameraError::StreamLost(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "MJPEG stream closed by peer",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn split_jpeg_part(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let start = find_marker(buf, &[0xFF, 0xD8])?;
    let end = start + find_marker(&buf[start..], &[0xFF, 0xD9])?;
    let jpeg = buf[start..end + 2].to_vec();
    buf.drain(..end + 2);
    Some(jpeg)
}

fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}
