pub mod camera;
pub mod client;
pub mod config;
pub mod quality;
pub mod ring_buffer;
pub mod supervisor;

/// Generated gateway protocol types.
pub mod pb {
    tonic::include_proto!("eyed.capture.v1");
}

use image::GrayImage;

/// One captured frame, exclusively owned by a single pipeline stage at a
/// time: the camera thread produces it, the ring buffer takes ownership on
/// push, the consumer takes ownership on pop.
#[derive(Debug)]
pub struct Frame {
    pub image: GrayImage,
    /// Unique within one process lifetime, monotonically increasing.
    pub frame_id: u32,
    /// Acquisition time, microseconds since the Unix epoch.
    pub timestamp_us: u64,
}
