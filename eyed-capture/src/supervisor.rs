//! Two-stage pipeline: a producer thread blocks on the camera and feeds the
//! ring buffer; an async consumer gates, encodes and streams. Shutdown is
//! cooperative through the shared cancellation token.

use std::time::{Duration, Instant};

use eyed_common::shutdown_handler::ShutdownHandler;
use eyre::{Result, WrapErr};

use crate::camera::Camera;
use crate::client::{reconnect_with_backoff, GatewayClient};
use crate::config::CaptureConfig;
use crate::pb::CaptureFrame;
use crate::quality::QualityGate;
use crate::ring_buffer::{ring_buffer, Consumer, Producer};
use crate::Frame;

/// Frames in flight between the camera thread and the consumer. Small on
/// purpose: a stale iris frame is worthless, dropping is cheaper than
/// queueing.
const FRAME_BUFFER_CAPACITY: usize = 4;

const EMPTY_POLL_SLEEP: Duration = Duration::from_millis(1);
const GATEWAY_REJECT_BACKOFF: Duration = Duration::from_millis(200);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone, Copy)]
struct Stats {
    sent: u64,
    rejected_quality: u64,
    rejected_gateway: u64,
}

/// Run the capture pipeline until shutdown. Errors here are startup
/// failures; once both stages are running the pipeline only ends on the
/// shutdown token.
pub async fn run(cfg: CaptureConfig, shutdown: ShutdownHandler) -> Result<()> {
    // Opening can block on device or network I/O, so keep it off the
    // reactor (the blocking HTTP client refuses to run inside a runtime).
    let camera_cfg = cfg.camera.clone();
    let camera = tokio::task::spawn_blocking(move || Camera::open(camera_cfg))
        .await
        .wrap_err("camera open task failed")?
        .wrap_err("camera not available")?;
    let gate = QualityGate::new(cfg.quality.clone());
    let mut client = GatewayClient::new(cfg.gateway.clone());

    tracing::info!("Connecting to gateway...");
    if !reconnect_with_backoff(&mut client, &cfg.gateway, &shutdown).await {
        return Ok(()); // shut down before the gateway ever came up
    }

    let (producer, consumer) = ring_buffer(FRAME_BUFFER_CAPACITY);
    let producer_shutdown = shutdown.clone();
    let producer_thread = std::thread::Builder::new()
        .name("camera-producer".to_string())
        .spawn(move || producer_loop(camera, producer, producer_shutdown))
        .wrap_err("failed to spawn camera thread")?;

    let sent = consumer_loop(consumer, &gate, &mut client, &cfg, &shutdown).await;

    tracing::info!("Shutting down...");
    // The producer observes the token on its next iteration.
    if producer_thread.join().is_err() {
        tracing::error!("Camera thread panicked");
    }
    tracing::info!("Capture device stopped. Total sent: {sent}");
    Ok(())
}

/// Thread 1: camera -> ring buffer. Exits on shutdown or permanent camera
/// failure; a full buffer drops the new frame.
fn producer_loop(mut camera: Camera, mut buffer: Producer<Frame>, shutdown: ShutdownHandler) {
    let mut stream = match camera.frames() {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("Camera stream failed to start: {e}");
            return;
        }
    };

    let mut frame_id: u32 = 0;
    while !shutdown.is_shutting_down() {
        match stream.next_frame() {
            Ok(Some((image, timestamp_us))) => {
                if image.is_empty() {
                    continue;
                }
                let frame = Frame {
                    image,
                    frame_id,
                    timestamp_us,
                };
                if let Err(dropped) = buffer.try_push(frame) {
                    tracing::debug!("Ring buffer full, dropping frame {}", dropped.frame_id);
                    metrics::counter!("eyed_capture_frames_dropped_buffer").increment(1);
                }
                frame_id = frame_id.wrapping_add(1);
            }
            Ok(None) => continue, // transient skip, pacing already consumed
            Err(e) => {
                tracing::error!("Camera failed, exiting capture thread: {e}");
                break;
            }
        }
    }
}

/// Thread 2: ring buffer -> quality gate -> gateway. Returns total frames
/// sent.
async fn consumer_loop(
    mut buffer: Consumer<Frame>,
    gate: &QualityGate,
    client: &mut GatewayClient,
    cfg: &CaptureConfig,
    shutdown: &ShutdownHandler,
) -> u64 {
    let mut stats = Stats::default();
    let mut stats_time = Instant::now();

    while !shutdown.is_shutting_down() {
        if stats_time.elapsed() >= STATS_INTERVAL {
            tracing::info!(
                "Stats: sent={} rejected_quality={} rejected_gateway={}",
                stats.sent,
                stats.rejected_quality,
                stats.rejected_gateway
            );
            stats_time = Instant::now();
        }

        let Some(frame) = buffer.try_pop() else {
            tokio::time::sleep(EMPTY_POLL_SLEEP).await;
            continue;
        };

        let score = gate.score(&frame.image);
        if !gate.passes(score) {
            stats.rejected_quality += 1;
            metrics::counter!("eyed_capture_frames_rejected_quality").increment(1);
            tracing::debug!(
                "Frame {} quality={score:.3} < {:.2}, skipped",
                frame.frame_id,
                cfg.quality.threshold
            );
            continue;
        }

        let jpeg = match gate.encode_jpeg(&frame.image) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!("JPEG encode failed for frame {}: {e}", frame.frame_id);
                continue;
            }
        };
        let jpeg_len = jpeg.len();

        let result = client
            .send_frame(CaptureFrame {
                jpeg_data: jpeg,
                quality_score: score,
                timestamp_us: frame.timestamp_us,
                frame_id: frame.frame_id,
                device_id: cfg.device.id.clone(),
                is_nir: cfg.camera.is_nir,
                eye_side: cfg.camera.eye_side.clone(),
            })
            .await;

        if !result.connection_ok {
            tracing::warn!("Lost connection to gateway, reconnecting...");
            if !reconnect_with_backoff(client, &cfg.gateway, shutdown).await {
                break;
            }
        } else if !result.accepted {
            stats.rejected_gateway += 1;
            metrics::counter!("eyed_capture_frames_rejected_gateway").increment(1);
            tracing::warn!(
                "Frame {} not accepted (queue_depth={})",
                frame.frame_id,
                result.queue_depth
            );
            tokio::time::sleep(GATEWAY_REJECT_BACKOFF).await;
        } else {
            stats.sent += 1;
            metrics::counter!("eyed_capture_frames_sent").increment(1);
            tracing::debug!(
                "Frame {} sent (quality={score:.3}, {jpeg_len} bytes)",
                frame.frame_id
            );
        }
    }

    stats.sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, SourceKind};
    use image::{GrayImage, Luma};

    #[test]
    fn producer_fills_buffer_and_exits_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "b.png"] {
            GrayImage::from_pixel(8, 8, Luma([64u8]))
                .save(dir.path().join(name))
                .unwrap();
        }
        let camera = Camera::open(CameraConfig {
            source: SourceKind::Directory,
            image_dir: dir.path().to_path_buf(),
            frame_rate_fps: 200,
            ..CameraConfig::default()
        })
        .unwrap();

        let shutdown = ShutdownHandler::new(1);
        let (producer, mut consumer) = ring_buffer(FRAME_BUFFER_CAPACITY);
        let thread_shutdown = shutdown.clone();
        let handle = std::thread::spawn(move || producer_loop(camera, producer, thread_shutdown));

        // Let the producer run long enough to overfill, then stop it.
        std::thread::sleep(Duration::from_millis(100));
        shutdown.trigger_manual_shutdown();
        handle.join().unwrap();

        // Exactly the buffered frames remain, ids strictly increasing.
        let mut ids = Vec::new();
        while let Some(frame) = consumer.try_pop() {
            ids.push(frame.frame_id);
        }
        assert!(!ids.is_empty());
        assert!(ids.len() <= FRAME_BUFFER_CAPACITY);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn deleted_file_is_a_transient_skip_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        GrayImage::from_pixel(8, 8, Luma([64u8]))
            .save(dir.path().join("a.png"))
            .unwrap();
        let mut camera = Camera::open(CameraConfig {
            source: SourceKind::Directory,
            image_dir: dir.path().to_path_buf(),
            frame_rate_fps: 100,
            ..CameraConfig::default()
        })
        .unwrap();

        // Pull the rug: empty the directory after open so reads skip, which
        // is transient, never permanent -- the thread must keep running
        // until told to stop.
        std::fs::remove_file(dir.path().join("a.png")).unwrap();
        let mut stream = camera.frames().unwrap();
        assert!(stream.next_frame().unwrap().is_none());
    }
}
