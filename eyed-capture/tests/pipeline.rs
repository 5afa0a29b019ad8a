//! Producer/consumer pipeline without a gateway: a directory camera feeds
//! the ring buffer from a capture thread while the consumer drains, gates
//! and encodes.

use std::time::{Duration, Instant};

use eyed_capture::camera::Camera;
use eyed_capture::config::{CameraConfig, QualityConfig, SourceKind};
use eyed_capture::quality::QualityGate;
use eyed_capture::ring_buffer::ring_buffer;
use eyed_capture::Frame;
use image::{GrayImage, Luma};

fn sharp_image(size: u32) -> GrayImage {
    GrayImage::from_fn(size, size, |x, y| Luma([(((x + y) % 2) * 255) as u8]))
}

#[test]
fn frames_flow_from_camera_to_encoded_jpeg() {
    let dir = tempfile::tempdir().unwrap();
    sharp_image(32).save(dir.path().join("a.png")).unwrap();
    sharp_image(32).save(dir.path().join("b.png")).unwrap();
    GrayImage::from_pixel(32, 32, Luma([128u8]))
        .save(dir.path().join("c_flat.png"))
        .unwrap();

    let mut camera = Camera::open(CameraConfig {
        source: SourceKind::Directory,
        image_dir: dir.path().to_path_buf(),
        frame_rate_fps: 200,
        ..CameraConfig::default()
    })
    .unwrap();

    let (mut producer, mut consumer) = ring_buffer::<Frame>(4);

    let capture_thread = std::thread::spawn(move || {
        let mut stream = camera.frames().unwrap();
        let mut frame_id = 0u32;
        // Two full directory cycles.
        for _ in 0..6 {
            if let Some((image, timestamp_us)) = stream.next_frame().unwrap() {
                let mut frame = Frame {
                    image,
                    frame_id,
                    timestamp_us,
                };
                // Retry instead of dropping; this test is about flow, the
                // drop policy has its own coverage.
                while let Err(rejected) = producer.try_push(frame) {
                    frame = rejected;
                    std::thread::sleep(Duration::from_millis(1));
                }
                frame_id += 1;
            }
        }
    });

    let gate = QualityGate::new(QualityConfig {
        threshold: 0.30,
        jpeg_quality: 85,
    });

    let mut sent = 0;
    let mut rejected_quality = 0;
    let mut drained = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while drained < 6 && Instant::now() < deadline {
        let Some(frame) = consumer.try_pop() else {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        };
        drained += 1;

        let score = gate.score(&frame.image);
        if !gate.passes(score) {
            rejected_quality += 1;
            continue;
        }
        let jpeg = gate.encode_jpeg(&frame.image).unwrap();
        assert!(image::load_from_memory(&jpeg).is_ok());
        sent += 1;
    }
    capture_thread.join().unwrap();

    // The consumer kept up, so nothing was dropped: both checkerboards per
    // cycle pass the gate, the flat frame is rejected every time.
    assert_eq!(drained, 6);
    assert_eq!(sent, 4);
    assert_eq!(rejected_quality, 2);
}
