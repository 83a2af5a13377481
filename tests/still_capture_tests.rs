// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for still capture against the simulated hardware

use rpicam::backends::simulated::{Fault, SimulatedBackend, SimulatedConfig};
use rpicam::backends::types::ComponentKind;
use rpicam::pipelines::{SessionState, StillSink};
use rpicam::{CaptureConfig, CaptureError, CapturePipeline, OperatingMode};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn still_backend(still_delay: Duration) -> Arc<SimulatedBackend> {
    Arc::new(SimulatedBackend::new(SimulatedConfig {
        frame_interval: Some(Duration::from_millis(5)),
        still_delay,
        still_size: 40_000,
        ..SimulatedConfig::default()
    }))
}

fn photo_config(dir: &std::path::Path) -> CaptureConfig {
    let mut config = CaptureConfig::default();
    config.still.output_dir = Some(dir.to_path_buf());
    config
}

/// Keeps what was written so the test can inspect it after commit
#[derive(Clone, Default)]
struct SharedSink {
    data: Arc<Mutex<Vec<u8>>>,
    committed: Arc<Mutex<bool>>,
}

impl StillSink for SharedSink {
    fn write_payload(&mut self, data: &[u8]) -> io::Result<usize> {
        self.data.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn commit(self: Box<Self>) -> io::Result<()> {
        *self.committed.lock().unwrap() = true;
        Ok(())
    }

    fn discard(self: Box<Self>) {
        self.data.lock().unwrap().clear();
    }
}

/// Accepts only half of every chunk
struct ShortWriteSink;

impl StillSink for ShortWriteSink {
    fn write_payload(&mut self, data: &[u8]) -> io::Result<usize> {
        Ok(data.len() / 2)
    }

    fn commit(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }

    fn discard(self: Box<Self>) {}
}

#[test]
fn test_photo_is_written_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let backend = still_backend(Duration::from_millis(10));
    let pipeline = CapturePipeline::setup(backend.clone(), photo_config(dir.path())).unwrap();

    let path = pipeline.capture_photo().unwrap();
    assert_eq!(path.parent(), Some(dir.path()));
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jpg"));

    let data = std::fs::read(&path).unwrap();
    assert_eq!(&data[..2], &[0xFF, 0xD8]);
    assert_eq!(&data[data.len() - 2..], &[0xFF, 0xD9]);

    // Only the finished image remains in the directory
    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(pipeline.still_state(), SessionState::Idle);
    assert_eq!(backend.stills_emitted(), 1);
}

#[test]
fn test_still_encoder_is_built_on_first_capture() {
    let backend = still_backend(Duration::from_millis(10));
    let pipeline = CapturePipeline::setup(backend.clone(), CaptureConfig::default()).unwrap();
    assert!(!backend.live_components().contains(&ComponentKind::StillEncoder));

    let sink = SharedSink::default();
    let bytes = pipeline.capture_photo_into(Box::new(sink.clone())).unwrap();
    assert_eq!(bytes as usize, sink.data.lock().unwrap().len());
    assert!(*sink.committed.lock().unwrap());
    assert!(backend.live_components().contains(&ComponentKind::StillEncoder));
    assert!(pipeline.stats().still_pool.is_some());

    // The second capture reuses it
    pipeline.capture_photo_into(Box::new(SharedSink::default())).unwrap();
    assert_eq!(backend.stills_emitted(), 2);
    assert_eq!(backend.live_connections(), 3);

    pipeline.shutdown().unwrap();
    assert!(backend.live_components().is_empty());
}

#[test]
fn test_capture_while_streaming() {
    let backend = still_backend(Duration::from_millis(10));
    let pipeline = Arc::new(CapturePipeline::setup(backend.clone(), CaptureConfig::default()).unwrap());
    pipeline.start().unwrap();

    let consumer = {
        let pipeline = Arc::clone(&pipeline);
        std::thread::spawn(move || {
            let mut frames = 0;
            while pipeline.fill().is_ok() {
                frames += 1;
            }
            frames
        })
    };

    let sink = SharedSink::default();
    pipeline.capture_photo_into(Box::new(sink.clone())).unwrap();
    assert!(*sink.committed.lock().unwrap());

    pipeline.stop();
    assert!(consumer.join().unwrap() > 0);
}

#[test]
fn test_overlapping_capture_is_busy() {
    let backend = still_backend(Duration::from_millis(300));
    let pipeline = Arc::new(CapturePipeline::setup(backend, CaptureConfig::default()).unwrap());

    let first = {
        let pipeline = Arc::clone(&pipeline);
        std::thread::spawn(move || pipeline.capture_photo_into(Box::new(SharedSink::default())))
    };
    std::thread::sleep(Duration::from_millis(100));

    let second = pipeline.capture_photo_into(Box::new(SharedSink::default()));
    assert!(matches!(second, Err(CaptureError::Busy)));
    assert!(first.join().unwrap().is_ok());
}

#[test]
fn test_bad_exif_tags_are_skipped() {
    let backend = still_backend(Duration::from_millis(10));
    let mut config = CaptureConfig::default();
    config.exif.tags = vec![
        "IFD0.Artist=Someone".to_string(),
        "not a tag".to_string(),
        format!("IFD0.ImageDescription={}", "x".repeat(200)),
    ];
    let pipeline = CapturePipeline::setup(backend.clone(), config).unwrap();

    pipeline.capture_photo_into(Box::new(SharedSink::default())).unwrap();

    let tags = backend.last_exif_tags();
    assert!(tags.iter().any(|t| t == "IFD0.Model=RP_OV5647"));
    assert!(tags.iter().any(|t| t == "IFD0.Artist=Someone"));
    assert!(!tags.iter().any(|t| t == "not a tag"));
    assert!(!tags.iter().any(|t| t.starts_with("IFD0.ImageDescription")));
}

#[test]
fn test_exif_can_be_disabled() {
    let backend = still_backend(Duration::from_millis(10));
    let mut config = CaptureConfig::default();
    config.exif.enabled = false;
    let pipeline = CapturePipeline::setup(backend.clone(), config).unwrap();

    pipeline.capture_photo_into(Box::new(SharedSink::default())).unwrap();
    assert!(backend.last_exif_tags().is_empty());
}

#[test]
fn test_rejected_exif_tag_does_not_fail_capture() {
    let backend = still_backend(Duration::from_millis(10));
    backend.inject(Fault::RejectParameter("EXIF tag"));
    let pipeline = CapturePipeline::setup(backend.clone(), CaptureConfig::default()).unwrap();

    assert!(pipeline.capture_photo_into(Box::new(SharedSink::default())).is_ok());
}

#[test]
fn test_short_write_fails_capture() {
    let backend = still_backend(Duration::from_millis(10));
    let pipeline = CapturePipeline::setup(backend, CaptureConfig::default()).unwrap();

    let result = pipeline.capture_photo_into(Box::new(ShortWriteSink));
    assert!(matches!(result, Err(CaptureError::PartialWrite { .. })));
    assert_eq!(pipeline.still_state(), SessionState::Idle);

    // The next capture is unaffected
    assert!(pipeline.capture_photo_into(Box::new(SharedSink::default())).is_ok());
}

#[test]
fn test_transmission_failure_discards_image() {
    let dir = tempfile::tempdir().unwrap();
    let backend = still_backend(Duration::from_millis(10));
    backend.inject(Fault::TransmissionFailure);
    let pipeline = CapturePipeline::setup(backend, photo_config(dir.path())).unwrap();

    let result = pipeline.capture_photo();
    assert!(matches!(result, Err(CaptureError::TransmissionFailed)));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_capture_times_out() {
    let backend = still_backend(Duration::from_secs(2));
    let mut config = CaptureConfig::default();
    config.still.timeout_ms = 200;
    let pipeline = CapturePipeline::setup(backend, config).unwrap();

    let sink = SharedSink::default();
    let result = pipeline.capture_photo_into(Box::new(sink.clone()));
    assert!(matches!(result, Err(CaptureError::Timeout(_))));
    assert!(!*sink.committed.lock().unwrap());
    assert_eq!(pipeline.still_state(), SessionState::Idle);
}

#[test]
fn test_abort_ends_wait() {
    let backend = still_backend(Duration::from_secs(2));
    let pipeline = Arc::new(CapturePipeline::setup(backend, CaptureConfig::default()).unwrap());

    let aborter = {
        let pipeline = Arc::clone(&pipeline);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            pipeline.abort_capture();
        })
    };

    let result = pipeline.capture_photo_into(Box::new(SharedSink::default()));
    assert!(matches!(result, Err(CaptureError::Aborted)));
    aborter.join().unwrap();
}

#[test]
fn test_capture_refused_in_demo_mode() {
    let backend = still_backend(Duration::from_millis(10));
    let mut config = CaptureConfig::default();
    config.mode = OperatingMode::Demo;
    let pipeline = CapturePipeline::setup(backend, config).unwrap();
    pipeline.start().unwrap();

    let result = pipeline.capture_photo_into(Box::new(SharedSink::default()));
    assert!(matches!(result, Err(CaptureError::NotStreaming)));
}

#[test]
fn test_failed_still_build_is_rolled_back() {
    let faults = [
        Fault::CreateComponent(ComponentKind::StillEncoder),
        Fault::CommitFormat(ComponentKind::StillEncoder),
        Fault::EnableComponent(ComponentKind::StillEncoder),
        Fault::RejectParameter("JPEG quality"),
        Fault::EnableConnection,
    ];

    for fault in faults {
        let backend = still_backend(Duration::from_millis(10));
        let pipeline = CapturePipeline::setup(backend.clone(), CaptureConfig::default()).unwrap();
        backend.inject(fault.clone());

        let result = pipeline.capture_photo_into(Box::new(SharedSink::default()));
        assert!(matches!(result, Err(CaptureError::Setup(_))), "Capture should fail with {:?}", fault);
        assert_eq!(
            backend.live_components(),
            vec![ComponentKind::Camera, ComponentKind::Preview, ComponentKind::VideoEncoder],
            "Still encoder left behind after {:?}",
            fault
        );
        assert_eq!(backend.live_connections(), 2, "Connections left behind after {:?}", fault);
        assert_eq!(pipeline.still_state(), SessionState::Idle);
        assert!(pipeline.stats().still_pool.is_none());

        // Nothing stale blocks the next build
        backend.clear_faults();
        pipeline.capture_photo_into(Box::new(SharedSink::default())).unwrap();
        assert!(backend.live_components().contains(&ComponentKind::StillEncoder));
        assert_eq!(backend.live_connections(), 3);

        pipeline.shutdown().unwrap();
        assert!(backend.live_components().is_empty());
        assert_eq!(backend.live_connections(), 0);
    }
}
