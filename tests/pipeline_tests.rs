// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the video pipeline against the simulated hardware

use rpicam::backends::simulated::{Fault, SimulatedBackend, SimulatedConfig, SimulatedFrame};
use rpicam::backends::types::ComponentKind;
use rpicam::pipelines::{ComponentState, PipelineState};
use rpicam::{CaptureConfig, CapturePipeline, FlowStatus, SetupError, StreamError};
use std::sync::Arc;
use std::time::Duration;

const FILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Hardware that waits for the consumer instead of dropping frames
fn lossless_backend(frame_limit: u64) -> Arc<SimulatedBackend> {
    Arc::new(SimulatedBackend::new(SimulatedConfig {
        frame_interval: Some(Duration::ZERO),
        frame_limit: Some(frame_limit),
        drop_when_starved: false,
        ..SimulatedConfig::default()
    }))
}

#[test]
fn test_stream_delivers_every_frame_in_order() {
    let backend = lossless_backend(300);
    let pipeline = CapturePipeline::setup(backend.clone(), CaptureConfig::default()).unwrap();
    pipeline.start().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Streaming);

    let first = pipeline.fill().unwrap();
    assert!(first.frame.is_config(), "Stream should open with codec config");

    for expected in 0..300u64 {
        let filled = pipeline
            .fill_timeout(FILL_TIMEOUT)
            .unwrap()
            .unwrap_or_else(|| panic!("Frame {} did not arrive", expected));
        assert_eq!(filled.status(), FlowStatus::Ok);

        let header = SimulatedFrame::parse(&filled.frame.data).unwrap();
        assert_eq!(header.seq, expected, "Frames must arrive in encoder order");
        assert_eq!(header.length, filled.frame.len(), "Payload must be copied whole");
        assert_eq!(header.keyframe, filled.frame.is_keyframe());
    }

    assert_eq!(backend.frames_emitted(), 300);
    assert_eq!(backend.frames_dropped(), 0);

    let stats = pipeline.stats();
    assert_eq!(stats.video_pool.violations, 0);
    let pool = &stats.video_pool;
    assert_eq!(pool.acquired - pool.released, (pool.capacity - pool.free) as u64);

    pipeline.shutdown().unwrap();
    assert!(backend.live_components().is_empty());
    assert_eq!(backend.live_connections(), 0);
}

#[test]
fn test_first_frame_is_keyframe() {
    let backend = lossless_backend(5);
    let pipeline = CapturePipeline::setup(backend, CaptureConfig::default()).unwrap();
    pipeline.start().unwrap();

    assert!(pipeline.fill().unwrap().frame.is_config());
    let frame = pipeline.fill().unwrap().frame;
    assert!(frame.is_keyframe());
    assert_eq!(frame.pts, Some(0));
}

#[test]
fn test_intra_period_sets_keyframe_spacing() {
    let backend = lossless_backend(20);
    let mut config = CaptureConfig::default();
    config.pipeline.intra_period = 5;
    let pipeline = CapturePipeline::setup(backend, config).unwrap();
    pipeline.start().unwrap();
    pipeline.fill().unwrap();

    let keyframes: Vec<bool> = (0..10)
        .map(|_| pipeline.fill().unwrap().frame.is_keyframe())
        .collect();
    assert_eq!(
        keyframes,
        vec![true, false, false, false, false, true, false, false, false, false]
    );
}

#[test]
fn test_setup_failures_leave_nothing_behind() {
    let faults = [
        Fault::CreateComponent(ComponentKind::Camera),
        Fault::CreateComponent(ComponentKind::Preview),
        Fault::CreateComponent(ComponentKind::VideoEncoder),
        Fault::CommitFormat(ComponentKind::Camera),
        Fault::CommitFormat(ComponentKind::VideoEncoder),
        Fault::EnableComponent(ComponentKind::Camera),
        Fault::EnableComponent(ComponentKind::Preview),
        Fault::EnableComponent(ComponentKind::VideoEncoder),
        Fault::EnableConnection,
        Fault::RejectParameter("camera config"),
        Fault::RejectParameter("H264 profile"),
    ];

    for fault in faults {
        let backend = Arc::new(SimulatedBackend::default());
        backend.inject(fault.clone());

        let result = CapturePipeline::setup(backend.clone(), CaptureConfig::default());
        assert!(result.is_err(), "Setup should fail with {:?}", fault);
        assert!(
            backend.live_components().is_empty(),
            "Components left behind after {:?}: {:?}",
            fault,
            backend.live_components()
        );
        assert_eq!(backend.live_connections(), 0, "Connections left behind after {:?}", fault);
    }
}

#[test]
fn test_failed_component_is_named() {
    let backend = Arc::new(SimulatedBackend::default());
    backend.inject(Fault::CreateComponent(ComponentKind::VideoEncoder));

    match CapturePipeline::setup(backend, CaptureConfig::default()) {
        Err(SetupError::ComponentCreate { kind, .. }) => {
            assert_eq!(kind, ComponentKind::VideoEncoder)
        }
        Err(e) => panic!("Unexpected error: {}", e),
        Ok(_) => panic!("Setup should have failed"),
    }
}

#[test]
fn test_optional_settings_do_not_fail_setup() {
    let backend = Arc::new(SimulatedBackend::default());
    backend.inject(Fault::RejectParameter("immutable input flag"));
    backend.inject(Fault::RejectParameter("display region"));
    backend.inject(Fault::RejectParameter("camera tuning"));

    let pipeline = CapturePipeline::setup(backend, CaptureConfig::default()).unwrap();
    let states: Vec<ComponentState> = pipeline.stats().components.iter().map(|c| c.1).collect();
    assert!(states.iter().all(|s| *s == ComponentState::Enabled));
}

#[test]
fn test_rejected_intra_period_fails_setup() {
    let backend = Arc::new(SimulatedBackend::default());
    backend.inject(Fault::RejectParameter("intra period"));
    let mut config = CaptureConfig::default();
    config.pipeline.intra_period = 10;

    let result = CapturePipeline::setup(backend.clone(), config);
    assert!(matches!(result, Err(SetupError::Parameter { name: "intra period", .. })));
    assert!(backend.live_components().is_empty());
}

#[test]
fn test_invalid_config_is_rejected_before_hardware() {
    let backend = Arc::new(SimulatedBackend::default());
    let mut config = CaptureConfig::default();
    config.pipeline.bitrate = 0;

    let result = CapturePipeline::setup(backend.clone(), config);
    assert!(matches!(result, Err(SetupError::Config(_))));
    assert!(backend.live_components().is_empty());
}

#[test]
fn test_start_failure_keeps_pipeline_configured() {
    let backend = lossless_backend(10);
    backend.inject(Fault::RejectParameter("capture"));
    let pipeline = CapturePipeline::setup(backend.clone(), CaptureConfig::default()).unwrap();

    assert!(matches!(pipeline.start(), Err(SetupError::Parameter { name: "capture", .. })));
    assert_eq!(pipeline.state(), PipelineState::Configured);
    assert!(matches!(pipeline.fill(), Err(StreamError::NotStreaming)));

    backend.clear_faults();
    pipeline.start().unwrap();
    assert!(pipeline.fill().unwrap().frame.is_config());
}

#[test]
fn test_start_twice_is_refused() {
    let pipeline = CapturePipeline::setup(lossless_backend(1), CaptureConfig::default()).unwrap();
    pipeline.start().unwrap();
    assert!(matches!(pipeline.start(), Err(SetupError::Pipeline(_))));
}

#[test]
fn test_stop_wakes_blocked_consumer() {
    // Codec config only, then the encoder goes quiet
    let backend = lossless_backend(0);
    let pipeline = Arc::new(CapturePipeline::setup(backend, CaptureConfig::default()).unwrap());
    pipeline.start().unwrap();
    assert!(pipeline.fill().unwrap().frame.is_config());

    let consumer = {
        let pipeline = Arc::clone(&pipeline);
        std::thread::spawn(move || pipeline.fill().map(|_| ()))
    };
    std::thread::sleep(Duration::from_millis(100));
    pipeline.stop();

    let result = consumer.join().unwrap();
    assert!(matches!(result, Err(StreamError::Stopped)));
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert!(matches!(pipeline.start(), Err(SetupError::Pipeline(_))));
}

#[test]
fn test_slow_consumer_drops_frames_without_leaking_buffers() {
    let backend = Arc::new(SimulatedBackend::new(SimulatedConfig {
        frame_interval: Some(Duration::from_millis(1)),
        ..SimulatedConfig::default()
    }));
    let pipeline = CapturePipeline::setup(backend.clone(), CaptureConfig::default()).unwrap();
    pipeline.start().unwrap();

    // Nobody pulls, so every buffer ends up queued and the encoder starves
    std::thread::sleep(Duration::from_millis(200));
    let stats = pipeline.stats();
    assert_eq!(stats.queued_frames, stats.video_pool.capacity);
    assert_eq!(stats.video_pool.free, 0);
    assert!(backend.frames_dropped() > 0);

    // Sequence numbers keep increasing across the gap
    assert!(pipeline.fill().unwrap().frame.is_config());
    let mut last = None;
    for _ in 0..10 {
        let filled = pipeline.fill_timeout(FILL_TIMEOUT).unwrap().unwrap();
        let seq = SimulatedFrame::parse(&filled.frame.data).unwrap().seq;
        assert!(last.is_none_or(|last| seq > last));
        last = Some(seq);
    }

    pipeline.stop();
    assert_eq!(pipeline.stats().queued_frames, 0);
    assert_eq!(pipeline.stats().video_pool.violations, 0);
}

#[test]
fn test_shutdown_is_idempotent() {
    let backend = lossless_backend(3);
    let pipeline = CapturePipeline::setup(backend.clone(), CaptureConfig::default()).unwrap();
    pipeline.start().unwrap();
    pipeline.fill().unwrap();

    pipeline.shutdown().unwrap();
    pipeline.shutdown().unwrap();
    assert!(matches!(pipeline.fill(), Err(StreamError::Stopped)));
    drop(pipeline);

    assert!(backend.live_components().is_empty());
    assert_eq!(backend.live_connections(), 0);
}

#[test]
fn test_drop_tears_down() {
    let backend = lossless_backend(3);
    {
        let pipeline = CapturePipeline::setup(backend.clone(), CaptureConfig::default()).unwrap();
        pipeline.start().unwrap();
        pipeline.fill().unwrap();
    }
    assert!(backend.live_components().is_empty());
}
