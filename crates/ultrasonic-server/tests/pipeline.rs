mod common;

use common::{wait_for, MockFactory, SourcePlan};
use std::sync::Arc;
use std::time::Duration;
use ultrasonic_core::config::{AudioConfig, AudioConfigUpdate, StreamConfig, StreamConfigUpdate, WindowKind};
use ultrasonic_core::frame::decode_magnitudes;
use ultrasonic_server::capture::CaptureError;
use ultrasonic_server::pipeline::{DevicePipeline, PipelineState};

fn test_audio() -> AudioConfig {
    AudioConfig {
        sample_rate: 48_000,
        fft_size: 1024,
        block_size: 512,
        window: WindowKind::Hann,
        overlap: 0.0,
    }
}

fn test_stream() -> StreamConfig {
    StreamConfig {
        target_fps: 120,
        magnitude_threshold_db: -200.0,
        enable_smart_skip: false,
        enable_adaptive_fps: false,
        ..StreamConfig::default()
    }
}

fn tone_pipeline(factory: MockFactory) -> DevicePipeline {
    DevicePipeline::new(
        "mockmic_abc123",
        "Mock Mic",
        Arc::new(factory),
        test_audio(),
        test_stream(),
        4,
    )
}

#[test]
fn start_and_stop_are_idempotent() {
    let pipeline = tone_pipeline(MockFactory::steady("Mock Mic", 0.5));

    assert_eq!(pipeline.state(), PipelineState::Stopped);
    pipeline.start().unwrap();
    pipeline.start().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);

    pipeline.stop();
    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert_eq!(pipeline.status().uptime_ms, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn emitted_frames_have_increasing_sequence_ids_and_decode() {
    let pipeline = tone_pipeline(MockFactory::steady("Mock Mic", 0.5));
    pipeline.start().unwrap();
    let mut subscription = pipeline.subscribe();

    let mut last_seq = 0u64;
    for _ in 0..5 {
        let frame = tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("hub closed");
        assert!(frame.sequence_id > last_seq);
        last_seq = frame.sequence_id;
        assert_eq!(frame.bins_count, 512);
        assert_eq!(frame.sample_rate, 48_000);
        let magnitudes = decode_magnitudes(&frame).unwrap();
        assert_eq!(magnitudes.len(), 512);
    }

    let status = pipeline.status();
    assert!(status.total_frames >= 5);
    assert!(status.frames_analyzed >= status.total_frames);
    pipeline.stop();
}

#[test]
fn silence_is_gated_before_the_wire() {
    let pipeline = DevicePipeline::new(
        "quietmic_000000",
        "Quiet Mic",
        Arc::new(MockFactory::steady("Quiet Mic", 0.0)),
        test_audio(),
        StreamConfig {
            magnitude_threshold_db: -80.0,
            enable_adaptive_fps: false,
            ..StreamConfig::default()
        },
        4,
    );
    pipeline.start().unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        pipeline.status().frames_analyzed >= 10
    }));
    let status = pipeline.status();
    assert_eq!(status.total_frames, 0, "silent frames must not be emitted");
    assert!(status.skipped_magnitude >= 10);
    assert_eq!(status.observed_fps, 0.0);
    pipeline.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_source_failure_triggers_auto_restart() {
    let pipeline = tone_pipeline(MockFactory::scripted(
        "Mock Mic",
        0.5,
        vec![SourcePlan::FailAfter(30), SourcePlan::Steady],
    ));
    pipeline.start().unwrap();
    let mut subscription = pipeline.subscribe();

    assert!(
        wait_for(Duration::from_secs(5), || pipeline.status().restart_count == 1),
        "pipeline never recovered: {:?}",
        pipeline.status().last_error
    );
    let status = pipeline.status();
    assert_eq!(status.state, PipelineState::Running);
    assert_eq!(status.last_error, None, "recovery must clear last_error");

    // Frames keep flowing after the gap, still in order.
    let a = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .unwrap()
        .unwrap();
    let b = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .unwrap()
        .unwrap();
    assert!(b.sequence_id > a.sequence_id);
    pipeline.stop();
}

#[test]
fn exhausted_reopen_attempts_stop_the_pipeline() {
    let pipeline = tone_pipeline(MockFactory::scripted(
        "Mock Mic",
        0.5,
        vec![
            SourcePlan::FailAfter(5),
            SourcePlan::OpenError,
            SourcePlan::OpenError,
            SourcePlan::OpenError,
        ],
    ));
    pipeline.start().unwrap();

    // Backoffs sum to 2.6 s before the pipeline gives up.
    assert!(wait_for(Duration::from_secs(10), || {
        pipeline.state() == PipelineState::Stopped
    }));
    let status = pipeline.status();
    assert!(status.last_error.is_some());
    assert_eq!(status.restart_count, 0);
}

#[test]
fn failing_open_surfaces_a_typed_error_from_start() {
    let pipeline = tone_pipeline(MockFactory::scripted(
        "Mock Mic",
        0.5,
        vec![SourcePlan::OpenError],
    ));
    let err = pipeline.start().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CaptureError>(),
        Some(CaptureError::DeviceBusy(_))
    ));
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert!(pipeline.status().last_error.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn audio_update_restarts_and_keeps_subscribers() {
    let pipeline = tone_pipeline(MockFactory::steady("Mock Mic", 0.5));
    pipeline.start().unwrap();
    let mut subscription = pipeline.subscribe();

    // Drain one frame at the original FFT size.
    let before = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(before.bins_count, 512);

    let applied = pipeline
        .update_audio(&AudioConfigUpdate {
            fft_size: Some(2048),
            ..AudioConfigUpdate::default()
        })
        .unwrap();
    assert_eq!(applied.fft_size, 2048);
    assert_eq!(pipeline.state(), PipelineState::Running);

    // Same subscription, new frame geometry.
    let after = loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .unwrap()
            .unwrap();
        if frame.bins_count == 1024 {
            break frame;
        }
    };
    assert!(after.sequence_id > before.sequence_id);
    pipeline.stop();
}

#[test]
fn invalid_audio_update_leaves_a_running_pipeline_alone() {
    let pipeline = tone_pipeline(MockFactory::steady("Mock Mic", 0.5));
    pipeline.start().unwrap();

    let err = pipeline
        .update_audio(&AudioConfigUpdate {
            fft_size: Some(1000),
            ..AudioConfigUpdate::default()
        })
        .unwrap_err();
    assert!(err.to_string().contains("fft_size"));
    assert_eq!(pipeline.state(), PipelineState::Running);
    assert_eq!(pipeline.audio_snapshot().fft_size, 1024);
    pipeline.stop();
}

#[test]
fn stream_updates_apply_hot() {
    let pipeline = tone_pipeline(MockFactory::steady("Mock Mic", 0.5));
    pipeline.start().unwrap();

    let err = pipeline
        .update_stream(&StreamConfigUpdate {
            target_fps: Some(0),
            ..StreamConfigUpdate::default()
        })
        .unwrap_err();
    assert!(err.to_string().contains("target_fps"));

    let applied = pipeline
        .update_stream(&StreamConfigUpdate {
            target_fps: Some(15),
            similarity_threshold: Some(0.9),
            ..StreamConfigUpdate::default()
        })
        .unwrap();
    assert_eq!(applied.target_fps, 15);
    assert_eq!(pipeline.state(), PipelineState::Running, "hot update must not restart");
    assert_eq!(pipeline.stream_config().target_fps, 15);
    pipeline.stop();
}
