mod common;

use common::{wait_for, MockPlatform};
use std::sync::Arc;
use std::time::Duration;
use ultrasonic_core::config::{AudioConfig, ServiceConfig, WindowKind};
use ultrasonic_core::registry::stable_device_id;
use ultrasonic_server::manager::{DeviceManager, DevicePlatform, ManagerError};
use ultrasonic_server::pipeline::PipelineState;

fn test_config(data_dir: &std::path::Path) -> ServiceConfig {
    ServiceConfig {
        data_dir: data_dir.to_string_lossy().into_owned(),
        audio: AudioConfig {
            sample_rate: 48_000,
            fft_size: 1024,
            block_size: 512,
            window: WindowKind::Hann,
            overlap: 0.0,
        },
        ..ServiceConfig::default()
    }
}

fn manager_with(names: &[&str], data_dir: &std::path::Path) -> (DeviceManager, Arc<MockPlatform>) {
    let platform = Arc::new(MockPlatform::with_devices(names));
    let manager = DeviceManager::new(
        test_config(data_dir),
        platform.clone() as Arc<dyn DevicePlatform>,
    );
    (manager, platform)
}

fn id_for(name: &str) -> String {
    stable_device_id(name, 1, 48_000.0)
}

#[test]
fn refresh_assigns_stable_ids_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = manager_with(&["UltraMic 384K", "Builtin Mic"], dir.path());

    let devices = manager.refresh_devices().unwrap();
    assert_eq!(devices.len(), 2);
    assert!(devices.iter().any(|d| d.stable_id == id_for("UltraMic 384K")));
    assert!(dir.path().join("device_mapping.json").exists());

    let views = manager.list_devices();
    assert_eq!(views.len(), 2);
    assert!(views.iter().all(|v| v.state == PipelineState::Stopped));
}

#[test]
fn operations_on_unknown_devices_are_typed_errors() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = manager_with(&["UltraMic 384K"], dir.path());
    manager.refresh_devices().unwrap();

    let err = manager.start("nosuch_device00").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ManagerError>(),
        Some(ManagerError::UnknownDevice(_))
    ));
    assert!(manager.status("nosuch_device00").is_err());
    assert!(manager.stop("nosuch_device00").is_err());
}

#[test]
fn pipelines_are_created_lazily_and_report_status() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = manager_with(&["UltraMic 384K"], dir.path());
    manager.refresh_devices().unwrap();
    let id = id_for("UltraMic 384K");

    // Known device, no pipeline yet: idle status, native sample rate.
    let idle = manager.status(&id).unwrap();
    assert_eq!(idle.state, PipelineState::Stopped);
    assert_eq!(idle.audio.sample_rate, 48_000);
    assert_eq!(idle.subscriber_count, 0);

    manager.start(&id).unwrap();
    assert_eq!(manager.status(&id).unwrap().state, PipelineState::Running);
    assert_eq!(manager.system_status().running_count, 1);

    manager.stop_all();
    assert_eq!(manager.status(&id).unwrap().state, PipelineState::Stopped);
    assert_eq!(manager.system_status().running_count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribing_rides_through_manager_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = manager_with(&["UltraMic 384K"], dir.path());
    manager.refresh_devices().unwrap();
    let id = id_for("UltraMic 384K");

    manager.start(&id).unwrap();
    let (_pipeline, mut subscription) = manager.subscribe(&id).unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .unwrap()
        .unwrap();

    manager.restart(&id).unwrap();
    let after = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .unwrap()
        .unwrap();
    assert!(after.sequence_id > first.sequence_id);
    manager.stop_all();
}

#[test]
fn remove_requires_a_stopped_pipeline_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = manager_with(&["UltraMic 384K"], dir.path());
    manager.refresh_devices().unwrap();
    let id = id_for("UltraMic 384K");
    manager.start(&id).unwrap();

    let err = manager.remove(&id, false).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ManagerError>(),
        Some(ManagerError::NotStopped(_))
    ));

    manager.remove(&id, true).unwrap();
    // The descriptor survives; only the pipeline object is gone.
    assert_eq!(manager.status(&id).unwrap().state, PipelineState::Stopped);
}

#[test]
fn batch_operations_report_per_device_results() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _) = manager_with(&["UltraMic 384K", "Builtin Mic"], dir.path());
    manager.refresh_devices().unwrap();

    let ids = vec![
        id_for("UltraMic 384K"),
        "bogus_id0000".to_string(),
        id_for("Builtin Mic"),
    ];
    let results = manager.batch_start(&ids);
    assert_eq!(results.len(), 3);
    assert!(results[0].ok);
    assert!(!results[1].ok);
    assert!(results[1].error.as_deref().unwrap_or("").contains("bogus_id0000"));
    assert!(results[2].ok);
    assert_eq!(manager.system_status().running_count, 2);

    let results = manager.batch_stop(&ids);
    assert!(results[0].ok && results[2].ok);
    assert!(!results[1].ok);
    assert_eq!(manager.system_status().running_count, 0);
}

#[test]
fn cleanup_spares_devices_owned_by_running_pipelines() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, platform) = manager_with(&["UltraMic 384K", "Flaky Mic"], dir.path());
    manager.refresh_devices().unwrap();
    let kept = id_for("UltraMic 384K");
    let gone = id_for("Flaky Mic");
    manager.start(&kept).unwrap();

    // Flaky Mic unplugs and stays gone for five scans.
    platform.set_devices(&["UltraMic 384K"]);
    for _ in 0..5 {
        manager.refresh_devices().unwrap();
    }

    assert_eq!(manager.cleanup(), 1);
    assert!(manager.status(&gone).is_err());
    assert_eq!(manager.status(&kept).unwrap().state, PipelineState::Running);
    manager.stop_all();
}

#[test]
fn default_pipeline_prefers_the_configured_device_names() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::with_devices(&[
        "Builtin Mic",
        "UltraMic 384K BLE",
    ]));
    let mut cfg = test_config(dir.path());
    cfg.device_names = vec!["UltraMic".to_string()];
    let manager = DeviceManager::new(cfg, platform as Arc<dyn DevicePlatform>);
    manager.refresh_devices().unwrap();

    let pipeline = manager.default_pipeline().unwrap();
    assert_eq!(pipeline.device_name(), "UltraMic 384K BLE");

    // Once something is running, that pipeline wins regardless of name.
    let builtin = id_for("Builtin Mic");
    manager.start(&builtin).unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        manager.default_pipeline().map(|p| p.device_name().to_string()).ok()
            == Some("Builtin Mic".to_string())
    }));
    manager.stop_all();
}

#[test]
fn registry_reload_preserves_ids_across_manager_instances() {
    let dir = tempfile::tempdir().unwrap();
    let first_ids: Vec<String> = {
        let (manager, _) = manager_with(&["UltraMic 384K"], dir.path());
        manager
            .refresh_devices()
            .unwrap()
            .into_iter()
            .map(|d| d.stable_id)
            .collect()
    };

    let (manager, _) = manager_with(&["UltraMic 384K"], dir.path());
    // Before any refresh, the persisted registry is authoritative.
    let known: Vec<String> = manager
        .list_devices()
        .into_iter()
        .map(|v| v.descriptor.stable_id)
        .collect();
    assert_eq!(first_ids, known);
}
