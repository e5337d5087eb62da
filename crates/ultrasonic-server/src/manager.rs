use crate::capture::{self, CpalSourceFactory, SourceFactory};
use crate::perf::CpuSampler;
use crate::pipeline::{DevicePipeline, PipelineState, PipelineStatus};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use ultrasonic_core::broadcast::Subscription;
use ultrasonic_core::config::{
    AudioConfig, AudioConfigUpdate, ServiceConfig, StreamConfig, StreamConfigUpdate,
};
use ultrasonic_core::registry::{DeviceDescriptor, DeviceRegistry, OsDeviceInfo};
use ultrasonic_core::util;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown device {0:?}")]
    UnknownDevice(String),
    #[error("pipeline {0} is running; stop it first or pass force=true")]
    NotStopped(String),
    #[error("no capture devices available")]
    NoDevices,
}

/// The host-OS audio capability as the manager sees it: list devices, open a
/// stream by name. Swappable so the supervisor logic is testable without
/// hardware.
pub trait DevicePlatform: Send + Sync {
    fn enumerate(&self) -> anyhow::Result<Vec<OsDeviceInfo>>;
    fn source_factory(&self, device_name: &str) -> Arc<dyn SourceFactory>;
}

pub struct CpalPlatform;

impl DevicePlatform for CpalPlatform {
    fn enumerate(&self) -> anyhow::Result<Vec<OsDeviceInfo>> {
        capture::enumerate_inputs()
    }

    fn source_factory(&self, device_name: &str) -> Arc<dyn SourceFactory> {
        Arc::new(CpalSourceFactory::new(device_name))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub running_count: usize,
    pub total_count: usize,
    pub subscriber_count: usize,
    pub cpu_pct: f32,
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub descriptor: DeviceDescriptor,
    pub state: PipelineState,
    pub subscriber_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub stable_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Process-wide supervisor: owns the device registry and one pipeline per
/// stable device ID. The pipeline map is only ever locked for map mutation;
/// pipeline I/O happens outside it.
pub struct DeviceManager {
    cfg: ServiceConfig,
    platform: Arc<dyn DevicePlatform>,
    registry: Mutex<DeviceRegistry>,
    pipelines: DashMap<String, Arc<DevicePipeline>>,
    cpu: Mutex<CpuSampler>,
    started_at: Instant,
}

impl DeviceManager {
    pub fn new(cfg: ServiceConfig, platform: Arc<dyn DevicePlatform>) -> Self {
        let registry = DeviceRegistry::load(cfg.registry_path());
        Self {
            cfg,
            platform,
            registry: Mutex::new(registry),
            pipelines: DashMap::new(),
            cpu: Mutex::new(CpuSampler::new()),
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.cfg
    }

    fn lock_registry(&self) -> MutexGuard<'_, DeviceRegistry> {
        match self.registry.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Re-enumerate the OS devices, merge into the registry and persist it.
    pub fn refresh_devices(&self) -> anyhow::Result<Vec<DeviceDescriptor>> {
        let snapshot = self.platform.enumerate()?;
        let mut registry = self.lock_registry();
        let devices = registry.enumerate(&snapshot, util::now_ms());
        if let Err(e) = registry.persist() {
            tracing::warn!(error = %e, "failed to persist device registry");
        }
        Ok(devices)
    }

    pub fn list_devices(&self) -> Vec<DeviceView> {
        self.lock_registry()
            .devices()
            .into_iter()
            .map(|descriptor| {
                let (state, subscriber_count) = self
                    .pipelines
                    .get(&descriptor.stable_id)
                    .map(|p| (p.state(), p.subscriber_count()))
                    .unwrap_or((PipelineState::Stopped, 0));
                DeviceView {
                    descriptor,
                    state,
                    subscriber_count,
                }
            })
            .collect()
    }

    fn resolve(&self, stable_id: &str) -> Result<DeviceDescriptor, ManagerError> {
        self.lock_registry()
            .resolve(stable_id)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownDevice(stable_id.to_string()))
    }

    /// The audio config a fresh pipeline starts with: service-wide settings
    /// on top of the descriptor's native sample rate.
    fn audio_for(&self, descriptor: &DeviceDescriptor) -> AudioConfig {
        AudioConfig {
            sample_rate: descriptor.default_sample_rate as u32,
            ..self.cfg.audio
        }
    }

    /// Get or lazily create the pipeline for a known device.
    pub fn pipeline(&self, stable_id: &str) -> anyhow::Result<Arc<DevicePipeline>> {
        if let Some(p) = self.pipelines.get(stable_id) {
            return Ok(p.clone());
        }
        let descriptor = self.resolve(stable_id)?;
        let pipeline = self
            .pipelines
            .entry(descriptor.stable_id.clone())
            .or_insert_with(|| {
                Arc::new(DevicePipeline::new(
                    descriptor.stable_id.clone(),
                    descriptor.name.clone(),
                    self.platform.source_factory(&descriptor.name),
                    self.audio_for(&descriptor),
                    self.cfg.stream,
                    self.cfg.limits.subscriber_queue,
                ))
            })
            .clone();
        Ok(pipeline)
    }

    pub fn start(&self, stable_id: &str) -> anyhow::Result<()> {
        self.pipeline(stable_id)?.start()
    }

    pub fn stop(&self, stable_id: &str) -> anyhow::Result<()> {
        match self.pipelines.get(stable_id) {
            Some(p) => {
                p.stop();
                Ok(())
            }
            // Stopping a device that never started is a no-op, but the ID
            // still has to exist.
            None => self.resolve(stable_id).map(|_| ()).map_err(Into::into),
        }
    }

    pub fn restart(&self, stable_id: &str) -> anyhow::Result<()> {
        self.pipeline(stable_id)?.restart()
    }

    /// Drop the pipeline object. Requires it stopped unless `force`.
    pub fn remove(&self, stable_id: &str, force: bool) -> anyhow::Result<()> {
        let Some(p) = self.pipelines.get(stable_id).map(|p| p.clone()) else {
            return self.resolve(stable_id).map(|_| ()).map_err(Into::into);
        };
        if p.state() != PipelineState::Stopped {
            if !force {
                return Err(ManagerError::NotStopped(stable_id.to_string()).into());
            }
            p.stop();
        }
        self.pipelines.remove(stable_id);
        tracing::info!(stable_id, "pipeline removed");
        Ok(())
    }

    pub fn status(&self, stable_id: &str) -> anyhow::Result<PipelineStatus> {
        if let Some(p) = self.pipelines.get(stable_id) {
            return Ok(p.status());
        }
        // Known device without a pipeline yet: report it idle.
        let descriptor = self.resolve(stable_id)?;
        Ok(PipelineStatus {
            stable_id: descriptor.stable_id.clone(),
            device_name: descriptor.name.clone(),
            state: PipelineState::Stopped,
            audio: self.audio_for(&descriptor),
            stream: self.cfg.stream,
            observed_fps: 0.0,
            effective_fps: 0.0,
            total_frames: 0,
            frames_analyzed: 0,
            skipped_magnitude: 0,
            skipped_similarity: 0,
            skipped_pacing: 0,
            total_dropped: 0,
            overruns: 0,
            restart_count: 0,
            last_error: None,
            uptime_ms: 0,
            subscriber_count: 0,
        })
    }

    pub fn subscribe(&self, stable_id: &str) -> anyhow::Result<(Arc<DevicePipeline>, Subscription)> {
        let pipeline = self.pipeline(stable_id)?;
        let subscription = pipeline.subscribe();
        Ok((pipeline, subscription))
    }

    pub fn update_stream(
        &self,
        stable_id: &str,
        update: &StreamConfigUpdate,
    ) -> anyhow::Result<StreamConfig> {
        self.pipeline(stable_id)?.update_stream(update)
    }

    pub fn update_audio(
        &self,
        stable_id: &str,
        update: &AudioConfigUpdate,
    ) -> anyhow::Result<AudioConfig> {
        self.pipeline(stable_id)?.update_audio(update)
    }

    pub fn stop_all(&self) {
        let pipelines: Vec<Arc<DevicePipeline>> =
            self.pipelines.iter().map(|p| p.clone()).collect();
        for p in pipelines {
            p.stop();
        }
    }

    /// Forget devices gone for several scans, keeping anything a running
    /// pipeline still owns.
    pub fn cleanup(&self) -> usize {
        let protected: HashSet<String> = self
            .pipelines
            .iter()
            .filter(|p| p.state() != PipelineState::Stopped)
            .map(|p| p.stable_id().to_string())
            .collect();
        let mut registry = self.lock_registry();
        let removed = registry.cleanup(&protected);
        if removed > 0 {
            if let Err(e) = registry.persist() {
                tracing::warn!(error = %e, "failed to persist device registry after cleanup");
            }
        }
        removed
    }

    pub fn batch_start(&self, ids: &[String]) -> Vec<BatchResult> {
        ids.iter()
            .map(|id| match self.start(id) {
                Ok(()) => BatchResult {
                    stable_id: id.clone(),
                    ok: true,
                    error: None,
                },
                Err(e) => BatchResult {
                    stable_id: id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                },
            })
            .collect()
    }

    pub fn batch_stop(&self, ids: &[String]) -> Vec<BatchResult> {
        ids.iter()
            .map(|id| match self.stop(id) {
                Ok(()) => BatchResult {
                    stable_id: id.clone(),
                    ok: true,
                    error: None,
                },
                Err(e) => BatchResult {
                    stable_id: id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                },
            })
            .collect()
    }

    pub fn system_status(&self) -> SystemStatus {
        let running_count = self
            .pipelines
            .iter()
            .filter(|p| p.is_running())
            .count();
        let subscriber_count = self.pipelines.iter().map(|p| p.subscriber_count()).sum();
        let cpu_pct = match self.cpu.lock() {
            Ok(mut sampler) => sampler.sample(),
            Err(poisoned) => poisoned.into_inner().sample(),
        };
        SystemStatus {
            version: crate::build_info::version(),
            running_count,
            total_count: self.lock_registry().len(),
            subscriber_count,
            cpu_pct,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }

    /// Per-pipeline counters for the performance surface.
    pub fn performance(&self) -> Vec<PipelineStatus> {
        self.pipelines.iter().map(|p| p.status()).collect()
    }

    pub fn persist_registry(&self) -> anyhow::Result<()> {
        self.lock_registry().persist()
    }

    /// The single-stream surface: the first running pipeline, else a
    /// pipeline for the preferred (or first) input device.
    pub fn default_pipeline(&self) -> anyhow::Result<Arc<DevicePipeline>> {
        if let Some(p) = self
            .pipelines
            .iter()
            .find(|p| p.is_running())
            .map(|p| p.clone())
        {
            return Ok(p);
        }

        let devices = self.lock_registry().devices();
        let preferred = self
            .cfg
            .device_names
            .iter()
            .find_map(|needle| {
                devices
                    .iter()
                    .find(|d| d.is_input && d.name.contains(needle.as_str()))
            })
            .or_else(|| devices.iter().find(|d| d.is_input))
            .ok_or(ManagerError::NoDevices)?;
        self.pipeline(&preferred.stable_id)
    }
}
