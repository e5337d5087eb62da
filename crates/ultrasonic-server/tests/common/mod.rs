// Shared fixtures; not every test crate exercises every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ultrasonic_core::config::AudioConfig;
use ultrasonic_core::registry::OsDeviceInfo;
use ultrasonic_server::capture::{BlockSource, CaptureError, SourceFactory};
use ultrasonic_server::manager::DevicePlatform;

/// What the next `open()` on a `MockFactory` hands out.
#[derive(Debug, Clone, Copy)]
pub enum SourcePlan {
    /// Serve blocks until dropped.
    Steady,
    /// Serve this many blocks, then fail the stream once.
    FailAfter(usize),
    /// Refuse to open.
    OpenError,
}

/// Deterministic stand-in for a capture device: a continuous sine tone (or
/// silence at amplitude 0), scripted failures included.
pub struct MockFactory {
    device_name: String,
    amplitude: f32,
    tone_hz: f32,
    plan: Mutex<VecDeque<SourcePlan>>,
}

impl MockFactory {
    pub fn steady(device_name: &str, amplitude: f32) -> Self {
        Self::scripted(device_name, amplitude, Vec::new())
    }

    pub fn scripted(device_name: &str, amplitude: f32, plan: Vec<SourcePlan>) -> Self {
        Self {
            device_name: device_name.to_string(),
            amplitude,
            tone_hz: 10_000.0,
            plan: Mutex::new(plan.into()),
        }
    }
}

impl SourceFactory for MockFactory {
    fn open(&self, cfg: &AudioConfig) -> Result<Box<dyn BlockSource>, CaptureError> {
        let plan = self
            .plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SourcePlan::Steady);
        match plan {
            SourcePlan::OpenError => Err(CaptureError::DeviceBusy(self.device_name.clone())),
            SourcePlan::Steady => Ok(Box::new(MockSource::new(
                &self.device_name,
                cfg,
                self.amplitude,
                self.tone_hz,
                None,
            ))),
            SourcePlan::FailAfter(blocks) => Ok(Box::new(MockSource::new(
                &self.device_name,
                cfg,
                self.amplitude,
                self.tone_hz,
                Some(blocks),
            ))),
        }
    }

    fn device_name(&self) -> &str {
        &self.device_name
    }
}

pub struct MockSource {
    device_name: String,
    sample_rate: f32,
    block_size: usize,
    amplitude: f32,
    tone_hz: f32,
    phase: f32,
    served: usize,
    fail_after: Option<usize>,
}

impl MockSource {
    fn new(
        device_name: &str,
        cfg: &AudioConfig,
        amplitude: f32,
        tone_hz: f32,
        fail_after: Option<usize>,
    ) -> Self {
        Self {
            device_name: device_name.to_string(),
            sample_rate: cfg.sample_rate as f32,
            block_size: cfg.block_size,
            amplitude,
            tone_hz,
            phase: 0.0,
            served: 0,
            fail_after,
        }
    }
}

impl BlockSource for MockSource {
    fn next_block(&mut self, _timeout: Duration) -> Result<Option<Vec<f32>>, CaptureError> {
        if let Some(limit) = self.fail_after {
            if self.served >= limit {
                return Err(CaptureError::Stream {
                    device: self.device_name.clone(),
                    message: "injected transient failure".to_string(),
                });
            }
        }
        self.served += 1;
        // Keep the worker loop from spinning flat out.
        std::thread::sleep(Duration::from_millis(1));

        let step = 2.0 * std::f32::consts::PI * self.tone_hz / self.sample_rate;
        let block = (0..self.block_size)
            .map(|_| {
                let s = self.amplitude * self.phase.sin();
                self.phase = (self.phase + step) % (2.0 * std::f32::consts::PI);
                s
            })
            .collect();
        Ok(Some(block))
    }

    fn overruns(&self) -> u64 {
        0
    }
}

/// A host with a configurable set of input devices, all backed by steady
/// mock tone sources.
pub struct MockPlatform {
    pub devices: Mutex<Vec<OsDeviceInfo>>,
    pub amplitude: f32,
}

impl MockPlatform {
    pub fn with_devices(names: &[&str]) -> Self {
        Self {
            devices: Mutex::new(
                names
                    .iter()
                    .enumerate()
                    .map(|(system_index, name)| OsDeviceInfo {
                        system_index,
                        name: name.to_string(),
                        max_input_channels: 1,
                        default_sample_rate: 48_000.0,
                        is_input: true,
                    })
                    .collect(),
            ),
            amplitude: 0.5,
        }
    }

    pub fn set_devices(&self, names: &[&str]) {
        *self.devices.lock().unwrap() = names
            .iter()
            .enumerate()
            .map(|(system_index, name)| OsDeviceInfo {
                system_index,
                name: name.to_string(),
                max_input_channels: 1,
                default_sample_rate: 48_000.0,
                is_input: true,
            })
            .collect();
    }
}

impl DevicePlatform for MockPlatform {
    fn enumerate(&self) -> anyhow::Result<Vec<OsDeviceInfo>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn source_factory(&self, device_name: &str) -> Arc<dyn SourceFactory> {
        Arc::new(MockFactory::steady(device_name, self.amplitude))
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
