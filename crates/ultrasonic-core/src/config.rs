use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Window function applied before the forward FFT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    #[default]
    Hann,
    Hamming,
    Blackman,
    Rectangular,
}

/// Parameters that shape the capture stream and the FFT. Changing any of
/// these tears down and re-opens the audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default)]
    pub window: WindowKind,
    #[serde(default)]
    pub overlap: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            fft_size: default_fft_size(),
            block_size: default_block_size(),
            window: WindowKind::default(),
            overlap: 0.0,
        }
    }
}

impl AudioConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.sample_rate > 0, "audio.sample_rate must be > 0 Hz");
        anyhow::ensure!(
            self.fft_size.is_power_of_two() && (256..=65_536).contains(&self.fft_size),
            "audio.fft_size must be a power of two within 256..=65536 (got {})",
            self.fft_size
        );
        anyhow::ensure!(self.block_size > 0, "audio.block_size must be > 0 samples");
        anyhow::ensure!(
            (0.0..=0.9).contains(&self.overlap),
            "audio.overlap must be within 0.0..=0.9 (got {})",
            self.overlap
        );
        Ok(())
    }

    pub fn bins_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Samples the analysis buffer advances per window.
    pub fn hop(&self) -> usize {
        (((self.fft_size as f32) * (1.0 - self.overlap)) as usize).max(1)
    }

    /// Wall-clock duration of one capture block.
    pub fn block_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.block_size as f64 / self.sample_rate as f64)
    }
}

/// Parameters that shape emission. All of these are hot: they apply to the
/// next frame without re-opening the audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    #[serde(default = "default_magnitude_threshold_db")]
    pub magnitude_threshold_db: f32,
    #[serde(default = "default_threshold_db")]
    pub threshold_db: f32,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_true")]
    pub enable_smart_skip: bool,
    #[serde(default = "default_true")]
    pub enable_adaptive_fps: bool,
    #[serde(default = "default_min_adaptive_fps")]
    pub min_adaptive_fps: u32,
    #[serde(default = "default_max_adaptive_fps")]
    pub max_adaptive_fps: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            compression_level: default_compression_level(),
            magnitude_threshold_db: default_magnitude_threshold_db(),
            threshold_db: default_threshold_db(),
            similarity_threshold: default_similarity_threshold(),
            enable_smart_skip: true,
            enable_adaptive_fps: true,
            min_adaptive_fps: default_min_adaptive_fps(),
            max_adaptive_fps: default_max_adaptive_fps(),
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=120).contains(&self.target_fps),
            "stream.target_fps must be within 1..=120 (got {})",
            self.target_fps
        );
        anyhow::ensure!(
            (1..=9).contains(&self.compression_level),
            "stream.compression_level must be within 1..=9 (got {})",
            self.compression_level
        );
        anyhow::ensure!(
            self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0,
            "stream.similarity_threshold must be within (0.0, 1.0] (got {})",
            self.similarity_threshold
        );
        anyhow::ensure!(
            self.min_adaptive_fps >= 1,
            "stream.min_adaptive_fps must be >= 1 (got {})",
            self.min_adaptive_fps
        );
        anyhow::ensure!(
            self.max_adaptive_fps <= 120 && self.max_adaptive_fps >= self.min_adaptive_fps,
            "stream.max_adaptive_fps must be within {}..=120 (got {})",
            self.min_adaptive_fps,
            self.max_adaptive_fps
        );
        Ok(())
    }
}

/// Sparse stream-config update as it arrives from the control surface.
/// Every field is hot-applicable.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfigUpdate {
    pub target_fps: Option<u32>,
    pub compression_level: Option<u32>,
    pub magnitude_threshold_db: Option<f32>,
    pub threshold_db: Option<f32>,
    pub similarity_threshold: Option<f32>,
    pub enable_smart_skip: Option<bool>,
    pub enable_adaptive_fps: Option<bool>,
    pub min_adaptive_fps: Option<u32>,
    pub max_adaptive_fps: Option<u32>,
}

impl StreamConfigUpdate {
    /// Merge into `cfg`, validating the result. On error `cfg` is untouched.
    pub fn apply(&self, cfg: &mut StreamConfig) -> anyhow::Result<()> {
        let mut next = *cfg;
        if let Some(v) = self.target_fps {
            next.target_fps = v;
        }
        if let Some(v) = self.compression_level {
            next.compression_level = v;
        }
        if let Some(v) = self.magnitude_threshold_db {
            next.magnitude_threshold_db = v;
        }
        if let Some(v) = self.threshold_db {
            next.threshold_db = v;
        }
        if let Some(v) = self.similarity_threshold {
            next.similarity_threshold = v;
        }
        if let Some(v) = self.enable_smart_skip {
            next.enable_smart_skip = v;
        }
        if let Some(v) = self.enable_adaptive_fps {
            next.enable_adaptive_fps = v;
        }
        if let Some(v) = self.min_adaptive_fps {
            next.min_adaptive_fps = v;
        }
        if let Some(v) = self.max_adaptive_fps {
            next.max_adaptive_fps = v;
        }
        next.validate()?;
        *cfg = next;
        Ok(())
    }
}

/// Sparse audio-config update. Applying one always requires the owning
/// pipeline to re-open its stream.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioConfigUpdate {
    pub sample_rate: Option<u32>,
    pub fft_size: Option<usize>,
    pub block_size: Option<usize>,
    pub window: Option<WindowKind>,
    pub overlap: Option<f32>,
}

impl AudioConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.sample_rate.is_none()
            && self.fft_size.is_none()
            && self.block_size.is_none()
            && self.window.is_none()
            && self.overlap.is_none()
    }

    pub fn apply(&self, cfg: &mut AudioConfig) -> anyhow::Result<()> {
        let mut next = *cfg;
        if let Some(v) = self.sample_rate {
            next.sample_rate = v;
        }
        if let Some(v) = self.fft_size {
            next.fft_size = v;
        }
        if let Some(v) = self.block_size {
            next.block_size = v;
        }
        if let Some(v) = self.window {
            next.window = v;
        }
        if let Some(v) = self.overlap {
            next.overlap = v;
        }
        next.validate()?;
        *cfg = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    /// Concurrent event-stream subscribers allowed per device.
    #[serde(default = "default_subscribers_per_device")]
    pub subscribers_per_device: usize,
    /// Frames buffered per subscriber before drop-oldest kicks in.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            subscribers_per_device: default_subscribers_per_device(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

/// Whole-service configuration threaded into manager construction.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: Server,
    /// Ordered preferred-name substrings used to pick the default device.
    #[serde(default)]
    pub device_names: Vec<String>,
    /// Directory holding the persisted device registry.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub limits: Limits,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: Server::default(),
            device_names: Vec::new(),
            data_dir: default_data_dir(),
            audio: AudioConfig::default(),
            stream: StreamConfig::default(),
            limits: Limits::default(),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.audio.validate()?;
        self.stream.validate()?;
        anyhow::ensure!(
            self.limits.subscriber_queue >= 1,
            "limits.subscriber_queue must be >= 1"
        );
        anyhow::ensure!(
            self.limits.subscribers_per_device >= 1,
            "limits.subscribers_per_device must be >= 1"
        );
        Ok(())
    }

    pub fn registry_path(&self) -> std::path::PathBuf {
        Path::new(&self.data_dir).join("device_mapping.json")
    }
}

pub fn load_from_file(config_json: &Path) -> anyhow::Result<ServiceConfig> {
    let raw = std::fs::read_to_string(config_json)
        .with_context(|| format!("read {}", config_json.display()))?;
    let cfg: ServiceConfig =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", config_json.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

fn default_sample_rate() -> u32 {
    384_000
}
fn default_fft_size() -> usize {
    8192
}
fn default_block_size() -> usize {
    4096
}
fn default_target_fps() -> u32 {
    30
}
fn default_compression_level() -> u32 {
    6
}
fn default_magnitude_threshold_db() -> f32 {
    -80.0
}
fn default_threshold_db() -> f32 {
    -100.0
}
fn default_similarity_threshold() -> f32 {
    0.95
}
fn default_true() -> bool {
    true
}
fn default_min_adaptive_fps() -> u32 {
    5
}
fn default_max_adaptive_fps() -> u32 {
    60
}
fn default_port() -> u16 {
    8380
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_data_dir() -> String {
    ".".to_string()
}
fn default_subscribers_per_device() -> usize {
    64
}
fn default_subscriber_queue() -> usize {
    4
}
