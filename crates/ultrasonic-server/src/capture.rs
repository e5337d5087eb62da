use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use ultrasonic_core::config::AudioConfig;
use ultrasonic_core::registry::OsDeviceInfo;

/// Capture blocks buffered between the audio callback and the processor.
/// When the processor falls behind, whole blocks are dropped here and the
/// overrun counter ticks; this is the only tolerated data loss.
const BLOCK_QUEUE: usize = 8;
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("audio device {0:?} not found")]
    DeviceNotFound(String),
    #[error("audio device {0:?} is busy or unavailable")]
    DeviceBusy(String),
    #[error("device {device:?} does not support {rate} Hz capture")]
    UnsupportedRate { device: String, rate: u32 },
    #[error("audio stream failure on {device:?}: {message}")]
    Stream { device: String, message: String },
}

/// A running capture stream viewed as a sequence of mono f32 blocks.
pub trait BlockSource: Send {
    /// Next block, waiting at most `timeout`. `Ok(None)` means no block was
    /// ready yet; `Err` means the stream died and must be re-opened.
    fn next_block(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>, CaptureError>;

    /// Blocks dropped because the processor was not ready.
    fn overruns(&self) -> u64;
}

/// Opens capture streams for one device. The indirection keeps pipelines
/// testable without audio hardware.
pub trait SourceFactory: Send + Sync {
    fn open(&self, cfg: &AudioConfig) -> Result<Box<dyn BlockSource>, CaptureError>;
    fn device_name(&self) -> &str;
}

/// One enumeration pass over the host's input devices.
pub fn enumerate_inputs() -> anyhow::Result<Vec<OsDeviceInfo>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| anyhow::anyhow!("enumerate audio input devices: {e}"))?;

    let mut out = Vec::new();
    for (system_index, device) in devices.enumerate() {
        let name = match device.name() {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(system_index, error = %e, "skipping unnamed audio device");
                continue;
            }
        };
        let default = match device.default_input_config() {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(name = %name, error = %e, "device has no input config; skipping");
                continue;
            }
        };
        out.push(OsDeviceInfo {
            system_index,
            name,
            max_input_channels: default.channels(),
            default_sample_rate: default.sample_rate().0 as f64,
            is_input: true,
        });
    }
    Ok(out)
}

pub struct CpalSourceFactory {
    device_name: String,
}

impl CpalSourceFactory {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
        }
    }
}

impl SourceFactory for CpalSourceFactory {
    fn open(&self, cfg: &AudioConfig) -> Result<Box<dyn BlockSource>, CaptureError> {
        Ok(Box::new(CpalBlockSource::open(&self.device_name, cfg)?))
    }

    fn device_name(&self) -> &str {
        &self.device_name
    }
}

/// Takes channel 0 of the interleaved callback buffers and re-chunks it
/// into fixed-size blocks.
struct BlockChunker {
    channels: usize,
    block_size: usize,
    pending: Vec<f32>,
    tx: Sender<Vec<f32>>,
    overruns: Arc<AtomicU64>,
}

impl BlockChunker {
    fn new(
        channels: usize,
        block_size: usize,
        tx: Sender<Vec<f32>>,
        overruns: Arc<AtomicU64>,
    ) -> Self {
        Self {
            channels: channels.max(1),
            block_size,
            pending: Vec::with_capacity(block_size),
            tx,
            overruns,
        }
    }

    fn push_f32(&mut self, data: &[f32]) {
        for frame in data.chunks(self.channels) {
            if let Some(&s) = frame.first() {
                self.push_sample(s);
            }
        }
    }

    fn push_i16(&mut self, data: &[i16]) {
        for frame in data.chunks(self.channels) {
            if let Some(&s) = frame.first() {
                self.push_sample((s as f32) / 32_768.0);
            }
        }
    }

    fn push_u16(&mut self, data: &[u16]) {
        for frame in data.chunks(self.channels) {
            if let Some(&s) = frame.first() {
                self.push_sample((s as f32) / 32_768.0 - 1.0);
            }
        }
    }

    fn push_sample(&mut self, s: f32) {
        self.pending.push(s);
        if self.pending.len() == self.block_size {
            let block = std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_size));
            match self.tx.try_send(block) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.overruns.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}

/// Capture stream backed by a dedicated holder thread. cpal streams are not
/// `Send`, so the stream object lives and dies on that thread; everyone else
/// talks to it through channels.
pub struct CpalBlockSource {
    device_name: String,
    rx: Receiver<Vec<f32>>,
    err_rx: Receiver<CaptureError>,
    overruns: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    holder: Option<JoinHandle<()>>,
}

impl CpalBlockSource {
    fn open(device_name: &str, cfg: &AudioConfig) -> Result<Self, CaptureError> {
        let (block_tx, block_rx) = bounded::<Vec<f32>>(BLOCK_QUEUE);
        let (err_tx, err_rx) = bounded::<CaptureError>(1);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), CaptureError>>();
        let overruns = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let holder = std::thread::Builder::new()
            .name(format!("capture-{device_name}"))
            .spawn({
                let device_name = device_name.to_string();
                let cfg = *cfg;
                let overruns = overruns.clone();
                let stop = stop.clone();
                move || run_holder(device_name, cfg, block_tx, err_tx, overruns, stop, ready_tx)
            })
            .map_err(|e| CaptureError::Stream {
                device: device_name.to_string(),
                message: format!("spawn capture thread: {e}"),
            })?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => Ok(Self {
                device_name: device_name.to_string(),
                rx: block_rx,
                err_rx,
                overruns,
                stop,
                holder: Some(holder),
            }),
            Ok(Err(e)) => {
                let _ = holder.join();
                Err(e)
            }
            Err(_) => {
                stop.store(true, Ordering::Relaxed);
                Err(CaptureError::Stream {
                    device: device_name.to_string(),
                    message: "timed out opening capture stream".to_string(),
                })
            }
        }
    }
}

impl BlockSource for CpalBlockSource {
    fn next_block(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>, CaptureError> {
        if let Ok(e) = self.err_rx.try_recv() {
            return Err(e);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(block) => Ok(Some(block)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => match self.err_rx.try_recv() {
                Ok(e) => Err(e),
                Err(_) => Ok(None),
            },
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(CaptureError::Stream {
                device: self.device_name.clone(),
                message: "capture thread exited".to_string(),
            }),
        }
    }

    fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl Drop for CpalBlockSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(holder) = self.holder.take() {
            let _ = holder.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_holder(
    device_name: String,
    cfg: AudioConfig,
    block_tx: Sender<Vec<f32>>,
    err_tx: Sender<CaptureError>,
    overruns: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    ready_tx: std::sync::mpsc::Sender<Result<(), CaptureError>>,
) {
    let stream = match build_stream(&device_name, &cfg, block_tx, err_tx, overruns) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(10));
    }
    drop(stream);
}

fn build_stream(
    device_name: &str,
    cfg: &AudioConfig,
    block_tx: Sender<Vec<f32>>,
    err_tx: Sender<CaptureError>,
    overruns: Arc<AtomicU64>,
) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let mut devices = host.input_devices().map_err(|e| CaptureError::Stream {
        device: device_name.to_string(),
        message: format!("enumerate devices: {e}"),
    })?;
    let device = devices
        .find(|d| d.name().map(|n| n == device_name).unwrap_or(false))
        .ok_or_else(|| CaptureError::DeviceNotFound(device_name.to_string()))?;

    let default = device
        .default_input_config()
        .map_err(|e| CaptureError::Stream {
            device: device_name.to_string(),
            message: format!("query input config: {e}"),
        })?;
    let channels = default.channels();
    let stream_config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(cfg.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_cb = || {
        let err_tx = err_tx.clone();
        let device = device_name.to_string();
        move |err: cpal::StreamError| {
            let _ = err_tx.try_send(CaptureError::Stream {
                device: device.clone(),
                message: err.to_string(),
            });
        }
    };

    let chunker = || {
        BlockChunker::new(
            channels as usize,
            cfg.block_size,
            block_tx.clone(),
            overruns.clone(),
        )
    };

    let built = match default.sample_format() {
        cpal::SampleFormat::F32 => {
            let mut ch = chunker();
            device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| ch.push_f32(data),
                err_cb(),
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let mut ch = chunker();
            device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| ch.push_i16(data),
                err_cb(),
                None,
            )
        }
        cpal::SampleFormat::U16 => {
            let mut ch = chunker();
            device.build_input_stream(
                &stream_config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| ch.push_u16(data),
                err_cb(),
                None,
            )
        }
        other => {
            return Err(CaptureError::Stream {
                device: device_name.to_string(),
                message: format!("unsupported sample format {other:?}"),
            })
        }
    };

    let stream = built.map_err(|e| match e {
        cpal::BuildStreamError::StreamConfigNotSupported => CaptureError::UnsupportedRate {
            device: device_name.to_string(),
            rate: cfg.sample_rate,
        },
        cpal::BuildStreamError::DeviceNotAvailable => {
            CaptureError::DeviceBusy(device_name.to_string())
        }
        other => CaptureError::Stream {
            device: device_name.to_string(),
            message: other.to_string(),
        },
    })?;

    stream.play().map_err(|e| match e {
        cpal::PlayStreamError::DeviceNotAvailable => {
            CaptureError::DeviceBusy(device_name.to_string())
        }
        other => CaptureError::Stream {
            device: device_name.to_string(),
            message: other.to_string(),
        },
    })?;

    Ok(stream)
}
