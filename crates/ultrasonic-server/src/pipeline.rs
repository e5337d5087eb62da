use crate::capture::SourceFactory;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use ultrasonic_core::broadcast::{Broadcaster, Subscription};
use ultrasonic_core::config::{AudioConfig, AudioConfigUpdate, StreamConfig, StreamConfigUpdate};
use ultrasonic_core::dsp::spectrum::FftProcessor;
use ultrasonic_core::frame;
use ultrasonic_core::throttle::{StreamThrottler, Verdict};
use ultrasonic_core::util;

const MAX_REOPEN_ATTEMPTS: u32 = 3;
const REOPEN_BACKOFF: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
];
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub stable_id: String,
    pub device_name: String,
    pub state: PipelineState,
    pub audio: AudioConfig,
    pub stream: StreamConfig,
    pub observed_fps: f32,
    pub effective_fps: f32,
    /// Frames actually emitted to the fan-out hub.
    pub total_frames: u64,
    /// Frames the FFT stage produced, before throttling.
    pub frames_analyzed: u64,
    pub skipped_magnitude: u64,
    pub skipped_similarity: u64,
    pub skipped_pacing: u64,
    /// Frames lost to slow subscribers, summed over all of them.
    pub total_dropped: u64,
    pub overruns: u64,
    pub restart_count: u64,
    pub last_error: Option<String>,
    pub uptime_ms: u64,
    pub subscriber_count: usize,
}

#[derive(Default)]
struct Counters {
    sequence: AtomicU64,
    frames_analyzed: AtomicU64,
    skipped_magnitude: AtomicU64,
    skipped_similarity: AtomicU64,
    skipped_pacing: AtomicU64,
    overruns: AtomicU64,
    restarts: AtomicU64,
    observed_fps_milli: AtomicU64,
    effective_fps_milli: AtomicU64,
}

struct Inner {
    state: PipelineState,
    stop: Option<Arc<AtomicBool>>,
    worker: Option<JoinHandle<()>>,
    last_error: Option<String>,
    started_at: Option<Instant>,
}

struct Shared {
    stable_id: String,
    stream: RwLock<StreamConfig>,
    counters: Counters,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn stream_snapshot(&self) -> StreamConfig {
        match self.stream.read() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// One capture device's DSP and streaming pipeline: audio source, windowed
/// FFT, throttler, wire encoder and fan-out hub, supervised as a unit.
///
/// The hub outlives start/stop cycles, so subscribers ride through restarts
/// and only observe a gap in sequence numbers.
pub struct DevicePipeline {
    device_name: String,
    factory: Arc<dyn SourceFactory>,
    audio: RwLock<AudioConfig>,
    broadcaster: Arc<Broadcaster>,
    shared: Arc<Shared>,
    /// Serializes start/stop/restart/reconfigure against each other.
    op: Mutex<()>,
}

impl DevicePipeline {
    pub fn new(
        stable_id: impl Into<String>,
        device_name: impl Into<String>,
        factory: Arc<dyn SourceFactory>,
        audio: AudioConfig,
        stream: StreamConfig,
        subscriber_queue: usize,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            factory,
            audio: RwLock::new(audio),
            broadcaster: Arc::new(Broadcaster::new(subscriber_queue)),
            shared: Arc::new(Shared {
                stable_id: stable_id.into(),
                stream: RwLock::new(stream),
                counters: Counters::default(),
                inner: Mutex::new(Inner {
                    state: PipelineState::Stopped,
                    stop: None,
                    worker: None,
                    last_error: None,
                    started_at: None,
                }),
            }),
            op: Mutex::new(()),
        }
    }

    pub fn stable_id(&self) -> &str {
        &self.shared.stable_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn state(&self) -> PipelineState {
        self.shared.lock_inner().state
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            PipelineState::Running | PipelineState::Starting
        )
    }

    pub fn start(&self) -> anyhow::Result<()> {
        let _op = lock_op(&self.op);
        self.start_locked()
    }

    fn start_locked(&self) -> anyhow::Result<()> {
        {
            let mut inner = self.shared.lock_inner();
            if matches!(
                inner.state,
                PipelineState::Running | PipelineState::Starting
            ) {
                return Ok(());
            }
            inner.state = PipelineState::Starting;
        }

        let audio = self.audio_snapshot();
        let source = match self.factory.open(&audio) {
            Ok(s) => s,
            Err(e) => {
                let mut inner = self.shared.lock_inner();
                inner.state = PipelineState::Stopped;
                inner.last_error = Some(e.to_string());
                tracing::warn!(
                    stable_id = %self.shared.stable_id,
                    device = %self.device_name,
                    error = %e,
                    "pipeline start failed"
                );
                return Err(e.into());
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let spawned = std::thread::Builder::new()
            .name(format!("pipeline-{}", self.shared.stable_id))
            .spawn({
                let shared = self.shared.clone();
                let factory = self.factory.clone();
                let broadcaster = self.broadcaster.clone();
                let stop = stop.clone();
                move || run_worker(shared, factory, broadcaster, audio, stop, source)
            });
        let worker = match spawned {
            Ok(w) => w,
            Err(e) => {
                let mut inner = self.shared.lock_inner();
                inner.state = PipelineState::Stopped;
                inner.last_error = Some(e.to_string());
                return Err(e.into());
            }
        };

        let mut inner = self.shared.lock_inner();
        inner.state = PipelineState::Running;
        inner.stop = Some(stop);
        inner.worker = Some(worker);
        inner.last_error = None;
        inner.started_at = Some(Instant::now());
        tracing::info!(
            stable_id = %self.shared.stable_id,
            device = %self.device_name,
            sample_rate = audio.sample_rate,
            fft_size = audio.fft_size,
            "pipeline started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        let _op = lock_op(&self.op);
        self.stop_locked();
    }

    fn stop_locked(&self) {
        let (stop, worker) = {
            let mut inner = self.shared.lock_inner();
            if inner.state == PipelineState::Stopped {
                return;
            }
            inner.state = PipelineState::Stopping;
            (inner.stop.take(), inner.worker.take())
        };

        if let Some(stop) = stop {
            stop.store(true, Ordering::Relaxed);
        }
        if let Some(worker) = worker {
            let deadline = Instant::now() + STOP_GRACE;
            while !worker.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                tracing::warn!(
                    stable_id = %self.shared.stable_id,
                    "worker missed the stop grace period; detaching"
                );
            }
        }

        let mut inner = self.shared.lock_inner();
        inner.state = PipelineState::Stopped;
        inner.started_at = None;
        tracing::info!(stable_id = %self.shared.stable_id, "pipeline stopped");
    }

    pub fn restart(&self) -> anyhow::Result<()> {
        let _op = lock_op(&self.op);
        self.stop_locked();
        self.start_locked()
    }

    /// All stream-config fields are hot; the worker sees the new snapshot on
    /// its next block.
    pub fn update_stream(&self, update: &StreamConfigUpdate) -> anyhow::Result<StreamConfig> {
        let _op = lock_op(&self.op);
        let mut cfg = match self.shared.stream.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        update.apply(&mut cfg)?;
        tracing::debug!(stable_id = %self.shared.stable_id, "stream config updated");
        Ok(*cfg)
    }

    /// Audio-config changes re-open the capture stream. Subscribers stay
    /// attached and see a sequence gap while the stream is down.
    pub fn update_audio(&self, update: &AudioConfigUpdate) -> anyhow::Result<AudioConfig> {
        let _op = lock_op(&self.op);
        if update.is_empty() {
            return Ok(self.audio_snapshot());
        }

        // Validate against a copy first so an invalid update never stops a
        // healthy pipeline.
        let mut next = self.audio_snapshot();
        update.apply(&mut next)?;

        let was_running = {
            let inner = self.shared.lock_inner();
            matches!(
                inner.state,
                PipelineState::Running | PipelineState::Starting
            )
        };
        if was_running {
            self.stop_locked();
        }
        match self.audio.write() {
            Ok(mut g) => *g = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        if was_running {
            self.start_locked()?;
        }
        Ok(next)
    }

    pub fn stream_config(&self) -> StreamConfig {
        self.shared.stream_snapshot()
    }

    pub fn audio_snapshot(&self) -> AudioConfig {
        match self.audio.read() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }

    pub fn status(&self) -> PipelineStatus {
        let c = &self.shared.counters;
        let hub = self.broadcaster.snapshot();
        let (state, last_error, uptime_ms) = {
            let inner = self.shared.lock_inner();
            (
                inner.state,
                inner.last_error.clone(),
                inner
                    .started_at
                    .map(|t| t.elapsed().as_millis() as u64)
                    .unwrap_or(0),
            )
        };
        PipelineStatus {
            stable_id: self.shared.stable_id.clone(),
            device_name: self.device_name.clone(),
            state,
            audio: self.audio_snapshot(),
            stream: self.shared.stream_snapshot(),
            observed_fps: (c.observed_fps_milli.load(Ordering::Relaxed) as f32) / 1000.0,
            effective_fps: (c.effective_fps_milli.load(Ordering::Relaxed) as f32) / 1000.0,
            total_frames: hub.total_published,
            frames_analyzed: c.frames_analyzed.load(Ordering::Relaxed),
            skipped_magnitude: c.skipped_magnitude.load(Ordering::Relaxed),
            skipped_similarity: c.skipped_similarity.load(Ordering::Relaxed),
            skipped_pacing: c.skipped_pacing.load(Ordering::Relaxed),
            total_dropped: hub.total_dropped,
            overruns: c.overruns.load(Ordering::Relaxed),
            restart_count: c.restarts.load(Ordering::Relaxed),
            last_error,
            uptime_ms,
            subscriber_count: hub.subscriber_count,
        }
    }
}

fn lock_op(op: &Mutex<()>) -> MutexGuard<'_, ()> {
    match op.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Sleep in small steps so a stop request interrupts a backoff promptly.
/// Returns true if stop was requested.
fn sleep_unless_stopped(stop: &AtomicBool, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if stop.load(Ordering::Relaxed) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    stop.load(Ordering::Relaxed)
}

fn run_worker(
    shared: Arc<Shared>,
    factory: Arc<dyn SourceFactory>,
    broadcaster: Arc<Broadcaster>,
    audio: AudioConfig,
    stop: Arc<AtomicBool>,
    mut source: Box<dyn crate::capture::BlockSource>,
) {
    let stable_id = shared.stable_id.clone();
    let mut fft = FftProcessor::new(&audio);
    let mut throttler = StreamThrottler::new(&shared.stream_snapshot());
    let block_timeout = audio.block_interval().max(Duration::from_millis(10));
    // Overruns accumulate across source re-opens; each new source counts
    // from zero on top of this base.
    let mut overrun_base = shared.counters.overruns.load(Ordering::Relaxed);

    'supervise: loop {
        // Hot read loop: one iteration per capture block.
        loop {
            if stop.load(Ordering::Relaxed) {
                break 'supervise;
            }
            let wait_start = Instant::now();
            match source.next_block(block_timeout) {
                Ok(Some(block)) => {
                    throttler.record_producer_wait(wait_start.elapsed());
                    shared
                        .counters
                        .overruns
                        .store(overrun_base + source.overruns(), Ordering::Relaxed);

                    let stream_cfg = shared.stream_snapshot();
                    let frames = match fft.push(&block, stream_cfg.threshold_db) {
                        Ok(frames) => frames,
                        Err(e) => {
                            // Invariant violation in the DSP stage is fatal
                            // for this pipeline.
                            tracing::error!(stable_id = %stable_id, error = %e, "DSP failure; stopping pipeline");
                            let mut inner = shared.lock_inner();
                            inner.last_error = Some(e.to_string());
                            inner.state = PipelineState::Stopped;
                            return;
                        }
                    };
                    for mut frame in frames {
                        frame.sequence_id =
                            shared.counters.sequence.fetch_add(1, Ordering::Relaxed) + 1;
                        frame.timestamp_ms = util::now_ms();
                        shared
                            .counters
                            .frames_analyzed
                            .fetch_add(1, Ordering::Relaxed);
                        if let Verdict::Emit = throttler.offer(&frame, &stream_cfg, Instant::now())
                        {
                            frame.fps = throttler.stats().observed_fps;
                            match frame::encode(&frame, stream_cfg.compression_level) {
                                Ok(wire) => broadcaster.publish(Arc::new(wire)),
                                Err(e) => {
                                    tracing::warn!(stable_id = %stable_id, error = %e, "frame encode failed; dropping frame");
                                }
                            }
                        }
                    }
                    sync_throttle_counters(&shared, &mut throttler);
                }
                Ok(None) => {
                    sync_throttle_counters(&shared, &mut throttler);
                }
                Err(e) => {
                    tracing::warn!(stable_id = %stable_id, error = %e, "audio source failed; attempting restart");
                    shared.lock_inner().last_error = Some(e.to_string());
                    break;
                }
            }
        }

        // Transient source failure: retry with backoff, then give up.
        let mut reopened = None;
        for attempt in 0..MAX_REOPEN_ATTEMPTS as usize {
            if sleep_unless_stopped(&stop, REOPEN_BACKOFF[attempt]) {
                break 'supervise;
            }
            match factory.open(&audio) {
                Ok(src) => {
                    reopened = Some(src);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        stable_id = %stable_id,
                        attempt = attempt + 1,
                        error = %e,
                        "pipeline reopen attempt failed"
                    );
                    shared.lock_inner().last_error = Some(e.to_string());
                }
            }
        }
        match reopened {
            Some(src) => {
                source = src;
                overrun_base = shared.counters.overruns.load(Ordering::Relaxed);
                // The capture gap invalidates the analysis buffer.
                fft = FftProcessor::new(&audio);
                shared.counters.restarts.fetch_add(1, Ordering::Relaxed);
                shared.lock_inner().last_error = None;
                tracing::info!(stable_id = %stable_id, "pipeline recovered after transient failure");
            }
            None => {
                let mut inner = shared.lock_inner();
                inner.state = PipelineState::Stopped;
                inner.started_at = None;
                tracing::error!(
                    stable_id = %stable_id,
                    error = inner.last_error.as_deref().unwrap_or("unknown"),
                    "pipeline stopped after repeated source failures"
                );
                return;
            }
        }
    }
    // Stop requested; state is finalized by the caller of stop().
}

fn sync_throttle_counters(shared: &Arc<Shared>, throttler: &mut StreamThrottler) {
    let observed = throttler.observed_fps(Instant::now());
    let stats = throttler.stats();
    let c = &shared.counters;
    c.skipped_magnitude
        .store(stats.skipped_magnitude, Ordering::Relaxed);
    c.skipped_similarity
        .store(stats.skipped_similarity, Ordering::Relaxed);
    c.skipped_pacing
        .store(stats.skipped_pacing, Ordering::Relaxed);
    c.observed_fps_milli
        .store((observed * 1000.0) as u64, Ordering::Relaxed);
    c.effective_fps_milli
        .store((stats.effective_fps * 1000.0) as u64, Ordering::Relaxed);
}
