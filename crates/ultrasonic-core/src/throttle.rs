use crate::config::StreamConfig;
use crate::frame::SpectrumFrame;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const EWMA_ALPHA: f32 = 0.2;
const OBSERVED_WINDOW: Duration = Duration::from_secs(1);
const ADAPTIVE_EVAL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Magnitude,
    Similarity,
    Pacing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Emit,
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThrottleStats {
    pub emitted: u64,
    pub skipped_magnitude: u64,
    pub skipped_similarity: u64,
    pub skipped_pacing: u64,
    pub last_emitted_sequence: u64,
    /// Emissions in the trailing one-second window.
    pub observed_fps: f32,
    pub effective_fps: f32,
}

/// Per-pipeline emission gate. Three rules run in order (magnitude gate,
/// similarity skip, FPS pacing); the first that fails skips the frame.
///
/// Time is passed in by the caller so the decision logic stays deterministic
/// under test.
pub struct StreamThrottler {
    last_emit: Option<Instant>,
    last_emitted_spectrum: Option<Vec<f32>>,
    recent_emits: VecDeque<Instant>,
    effective_fps: f32,
    wait_ewma_s: f32,
    frame_gap_ewma_s: f32,
    last_frame_at: Option<Instant>,
    last_adaptive_eval: Option<Instant>,
    stats: ThrottleStats,
}

impl StreamThrottler {
    pub fn new(cfg: &StreamConfig) -> Self {
        Self {
            last_emit: None,
            last_emitted_spectrum: None,
            recent_emits: VecDeque::new(),
            effective_fps: cfg.target_fps as f32,
            wait_ewma_s: 0.0,
            frame_gap_ewma_s: 0.0,
            last_frame_at: None,
            last_adaptive_eval: None,
            stats: ThrottleStats {
                effective_fps: cfg.target_fps as f32,
                ..ThrottleStats::default()
            },
        }
    }

    /// Record how long the processor waited on the audio source before this
    /// frame. Feeds the saturation estimate behind adaptive FPS.
    pub fn record_producer_wait(&mut self, wait: Duration) {
        let w = wait.as_secs_f32();
        self.wait_ewma_s = if self.wait_ewma_s == 0.0 {
            w
        } else {
            self.wait_ewma_s + EWMA_ALPHA * (w - self.wait_ewma_s)
        };
    }

    pub fn offer(&mut self, frame: &SpectrumFrame, cfg: &StreamConfig, now: Instant) -> Verdict {
        if let Some(prev) = self.last_frame_at {
            let gap = (now - prev).as_secs_f32();
            self.frame_gap_ewma_s = if self.frame_gap_ewma_s == 0.0 {
                gap
            } else {
                self.frame_gap_ewma_s + EWMA_ALPHA * (gap - self.frame_gap_ewma_s)
            };
        }
        self.last_frame_at = Some(now);

        let effective = self.update_effective_fps(cfg, now);

        if frame.peak_magnitude_db < cfg.magnitude_threshold_db {
            self.stats.skipped_magnitude += 1;
            return Verdict::Skip(SkipReason::Magnitude);
        }

        if cfg.enable_smart_skip {
            if let Some(prev) = self.last_emitted_spectrum.as_deref() {
                if cosine_similarity(prev, &frame.magnitudes_db) >= cfg.similarity_threshold {
                    self.stats.skipped_similarity += 1;
                    return Verdict::Skip(SkipReason::Similarity);
                }
            }
        }

        if let Some(last) = self.last_emit {
            if (now - last).as_secs_f32() < 1.0 / effective {
                self.stats.skipped_pacing += 1;
                return Verdict::Skip(SkipReason::Pacing);
            }
        }

        self.last_emit = Some(now);
        self.last_emitted_spectrum = Some(frame.magnitudes_db.clone());
        self.recent_emits.push_back(now);
        self.prune_observed(now);
        self.stats.emitted += 1;
        self.stats.last_emitted_sequence = frame.sequence_id;
        self.stats.observed_fps = self.recent_emits.len() as f32;
        Verdict::Emit
    }

    pub fn stats(&self) -> ThrottleStats {
        self.stats
    }

    /// Observed FPS with stale emissions aged out relative to `now`.
    pub fn observed_fps(&mut self, now: Instant) -> f32 {
        self.prune_observed(now);
        self.stats.observed_fps = self.recent_emits.len() as f32;
        self.stats.observed_fps
    }

    fn prune_observed(&mut self, now: Instant) {
        while let Some(&front) = self.recent_emits.front() {
            if now.duration_since(front) > OBSERVED_WINDOW {
                self.recent_emits.pop_front();
            } else {
                break;
            }
        }
    }

    fn update_effective_fps(&mut self, cfg: &StreamConfig, now: Instant) -> f32 {
        if !cfg.enable_adaptive_fps {
            self.effective_fps = cfg.target_fps as f32;
            self.stats.effective_fps = self.effective_fps;
            return self.effective_fps;
        }

        let due = match self.last_adaptive_eval {
            None => true,
            Some(t) => now.duration_since(t) >= ADAPTIVE_EVAL_INTERVAL,
        };
        if due {
            self.last_adaptive_eval = Some(now);
            let interval = if self.frame_gap_ewma_s > 0.0 {
                self.frame_gap_ewma_s
            } else {
                1.0 / self.effective_fps.max(1.0)
            };
            let idle_ratio = self.wait_ewma_s / interval;
            // Steps are bounded to 10% either way so the loop cannot
            // oscillate between extremes.
            if idle_ratio < 0.1 {
                self.effective_fps *= 0.9;
            } else if idle_ratio > 0.5 {
                self.effective_fps *= 1.1;
            }
        }
        let lo = cfg.min_adaptive_fps as f32;
        let hi = cfg.max_adaptive_fps as f32;
        self.effective_fps = self.effective_fps.clamp(lo, hi);
        self.stats.effective_fps = self.effective_fps;
        self.effective_fps
    }
}

/// Cosine similarity over the clamped dB vectors, 64-bit accumulators.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += (x as f64) * (y as f64);
        norm_a += (x as f64) * (x as f64);
        norm_b += (y as f64) * (y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        // Two all-zero spectra are indistinguishable.
        return if norm_a == norm_b { 1.0 } else { 0.0 };
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}
