use crate::config::AudioConfig;
use crate::dsp::window;
use crate::frame::SpectrumFrame;
use num_complex::Complex32;
use realfft::{RealFftPlanner, RealToComplex};
use std::sync::Arc;

/// Streaming short-time FFT: buffers capture blocks and yields one spectrum
/// per analysis window, advancing by `hop` samples (overlap < 1 window).
///
/// Re-created on sample-rate or FFT-size changes; the per-bin noise floor
/// (`threshold_db`) is passed per push so hot config updates land on the
/// next window.
pub struct FftProcessor {
    sample_rate: u32,
    fft_size: usize,
    hop: usize,
    coeffs: Arc<Vec<f32>>,
    fft: Arc<dyn RealToComplex<f32>>,
    buf: Vec<f32>,
    windowed: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl FftProcessor {
    pub fn new(cfg: &AudioConfig) -> Self {
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(cfg.fft_size);
        let scratch = vec![Complex32::default(); fft.get_scratch_len()];
        Self {
            sample_rate: cfg.sample_rate,
            fft_size: cfg.fft_size,
            hop: cfg.hop(),
            coeffs: window::coefficients(cfg.window, cfg.fft_size),
            spectrum: vec![Complex32::default(); cfg.fft_size / 2 + 1],
            fft,
            buf: Vec::with_capacity(cfg.fft_size * 2),
            windowed: vec![0.0f32; cfg.fft_size],
            scratch,
        }
    }

    pub fn buffered_samples(&self) -> usize {
        self.buf.len()
    }

    /// Feed one capture block; returns zero or more frames depending on how
    /// many full windows the buffer now holds.
    pub fn push(&mut self, block: &[f32], threshold_db: f32) -> anyhow::Result<Vec<SpectrumFrame>> {
        self.buf.extend_from_slice(block);
        let mut out = Vec::new();
        while self.buf.len() >= self.fft_size {
            out.push(self.analyze_front(threshold_db)?);
            self.buf.drain(..self.hop);
        }
        Ok(out)
    }

    fn analyze_front(&mut self, threshold_db: f32) -> anyhow::Result<SpectrumFrame> {
        for (dst, (s, w)) in self
            .windowed
            .iter_mut()
            .zip(self.buf.iter().zip(self.coeffs.iter()))
        {
            *dst = s * w;
        }
        self.fft
            .process_with_scratch(&mut self.windowed, &mut self.spectrum, &mut self.scratch)
            .map_err(|e| anyhow::anyhow!("forward FFT failed: {e}"))?;

        let bins = self.fft_size / 2;
        let scale = 1.0f32 / (self.fft_size as f32);
        let mut magnitudes_db = Vec::with_capacity(bins);
        let mut peak_bin = 0usize;
        let mut peak_db = f32::NEG_INFINITY;
        // Energy sum runs over the pre-clamp values: the noise-floor clamp is
        // a display aid and must not move the SPL.
        let mut energy = 0.0f64;
        for (i, c) in self.spectrum[..bins].iter().enumerate() {
            // +6 dB compensates the window attenuation; fixed constant so SPL
            // calibration is reproducible downstream.
            let db = 20.0 * (c.norm() * scale + 1e-10).log10() + 6.0;
            energy += 10.0f64.powf(db as f64 / 10.0);
            let clamped = db.max(threshold_db);
            if clamped > peak_db {
                peak_db = clamped;
                peak_bin = i;
            }
            magnitudes_db.push(clamped);
        }
        let spl_db = (10.0 * energy.log10()) as f32;
        let peak_frequency_hz =
            (peak_bin as f32) * (self.sample_rate as f32) / (self.fft_size as f32);

        Ok(SpectrumFrame {
            sequence_id: 0,
            timestamp_ms: 0,
            sample_rate: self.sample_rate,
            fft_size: self.fft_size,
            bins_count: bins,
            magnitudes_db,
            peak_frequency_hz,
            peak_magnitude_db: peak_db,
            spl_db,
            fps: 0.0,
        })
    }
}
