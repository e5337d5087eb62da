use anyhow::Context;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// One analysis window's worth of spectrum, before wire encoding.
///
/// `sequence_id`, `timestamp_ms` and `fps` are stamped by the pipeline;
/// the FFT stage leaves them zeroed.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumFrame {
    pub sequence_id: u64,
    pub timestamp_ms: u64,
    pub sample_rate: u32,
    pub fft_size: usize,
    pub bins_count: usize,
    pub magnitudes_db: Vec<f32>,
    pub peak_frequency_hz: f32,
    pub peak_magnitude_db: f32,
    pub spl_db: f32,
    pub fps: f32,
}

/// The frame as emitted to subscribers: one JSON object per event, with the
/// magnitude vector carried as base64(gzip(little-endian f32 bytes)).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFrame {
    pub sequence_id: u64,
    pub timestamp: u64,
    pub sample_rate: u32,
    pub fft_size: usize,
    pub bins_count: usize,
    pub peak_frequency_hz: f32,
    pub peak_magnitude_db: f32,
    pub spl_db: f32,
    pub fps: f32,
    pub data_compressed: String,
    pub data_size_bytes: usize,
    pub original_size_bytes: usize,
}

pub fn encode(frame: &SpectrumFrame, compression_level: u32) -> anyhow::Result<WireFrame> {
    let mut raw = Vec::with_capacity(frame.magnitudes_db.len() * 4);
    for v in &frame.magnitudes_db {
        raw.extend_from_slice(&v.to_le_bytes());
    }

    let mut enc = GzEncoder::new(
        Vec::with_capacity(raw.len() / 2),
        Compression::new(compression_level),
    );
    enc.write_all(&raw).context("gzip magnitudes")?;
    let compressed = enc.finish().context("finish gzip stream")?;
    let data_size_bytes = compressed.len();

    Ok(WireFrame {
        sequence_id: frame.sequence_id,
        timestamp: frame.timestamp_ms,
        sample_rate: frame.sample_rate,
        fft_size: frame.fft_size,
        bins_count: frame.bins_count,
        peak_frequency_hz: frame.peak_frequency_hz,
        peak_magnitude_db: frame.peak_magnitude_db,
        spl_db: frame.spl_db,
        fps: frame.fps,
        data_compressed: base64::engine::general_purpose::STANDARD.encode(&compressed),
        data_size_bytes,
        original_size_bytes: raw.len(),
    })
}

/// Recover the magnitude vector from a wire frame. This is the subscriber
/// side of `encode` and is what visualizers (and tests) run.
pub fn decode_magnitudes(wire: &WireFrame) -> anyhow::Result<Vec<f32>> {
    let compressed = base64::engine::general_purpose::STANDARD
        .decode(&wire.data_compressed)
        .context("base64-decode frame payload")?;
    let mut raw = Vec::with_capacity(wire.original_size_bytes);
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut raw)
        .context("gunzip frame payload")?;
    anyhow::ensure!(
        raw.len() == wire.bins_count * 4,
        "frame payload is {} bytes, expected {} (bins_count {})",
        raw.len(),
        wire.bins_count * 4,
        wire.bins_count
    );
    Ok(raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
