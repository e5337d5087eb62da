use anyhow::Context;
use clap::Parser;
use futures_util::StreamExt;
use std::io::IsTerminal;
use std::time::Duration;
use ultrasonic_core::frame::{decode_magnitudes, WireFrame};

#[derive(Debug, Parser)]
#[command(
    name = "sse_probe",
    version,
    about = "Subscribe to an ultrasonic-server spectrum stream and print a frame summary."
)]
struct Args {
    /// Stream URL (example: http://127.0.0.1:8380/api/device/<id>/stream)
    url: String,

    /// Number of frames to print before exiting
    #[arg(long, default_value_t = 3)]
    count: usize,

    /// Per-read timeout (milliseconds)
    #[arg(long, default_value_t = 4000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .with_writer(std::io::stdout)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .map_err(|e| anyhow::anyhow!("init tracing: {e}"))?;

    let args = Args::parse();
    let response = reqwest::Client::new()
        .get(args.url.as_str())
        .send()
        .await
        .context("connect")?
        .error_for_status()
        .context("stream request rejected")?;

    let mut body = Box::pin(response.bytes_stream());
    let mut buffer = String::new();
    let mut printed = 0usize;

    while printed < args.count {
        let chunk = tokio::time::timeout(Duration::from_millis(args.timeout_ms), body.next())
            .await
            .context("timeout")?
            .context("stream ended")?
            .context("read chunk")?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        // SSE events are separated by a blank line.
        while let Some(boundary) = buffer.find("\n\n") {
            let event: String = buffer[..boundary].to_string();
            buffer.drain(..boundary + 2);
            if let Some(frame) = parse_frame(&event) {
                summarize(printed, &frame);
                printed += 1;
                if printed >= args.count {
                    break;
                }
            }
        }
    }

    Ok(())
}

fn parse_frame(event: &str) -> Option<WireFrame> {
    let data: String = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.trim_start())
        .collect();
    if data.is_empty() {
        return None;
    }
    serde_json::from_str::<WireFrame>(&data).ok()
}

fn summarize(idx: usize, frame: &WireFrame) {
    match decode_magnitudes(frame) {
        Ok(magnitudes) => {
            tracing::info!(
                idx,
                sequence_id = frame.sequence_id,
                bins = magnitudes.len(),
                peak_hz = frame.peak_frequency_hz,
                peak_db = frame.peak_magnitude_db,
                spl_db = frame.spl_db,
                fps = frame.fps,
                compressed_bytes = frame.data_size_bytes,
                "frame"
            );
        }
        Err(e) => {
            tracing::warn!(idx, sequence_id = frame.sequence_id, error = %e, "undecodable frame");
        }
    }
}
