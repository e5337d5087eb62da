use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use ultrasonic_core::config::{self, ServiceConfig};
use ultrasonic_server::manager::{CpalPlatform, DeviceManager};
use ultrasonic_server::state::AppState;
use ultrasonic_server::{app, banner, logging};

#[derive(Debug, Parser)]
#[command(
    name = "ultrasonic-server",
    version,
    about = "Headless ultrasonic spectrum server: wideband capture, FFT, SSE streaming."
)]
struct Args {
    /// JSON config file; built-in defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the directory holding device_mapping.json.
    #[arg(long)]
    data_dir: Option<String>,

    /// Also write logs to daily-rolling files in this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Start every enumerated device immediately.
    #[arg(long)]
    autostart: bool,

    /// Raise our crates to debug logging (RUST_LOG still wins).
    #[arg(long)]
    debug: bool,
}

fn load_config(args: &Args) -> anyhow::Result<ServiceConfig> {
    let mut cfg = match &args.config {
        Some(path) => config::load_from_file(path)?,
        None => ServiceConfig::default(),
    };
    if let Some(host) = &args.host {
        cfg.server.host = host.clone();
    }
    if let Some(port) = args.port {
        cfg.server.port = port;
    }
    if let Some(data_dir) = &args.data_dir {
        cfg.data_dir = data_dir.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = load_config(&args)?;

    let _guards = logging::init(&logging::LoggingConfig {
        debug: args.debug,
        log_dir: args.log_dir.clone(),
        ..logging::LoggingConfig::default()
    })
    .context("init logging")?;
    banner::log_startup_banner();

    let manager = Arc::new(DeviceManager::new(cfg, Arc::new(CpalPlatform)));

    match manager.refresh_devices() {
        Ok(devices) => {
            tracing::info!(count = devices.len(), "enumerated capture devices");
            if args.autostart {
                for result in
                    manager.batch_start(&devices.iter().map(|d| d.stable_id.clone()).collect::<Vec<_>>())
                {
                    if !result.ok {
                        tracing::warn!(
                            stable_id = %result.stable_id,
                            error = result.error.as_deref().unwrap_or(""),
                            "autostart failed"
                        );
                    }
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "initial device enumeration failed"),
    }

    let state = AppState::new(manager.clone());
    app::serve(state).await?;

    manager.stop_all();
    if let Err(e) = manager.persist_registry() {
        tracing::warn!(error = %e, "failed to persist device registry on shutdown");
    }
    tracing::info!("bye");
    Ok(())
}
