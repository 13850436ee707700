use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mvirt_mux::lower::MediaStatus;
use mvirt_mux::lower::loopback::LoopbackOpener;
use mvirt_mux::{
    FrameCookie, Multiplexer, MuxConfig, PacketFilter, ReceivedFrame, VifHandler, VifId,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Default configuration path.
const CONFIG_PATH: &str = "/etc/mvirt/mux.json";

#[derive(Parser, Debug)]
#[command(name = "mvirt-mux", about = "Virtual interface multiplexer")]
struct Args {
    /// VIF configuration file (JSON)
    #[arg(short, long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Upper edge for daemon VIFs: logs traffic and returns frames at once.
struct LogHandler;

impl VifHandler for LogHandler {
    fn frame_indicated(&self, frame: ReceivedFrame) {
        debug!(vif = %frame.vif_id(), len = frame.len(), tag = ?frame.tag(), "frame received");
    }

    fn send_complete(&self, vif: VifId, cookie: FrameCookie, result: mvirt_mux::Result<()>) {
        if let Err(e) = result {
            warn!(vif = %vif, cookie = %cookie, error = %e, "send failed");
        }
    }

    fn status_indicated(&self, vif: VifId, status: MediaStatus) {
        info!(vif = %vif, status = ?status, "media status");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = MuxConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    info!(
        config = %args.config.display(),
        adapters = config.bindings.len(),
        "starting mvirt-mux"
    );

    let mux = Multiplexer::new(Arc::new(LoopbackOpener::new()));
    let handler: Arc<dyn VifHandler> = Arc::new(LogHandler);
    for (binding, report) in mux.bind_all(&config) {
        for (key, e) in &report.failed {
            warn!(binding = %binding.id(), key = %key, error = %e, "VIF not created");
        }
        for vif in report.created {
            vif.initialize(Arc::clone(&handler))
                .with_context(|| format!("failed to initialize {}", vif.id()))?;
            vif.set_packet_filter(
                PacketFilter::DIRECTED | PacketFilter::BROADCAST | PacketFilter::MULTICAST,
            )
            .with_context(|| format!("failed to set filter on {}", vif.id()))?;
        }
    }

    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }

    tokio::task::spawn_blocking(move || mux.shutdown())
        .await
        .context("shutdown task failed")?;
    info!("mvirt-mux stopped");
    Ok(())
}
