mod receiver;

use std::sync::Arc;
use std::time::Duration;

use env_logger::Env;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;
use xlink::{ConfigFile, Escalation, FrameSlot, Result, Supervisor, SupervisorConfig};

use receiver::ReceiverSettings;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        error!("receiver failed: {}", e);
        std::process::exit(2);
    }
}

async fn run() -> Result<()> {
    let file = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            ConfigFile::load(path)?
        }
        None => ConfigFile::default(),
    };
    let settings = Arc::new(ReceiverSettings::from_file(&file)?);
    let supervision =
        SupervisorConfig::from_config(&file.section("supervisor"), Escalation::AbandonTask)?;

    let shutdown = CancellationToken::new();
    let slot = FrameSlot::new();

    let frames = Supervisor::new("frame receiver", supervision).with_cancellation(shutdown.clone());
    let progress = frames.progress();
    let frames = frames.spawn({
        let settings = settings.clone();
        let slot = slot.clone();
        move || receiver::run_frames(settings.clone(), slot.clone(), progress.clone())
    });
    let telemetry =
        Supervisor::new("telemetry subscriber", supervision).with_cancellation(shutdown.clone());
    let progress = telemetry.progress();
    let telemetry = telemetry.spawn({
        let settings = settings.clone();
        move || receiver::run_telemetry(settings.clone(), progress.clone())
    });
    let preview = tokio::spawn(receiver::report_previews(
        slot.clone(),
        settings.preview_interval,
        shutdown.clone(),
    ));
    info!("Receiver running, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl-C ({}), stopping now", e);
    }
    info!("Shutting down...");
    shutdown.cancel();

    let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = tokio::join!(frames, telemetry, preview);
    })
    .await;
    if joined.is_err() {
        warn!("tasks did not stop within {:?}", SHUTDOWN_GRACE);
    }

    match slot.latest() {
        Some(frame) => info!("Last frame: {} ({} KB)", frame.sequence, frame.len() / 1024),
        None => info!("No frame received"),
    }
    Ok(())
}
