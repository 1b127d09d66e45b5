mod camera;
mod streamer;

use std::sync::Arc;

use env_logger::Env;
use log::{error, info};
use tokio_util::sync::CancellationToken;
use xlink::{ConfigFile, Error, Escalation, Result, Supervisor, SupervisorConfig};

use streamer::{StreamSettings, Totals};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        error!("edge streamer failed: {}", e);
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
    let settings = Arc::new(StreamSettings::from_file(&file)?);
    let supervision = SupervisorConfig::from_config(
        &file.section("supervisor"),
        Escalation::ExitProcess { code: 1 },
    )?;

    let shutdown = CancellationToken::new();
    let totals = Arc::new(Totals::default());
    let supervisor =
        Supervisor::new("edge streamer", supervision).with_cancellation(shutdown.clone());
    let progress = supervisor.progress();
    let mut task = supervisor.spawn({
        let settings = settings.clone();
        let totals = totals.clone();
        move || streamer::run_session(settings.clone(), totals.clone(), progress.clone())
    });

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping stream...");
            shutdown.cancel();
            (&mut task).await
        }
        result = &mut task => result,
    };

    info!("=== Stream Complete ===");
    info!("Total frames: {}", totals.frames());
    info!("Total sent: {} MB", totals.bytes() / 1024 / 1024);

    result.map_err(|e| Error::Unavailable(format!("streamer task failed: {}", e)))?
}
