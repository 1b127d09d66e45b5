//! Receive side: frame listener feeding the preview slot, and the telemetry
//! subscriber.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio_util::sync::CancellationToken;
use xlink::reliable::Progress;
use xlink::{
    Channel, ConfigFile, DatagramChannel, Delivery, Error, Frame, FrameSlot, PubSubChannel, Result,
    TransportConfig,
};

/// How often a supervised session checks that its listener is still alive.
const LIVENESS_CHECK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    pub datagram: TransportConfig,
    pub pubsub: TransportConfig,
    pub preview_interval: Duration,
}

impl ReceiverSettings {
    pub fn from_file(file: &ConfigFile) -> Result<Self> {
        let datagram = TransportConfig::new()
            .with("localPort", 9999)
            .with("bufferSize", xlink::MEDIA_BUFFER_SIZE)
            .with("timeout", 500)
            .merged(&file.section("datagram"));
        let pubsub = TransportConfig::new()
            .with("endpoint", "tcp://*:5556")
            .with("role", "SUB")
            .with("bind", true)
            .with("topic", "telemetry")
            .merged(&file.section("pubsub"));

        let preview = file.section("preview");
        preview.ensure_known(&["intervalMs"])?;
        Ok(Self {
            datagram,
            pubsub,
            preview_interval: preview.millis("intervalMs")?.unwrap_or(Duration::from_secs(2)),
        })
    }
}

/// Binds the datagram channel and keeps its listener running.
///
/// Completed frames land in `slot`, which outlives the session so the
/// preview survives restarts.
pub async fn run_frames(
    settings: Arc<ReceiverSettings>,
    slot: FrameSlot,
    progress: Progress,
) -> Result<ControlFlow<()>> {
    let mut channel = DatagramChannel::with_config(settings.datagram.clone())?;
    channel.set_frame_slot(slot);
    channel.connect().await?;
    channel.start_listener(|delivery| {
        match delivery {
            Delivery::Document(document) => info!("telemetry (datagram): {}", document.to_json()),
            Delivery::Frame(frame) => {
                debug!("frame {} complete, {} bytes", frame.sequence, frame.len())
            }
        }
        Ok(())
    })?;
    let alive = || channel.is_listening() && channel.is_connected();
    watch_listener(alive, &progress, "frame listener").await
}

/// Subscribes to telemetry topics and logs every message.
pub async fn run_telemetry(
    settings: Arc<ReceiverSettings>,
    progress: Progress,
) -> Result<ControlFlow<()>> {
    let mut channel = PubSubChannel::with_config(settings.pubsub.clone())?;
    channel.connect().await?;
    channel.start_listener(|message| {
        info!("telemetry [{}]: {}", message.topic, message.document.to_json());
        Ok(())
    })?;
    let alive = || channel.is_listening() && channel.is_connected();
    watch_listener(alive, &progress, "telemetry listener").await
}

/// Every passed check counts as progress for the supervisor.
async fn watch_listener(
    alive: impl Fn() -> bool,
    progress: &Progress,
    what: &str,
) -> Result<ControlFlow<()>> {
    loop {
        tokio::time::sleep(LIVENESS_CHECK).await;
        if !alive() {
            return Err(Error::Unavailable(format!("{} stopped unexpectedly", what)));
        }
        progress.mark();
    }
}

/// Remembers which frame was last shown so each one is reported once.
#[derive(Debug, Default)]
pub struct PreviewTracker {
    shown: Option<Arc<[u8]>>,
}

impl PreviewTracker {
    pub fn observe(&mut self, latest: Option<Frame>) -> Option<Frame> {
        let frame = latest?;
        if self.shown.as_ref().is_some_and(|shown| Arc::ptr_eq(shown, &frame.data)) {
            return None;
        }
        self.shown = Some(frame.data.clone());
        Some(frame)
    }
}

/// Reads the latest frame at its own pace until cancelled.
pub async fn report_previews(slot: FrameSlot, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    let mut tracker = PreviewTracker::default();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match tracker.observe(slot.latest()) {
            Some(frame) => info!("preview: frame {} ({} KB)", frame.sequence, frame.len() / 1024),
            None => debug!("preview: no new frame"),
        }
    }
    debug!("preview reporter stopped");
}
