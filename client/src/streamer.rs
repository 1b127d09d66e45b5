//! One streaming session: frames over the datagram channel, telemetry over
//! the datagram side channel and the pub/sub publisher.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info};
use serde::Serialize;
use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior};
use xlink::reliable::Progress;
use xlink::{
    Channel, ConfigFile, DatagramChannel, Document, Error, PubSubChannel, Result, TransportConfig,
};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);
const MAX_FRAME_BYTES: i64 = 8 * 1024 * 1024;

/// Options of the `[stream]` section plus the channel sections.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub datagram: TransportConfig,
    pub pubsub: TransportConfig,
    pub sensor_id: String,
    pub frame_interval: Duration,
    pub telemetry_every: u64,
    pub min_frame_len: usize,
    pub max_frame_len: usize,
}

impl StreamSettings {
    pub fn from_file(file: &ConfigFile) -> Result<Self> {
        let datagram = TransportConfig::new()
            .with("host", "127.0.0.1")
            .with("port", 9999)
            .with("bufferSize", xlink::MEDIA_BUFFER_SIZE)
            .merged(&file.section("datagram"));
        let pubsub = TransportConfig::new()
            .with("endpoint", "tcp://127.0.0.1:5556")
            .with("role", "PUB")
            .with("topic", "telemetry/camera")
            .merged(&file.section("pubsub"));

        let stream = file.section("stream");
        stream.ensure_known(&[
            "sensorId",
            "fps",
            "telemetryEvery",
            "minFrameBytes",
            "maxFrameBytes",
        ])?;
        let fps = stream.bounded("fps", 1, 240)?.unwrap_or(10);
        let frame_bytes = |key: &str, default: i64| -> Result<usize> {
            Ok(stream.bounded(key, 4, MAX_FRAME_BYTES)?.unwrap_or(default) as usize)
        };
        let min_frame_len = frame_bytes("minFrameBytes", 20_000)?;
        let max_frame_len = frame_bytes("maxFrameBytes", 150_000)?;
        if min_frame_len > max_frame_len {
            return Err(Error::Configuration(format!(
                "minFrameBytes {} exceeds maxFrameBytes {}",
                min_frame_len, max_frame_len
            )));
        }

        Ok(Self {
            datagram,
            pubsub,
            sensor_id: stream.text("sensorId")?.unwrap_or("CAM_EDGE_01").to_owned(),
            frame_interval: Duration::from_secs(1) / fps as u32,
            telemetry_every: stream.bounded("telemetryEvery", 1, 1_000_000)?.unwrap_or(10) as u64,
            min_frame_len,
            max_frame_len,
        })
    }

    /// Sensor template with this camera's identity filled in.
    pub fn template(&self) -> Result<Document> {
        let identity = Document::from_value(json!({
            "sensor_id": self.sensor_id,
            "sensor_type": "camera",
            "data_type": "jpeg",
            "metadata": { "units": "bytes", "tags": ["edge", "preview"] }
        }))?;
        Ok(Document::sensor_template().merged(&identity))
    }
}

/// Counters that survive session restarts.
#[derive(Debug, Default)]
pub struct Totals {
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl Totals {
    /// Returns the 1-based number of the frame just sent.
    fn record(&self, len: usize) -> u64 {
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.frames.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[derive(Serialize)]
struct Reading {
    timestamp: f64,
    data: FrameReport,
}

#[derive(Serialize)]
struct FrameReport {
    frame: u64,
    bytes: usize,
    chunks: usize,
}

fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// Streams until a send fails. Never returns `Ok`; every delivered frame
/// marks `progress`, so a session that streamed and then lost its link does
/// not count toward the retry budget.
pub async fn run_session(
    settings: Arc<StreamSettings>,
    totals: Arc<Totals>,
    progress: Progress,
) -> Result<ControlFlow<()>> {
    let template = settings.template()?;

    let mut frames = DatagramChannel::with_config(settings.datagram.clone())?;
    frames.connect().await?;
    let mut telemetry = PubSubChannel::with_config(settings.pubsub.clone())?;
    telemetry.set_template(template.clone());
    telemetry.connect().await?;
    info!(
        "streaming to {:?}, telemetry on topic '{}'",
        frames.remote_addr(),
        telemetry.topic()
    );

    let mut camera =
        crate::camera::SyntheticCamera::new(settings.min_frame_len, settings.max_frame_len);
    let mut ticker = tokio::time::interval(settings.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut window_start = Instant::now();
    let mut window_bytes = 0usize;
    let mut window_frames = 0u32;

    loop {
        ticker.tick().await;
        let frame = camera.capture();
        let chunks = frames.send_frame(&frame).await?;
        let number = totals.record(frame.len());
        progress.mark();
        window_bytes += frame.len();
        window_frames += 1;
        debug!("frame {}: {} bytes in {} chunks", number, frame.len(), chunks);

        if number % settings.telemetry_every == 0 {
            let reading = Document::from_serializable(&Reading {
                timestamp: unix_time(),
                data: FrameReport {
                    frame: number,
                    bytes: frame.len(),
                    chunks,
                },
            })?;
            frames.send_document(&template.merged(&reading)).await?;
            telemetry.send_templated(&reading)?;
        }

        let elapsed = window_start.elapsed();
        if elapsed >= REPORT_INTERVAL {
            let secs = elapsed.as_secs_f64();
            info!(
                "sent {} frames ({:.1} fps, {:.2} MB/s), {} subscriber(s)",
                window_frames,
                window_frames as f64 / secs,
                window_bytes as f64 / 1024.0 / 1024.0 / secs,
                telemetry.peer_count()
            );
            window_start = Instant::now();
            window_bytes = 0;
            window_frames = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xlink::ErrorKind;

    #[test]
    fn test_settings_defaults_and_overrides() {
        let file = ConfigFile::parse(
            r#"
            [datagram]
            host = "10.0.0.2"

            [stream]
            fps = 25
            sensorId = "CAM_7"
            "#,
        )
        .unwrap();
        let settings = StreamSettings::from_file(&file).unwrap();
        assert_eq!(settings.datagram.text("host").unwrap(), Some("10.0.0.2"));
        assert_eq!(settings.datagram.int("port").unwrap(), Some(9999));
        assert_eq!(settings.pubsub.text("role").unwrap(), Some("PUB"));
        assert_eq!(settings.frame_interval, Duration::from_millis(40));
        assert_eq!(settings.telemetry_every, 10);

        let template = settings.template().unwrap();
        assert_eq!(template.get("sensor_id").unwrap(), "CAM_7");
        assert_eq!(template.pointer("metadata.units").unwrap(), "bytes");
        assert_eq!(template.pointer("metadata.schema_version").unwrap(), "1.0");
    }

    #[test]
    fn test_rejects_inverted_frame_bounds() {
        let file =
            ConfigFile::parse("[stream]\nminFrameBytes = 500\nmaxFrameBytes = 100\n").unwrap();
        let err = StreamSettings::from_file(&file).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_totals_number_frames_from_one() {
        let totals = Totals::default();
        assert_eq!(totals.record(10), 1);
        assert_eq!(totals.record(5), 2);
        assert_eq!(totals.frames(), 2);
        assert_eq!(totals.bytes(), 15);
    }
}
