//! Connectionless transport for media chunks and whole documents.
//!
//! Send side: every chunk travels as one datagram with a CRC32 trailer; there
//! is no acknowledgment and no ordering. Receive side: one listener task per
//! channel classifies each datagram, feeds verified chunks to a
//! [`FrameReassembler`] and hands documents and completed frames to the
//! handler. Completed frames are also published to the channel's
//! [`FrameSlot`].

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::net::UdpSocket;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::listener::{Handler, HandlerResult, ListenerTask, STOP_GRACE, dispatch};
use super::{Channel, ChannelState, Lifecycle};
use crate::config::TransportConfig;
use crate::core::{Document, Framing, Inbound};
use crate::error::{Error, ErrorKind, Result};
use crate::reliable::{Assembly, Frame, FrameDetector, FrameReassembler, FrameSlot, JpegTrailer};

pub const KEY_HOST: &str = "host";
pub const KEY_ADDRESS: &str = "address";
pub const KEY_PORT: &str = "port";
pub const KEY_LOCAL_PORT: &str = "localPort";
pub const KEY_BUFFER_SIZE: &str = "bufferSize";
pub const KEY_TIMEOUT: &str = "timeout";
pub const KEY_FRAMING: &str = "framing";
pub const KEY_MAX_FRAME_SIZE: &str = "maxFrameSize";

const KNOWN_KEYS: &[&str] = &[
    KEY_HOST,
    KEY_ADDRESS,
    KEY_PORT,
    KEY_LOCAL_PORT,
    KEY_BUFFER_SIZE,
    KEY_TIMEOUT,
    KEY_FRAMING,
    KEY_MAX_FRAME_SIZE,
];

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 9999;
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Largest UDP payload over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Receive statistics are logged at this period while listening.
pub const STATS_INTERVAL: Duration = Duration::from_secs(5);

const NAME: &str = "datagram channel";

/// What the listener hands to its handler.
#[derive(Debug, Clone)]
pub enum Delivery {
    Document(Document),
    Frame(Frame),
}

/// Receive counters shared between the listener task and the channel.
#[derive(Debug, Default)]
pub struct ReceiveStats {
    datagrams: AtomicU64,
    bytes: AtomicU64,
    documents: AtomicU64,
    chunks: AtomicU64,
    integrity_failures: AtomicU64,
    rejected: AtomicU64,
    frames: AtomicU64,
    overflows: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub datagrams: u64,
    pub bytes: u64,
    pub documents: u64,
    pub chunks: u64,
    pub integrity_failures: u64,
    /// Undecodable documents and unknown tags.
    pub rejected: u64,
    pub frames: u64,
    pub overflows: u64,
}

impl ReceiveStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            documents: self.documents.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
        }
    }
}

/// Validated view of the datagram options.
#[derive(Debug, Clone, PartialEq)]
struct Settings {
    host: String,
    port: u16,
    local_port: Option<u16>,
    buffer_size: usize,
    timeout: Option<Duration>,
    framing: Framing,
    max_frame_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            local_port: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            timeout: None,
            framing: Framing::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Settings {
    fn from_config(config: &TransportConfig) -> Result<Self> {
        config.ensure_known(KNOWN_KEYS)?;
        let framing = match config.text(KEY_FRAMING)? {
            Some(text) => text.parse()?,
            None => Framing::default(),
        };
        let min_buffer = (crate::core::CHECKSUM_LEN + framing.overhead() + 1) as i64;

        Ok(Self {
            host: config
                .text_any(&[KEY_HOST, KEY_ADDRESS])?
                .unwrap_or(DEFAULT_HOST)
                .to_owned(),
            port: config.port(KEY_PORT)?.unwrap_or(DEFAULT_PORT),
            local_port: config.port(KEY_LOCAL_PORT)?,
            buffer_size: config
                .bounded(KEY_BUFFER_SIZE, min_buffer, 65_535)?
                .map_or(DEFAULT_BUFFER_SIZE, |v| v as usize),
            timeout: config.millis(KEY_TIMEOUT)?,
            framing,
            max_frame_size: config
                .bounded(KEY_MAX_FRAME_SIZE, 1, 1 << 30)?
                .map_or(DEFAULT_MAX_FRAME_SIZE, |v| v as usize),
        })
    }

    fn max_datagram(&self) -> usize {
        self.buffer_size.min(MAX_UDP_PAYLOAD)
    }
}

type DetectorFactory = Arc<dyn Fn() -> Box<dyn FrameDetector> + Send + Sync>;

pub struct DatagramChannel {
    config: TransportConfig,
    settings: Settings,
    lifecycle: Lifecycle,
    socket: Option<Arc<UdpSocket>>,
    remote: Option<SocketAddr>,
    listener: Option<ListenerTask<()>>,
    detector: DetectorFactory,
    slot: FrameSlot,
    stats: Arc<ReceiveStats>,
}

impl DatagramChannel {
    pub fn new() -> Self {
        Self {
            config: TransportConfig::new(),
            settings: Settings::default(),
            lifecycle: Lifecycle::new(NAME),
            socket: None,
            remote: None,
            listener: None,
            detector: Arc::new(|| Box::new(JpegTrailer) as Box<dyn FrameDetector>),
            slot: FrameSlot::new(),
            stats: Arc::new(ReceiveStats::default()),
        }
    }

    pub fn with_config(options: TransportConfig) -> Result<Self> {
        let mut channel = Self::new();
        channel.configure(options)?;
        Ok(channel)
    }

    /// Replaces the JPEG trailer check used by listeners started afterwards.
    pub fn set_frame_detector<D, F>(&mut self, make: F)
    where
        D: FrameDetector + 'static,
        F: Fn() -> D + Send + Sync + 'static,
    {
        self.detector = Arc::new(move || Box::new(make()) as Box<dyn FrameDetector>);
    }

    /// Largest chunk accepted by [`send_chunk`](Self::send_chunk).
    pub fn max_chunk_len(&self) -> usize {
        self.settings.framing.max_chunk_len(self.settings.max_datagram())
    }

    pub fn framing(&self) -> Framing {
        self.settings.framing
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Latest completed frame, shared with any preview consumer.
    pub fn frame_slot(&self) -> FrameSlot {
        self.slot.clone()
    }

    /// Shares an existing slot, e.g. one that outlives reconnects.
    pub fn set_frame_slot(&mut self, slot: FrameSlot) {
        self.slot = slot;
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_listening(&self) -> bool {
        self.listener.as_ref().is_some_and(|l| !l.is_finished())
    }

    fn link(&self) -> Result<(&UdpSocket, SocketAddr)> {
        self.lifecycle.ensure_connected()?;
        match (&self.socket, self.remote) {
            (Some(socket), Some(remote)) => Ok((socket, remote)),
            _ => Err(Error::not_connected(NAME)),
        }
    }

    async fn transmit(socket: &UdpSocket, datagram: &[u8], remote: SocketAddr) -> Result<()> {
        let sent = socket.send_to(datagram, remote).await?;
        if sent != datagram.len() {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("sent {} of {} bytes", sent, datagram.len()),
            )));
        }
        trace!("sent {} bytes to {}", sent, remote);
        Ok(())
    }

    /// Sends one chunk with its checksum trailer.
    pub async fn send_chunk(&self, chunk: &[u8]) -> Result<()> {
        self.send_chunked([chunk]).await.map(|_| ())
    }

    /// Sends pre-split chunks in order, one datagram each.
    ///
    /// Every chunk is size-checked before the first one goes out, so an
    /// oversize chunk never leaves a partial frame on the wire.
    pub async fn send_chunked<'a, I>(&self, chunks: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let (socket, remote) = self.link()?;
        let max = self.max_chunk_len();
        let chunks: Vec<&[u8]> = chunks.into_iter().collect();
        if let Some(big) = chunks.iter().find(|c| c.len() > max) {
            return Err(Error::Oversize { len: big.len(), max });
        }

        let mut datagram = Vec::with_capacity(self.settings.max_datagram());
        for chunk in &chunks {
            self.settings.framing.encode_chunk(chunk, &mut datagram);
            Self::transmit(socket, &datagram, remote).await?;
        }
        Ok(chunks.len())
    }

    /// Splits `payload` at [`max_chunk_len`](Self::max_chunk_len) and sends it.
    pub async fn send_frame(&self, payload: &[u8]) -> Result<usize> {
        let max = self.max_chunk_len();
        if max == 0 {
            return Err(Error::Configuration("buffer size leaves no room for chunk bytes".into()));
        }
        self.send_chunked(crate::core::chunk::split(payload, max)).await
    }

    /// Sends `document` whole in one datagram.
    pub async fn send_document(&self, document: &Document) -> Result<()> {
        let (socket, remote) = self.link()?;
        let datagram = self.settings.framing.encode_document(document)?;
        let max = self.settings.max_datagram();
        if datagram.len() > max {
            return Err(Error::Oversize { len: datagram.len(), max });
        }
        Self::transmit(socket, &datagram, remote).await
    }

    /// Receives one raw datagram, honoring the configured timeout.
    ///
    /// Not available while a listener owns the receive path.
    pub async fn receive_datagram(&self) -> Result<(Vec<u8>, SocketAddr)> {
        self.lifecycle.ensure_connected()?;
        if self.is_listening() {
            return Err(Error::ConnectionState("listener owns the receive path".into()));
        }
        let socket = self.socket.as_ref().ok_or_else(|| Error::not_connected(NAME))?;

        let mut buf = vec![0u8; self.settings.buffer_size];
        let (n, src) = recv(socket, &mut buf, self.settings.timeout).await?;
        buf.truncate(n);
        Ok((buf, src))
    }

    /// Starts the background listener. One per channel.
    pub fn start_listener<H>(&mut self, handler: H) -> Result<()>
    where
        H: FnMut(Delivery) -> HandlerResult + Send + 'static,
    {
        self.lifecycle.ensure_connected()?;
        if self.is_listening() {
            return Err(Error::ConnectionState("listener already running".into()));
        }
        let socket = self.socket.clone().ok_or_else(|| Error::not_connected(NAME))?;

        let receiver = Receiver {
            socket,
            buffer_size: self.settings.buffer_size,
            timeout: self.settings.timeout,
            framing: self.settings.framing,
            reassembler: FrameReassembler::with_boxed(
                (self.detector)(),
                self.settings.max_frame_size,
            ),
            slot: self.slot.clone(),
            stats: self.stats.clone(),
            handler: Box::new(handler),
        };
        info!(
            "{}: listening on {:?} ({} framing, {} byte buffer)",
            NAME,
            self.local_addr(),
            self.settings.framing,
            self.settings.buffer_size
        );
        self.listener = Some(ListenerTask::spawn(NAME, move |cancel| receiver.run(cancel)));
        Ok(())
    }

    pub async fn stop_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop(STOP_GRACE).await;
        }
    }
}

impl Default for DatagramChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for DatagramChannel {
    fn configure(&mut self, options: TransportConfig) -> Result<()> {
        let merged = self.config.merged(&options);
        let settings = Settings::from_config(&merged)?;
        if self.lifecycle.is_connected() && settings != self.settings {
            debug!("{}: new settings apply on the next connect", NAME);
        }
        self.config = merged;
        self.settings = settings;
        self.lifecycle.configured();
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        self.lifecycle.begin_connect()?;

        let remote = resolve(&self.settings.host, self.settings.port).await?;
        let local_port = self.settings.local_port.unwrap_or(0);
        let bind: SocketAddr = if remote.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, local_port).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, local_port).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        info!(
            "{}: bound {}, sending to {}",
            NAME,
            socket.local_addr()?,
            remote
        );

        self.socket = Some(Arc::new(socket));
        self.remote = Some(remote);
        self.lifecycle.mark_connected();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if !self.lifecycle.is_connected() {
            return Ok(());
        }
        self.stop_listener().await;
        self.socket = None;
        self.remote = None;
        self.lifecycle.mark_disconnected();
        info!("{}: disconnected", NAME);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lifecycle.is_connected()
    }

    fn state(&self) -> ChannelState {
        self.lifecycle.state()
    }

    fn config(&self) -> &TransportConfig {
        &self.config
    }
}

/// Resolves `host:port`, preferring IPv4.
pub(crate) async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::Configuration(format!("host '{}' resolved to no address", host)))
}

async fn recv(
    socket: &UdpSocket,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> std::io::Result<(usize, SocketAddr)> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, socket.recv_from(buf)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no datagram within {:?}", limit),
            )),
        },
        None => socket.recv_from(buf).await,
    }
}

/// State owned by the listener task.
struct Receiver {
    socket: Arc<UdpSocket>,
    buffer_size: usize,
    timeout: Option<Duration>,
    framing: Framing,
    reassembler: FrameReassembler,
    slot: FrameSlot,
    stats: Arc<ReceiveStats>,
    handler: Handler<Delivery>,
}

impl Receiver {
    async fn run(mut self, cancel: CancellationToken) {
        let mut buf = vec![0u8; self.buffer_size];
        let mut report = tokio::time::interval_at(Instant::now() + STATS_INTERVAL, STATS_INTERVAL);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = self.stats.snapshot();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = report.tick() => {
                    let now = self.stats.snapshot();
                    if now != last {
                        log_stats(&now, &last);
                    }
                    last = now;
                }
                result = recv(&self.socket, &mut buf, self.timeout) => match result {
                    Ok((n, src)) => self.accept(&buf[..n], src),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => warn!("{}: receive failed: {}", NAME, e),
                },
            }
        }
        debug!("{}: listener loop exited", NAME);
    }

    fn accept(&mut self, datagram: &[u8], src: SocketAddr) {
        ReceiveStats::bump(&self.stats.datagrams);
        self.stats.bytes.fetch_add(datagram.len() as u64, Ordering::Relaxed);

        match self.framing.classify(datagram) {
            Inbound::Document(document) => {
                ReceiveStats::bump(&self.stats.documents);
                trace!("{}: document from {}", NAME, src);
                dispatch(NAME, &mut self.handler, Delivery::Document(document));
            }
            Inbound::Chunk(chunk) => {
                ReceiveStats::bump(&self.stats.chunks);
                match self.reassembler.push(chunk) {
                    Assembly::Pending => {}
                    Assembly::Complete(frame) => {
                        ReceiveStats::bump(&self.stats.frames);
                        self.slot.publish(frame.clone());
                        dispatch(NAME, &mut self.handler, Delivery::Frame(frame));
                    }
                    Assembly::Overflow { .. } => ReceiveStats::bump(&self.stats.overflows),
                }
            }
            Inbound::Rejected(e) if e.kind() == ErrorKind::Integrity => {
                ReceiveStats::bump(&self.stats.integrity_failures);
                trace!("{}: dropped datagram from {}: {}", NAME, src, e);
                self.reassembler.discard();
            }
            Inbound::Rejected(e) => {
                ReceiveStats::bump(&self.stats.rejected);
                debug!("{}: undecodable document from {}: {}", NAME, src, e);
            }
            Inbound::Unknown(tag) => {
                ReceiveStats::bump(&self.stats.rejected);
                debug!("{}: unknown datagram tag 0x{:02X} from {}", NAME, tag, src);
            }
        }
    }
}

fn log_stats(now: &StatsSnapshot, last: &StatsSnapshot) {
    info!(
        "{}: {} datagrams ({} KiB), {} documents, {} chunks, {} frames (+{} datagrams in {}s)",
        NAME,
        now.datagrams,
        now.bytes / 1024,
        now.documents,
        now.chunks,
        now.frames,
        now.datagrams - last.datagrams,
        STATS_INTERVAL.as_secs()
    );
    info!(
        "{}: {} checksum failures, {} rejected, {} overflows",
        NAME, now.integrity_failures, now.rejected, now.overflows
    );
}
