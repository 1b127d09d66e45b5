//! TCP peers of a pub/sub channel.
//!
//! Every connection is length-delimited (4-byte big-endian prefix) and each
//! frame is one envelope:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────┐
//! │ topic len u16│ topic (UTF-8)│ BSON document    │
//! └──────────────┴──────────────┴──────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Outbound frames queued per peer before sends start failing.
pub(crate) const PEER_QUEUE: usize = 1024;

pub(crate) type PeerId = u64;

#[derive(Debug)]
pub(crate) struct Incoming {
    pub(crate) peer: PeerId,
    pub(crate) topic: String,
    pub(crate) payload: Bytes,
}

pub(crate) fn encode_envelope(topic: &str, payload: &[u8]) -> Result<Bytes> {
    let topic_len = u16::try_from(topic.len())
        .map_err(|_| Error::Configuration(format!("topic of {} bytes is too long", topic.len())))?;
    let mut out = BytesMut::with_capacity(2 + topic.len() + payload.len());
    out.put_u16(topic_len);
    out.put_slice(topic.as_bytes());
    out.put_slice(payload);
    Ok(out.freeze())
}

pub(crate) fn decode_envelope(mut frame: Bytes) -> Result<(String, Bytes)> {
    if frame.len() < 2 {
        return Err(Error::Decode("envelope shorter than its topic length".into()));
    }
    let topic_len = frame.get_u16() as usize;
    if frame.len() < topic_len {
        return Err(Error::Decode(format!(
            "topic length {} exceeds the {} remaining bytes",
            topic_len,
            frame.len()
        )));
    }
    let topic = frame.split_to(topic_len);
    let topic = String::from_utf8(topic.to_vec()).map_err(|e| Error::Decode(e.to_string()))?;
    Ok((topic, frame))
}

#[derive(Debug)]
struct PeerHandle {
    id: PeerId,
    addr: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
}

/// Connected peers shared by the accept task, peer tasks and senders.
#[derive(Debug, Default)]
pub(crate) struct PeerSet {
    peers: Mutex<Vec<PeerHandle>>,
    next_id: AtomicU64,
    cursor: AtomicUsize,
}

impl PeerSet {
    fn lock(&self) -> MutexGuard<'_, Vec<PeerHandle>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, addr: SocketAddr, outbound: mpsc::Sender<Bytes>) -> PeerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().push(PeerHandle { id, addr, outbound });
        id
    }

    fn remove(&self, id: PeerId) {
        self.lock().retain(|p| p.id != id);
    }

    pub(crate) fn count(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    /// Queues `frame` for every peer; returns how many accepted it.
    ///
    /// A peer whose queue is full misses this frame.
    pub(crate) fn broadcast(&self, frame: &Bytes) -> usize {
        let peers = self.lock();
        let mut delivered = 0;
        for peer in peers.iter() {
            match peer.outbound.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("peer {} ({}) is not keeping up, frame dropped", peer.id, peer.addr)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Queues `frame` for the next peer in rotation.
    pub(crate) fn send_next(&self, frame: Bytes) -> Result<PeerId> {
        let peers = self.lock();
        if peers.is_empty() {
            return Err(no_peer());
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..peers.len() {
            let peer = &peers[(start + offset) % peers.len()];
            if peer.outbound.try_send(frame.clone()).is_ok() {
                return Ok(peer.id);
            }
        }
        Err(Error::Unavailable("every peer queue is full or closed".into()))
    }

    pub(crate) fn send_to(&self, id: PeerId, frame: Bytes) -> Result<()> {
        let peers = self.lock();
        let peer = peers
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::Unavailable(format!("peer {} has disconnected", id)))?;
        peer.outbound
            .try_send(frame)
            .map_err(|e| Error::Unavailable(format!("peer {} cannot take the message: {}", id, e)))
    }
}

fn no_peer() -> Error {
    Error::Transport(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "no connected peer",
    ))
}

/// Delivery filter installed on every new peer before it reads anything.
#[derive(Debug, Clone)]
pub(crate) enum Filter {
    All,
    Prefix(String),
    /// Outbound-only sockets discard whatever arrives.
    Nothing,
}

impl Filter {
    fn accepts(&self, topic: &str) -> bool {
        match self {
            Filter::All => true,
            Filter::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            Filter::Nothing => false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PeerContext {
    pub(crate) peers: Arc<PeerSet>,
    pub(crate) inbox: mpsc::Sender<Incoming>,
    pub(crate) filter: Filter,
    pub(crate) cancel: CancellationToken,
}

/// Registers `stream` and runs its read/write loop on a new task.
///
/// Inbound messages never wait for inbox space, so a slow consumer cannot
/// hold up frames queued for this peer.
pub(crate) fn spawn_peer(stream: TcpStream, ctx: PeerContext) -> Result<PeerId> {
    let addr = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let (outbound, mut queue) = mpsc::channel::<Bytes>(PEER_QUEUE);
    let id = ctx.peers.add(addr, outbound);
    debug!("peer {} connected from {}", id, addr);

    tokio::spawn(async move {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                next = queue.recv() => match next {
                    Some(frame) => {
                        if let Err(e) = framed.send(frame).await {
                            warn!("peer {}: send failed: {}", id, e);
                            break;
                        }
                    }
                    None => break,
                },
                incoming = framed.next() => match incoming {
                    Some(Ok(frame)) => {
                        let (topic, payload) = match decode_envelope(frame.freeze()) {
                            Ok(parts) => parts,
                            Err(e) => {
                                warn!("peer {}: {}", id, e);
                                continue;
                            }
                        };
                        if !ctx.filter.accepts(&topic) {
                            trace!("peer {}: filtered topic '{}'", id, topic);
                            continue;
                        }
                        let message = Incoming { peer: id, topic, payload };
                        match ctx.inbox.try_send(message) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(message)) => {
                                warn!("peer {}: inbox full, '{}' dropped", id, message.topic)
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    }
                    Some(Err(e)) => {
                        warn!("peer {}: receive failed: {}", id, e);
                        break;
                    }
                    None => break,
                },
            }
        }
        ctx.peers.remove(id);
        debug!("peer {} ({}) closed", id, addr);
    });

    Ok(id)
}

/// Accepts connections until cancelled.
pub(crate) fn spawn_acceptor(listener: TcpListener, ctx: PeerContext) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        if let Err(e) = spawn_peer(stream, ctx.clone()) {
                            warn!("dropping incoming connection: {}", e);
                        }
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
            }
        }
        debug!("acceptor stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_envelope_layout() {
        let frame = encode_envelope("telemetry", b"\xA0").unwrap();
        assert_eq!(&frame[..2], &[0x00, 0x09]);
        assert_eq!(&frame[2..11], b"telemetry");

        let (topic, payload) = decode_envelope(frame).unwrap();
        assert_eq!(topic, "telemetry");
        assert_eq!(&payload[..], b"\xA0");
    }

    #[test]
    fn test_malformed_envelopes() {
        assert!(decode_envelope(Bytes::from_static(&[0x00])).is_err());
        assert!(decode_envelope(Bytes::from_static(&[0x00, 0x05, b'a'])).is_err());
        assert!(decode_envelope(Bytes::from_static(&[0x00, 0x01, 0xFF])).is_err());
        assert!(encode_envelope(&"t".repeat(70_000), b"").is_err());
    }

    #[test]
    fn test_filters() {
        assert!(Filter::All.accepts("anything"));
        assert!(Filter::Prefix("sensor/".into()).accepts("sensor/temp"));
        assert!(!Filter::Prefix("sensor/".into()).accepts("control/stop"));
        assert!(Filter::Prefix(String::new()).accepts(""));
        assert!(!Filter::Nothing.accepts("sensor/temp"));
    }

    #[test]
    fn test_round_robin_and_fanout() {
        let peers = PeerSet::default();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = peers.add(addr, tx_a);
        let b = peers.add(addr, tx_b);

        let first = peers.send_next(Bytes::from_static(b"1")).unwrap();
        let second = peers.send_next(Bytes::from_static(b"2")).unwrap();
        assert_ne!(first, second);
        assert!([a, b].contains(&first) && [a, b].contains(&second));

        assert_eq!(peers.broadcast(&Bytes::from_static(b"all")), 2);
        assert_eq!(rx_a.try_recv().is_ok() as u8 + rx_b.try_recv().is_ok() as u8, 2);

        peers.send_to(b, Bytes::from_static(b"direct")).unwrap();
        peers.remove(a);
        assert_eq!(peers.count(), 1);
        assert_eq!(peers.send_to(a, Bytes::new()).unwrap_err().kind(), ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_full_inbox_does_not_stall_outbound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (local, _) = listener.accept().await.unwrap();

        let peers = Arc::new(PeerSet::default());
        let (inbox, mut inbox_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let ctx = PeerContext {
            peers: peers.clone(),
            inbox,
            filter: Filter::All,
            cancel: cancel.clone(),
        };
        let id = spawn_peer(local, ctx).unwrap();

        let mut remote = Framed::new(remote, LengthDelimitedCodec::new());
        for n in 0..3u8 {
            remote.send(encode_envelope("t", &[n]).unwrap()).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        peers.send_to(id, Bytes::from_static(b"reply")).unwrap();
        let reply = tokio::time::timeout(std::time::Duration::from_secs(2), remote.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..], b"reply");

        // Only the first message fit; the rest were dropped, not queued.
        assert_eq!(&inbox_rx.recv().await.unwrap().payload[..], &[0]);
        assert!(inbox_rx.try_recv().is_err());
        assert_eq!(peers.count(), 1);
        cancel.cancel();
    }

    #[test]
    fn test_no_peer_is_transport_error() {
        let peers = PeerSet::default();
        let err = peers.send_next(Bytes::from_static(b"x")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_retryable());
        assert_eq!(peers.broadcast(&Bytes::from_static(b"x")), 0);
    }
}
