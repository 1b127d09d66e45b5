//! Latest-frame cell between the receive path and the preview layer.

use std::sync::Arc;

use tokio::sync::watch;

use super::reassembler::Frame;

/// Single-writer cell holding the most recent complete frame.
///
/// Readers never block the writer; a slow reader simply sees the newest frame
/// when it next looks, and may read an unchanged frame repeatedly.
#[derive(Debug, Clone)]
pub struct FrameSlot {
    tx: Arc<watch::Sender<Option<Frame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn publish(&self, frame: Frame) {
        self.tx.send_replace(Some(frame));
    }

    pub fn latest(&self) -> Option<Frame> {
        self.tx.borrow().clone()
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}
