//! Frame reassembly from integrity-checked chunks.
//!
//! Chunks carry no sequence number, so one growing buffer per stream is all
//! the state there is. After each append a [`FrameDetector`] decides whether
//! the buffer now holds one complete frame.

use std::sync::Arc;

use log::{debug, trace, warn};

/// One complete, independently decodable media unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Monotonic per-reassembler counter, starting at 1.
    pub sequence: u64,
    pub data: Arc<[u8]>,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Recognizes a complete frame at the end of the assembly buffer.
pub trait FrameDetector: Send {
    fn is_complete(&self, buffered: &[u8]) -> bool;
}

/// JPEG end-of-image marker (`FF D9`) terminates the frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegTrailer;

impl JpegTrailer {
    pub const MARKER: [u8; 2] = [0xFF, 0xD9];
}

impl FrameDetector for JpegTrailer {
    fn is_complete(&self, buffered: &[u8]) -> bool {
        buffered.ends_with(&Self::MARKER)
    }
}

/// Check closures, e.g. a full decode attempt.
impl<F> FrameDetector for F
where
    F: Fn(&[u8]) -> bool + Send,
{
    fn is_complete(&self, buffered: &[u8]) -> bool {
        self(buffered)
    }
}

/// Outcome of feeding one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// Accumulating; no frame yet.
    Pending,
    /// A frame was recognized and the buffer reset.
    Complete(Frame),
    /// The bound was exceeded; buffer and chunk were dropped.
    Overflow { discarded: usize },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AssemblyStats {
    pub chunks: u64,
    pub frames: u64,
    /// Buffers cleared because a chunk failed its integrity check.
    pub resets: u64,
    pub overflows: u64,
    pub discarded_bytes: u64,
}

/// Single-stream assembly buffer.
///
/// A dropped chunk leaves an undetectable gap, so [`discard`](Self::discard)
/// must be called whenever a chunk fails verification; the partial frame is
/// thrown away rather than completed with missing bytes.
pub struct FrameReassembler {
    buffer: Vec<u8>,
    max_frame_size: usize,
    detector: Box<dyn FrameDetector>,
    next_sequence: u64,
    stats: AssemblyStats,
}

impl FrameReassembler {
    pub fn new(detector: impl FrameDetector + 'static, max_frame_size: usize) -> Self {
        Self::with_boxed(Box::new(detector), max_frame_size)
    }

    pub fn with_boxed(detector: Box<dyn FrameDetector>, max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size: max_frame_size.max(1),
            detector,
            next_sequence: 1,
            stats: AssemblyStats::default(),
        }
    }

    pub fn jpeg(max_frame_size: usize) -> Self {
        Self::new(JpegTrailer, max_frame_size)
    }

    /// Appends a verified chunk and checks for a complete frame.
    pub fn push(&mut self, chunk: &[u8]) -> Assembly {
        self.stats.chunks += 1;
        if chunk.is_empty() {
            return Assembly::Pending;
        }

        if self.buffer.len() + chunk.len() > self.max_frame_size {
            let discarded = self.buffer.len() + chunk.len();
            warn!(
                "frame exceeds {} bytes without a terminator, dropping {} buffered bytes",
                self.max_frame_size, discarded
            );
            self.buffer.clear();
            self.stats.overflows += 1;
            self.stats.discarded_bytes += discarded as u64;
            return Assembly::Overflow { discarded };
        }

        self.buffer.extend_from_slice(chunk);
        trace!("buffered {} bytes (+{})", self.buffer.len(), chunk.len());

        if !self.detector.is_complete(&self.buffer) {
            return Assembly::Pending;
        }

        let data: Arc<[u8]> = Arc::from(self.buffer.as_slice());
        self.buffer.clear();
        let frame = Frame {
            sequence: self.next_sequence,
            data,
        };
        self.next_sequence += 1;
        self.stats.frames += 1;
        debug!("frame #{} complete ({} bytes)", frame.sequence, frame.len());
        Assembly::Complete(frame)
    }

    /// Drops the partial frame after a chunk was lost. Returns the bytes dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        if dropped > 0 {
            debug!("discarding {} buffered bytes after a dropped chunk", dropped);
            self.stats.discarded_bytes += dropped as u64;
        }
        self.buffer.clear();
        self.stats.resets += 1;
        dropped
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn stats(&self) -> AssemblyStats {
        self.stats
    }
}

impl std::fmt::Debug for FrameReassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReassembler")
            .field("buffered", &self.buffer.len())
            .field("max_frame_size", &self.max_frame_size)
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}
