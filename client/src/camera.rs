//! Synthetic camera producing JPEG-shaped frames.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

pub struct SyntheticCamera {
    rng: StdRng,
    min_len: usize,
    max_len: usize,
}

impl SyntheticCamera {
    pub fn new(min_len: usize, max_len: usize) -> Self {
        Self::with_rng(StdRng::from_entropy(), min_len, max_len)
    }

    pub fn with_rng(rng: StdRng, min_len: usize, max_len: usize) -> Self {
        let min_len = min_len.max(SOI.len() + EOI.len());
        Self {
            rng,
            min_len,
            max_len: max_len.max(min_len),
        }
    }

    /// SOI marker, noise body, EOI marker. The body never contains 0xFF so
    /// the trailer appears exactly once.
    pub fn capture(&mut self) -> Vec<u8> {
        let len = self.rng.gen_range(self.min_len..=self.max_len);
        let mut frame = vec![0u8; len];
        frame[..2].copy_from_slice(&SOI);
        let body_end = len - EOI.len();
        self.rng.fill(&mut frame[2..body_end]);
        for byte in &mut frame[2..body_end] {
            if *byte == 0xFF {
                *byte = 0xFE;
            }
        }
        frame[body_end..].copy_from_slice(&EOI);
        frame
    }
}
