//! Chunk integrity trailer.
//!
//! Reflected CRC-32 (polynomial `0xEDB88320`, init and xor-out `!0`), i.e. the
//! value zlib's `crc32` returns, written big-endian after the chunk.
//!
//! ```rust
//! use xlink::Crc32;
//!
//! let trailer = Crc32::trailer(b"123456789");
//! assert_eq!(trailer, [0xCB, 0xF4, 0x39, 0x26]);
//! assert_eq!(Crc32::read_trailer(trailer), Crc32::compute(b"123456789"));
//! ```

/// Size of the big-endian checksum trailer appended to every chunk.
pub const CHECKSUM_LEN: usize = 4;

const REFLECTED_POLY: u32 = 0xEDB8_8320;

static TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < table.len() {
        let mut value = n as u32;
        let mut bit = 0;
        while bit < 8 {
            let carry = value & 1;
            value >>= 1;
            if carry == 1 {
                value ^= REFLECTED_POLY;
            }
            bit += 1;
        }
        table[n] = value;
        n += 1;
    }
    table
};

/// Running checksum; feed chunks in order, then take [`value`](Self::value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc32(u32);

impl Default for Crc32 {
    fn default() -> Self {
        Crc32(!0)
    }
}

impl Crc32 {
    pub fn feed(self, bytes: &[u8]) -> Self {
        let state = bytes.iter().fold(self.0, |state, &byte| {
            TABLE[usize::from(state as u8 ^ byte)] ^ (state >> 8)
        });
        Crc32(state)
    }

    pub fn value(self) -> u32 {
        !self.0
    }

    pub fn compute(bytes: &[u8]) -> u32 {
        Crc32::default().feed(bytes).value()
    }

    pub fn trailer(bytes: &[u8]) -> [u8; CHECKSUM_LEN] {
        Self::compute(bytes).to_be_bytes()
    }

    pub fn read_trailer(trailer: [u8; CHECKSUM_LEN]) -> u32 {
        u32::from_be_bytes(trailer)
    }
}
