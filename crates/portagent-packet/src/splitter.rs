use tracing::warn;

use crate::{HEADER_SIZE, SYNC, packet::SIZE_OFFSET};

/// Splits a byte stream that carries back-to-back pre-framed packets (the
/// DIGI data channel) into whole frames.
///
/// Garbage between frames is discarded up to the next sync pattern; a sync
/// with an impossible size field is treated as garbage too.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    acc: Vec<u8>,
}

impl FrameSplitter {
    pub fn push(&mut self, bytes: &[u8]) {
        self.acc.extend_from_slice(bytes);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.acc.is_empty()
    }

    /// Pops the next complete frame, resyncing past any leading garbage.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            self.resync();
            if self.acc.len() < HEADER_SIZE {
                return None;
            }
            let size =
                u16::from_be_bytes([self.acc[SIZE_OFFSET], self.acc[SIZE_OFFSET + 1]]) as usize;
            if size < HEADER_SIZE {
                warn!(size, "frame size below header size, discarding sync");
                self.acc.drain(..SYNC.len());
                continue;
            }
            if self.acc.len() < size {
                return None;
            }
            let frame = self.acc.drain(..size).collect();
            return Some(frame);
        }
    }

    /// Drops bytes until the buffer starts with the sync pattern (or with a
    /// prefix of it at the tail, which may still complete).
    fn resync(&mut self) {
        let mut dropped = 0usize;
        while !self.acc.is_empty() {
            let head = &self.acc[dropped..];
            if head.is_empty() {
                break;
            }
            let keep = SYNC.len().min(head.len());
            if head[..keep] == SYNC[..keep] {
                break;
            }
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "discarded bytes while hunting for frame sync");
            self.acc.drain(..dropped);
        }
    }
}
