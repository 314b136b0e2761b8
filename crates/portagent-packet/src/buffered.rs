use std::collections::VecDeque;

use portagent_timing::{Nanos, NtpTimestamp};

use crate::{MAX_PAYLOAD, Packet, PacketError, PacketType};

/// Single-producer accumulator that turns a byte stream into bounded
/// packets.
///
/// Bytes are appended with `push`; the buffer flips READY when the payload
/// reaches `max_payload`, when the configured sentinel appears at the tail,
/// or when `flush_timeout` has elapsed since the first buffered byte.
/// `tick` re-evaluates only the timeout rule so quiescent streams still
/// flush. Drained packets are stamped with the arrival time of their first
/// byte, never the flush time; an overflow remainder retained across a
/// drain keeps the arrival time of its own first byte, not the emitted
/// packet's.
#[derive(Debug)]
pub struct BufferedPacket {
    ty: PacketType,
    max_payload: usize,
    flush_timeout: Nanos,
    sentinel: Option<Vec<u8>>,
    payload: Vec<u8>,
    /// Start offset and arrival time of each push still held in `payload`.
    arrivals: VecDeque<(usize, Nanos)>,
    first_byte_at: Nanos,
    ready: bool,
}

impl BufferedPacket {
    pub fn new(ty: PacketType, max_payload: usize, flush_timeout: Nanos) -> Self {
        Self {
            ty,
            max_payload: max_payload.min(MAX_PAYLOAD),
            flush_timeout,
            sentinel: None,
            payload: Vec::new(),
            arrivals: VecDeque::new(),
            first_byte_at: Nanos::ZERO,
            ready: false,
        }
    }

    pub fn with_sentinel(mut self, sentinel: Vec<u8>) -> Self {
        self.sentinel = Some(sentinel);
        self
    }

    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload.min(MAX_PAYLOAD);
    }

    /// Appends bytes and evaluates the READY transitions, in order: size,
    /// sentinel, timeout.
    pub fn push(&mut self, bytes: &[u8], now: Nanos) {
        if bytes.is_empty() {
            return;
        }
        if self.payload.is_empty() {
            self.first_byte_at = now;
            self.arrivals.clear();
        }
        self.arrivals.push_back((self.payload.len(), now));
        self.payload.extend_from_slice(bytes);

        if self.payload.len() >= self.max_payload {
            self.ready = true;
        } else if let Some(sentinel) = &self.sentinel
            && self.payload.ends_with(sentinel)
        {
            self.ready = true;
        } else if now.elapsed_since(self.first_byte_at) >= self.flush_timeout {
            self.ready = true;
        }
    }

    /// Timeout-only evaluation, called every event-loop iteration.
    pub fn tick(&mut self, now: Nanos) {
        if !self.payload.is_empty() && now.elapsed_since(self.first_byte_at) >= self.flush_timeout
        {
            self.ready = true;
        }
    }

    /// Forces a flush of whatever is buffered; used on shutdown drain.
    pub fn flush(&mut self) {
        if !self.payload.is_empty() {
            self.ready = true;
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Deadline at which the timeout rule would fire, if anything is
    /// buffered. Feeds the event loop's poll timeout.
    pub fn flush_due(&self) -> Option<Nanos> {
        (!self.payload.is_empty()).then(|| self.first_byte_at + self.flush_timeout)
    }

    /// Emits one packet and returns to OPEN. Overflow beyond `max_payload`
    /// is retained for the next packet and is re-stamped with the arrival
    /// time of its own first byte.
    pub fn drain(&mut self) -> Result<Option<Packet>, PacketError> {
        if !self.ready {
            return Ok(None);
        }
        let take = self.payload.len().min(self.max_payload);
        let ts = NtpTimestamp::from_nanos(self.first_byte_at);
        let packet = Packet::build_raw(self.ty, ts, &self.payload[..take])?;
        self.payload.drain(..take);

        // the first retained byte belongs to the last push starting at or
        // before the cut
        let mut tail_at = self.first_byte_at;
        while let Some(&(offset, at)) = self.arrivals.front() {
            if offset > take {
                break;
            }
            tail_at = at;
            self.arrivals.pop_front();
        }
        for entry in &mut self.arrivals {
            entry.0 -= take;
        }
        if !self.payload.is_empty() {
            self.arrivals.push_front((0, tail_at));
            self.first_byte_at = tail_at;
        }

        self.ready = self.payload.len() >= self.max_payload;
        Ok(Some(packet))
    }

    /// Discards buffered bytes, e.g. after a malformed upstream frame.
    pub fn reset(&mut self) {
        self.payload.clear();
        self.arrivals.clear();
        self.ready = false;
    }
}
