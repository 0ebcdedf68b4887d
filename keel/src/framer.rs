//! Message framing
//!
//! A frame on the wire is `[len][seq][payload...][crc_hi][crc_lo][sync]`. `len` counts the whole
//! frame, `seq` carries the destination tag in its high bits, and the CRC covers everything up to
//! the trailer. The sync byte doubles as a delimiter the framer scans for after corruption.
use crate::buffer::OutputBuffer;
use core::sync::atomic::{AtomicU8, Ordering};

pub const MESSAGE_HEADER_SIZE: usize = 2;
pub const MESSAGE_TRAILER_SIZE: usize = 3;
pub const MESSAGE_MIN: usize = MESSAGE_HEADER_SIZE + MESSAGE_TRAILER_SIZE;
pub const MESSAGE_MAX: usize = 64;
/// Largest payload that fits in a single frame
pub const MESSAGE_PAYLOAD_MAX: usize = MESSAGE_MAX - MESSAGE_MIN;
pub const MESSAGE_SYNC: u8 = 0x7E;
pub const MESSAGE_DEST: u8 = 0x10;
pub const MESSAGE_SEQ_MASK: u8 = 0x0F;

const MESSAGE_POS_LEN: usize = 0;
const MESSAGE_POS_SEQ: usize = 1;
const MESSAGE_TRAILER_CRC: usize = 3;
const MESSAGE_TRAILER_SYNC: usize = 1;

const NEED_SYNC: u8 = 1 << 0;
const NEED_VALID: u8 = 1 << 1;

/// CRC16-CCITT as used by the protocol (reflected 0x1021, initial value 0xFFFF)
pub fn crc16(buf: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for b in buf {
        let b = *b ^ ((crc & 0xFF) as u8);
        let b = b ^ (b << 4);
        let b16 = b as u16;
        crc = (b16 << 8 | crc >> 8) ^ (b16 >> 4) ^ (b16 << 3);
    }
    crc
}

/// Outcome of looking for a frame at the front of the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameStatus {
    /// Not enough bytes buffered to decide
    NoData,
    /// Drop `consumed` bytes; `nak` asks the caller to tell the host to retransmit
    Resync { consumed: usize, nak: bool },
    /// A valid, in-sequence frame of this length starts the buffer
    Block(usize),
}

/// Inbound frame validation and outbound frame construction
///
/// Owns the sequence counter. The host keeps one frame in flight and waits for the ack (carrying
/// the next expected sequence) before moving on, so a single expected value is enough to reject
/// both duplicates and gaps.
pub struct Framer {
    sync_state: AtomicU8,
    next_sequence: AtomicU8,
}

impl Framer {
    pub const fn new() -> Self {
        Self {
            sync_state: AtomicU8::new(0),
            next_sequence: AtomicU8::new(MESSAGE_DEST),
        }
    }

    /// The sequence byte the next inbound frame must carry
    pub fn next_sequence(&self) -> u8 {
        self.next_sequence.load(Ordering::Relaxed)
    }

    /// Validates the frame at the front of `buf`
    pub fn find_block(&self, buf: &[u8]) -> FrameStatus {
        if buf.is_empty() {
            return FrameStatus::NoData;
        }
        if self.sync_state.load(Ordering::Relaxed) & NEED_SYNC != 0 {
            return self.resync(buf);
        }
        if buf.len() < MESSAGE_MIN {
            return FrameStatus::NoData;
        }
        let len = buf[MESSAGE_POS_LEN] as usize;
        if !(MESSAGE_MIN..=MESSAGE_MAX).contains(&len) {
            return self.corrupt(buf);
        }
        let seq = buf[MESSAGE_POS_SEQ];
        if seq & !MESSAGE_SEQ_MASK != MESSAGE_DEST {
            return self.corrupt(buf);
        }
        if buf.len() < len {
            return FrameStatus::NoData;
        }
        if buf[len - MESSAGE_TRAILER_SYNC] != MESSAGE_SYNC {
            return self.corrupt(buf);
        }
        let frame_crc = u16::from_be_bytes([
            buf[len - MESSAGE_TRAILER_CRC],
            buf[len - MESSAGE_TRAILER_CRC + 1],
        ]);
        if frame_crc != crc16(&buf[..len - MESSAGE_TRAILER_SIZE]) {
            return self.corrupt(buf);
        }

        let state = self.sync_state.load(Ordering::Relaxed);
        self.sync_state.store(state & !NEED_VALID, Ordering::Relaxed);
        let expected = self.next_sequence();
        if seq != expected {
            debug!("sequence mismatch got={} want={}", seq, expected);
            return FrameStatus::Resync {
                consumed: len,
                nak: true,
            };
        }
        self.next_sequence.store(
            ((seq + 1) & MESSAGE_SEQ_MASK) | MESSAGE_DEST,
            Ordering::Relaxed,
        );
        FrameStatus::Block(len)
    }

    fn corrupt(&self, buf: &[u8]) -> FrameStatus {
        if buf[0] == MESSAGE_SYNC {
            // Leading sync bytes are just delimiters
            return FrameStatus::Resync {
                consumed: 1,
                nak: false,
            };
        }
        let state = self.sync_state.load(Ordering::Relaxed);
        self.sync_state.store(state | NEED_SYNC, Ordering::Relaxed);
        self.resync(buf)
    }

    fn resync(&self, buf: &[u8]) -> FrameStatus {
        let mut state = self.sync_state.load(Ordering::Relaxed);
        let consumed = match buf.iter().position(|b| *b == MESSAGE_SYNC) {
            Some(n) => {
                state &= !NEED_SYNC;
                n + 1
            }
            None => buf.len(),
        };
        let nak = state & NEED_VALID == 0;
        if nak {
            trace!("framer lost sync, discarding {} bytes", consumed);
        }
        self.sync_state.store(state | NEED_VALID, Ordering::Relaxed);
        FrameStatus::Resync { consumed, nak }
    }

    /// Appends a complete frame around `payload`, stamped with the current sequence
    ///
    /// An empty payload is the ack/nak message. `payload` must not exceed
    /// [`MESSAGE_PAYLOAD_MAX`].
    pub fn write_frame(&self, output: &mut impl OutputBuffer, payload: &[u8]) {
        let start = output.position();
        output.output(&[0, self.next_sequence()]);
        output.output(payload);
        let len = output.data_since(start).len() + MESSAGE_TRAILER_SIZE;
        output.update(start + MESSAGE_POS_LEN, len as u8);
        let crc = crc16(output.data_since(start));
        let [hi, lo] = crc.to_be_bytes();
        output.output(&[hi, lo, MESSAGE_SYNC]);
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

/// Strips header and trailer from a block returned by [`Framer::find_block`]
pub fn payload(block: &[u8]) -> &[u8] {
    block
        .get(MESSAGE_HEADER_SIZE..block.len().saturating_sub(MESSAGE_TRAILER_SIZE))
        .unwrap_or(&[])
}

#[cfg(test)]
pub(crate) fn host_frame(seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0, MESSAGE_DEST | (seq & MESSAGE_SEQ_MASK)];
    out.extend_from_slice(payload);
    out[0] = (out.len() + MESSAGE_TRAILER_SIZE) as u8;
    let crc = crc16(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out.push(MESSAGE_SYNC);
    out
}
