//! Byte buffers shared between the transport and the protocol engine
//!
//! Inbound bytes are read through [`InputBuffer`], outbound frames are built in an
//! [`OutputBuffer`] obtained from a [`TransportOutput`].

/// Trait representing a buffer that protocol messages can be read from
pub trait InputBuffer {
    /// Retrieve all current data in the buffer
    fn data(&self) -> &[u8];
    /// Remove `count` bytes from the front of the buffer
    fn pop(&mut self, count: usize);
    /// Retrieve the amount of data currently in the buffer
    fn available(&self) -> usize {
        self.data().len()
    }
}

/// An `InputBuffer` implementation wrapping a slice
pub struct SliceInputBuffer<'a> {
    buffer: &'a [u8],
}

impl<'a> SliceInputBuffer<'a> {
    /// Create a new `SliceInputBuffer` backed by an input byte slice
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }
}

impl<'a> InputBuffer for SliceInputBuffer<'a> {
    fn data(&self) -> &[u8] {
        self.buffer
    }

    fn pop(&mut self, count: usize) {
        let count = count.min(self.buffer.len());
        self.buffer = &self.buffer[count..];
    }
}

#[cfg(any(test, feature = "std"))]
impl InputBuffer for Vec<u8> {
    fn data(&self) -> &[u8] {
        &self[..]
    }

    fn pop(&mut self, count: usize) {
        let count = count.min(self.len());
        self.drain(..count);
    }
}

/// FIFO buffer
///
/// Fixed capacity receive buffer, usable in `static` contexts. Transports fill it from their
/// receive path and hand it to [`Engine::receive`](crate::Engine::receive).
pub struct FifoBuffer<const BUF_SIZE: usize> {
    buffer: [u8; BUF_SIZE],
    used: usize,
}

impl<const BUF_SIZE: usize> FifoBuffer<BUF_SIZE> {
    /// Creates a new, empty buffer
    pub const fn new() -> Self {
        FifoBuffer {
            buffer: [0u8; BUF_SIZE],
            used: 0,
        }
    }

    /// Checks for buffer emptiness
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Return length of currently stored data
    pub fn len(&self) -> usize {
        self.used
    }

    /// Return mutable slice to the non-filled part of the buffer
    pub fn receive_buffer(&mut self) -> &mut [u8] {
        &mut self.buffer[self.used..]
    }

    /// Append as much of `buf` as fits, returning the number of bytes taken
    pub fn extend(&mut self, buf: &[u8]) -> usize {
        let into = self.receive_buffer();
        let n = buf.len().min(into.len());
        into[..n].copy_from_slice(&buf[..n]);
        self.used += n;
        n
    }

    /// Moves the used cursor forward after filling part of `receive_buffer`
    pub fn advance(&mut self, n: usize) {
        self.used = (self.used + n).min(BUF_SIZE);
    }
}

impl<const BUF_SIZE: usize> Default for FifoBuffer<BUF_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BUF_SIZE: usize> InputBuffer for FifoBuffer<BUF_SIZE> {
    fn data(&self) -> &[u8] {
        &self.buffer[..self.used]
    }

    /// Linear in the number of bytes left behind
    fn pop(&mut self, count: usize) {
        let count = count.min(self.used);
        self.buffer.copy_within(count..self.used, 0);
        self.used -= count;
    }
}

/// Trait for output buffers that can accept encoded data
///
/// The buffer supports seeking back to a previously retrieved position, which the framer uses to
/// patch the length byte and checksum the frame it just wrote.
pub trait OutputBuffer {
    /// Append bytes to the buffer
    fn output(&mut self, buf: &[u8]);
    /// Position the next appended byte will land at
    fn position(&self) -> usize;
    /// Replace the byte at `pos` with a new value
    fn update(&mut self, pos: usize, value: u8);
    /// Retrieve a reference to all data appended at or after `pos`
    fn data_since(&self, pos: usize) -> &[u8];
}

/// A scratch pad based `OutputBuffer`
///
/// Uses a statically sized inline buffer. Output past the end is dropped.
pub struct ScratchOutput<const MAX_SIZE: usize = 64> {
    buffer: [u8; MAX_SIZE],
    idx: usize,
}

impl<const MAX_SIZE: usize> ScratchOutput<MAX_SIZE> {
    /// Create a new buffer
    pub const fn new() -> Self {
        Self {
            buffer: [0u8; MAX_SIZE],
            idx: 0,
        }
    }

    /// Retrieve the currently built buffer
    pub fn result(&self) -> &[u8] {
        &self.buffer[..self.idx]
    }

    /// Reset the buffer, clearing it
    pub fn reset(&mut self) {
        self.idx = 0;
    }

    /// Remaining free space
    pub fn remaining(&self) -> usize {
        MAX_SIZE - self.idx
    }
}

impl<const MAX_SIZE: usize> Default for ScratchOutput<MAX_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const MAX_SIZE: usize> OutputBuffer for ScratchOutput<MAX_SIZE> {
    fn output(&mut self, buf: &[u8]) {
        let area = &mut self.buffer[self.idx..];
        let len = buf.len().min(area.len());
        area[..len].copy_from_slice(&buf[..len]);
        self.idx += len;
    }

    fn position(&self) -> usize {
        self.idx
    }

    fn update(&mut self, pos: usize, value: u8) {
        if pos < self.idx {
            self.buffer[pos] = value;
        }
    }

    fn data_since(&self, pos: usize) -> &[u8] {
        self.buffer.get(pos..self.idx).unwrap_or(&[])
    }
}

#[cfg(any(test, feature = "std"))]
impl OutputBuffer for Vec<u8> {
    fn output(&mut self, buf: &[u8]) {
        self.extend_from_slice(buf)
    }

    fn position(&self) -> usize {
        self.len()
    }

    fn update(&mut self, pos: usize, value: u8) {
        if let Some(b) = self.get_mut(pos) {
            *b = value;
        }
    }

    fn data_since(&self, pos: usize) -> &[u8] {
        self.get(pos..).unwrap_or(&[])
    }
}

/// Trait representing the capability to emit a framed message
pub trait TransportOutput {
    /// The type of `OutputBuffer` that will be provided to the caller
    type Output: OutputBuffer;

    /// Request output of a message
    ///
    /// `f` is called with an `OutputBuffer` it appends exactly one frame to. Implementations
    /// decide whether that buffer is a transmit ring, a scratch pad or a socket write.
    fn output(&self, f: impl FnOnce(&mut Self::Output));
}

impl<T> TransportOutput for &T
where
    T: TransportOutput,
{
    type Output = T::Output;
    fn output(&self, f: impl FnOnce(&mut Self::Output)) {
        (*self).output(f)
    }
}
