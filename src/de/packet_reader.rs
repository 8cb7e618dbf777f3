use crate::codec::frame_length;
use crate::error::DecodeError;

/// Accumulates received bytes until complete control packets are available.
pub(crate) struct PacketReader<const N: usize> {
    buffer: [u8; N],
    read_bytes: usize,
}

impl<const N: usize> PacketReader<N> {
    pub fn new() -> Self {
        Self {
            buffer: [0; N],
            read_bytes: 0,
        }
    }

    /// The free space that transport reads should be written into.
    pub fn receive_buffer(&mut self) -> &mut [u8] {
        &mut self.buffer[self.read_bytes..]
    }

    /// Mark `len` bytes of the receive buffer as filled.
    pub fn commit(&mut self, len: usize) {
        self.read_bytes = core::cmp::min(self.read_bytes + len, N);
    }

    /// All buffered bytes, starting at a packet boundary.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[..self.read_bytes]
    }

    /// Determine whether a complete packet is buffered.
    ///
    /// # Returns
    /// The length of the complete packet at the head of the buffer, or `None` if more bytes are
    /// required.
    pub fn probe(&self) -> Result<Option<usize>, DecodeError> {
        match frame_length(self.buffered()) {
            Ok(len) if len > N => Err(DecodeError::PacketTooLarge),
            Ok(len) if len > self.read_bytes => Ok(None),
            Ok(len) => Ok(Some(len)),
            Err(err) if err.is_fatal() => Err(err),
            Err(_) => Ok(None),
        }
    }

    /// Discard the packet of `len` bytes at the head of the buffer.
    pub fn pop_packet(&mut self, len: usize) {
        let len = core::cmp::min(len, self.read_bytes);
        self.buffer.copy_within(len..self.read_bytes, 0);
        self.read_bytes -= len;
    }

    pub fn reset(&mut self) {
        self.read_bytes = 0;
    }
}
