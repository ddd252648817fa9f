use std::io;

use relay_net::{BufferPos, RingBuffer};

/// A `std::io::Read` adapter over a [`RingBuffer`] that advances its own
/// position as bytes are consumed, without borrowing the buffer's blocks
/// directly (each `read` call copies through [`RingBuffer::read_at`]).
///
/// Used to drive `rmp`'s decode functions directly against buffer contents
/// that may be split across multiple non-contiguous blocks.
pub struct BufCursor<'a> {
    buf: &'a RingBuffer,
    pos: BufferPos,
}

impl<'a> BufCursor<'a> {
    pub fn new(buf: &'a RingBuffer, pos: BufferPos) -> Self {
        Self { buf, pos }
    }

    #[inline]
    pub fn pos(&self) -> BufferPos {
        self.pos
    }
}

impl io::Read for BufCursor<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.buf.read_at(self.pos, out);
        self.pos = self.pos.advance(n);
        Ok(n)
    }
}
