use std::{
    collections::VecDeque,
    io::{self, IoSlice},
};

use relay_net::TcpStream;

/// Bytes a previous [`crate::connector::Connector::send_decoded_to_stream`]
/// or `send_encoded_to_client` call could not push into the kernel's send
/// buffer in one shot. Owned (copied once, here) rather than a reference
/// into a `RingBuffer`, because the ring buffer's front may already have
/// been dropped by the time this backlog drains — see the handler contract
/// note on `skipLastDecodedMessage`.
#[derive(Default)]
pub struct SendBacklog {
    pending: VecDeque<u8>,
}

impl SendBacklog {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn enqueue(&mut self, tail: &[u8]) {
        self.pending.extend(tail);
    }

    /// Attempts to drain the backlog into `stream`. Leaves whatever remains
    /// would-block or partially sent for the next writable event.
    pub fn try_flush(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        while !self.pending.is_empty() {
            let (first, second) = self.pending.as_slices();
            let iov = [IoSlice::new(first), IoSlice::new(second)];
            match stream.send(&iov) {
                Ok(0) => break,
                Ok(n) => drop(self.pending.drain(..n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
