//! Bounded ring buffer and non-blocking TCP stream primitives.
//!
//! This crate is the bottom layer of the relay: it knows nothing about
//! Iproto framing or connection lifecycles, only about moving bytes in and
//! out of sockets without blocking and without copying them more than once.

pub mod buffer;
pub mod stream;

pub use buffer::{BufferPos, RingBuffer, RingBufferError};
pub use stream::{StreamStatus, TcpStream, set_socket_buf_size};
