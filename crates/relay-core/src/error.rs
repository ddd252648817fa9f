use std::{io, sync::Arc};

use thiserror::Error;

/// Per-connection fatal error, recorded on [`crate::Connection::error`] the
/// moment it happens and checked by the event loop once dispatch returns
/// (spec.md: "per-connection errors are recorded on the Connection's error
/// slot and cause that Connection to close"). `Io` wraps an `Arc<io::Error>`
/// rather than `io::Error` directly so this type can be `Clone` — a send or
/// recv failure needs to both propagate to its immediate caller and be
/// stashed in the error slot for the event loop to observe afterward.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(Arc<io::Error>),
    #[error("protocol error: {0}")]
    Protocol(#[from] relay_codec::CodecError),
    #[error("ring buffer exhausted: {0}")]
    BufferFull(#[from] relay_net::RingBufferError),
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        ConnectionError::Io(Arc::new(e))
    }
}
