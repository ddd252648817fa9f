use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CodecError {
    #[error("malformed iproto frame: {reason}")]
    Malformed { reason: String },
}

impl CodecError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        CodecError::Malformed { reason: reason.into() }
    }
}

/// Outcome of a decode attempt that may legitimately need more bytes. Kept
/// separate from [`CodecError`] because "need more" is an expected, frequent
/// result on a live stream, not a fault.
#[derive(Debug)]
pub enum Decoded<T> {
    Ready(T),
    NeedMore,
}
