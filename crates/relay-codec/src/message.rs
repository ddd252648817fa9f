use relay_net::{BufferPos, RingBuffer};
use serde::de::DeserializeOwned;

use crate::error::CodecError;

/// Parsed header map: `{REQUEST_TYPE, SYNC, SCHEMA_VERSION?}`.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub code: u32,
    pub sync: u32,
    pub schema_id: Option<u32>,
}

impl Header {
    #[inline]
    pub fn is_error(&self) -> bool {
        crate::iproto::is_error_code(self.code)
    }
}

/// A pair of buffer iterators bracketing an undecoded MessagePack value
/// (a key tuple or a data tuple). Bytes are never copied at decode time;
/// [`Tuple::decode`] replays the range through MessagePack only when the
/// handler actually asks for it.
#[derive(Debug, Clone, Copy)]
pub struct Tuple {
    pub first: BufferPos,
    pub last: BufferPos,
}

impl Tuple {
    pub fn len(&self) -> usize {
        self.first.distance_to(self.last)
    }

    pub fn is_empty(&self) -> bool {
        self.first == self.last
    }

    /// Materializes the tuple's bytes against `buf` and deserializes them
    /// as `T`. The only point at which this sub-range is actually copied.
    pub fn decode<T: DeserializeOwned>(&self, buf: &RingBuffer) -> Result<T, CodecError> {
        let len = self.len();
        let mut bytes = vec![0u8; len];
        let n = buf.read_at(self.first, &mut bytes);
        if n != len {
            return Err(CodecError::malformed("tuple range no longer present in buffer"));
        }
        rmp_serde::from_slice(&bytes).map_err(|e| CodecError::malformed(e.to_string()))
    }
}

/// Scalar fields and payload ranges parsed from the body map. A given
/// message only ever populates the fields relevant to its code; the rest
/// stay `None`. Unknown body keys are skipped and not represented here at
/// all, matching the wire contract that they pass through uninspected.
#[derive(Debug, Clone, Copy, Default)]
pub struct Body {
    pub space_id: Option<u32>,
    pub index_id: Option<u32>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub iterator: Option<u32>,
    pub key: Option<Tuple>,
    pub tuple: Option<Tuple>,
    /// Present only on error responses (`header.is_error()`); derived from
    /// the header code's low 15 bits, not a separate body key.
    pub error_code: Option<u32>,
    pub error_string: Option<String>,
}

/// A decoded message together with its body, returned by
/// [`crate::codec::decode_message`].
#[derive(Debug, Clone, Copy)]
pub struct Message {
    pub size: usize,
    pub header: Header,
    pub body: Body,
}
