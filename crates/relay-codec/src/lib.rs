//! Iproto framing: the 5-byte size prefix, greeting recognition, and the
//! header/body map decoder, layered directly on `relay-net`'s `RingBuffer`.
//!
//! Payloads (keys, tuples) are never copied here — the decoder only walks
//! far enough to know where each value ends, leaving `Tuple::decode` to
//! materialize the bytes the handler actually asks for.

mod codec;
mod cursor;
mod encode;
mod error;
mod greeting;
pub mod iproto;
mod message;
mod skip;

pub use codec::{decode_message, decode_message_size};
pub use encode::{encode_error_response, encode_response};
pub use error::{CodecError, Decoded};
pub use greeting::{Greeting, decode_greeting, encode_greeting};
pub use message::{Body, Header, Message, Tuple};
