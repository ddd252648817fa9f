//! Wire-level Iproto constants. Values match Tarantool's own protocol
//! numbering, not anything invented for this codec.

/// The 5-byte size prefix is always this fixed-width encoding, never the
/// shorter positive-fixint/uint8/uint16 MessagePack forms a generic encoder
/// might otherwise choose for a small length.
pub const SIZE_PREFIX_MARKER: u8 = 0xCE;
pub const SIZE_PREFIX_LEN: usize = 5;

pub const GREETING_LEN: usize = 128;
pub const GREETING_LINE_LEN: usize = 64;

/// Header map keys.
pub mod header {
    pub const REQUEST_TYPE: u8 = 0x00;
    pub const SYNC: u8 = 0x01;
    pub const SCHEMA_VERSION: u8 = 0x05;
}

/// Body map keys.
pub mod body {
    pub const SPACE_ID: u8 = 0x10;
    pub const INDEX_ID: u8 = 0x11;
    pub const LIMIT: u8 = 0x12;
    pub const OFFSET: u8 = 0x13;
    pub const ITERATOR: u8 = 0x14;
    pub const KEY: u8 = 0x20;
    pub const TUPLE: u8 = 0x21;
    /// Conventional `IPROTO_ERROR` key carrying the textual error message on
    /// an error response.
    pub const ERROR: u8 = 0x31;
}

/// Request/response type codes carried in `header::REQUEST_TYPE`.
pub mod code {
    pub const OK: u32 = 0x00;
    pub const SELECT: u32 = 0x01;
    pub const INSERT: u32 = 0x02;
    pub const REPLACE: u32 = 0x03;
    pub const UPDATE: u32 = 0x04;
    pub const DELETE: u32 = 0x05;
    pub const PING: u32 = 0x40;

    /// Set on the response code when the request failed; the low 15 bits
    /// are the Tarantool error code.
    pub const ERROR_BIT: u32 = 0x8000;
}

#[inline]
pub fn is_error_code(code: u32) -> bool {
    code & code::ERROR_BIT != 0
}
