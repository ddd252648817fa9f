use relay_net::{BufferPos, RingBuffer};

use crate::{
    cursor::BufCursor,
    error::{CodecError, Decoded},
    iproto,
    message::{Body, Header, Message, Tuple},
    skip::{read_map_len, read_str, read_uint, skip_value},
};

/// Reads the 5-byte size prefix at `pos` and returns the *total* frame size
/// (prefix included), or `NeedMore` if fewer than 5 bytes are available yet.
pub fn decode_message_size(buf: &RingBuffer, pos: BufferPos) -> Result<Decoded<usize>, CodecError> {
    if !buf.has(pos, iproto::SIZE_PREFIX_LEN) {
        return Ok(Decoded::NeedMore);
    }
    let mut prefix = [0u8; iproto::SIZE_PREFIX_LEN];
    buf.read_at(pos, &mut prefix);
    if prefix[0] != iproto::SIZE_PREFIX_MARKER {
        return Err(CodecError::malformed(format!(
            "expected 0x{:02x} size marker, got 0x{:02x}",
            iproto::SIZE_PREFIX_MARKER,
            prefix[0]
        )));
    }
    let payload_size = u32::from_be_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]) as usize;
    Ok(Decoded::Ready(iproto::SIZE_PREFIX_LEN + payload_size))
}

/// Decodes the header and body maps of a frame whose full `total` bytes are
/// already known to be present (the caller checked `has(pos, total)`).
pub fn decode_message(buf: &RingBuffer, pos: BufferPos, total: usize) -> Result<Message, CodecError> {
    let mut cursor = BufCursor::new(buf, pos.advance(iproto::SIZE_PREFIX_LEN));
    let header = decode_header(&mut cursor)?;
    let mut body = decode_body(&mut cursor)?;
    if header.is_error() {
        body.error_code = Some(header.code & !iproto::code::ERROR_BIT);
    }

    let expected_end = pos.advance(total);
    if cursor.pos() != expected_end {
        return Err(CodecError::malformed(
            "declared frame size did not match parsed header+body length",
        ));
    }

    Ok(Message { size: total, header, body })
}

fn decode_header(cursor: &mut BufCursor) -> Result<Header, CodecError> {
    let len = read_map_len(cursor)?;
    let mut code = None;
    let mut sync = None;
    let mut schema_id = None;
    for _ in 0..len {
        let key = read_uint(cursor)? as u8;
        match key {
            iproto::header::REQUEST_TYPE => code = Some(read_uint(cursor)? as u32),
            iproto::header::SYNC => sync = Some(read_uint(cursor)? as u32),
            iproto::header::SCHEMA_VERSION => schema_id = Some(read_uint(cursor)? as u32),
            _ => skip_value(cursor)?,
        }
    }
    Ok(Header {
        code: code.ok_or_else(|| CodecError::malformed("header missing REQUEST_TYPE"))?,
        sync: sync.unwrap_or(0),
        schema_id,
    })
}

fn decode_body(cursor: &mut BufCursor) -> Result<Body, CodecError> {
    let len = read_map_len(cursor)?;
    let mut body = Body::default();
    for _ in 0..len {
        let key = read_uint(cursor)? as u8;
        match key {
            iproto::body::SPACE_ID => body.space_id = Some(read_uint(cursor)? as u32),
            iproto::body::INDEX_ID => body.index_id = Some(read_uint(cursor)? as u32),
            iproto::body::LIMIT => body.limit = Some(read_uint(cursor)? as u32),
            iproto::body::OFFSET => body.offset = Some(read_uint(cursor)? as u32),
            iproto::body::ITERATOR => body.iterator = Some(read_uint(cursor)? as u32),
            iproto::body::KEY => body.key = Some(capture_tuple(cursor)?),
            iproto::body::TUPLE => body.tuple = Some(capture_tuple(cursor)?),
            iproto::body::ERROR => body.error_string = Some(read_str(cursor)?),
            _ => skip_value(cursor)?,
        }
    }
    Ok(body)
}

fn capture_tuple(cursor: &mut BufCursor) -> Result<Tuple, CodecError> {
    let first = cursor.pos();
    skip_value(cursor)?;
    let last = cursor.pos();
    Ok(Tuple { first, last })
}
