use rmp::encode;

use relay_net::RingBuffer;

use crate::{error::CodecError, iproto};

fn err(e: impl std::fmt::Display) -> CodecError {
    CodecError::malformed(e.to_string())
}

fn encode_uint_kv(payload: &mut Vec<u8>, key: u8, val: u64) -> Result<(), CodecError> {
    encode::write_uint(payload, key as u64).map_err(err)?;
    encode::write_uint(payload, val).map_err(err)?;
    Ok(())
}

fn frame_and_write(out: &mut RingBuffer, payload: &[u8]) -> Result<usize, CodecError> {
    let mut framed = Vec::with_capacity(iproto::SIZE_PREFIX_LEN + payload.len());
    framed.push(iproto::SIZE_PREFIX_MARKER);
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    out.write(&framed).map_err(err)?;
    Ok(framed.len())
}

/// Encodes a synthetic OK (or otherwise successful) response frame into
/// `out`. `tuple_payload`, if given, is a caller-supplied, already-encoded
/// MessagePack array of rows, written verbatim as the body's `TUPLE` value;
/// this codec has no opinion on row shape. Returns the frame's total byte
/// length, mirroring `createMessage`'s contract.
pub fn encode_response(
    out: &mut RingBuffer,
    sync: u32,
    schema_id: u32,
    code: u32,
    tuple_payload: Option<&[u8]>,
) -> Result<usize, CodecError> {
    let mut payload = Vec::new();
    encode::write_map_len(&mut payload, 3).map_err(err)?;
    encode_uint_kv(&mut payload, iproto::header::REQUEST_TYPE, code as u64)?;
    encode_uint_kv(&mut payload, iproto::header::SYNC, sync as u64)?;
    encode_uint_kv(&mut payload, iproto::header::SCHEMA_VERSION, schema_id as u64)?;

    match tuple_payload {
        Some(raw) => {
            encode::write_map_len(&mut payload, 1).map_err(err)?;
            encode::write_uint(&mut payload, iproto::body::TUPLE as u64).map_err(err)?;
            payload.extend_from_slice(raw);
        }
        None => {
            encode::write_map_len(&mut payload, 0).map_err(err)?;
        }
    }

    frame_and_write(out, &payload)
}

/// Encodes a synthetic error response (header code carries `ERROR_BIT |
/// error_code`, body carries the textual message under `ERROR`).
pub fn encode_error_response(
    out: &mut RingBuffer,
    sync: u32,
    schema_id: u32,
    error_code: u32,
    error_string: &str,
) -> Result<usize, CodecError> {
    let mut payload = Vec::new();
    let code = error_code | iproto::code::ERROR_BIT;
    encode::write_map_len(&mut payload, 3).map_err(err)?;
    encode_uint_kv(&mut payload, iproto::header::REQUEST_TYPE, code as u64)?;
    encode_uint_kv(&mut payload, iproto::header::SYNC, sync as u64)?;
    encode_uint_kv(&mut payload, iproto::header::SCHEMA_VERSION, schema_id as u64)?;

    encode::write_map_len(&mut payload, 1).map_err(err)?;
    encode::write_uint(&mut payload, iproto::body::ERROR as u64).map_err(err)?;
    encode::write_str(&mut payload, error_string).map_err(err)?;

    frame_and_write(out, &payload)
}
