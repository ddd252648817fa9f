use std::io::Read;

use rmp::Marker;

use crate::{cursor::BufCursor, error::CodecError};

fn read_exact_arr<const N: usize>(cursor: &mut BufCursor) -> Result<[u8; N], CodecError> {
    let mut buf = [0u8; N];
    cursor.read_exact(&mut buf).map_err(|e| CodecError::malformed(e.to_string()))?;
    Ok(buf)
}

pub(crate) fn read_marker(cursor: &mut BufCursor) -> Result<Marker, CodecError> {
    let [byte] = read_exact_arr::<1>(cursor)?;
    Ok(Marker::from_u8(byte))
}

fn skip_bytes(cursor: &mut BufCursor, mut n: usize) -> Result<(), CodecError> {
    let mut scratch = [0u8; 256];
    while n > 0 {
        let take = n.min(scratch.len());
        cursor.read_exact(&mut scratch[..take]).map_err(|e| CodecError::malformed(e.to_string()))?;
        n -= take;
    }
    Ok(())
}

fn skip_ext(cursor: &mut BufCursor, data_len: usize) -> Result<(), CodecError> {
    read_exact_arr::<1>(cursor)?; // ext type byte
    skip_bytes(cursor, data_len)
}

fn skip_n_values(cursor: &mut BufCursor, n: usize) -> Result<(), CodecError> {
    for _ in 0..n {
        skip_value(cursor)?;
    }
    Ok(())
}

/// Walks past one complete MessagePack value without materializing it,
/// relying only on each type's self-describing length. This is the
/// mechanism that lets the codec locate key/tuple sub-ranges as plain
/// `(first, last)` buffer positions instead of parsing their contents.
pub(crate) fn skip_value(cursor: &mut BufCursor) -> Result<(), CodecError> {
    match read_marker(cursor)? {
        Marker::Null | Marker::True | Marker::False => Ok(()),
        Marker::FixPos(_) | Marker::FixNeg(_) => Ok(()),
        Marker::U8 | Marker::I8 => read_exact_arr::<1>(cursor).map(|_| ()),
        Marker::U16 | Marker::I16 => read_exact_arr::<2>(cursor).map(|_| ()),
        Marker::U32 | Marker::I32 | Marker::F32 => read_exact_arr::<4>(cursor).map(|_| ()),
        Marker::U64 | Marker::I64 | Marker::F64 => read_exact_arr::<8>(cursor).map(|_| ()),
        Marker::FixStr(len) => skip_bytes(cursor, len as usize),
        Marker::Str8 | Marker::Bin8 => {
            let [n] = read_exact_arr::<1>(cursor)?;
            skip_bytes(cursor, n as usize)
        }
        Marker::Str16 | Marker::Bin16 => {
            let n = u16::from_be_bytes(read_exact_arr::<2>(cursor)?);
            skip_bytes(cursor, n as usize)
        }
        Marker::Str32 | Marker::Bin32 => {
            let n = u32::from_be_bytes(read_exact_arr::<4>(cursor)?);
            skip_bytes(cursor, n as usize)
        }
        Marker::FixArray(len) => skip_n_values(cursor, len as usize),
        Marker::Array16 => {
            let n = u16::from_be_bytes(read_exact_arr::<2>(cursor)?);
            skip_n_values(cursor, n as usize)
        }
        Marker::Array32 => {
            let n = u32::from_be_bytes(read_exact_arr::<4>(cursor)?);
            skip_n_values(cursor, n as usize)
        }
        Marker::FixMap(len) => skip_n_values(cursor, 2 * len as usize),
        Marker::Map16 => {
            let n = u16::from_be_bytes(read_exact_arr::<2>(cursor)?);
            skip_n_values(cursor, 2 * n as usize)
        }
        Marker::Map32 => {
            let n = u32::from_be_bytes(read_exact_arr::<4>(cursor)?);
            skip_n_values(cursor, 2 * n as usize)
        }
        Marker::FixExt1 => skip_ext(cursor, 1),
        Marker::FixExt2 => skip_ext(cursor, 2),
        Marker::FixExt4 => skip_ext(cursor, 4),
        Marker::FixExt8 => skip_ext(cursor, 8),
        Marker::FixExt16 => skip_ext(cursor, 16),
        Marker::Ext8 => {
            let [n] = read_exact_arr::<1>(cursor)?;
            skip_ext(cursor, n as usize)
        }
        Marker::Ext16 => {
            let n = u16::from_be_bytes(read_exact_arr::<2>(cursor)?);
            skip_ext(cursor, n as usize)
        }
        Marker::Ext32 => {
            let n = u32::from_be_bytes(read_exact_arr::<4>(cursor)?);
            skip_ext(cursor, n as usize)
        }
        Marker::Reserved => Err(CodecError::malformed("reserved messagepack marker")),
    }
}

/// Reads a non-negative integer scalar (fixint/u8/u16/u32/u64), the shape
/// used for every header field and the body's small integer fields.
pub(crate) fn read_uint(cursor: &mut BufCursor) -> Result<u64, CodecError> {
    match read_marker(cursor)? {
        Marker::FixPos(v) => Ok(v as u64),
        Marker::U8 => Ok(read_exact_arr::<1>(cursor)?[0] as u64),
        Marker::U16 => Ok(u16::from_be_bytes(read_exact_arr::<2>(cursor)?) as u64),
        Marker::U32 => Ok(u32::from_be_bytes(read_exact_arr::<4>(cursor)?) as u64),
        Marker::U64 => Ok(u64::from_be_bytes(read_exact_arr::<8>(cursor)?)),
        other => Err(CodecError::malformed(format!("expected unsigned int, got {other:?}"))),
    }
}

/// Reads a map header and returns its entry count (not byte-pair count).
pub(crate) fn read_map_len(cursor: &mut BufCursor) -> Result<u32, CodecError> {
    match read_marker(cursor)? {
        Marker::FixMap(len) => Ok(len as u32),
        Marker::Map16 => Ok(u16::from_be_bytes(read_exact_arr::<2>(cursor)?) as u32),
        Marker::Map32 => Ok(u32::from_be_bytes(read_exact_arr::<4>(cursor)?)),
        other => Err(CodecError::malformed(format!("expected map, got {other:?}"))),
    }
}

/// Reads a UTF-8 string scalar (used for `error_string`).
pub(crate) fn read_str(cursor: &mut BufCursor) -> Result<String, CodecError> {
    let len = match read_marker(cursor)? {
        Marker::FixStr(len) => len as usize,
        Marker::Str8 => read_exact_arr::<1>(cursor)?[0] as usize,
        Marker::Str16 => u16::from_be_bytes(read_exact_arr::<2>(cursor)?) as usize,
        Marker::Str32 => u32::from_be_bytes(read_exact_arr::<4>(cursor)?) as usize,
        other => return Err(CodecError::malformed(format!("expected string, got {other:?}"))),
    };
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes).map_err(|e| CodecError::malformed(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| CodecError::malformed(e.to_string()))
}
