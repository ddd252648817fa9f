use relay_net::{BufferPos, RingBuffer};

use crate::{error::CodecError, iproto};

/// The 128-byte banner every Iproto stream sends exactly once, before any
/// framed traffic: a 64-byte version line followed by a 64-byte base64 salt
/// line, each newline-terminated within its 64 bytes.
#[derive(Debug, Clone)]
pub struct Greeting {
    pub version: String,
    pub salt: String,
}

fn line_text(line: &[u8; iproto::GREETING_LINE_LEN]) -> String {
    let end = line.iter().position(|&b| b == b'\n').unwrap_or(line.len());
    String::from_utf8_lossy(&line[..end]).trim_end().to_string()
}

/// Decodes the 128-byte greeting at `pos`, if present. Callers check
/// `buf.has(pos, GREETING_LEN)` first; this never returns `NeedMore` itself.
pub fn decode_greeting(buf: &RingBuffer, pos: BufferPos) -> Result<Greeting, CodecError> {
    let mut raw = [0u8; iproto::GREETING_LEN];
    let n = buf.read_at(pos, &mut raw);
    if n != iproto::GREETING_LEN {
        return Err(CodecError::malformed("greeting truncated"));
    }
    let mut version_line = [0u8; iproto::GREETING_LINE_LEN];
    let mut salt_line = [0u8; iproto::GREETING_LINE_LEN];
    version_line.copy_from_slice(&raw[..iproto::GREETING_LINE_LEN]);
    salt_line.copy_from_slice(&raw[iproto::GREETING_LINE_LEN..]);
    Ok(Greeting { version: line_text(&version_line), salt: line_text(&salt_line) })
}

/// Encodes a synthetic greeting, padding each line with spaces up to 63
/// characters and terminating it with `\n`, matching the wire layout a real
/// Tarantool instance produces.
pub fn encode_greeting(version: &str, salt: &str) -> Result<[u8; iproto::GREETING_LEN], CodecError> {
    let mut out = [0u8; iproto::GREETING_LEN];
    write_line(&mut out[..iproto::GREETING_LINE_LEN], version)?;
    write_line(&mut out[iproto::GREETING_LINE_LEN..], salt)?;
    Ok(out)
}

fn write_line(dst: &mut [u8], text: &str) -> Result<(), CodecError> {
    const PAD_LEN: usize = iproto::GREETING_LINE_LEN - 1;
    if text.len() > PAD_LEN {
        return Err(CodecError::malformed(format!(
            "greeting line {text:?} exceeds {PAD_LEN} characters"
        )));
    }
    dst.fill(b' ');
    dst[..text.len()].copy_from_slice(text.as_bytes());
    dst[PAD_LEN] = b'\n';
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_roundtrips_scenario_s5() {
        let raw = encode_greeting(
            "Tarantool 2.10.0",
            "QK2HoFZGXTXBq2vFj7soCsHqTo6PGTF575ssUBAJLAI=",
        )
        .unwrap();
        assert_eq!(raw.len(), iproto::GREETING_LEN);

        let mut buf = RingBuffer::new(relay_net::buffer::DEFAULT_BLOCK_SIZE, 1 << 16);
        buf.write(&raw).unwrap();
        let greeting = decode_greeting(&buf, buf.begin()).unwrap();
        assert_eq!(greeting.version, "Tarantool 2.10.0");
        assert_eq!(greeting.salt, "QK2HoFZGXTXBq2vFj7soCsHqTo6PGTF575ssUBAJLAI=");
    }

    #[test]
    fn rejects_line_too_long() {
        let too_long = "x".repeat(64);
        assert!(encode_greeting(&too_long, "salt").is_err());
    }
}
