use relay_codec::{Decoded, decode_message, decode_message_size, encode_error_response, encode_response, iproto};
use relay_net::RingBuffer;
use rmp::encode as mp;

fn new_buf() -> RingBuffer {
    RingBuffer::new(relay_net::buffer::DEFAULT_BLOCK_SIZE, 1 << 20)
}

fn build_frame(header_entries: &[(u8, u64)], body: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    let mut payload = Vec::new();
    mp::write_map_len(&mut payload, header_entries.len() as u32).unwrap();
    for &(k, v) in header_entries {
        mp::write_uint(&mut payload, k as u64).unwrap();
        mp::write_uint(&mut payload, v).unwrap();
    }
    body(&mut payload);

    let mut framed = Vec::new();
    framed.push(iproto::SIZE_PREFIX_MARKER);
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(&payload);
    framed
}

#[test]
fn decodes_ping_request() {
    let frame = build_frame(
        &[(iproto::header::REQUEST_TYPE, iproto::code::PING as u64), (iproto::header::SYNC, 7)],
        |payload| {
            mp::write_map_len(payload, 0).unwrap();
        },
    );

    let mut buf = new_buf();
    buf.write(&frame).unwrap();

    let size = match decode_message_size(&buf, buf.begin()).unwrap() {
        Decoded::Ready(n) => n,
        Decoded::NeedMore => panic!("expected a full frame"),
    };
    assert_eq!(size, frame.len());

    let msg = decode_message(&buf, buf.begin(), size).unwrap();
    assert_eq!(msg.header.code, iproto::code::PING);
    assert_eq!(msg.header.sync, 7);
    assert!(msg.body.tuple.is_none());
    assert!(msg.body.key.is_none());
}

#[test]
fn decodes_replace_with_space_id_and_tuple() {
    let frame = build_frame(
        &[(iproto::header::REQUEST_TYPE, iproto::code::REPLACE as u64), (iproto::header::SYNC, 9)],
        |payload| {
            mp::write_map_len(payload, 2).unwrap();
            mp::write_uint(payload, iproto::body::SPACE_ID as u64).unwrap();
            mp::write_uint(payload, 512).unwrap();
            mp::write_uint(payload, iproto::body::TUPLE as u64).unwrap();
            let tuple_bytes = rmp_serde::to_vec(&(1u32, "hello".to_string())).unwrap();
            payload.extend_from_slice(&tuple_bytes);
        },
    );

    let mut buf = new_buf();
    buf.write(&frame).unwrap();
    let size = match decode_message_size(&buf, buf.begin()).unwrap() {
        Decoded::Ready(n) => n,
        Decoded::NeedMore => panic!("expected a full frame"),
    };
    let msg = decode_message(&buf, buf.begin(), size).unwrap();

    assert_eq!(msg.header.code, iproto::code::REPLACE);
    assert_eq!(msg.body.space_id, Some(512));
    let tuple = msg.body.tuple.expect("tuple present");
    let (id, name): (u32, String) = tuple.decode(&buf).unwrap();
    assert_eq!(id, 1);
    assert_eq!(name, "hello");
}

#[test]
fn decode_message_size_reports_need_more_on_partial_prefix() {
    let mut buf = new_buf();
    buf.write(&[iproto::SIZE_PREFIX_MARKER, 0, 0]).unwrap();
    assert!(matches!(decode_message_size(&buf, buf.begin()).unwrap(), Decoded::NeedMore));
}

#[test]
fn decode_message_size_rejects_bad_marker() {
    let mut buf = new_buf();
    buf.write(&[0x00, 0, 0, 0, 5]).unwrap();
    assert!(decode_message_size(&buf, buf.begin()).is_err());
}

#[test]
fn scenario_s6_partial_read_produces_no_message_until_complete() {
    let frame = build_frame(
        &[(iproto::header::REQUEST_TYPE, iproto::code::SELECT as u64), (iproto::header::SYNC, 11)],
        |payload| {
            mp::write_map_len(payload, 1).unwrap();
            mp::write_uint(payload, iproto::body::SPACE_ID as u64).unwrap();
            mp::write_uint(payload, 1).unwrap();
        },
    );

    let mut buf = new_buf();
    buf.write(&frame[..3]).unwrap();
    assert!(matches!(decode_message_size(&buf, buf.begin()).unwrap(), Decoded::NeedMore));

    buf.write(&frame[3..]).unwrap();
    let size = match decode_message_size(&buf, buf.begin()).unwrap() {
        Decoded::Ready(n) => n,
        Decoded::NeedMore => panic!("full frame should now be decodable"),
    };
    assert_eq!(size, frame.len());
    decode_message(&buf, buf.begin(), size).unwrap();
}

#[test]
fn encode_response_round_trips_sync_and_schema() {
    let mut buf = new_buf();
    let n = encode_response(&mut buf, 7, 42, iproto::code::OK, None).unwrap();
    assert_eq!(n, buf.len());

    let size = match decode_message_size(&buf, buf.begin()).unwrap() {
        Decoded::Ready(n) => n,
        Decoded::NeedMore => panic!("encoded frame should decode whole"),
    };
    let msg = decode_message(&buf, buf.begin(), size).unwrap();
    assert_eq!(msg.header.sync, 7);
    assert_eq!(msg.header.schema_id, Some(42));
    assert_eq!(msg.header.code, iproto::code::OK);
    assert!(!msg.header.is_error());
}

#[test]
fn encode_error_response_round_trips_code_and_message() {
    let mut buf = new_buf();
    encode_error_response(&mut buf, 3, 1, 0x0002, "no such space").unwrap();

    let size = match decode_message_size(&buf, buf.begin()).unwrap() {
        Decoded::Ready(n) => n,
        Decoded::NeedMore => panic!("encoded frame should decode whole"),
    };
    let msg = decode_message(&buf, buf.begin(), size).unwrap();
    assert!(msg.header.is_error());
    assert_eq!(msg.body.error_code, Some(0x0002));
    assert_eq!(msg.body.error_string.as_deref(), Some("no such space"));
}
