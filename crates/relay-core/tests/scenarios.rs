//! End-to-end scenarios over real loopback TCP sockets, mirroring the
//! concrete walkthroughs a reviewer would use to sanity-check the proxy:
//! pure passthrough, fan-out, load-balance, a locally-answered mock
//! request, and greeting injection.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use relay_codec::iproto;
use relay_core::{Connector, EventLoop, Handler, HandlerContext, RelayConfig, StreamRef, TransportKind, UpstreamConfig};

fn frame(payload: Vec<u8>) -> Vec<u8> {
    let mut framed = Vec::with_capacity(iproto::SIZE_PREFIX_LEN + payload.len());
    framed.push(iproto::SIZE_PREFIX_MARKER);
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(&payload);
    framed
}

fn request_frame(code: u32, sync: u32, body: Vec<(u8, u32)>) -> Vec<u8> {
    let mut payload = Vec::new();
    rmp::encode::write_map_len(&mut payload, 2).unwrap();
    rmp::encode::write_uint(&mut payload, iproto::header::REQUEST_TYPE as u64).unwrap();
    rmp::encode::write_uint(&mut payload, code as u64).unwrap();
    rmp::encode::write_uint(&mut payload, iproto::header::SYNC as u64).unwrap();
    rmp::encode::write_uint(&mut payload, sync as u64).unwrap();

    rmp::encode::write_map_len(&mut payload, body.len() as u32).unwrap();
    for (key, val) in body {
        rmp::encode::write_uint(&mut payload, key as u64).unwrap();
        rmp::encode::write_uint(&mut payload, val as u64).unwrap();
    }
    frame(payload)
}

fn ok_response_frame(sync: u32, schema_id: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    rmp::encode::write_map_len(&mut payload, 3).unwrap();
    rmp::encode::write_uint(&mut payload, iproto::header::REQUEST_TYPE as u64).unwrap();
    rmp::encode::write_uint(&mut payload, iproto::code::OK as u64).unwrap();
    rmp::encode::write_uint(&mut payload, iproto::header::SYNC as u64).unwrap();
    rmp::encode::write_uint(&mut payload, sync as u64).unwrap();
    rmp::encode::write_uint(&mut payload, iproto::header::SCHEMA_VERSION as u64).unwrap();
    rmp::encode::write_uint(&mut payload, schema_id as u64).unwrap();
    rmp::encode::write_map_len(&mut payload, 0).unwrap();
    frame(payload)
}

fn read_one_frame(sock: &mut StdTcpStream) -> Option<Vec<u8>> {
    let mut prefix = [0u8; 5];
    sock.read_exact(&mut prefix).ok()?;
    if prefix[0] != iproto::SIZE_PREFIX_MARKER {
        return None;
    }
    let len = u32::from_be_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]) as usize;
    let mut payload = vec![0u8; len];
    sock.read_exact(&mut payload).ok()?;
    let mut full = prefix.to_vec();
    full.extend_from_slice(&payload);
    Some(full)
}

/// A single-shot mock Tarantool instance: accepts one connection, and for
/// each request frame it reads, hands the raw bytes to `respond` and writes
/// back whatever it returns (if anything).
fn spawn_mock_upstream(
    respond: impl Fn(Vec<u8>) -> Option<Vec<u8>> + Send + 'static,
) -> (SocketAddr, thread::JoinHandle<()>) {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        if let Ok((mut sock, _)) = listener.accept() {
            while let Some(req) = read_one_frame(&mut sock) {
                if let Some(resp) = respond(req) {
                    if sock.write_all(&resp).is_err() {
                        break;
                    }
                }
            }
        }
    });
    (addr, handle)
}

struct RunningProxy {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_proxy(upstreams: Vec<UpstreamConfig>, handler: Handler) -> RunningProxy {
    let config = RelayConfig {
        listen_addr: "127.0.0.1".to_string(),
        listen_port: 0,
        upstreams,
        max_connections: None,
        read_ahead_bytes: None,
    };
    let connector = Connector::new(config.listen_addr.clone(), config.listen_port, config.upstreams.clone(), handler);
    let mut event_loop = EventLoop::new(&config, connector).expect("bind proxy listener");
    let addr = event_loop.local_addr().expect("local addr");
    let running = Arc::new(AtomicBool::new(true));
    let running_for_thread = running.clone();
    let handle = thread::spawn(move || {
        event_loop.run(&running_for_thread).expect("event loop run");
    });
    // Give the loop a moment to register the listener before the test connects.
    thread::sleep(Duration::from_millis(20));
    RunningProxy { addr, running, handle: Some(handle) }
}

fn connect_client(addr: SocketAddr) -> StdTcpStream {
    let stream = StdTcpStream::connect(addr).expect("connect to proxy");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
}

fn plain_upstream(address: &str, service: u16, is_tnt: bool) -> UpstreamConfig {
    UpstreamConfig { address: address.to_string(), service, is_tnt, transport: TransportKind::Plain }
}

/// Forwards whatever arrives from the client to upstream 0, and whatever
/// arrives from any upstream straight back to the client.
fn passthrough_handler() -> Handler {
    Box::new(|ctx: &mut HandlerContext| {
        if ctx.is_recv_from_client() {
            while let Some(msg) = ctx.get_next_decoded_message() {
                let n = msg.size;
                let _ = ctx.connect(0);
                let _ = ctx.send_decoded_to_stream(StreamRef::Upstream(0), n);
                ctx.skip_last_decoded_message(n);
            }
        } else if ctx.is_greeting_expected() {
            let _ = ctx.deliver_decoded_greeting();
        } else {
            while let Some(msg) = ctx.get_next_decoded_message() {
                let n = msg.size;
                let _ = ctx.send_decoded_to_client(n);
                ctx.skip_last_decoded_message(n);
            }
        }
    })
}

/// Forwards a client request to every configured upstream, and relays
/// whichever upstream answers back to the client.
fn fanout_handler(upstream_count: usize) -> Handler {
    Box::new(move |ctx: &mut HandlerContext| {
        if ctx.is_recv_from_client() {
            while let Some(msg) = ctx.get_next_decoded_message() {
                let n = msg.size;
                for instance in 0..upstream_count {
                    let _ = ctx.connect(instance);
                    let _ = ctx.send_decoded_to_stream(StreamRef::Upstream(instance), n);
                }
                ctx.skip_last_decoded_message(n);
            }
        } else if ctx.is_greeting_expected() {
            let _ = ctx.deliver_decoded_greeting();
        } else {
            while let Some(msg) = ctx.get_next_decoded_message() {
                let n = msg.size;
                let _ = ctx.send_decoded_to_client(n);
                ctx.skip_last_decoded_message(n);
            }
        }
    })
}

/// Answers every client request locally with a synthetic OK, no upstream.
fn mock_response_handler(schema_id: u32) -> Handler {
    Box::new(move |ctx: &mut HandlerContext| {
        if ctx.is_recv_from_client() {
            while let Some(msg) = ctx.get_next_decoded_message() {
                let n = msg.size;
                let resp_len = ctx
                    .create_message(msg.header.sync, schema_id, iproto::code::OK, None)
                    .expect("encode mock response");
                let _ = ctx.send_encoded_to_client(resp_len);
                ctx.skip_last_decoded_message(n);
            }
        }
    })
}

/// Synthesizes a fixed 128-byte greeting the moment a client connects.
fn greeting_handler(greeting: [u8; iproto::GREETING_LEN]) -> Handler {
    Box::new(move |ctx: &mut HandlerContext| {
        if ctx.is_client_first_request() {
            let _ = ctx.deliver_encoded_greeting(&greeting);
        }
        while ctx.get_next_decoded_message().is_some() {}
    })
}

#[test]
fn s1_pure_passthrough() {
    let (upstream_addr, _upstream) = spawn_mock_upstream(|req| {
        // PING request framed as {REQUEST_TYPE: PING, SYNC: 7}; the mock
        // answers with OK carrying the same sync, ignoring the rest.
        let _ = req;
        Some(ok_response_frame(7, 1))
    });

    let proxy = spawn_proxy(vec![plain_upstream("127.0.0.1", upstream_addr.port(), false)], passthrough_handler());

    let mut client = connect_client(proxy.addr);
    let ping = request_frame(iproto::code::PING, 7, vec![]);
    client.write_all(&ping).unwrap();

    let expected = ok_response_frame(7, 1);
    let mut got = vec![0u8; expected.len()];
    client.read_exact(&mut got).unwrap();
    assert_eq!(got, expected);
}

#[test]
fn s2_fan_out_replication() {
    let (addr0, _u0) = spawn_mock_upstream(move |_req| Some(ok_response_frame(9, 2)));
    let (addr1, _u1) = spawn_mock_upstream(move |_req| Some(ok_response_frame(9, 2)));

    let proxy = spawn_proxy(
        vec![plain_upstream("127.0.0.1", addr0.port(), false), plain_upstream("127.0.0.1", addr1.port(), false)],
        fanout_handler(2),
    );

    let mut client = connect_client(proxy.addr);
    let replace = request_frame(iproto::code::REPLACE, 9, vec![(iproto::body::SPACE_ID, 512)]);
    client.write_all(&replace).unwrap();

    let expected = ok_response_frame(9, 2);
    for _ in 0..2 {
        let mut got = vec![0u8; expected.len()];
        client.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);
    }
}

#[test]
fn s3_load_balance_only_hits_first_upstream() {
    let (addr0, _u0) = spawn_mock_upstream(move |_req| Some(ok_response_frame(11, 4)));
    let saw_any = Arc::new(AtomicBool::new(false));
    let saw_any_upstream1 = saw_any.clone();
    let (addr1, _u1) = spawn_mock_upstream(move |_req| {
        saw_any_upstream1.store(true, Ordering::SeqCst);
        None
    });

    let proxy = spawn_proxy(
        vec![plain_upstream("127.0.0.1", addr0.port(), false), plain_upstream("127.0.0.1", addr1.port(), false)],
        passthrough_handler(),
    );

    let mut client = connect_client(proxy.addr);
    let select = request_frame(iproto::code::SELECT, 11, vec![]);
    client.write_all(&select).unwrap();

    let expected = ok_response_frame(11, 4);
    let mut got = vec![0u8; expected.len()];
    client.read_exact(&mut got).unwrap();
    assert_eq!(got, expected);

    thread::sleep(Duration::from_millis(100));
    assert!(!saw_any.load(Ordering::SeqCst), "upstream index 1 should never have been contacted");
}

#[test]
fn s4_mock_local_response_with_no_upstreams() {
    let proxy = spawn_proxy(vec![], mock_response_handler(85));

    let mut client = connect_client(proxy.addr);
    let ping = request_frame(iproto::code::PING, 3, vec![]);
    client.write_all(&ping).unwrap();

    let expected = ok_response_frame(3, 85);
    let mut got = vec![0u8; expected.len()];
    client.read_exact(&mut got).unwrap();
    assert_eq!(got, expected);
}

#[test]
fn s5_greeting_injection() {
    let greeting = relay_codec::encode_greeting(
        "Tarantool 2.10.0",
        "QK2HoFZGXTXBq2vFj7soCsHqTo6PGTF575ssUBAJLAI=",
    )
    .unwrap();

    let proxy = spawn_proxy(vec![], greeting_handler(greeting));

    let mut client = connect_client(proxy.addr);
    let mut got = [0u8; iproto::GREETING_LEN];
    client.read_exact(&mut got).unwrap();
    assert_eq!(got, greeting);
}

/// A mock Tarantool instance that writes its 128-byte greeting immediately
/// on accept, then behaves like `spawn_mock_upstream`.
fn spawn_mock_tnt_upstream(
    greeting: [u8; iproto::GREETING_LEN],
    respond: impl Fn(Vec<u8>) -> Option<Vec<u8>> + Send + 'static,
) -> (SocketAddr, thread::JoinHandle<()>) {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        if let Ok((mut sock, _)) = listener.accept() {
            if sock.write_all(&greeting).is_err() {
                return;
            }
            while let Some(req) = read_one_frame(&mut sock) {
                if let Some(resp) = respond(req) {
                    if sock.write_all(&resp).is_err() {
                        break;
                    }
                }
            }
        }
    });
    (addr, handle)
}

#[test]
fn s6_upstream_greeting_relayed_before_responses() {
    let greeting =
        relay_codec::encode_greeting("Tarantool 2.10.0", "QK2HoFZGXTXBq2vFj7soCsHqTo6PGTF575ssUBAJLAI=").unwrap();
    let (upstream_addr, _upstream) = spawn_mock_tnt_upstream(greeting, |_req| Some(ok_response_frame(42, 6)));

    let proxy = spawn_proxy(vec![plain_upstream("127.0.0.1", upstream_addr.port(), true)], passthrough_handler());

    let mut client = connect_client(proxy.addr);
    // The proxy only opens the upstream connection once the client sends
    // its first request, so the greeting and the eventual reply both arrive
    // after this write.
    let ping = request_frame(iproto::code::PING, 42, vec![]);
    client.write_all(&ping).unwrap();

    let mut got_greeting = [0u8; iproto::GREETING_LEN];
    client.read_exact(&mut got_greeting).unwrap();
    assert_eq!(got_greeting, greeting);

    let expected = ok_response_frame(42, 6);
    let mut got = vec![0u8; expected.len()];
    client.read_exact(&mut got).unwrap();
    assert_eq!(got, expected);
}
