use std::{
    collections::{HashMap, HashSet, VecDeque},
    io::{IoSlice, IoSliceMut},
};

use relay_codec::{Decoded, Message};
use relay_net::{BufferPos, RingBuffer, TcpStream};
use tracing::warn;

use crate::{backlog::SendBacklog, error::ConnectionError};

/// Outcome of one non-blocking `recv` attempt into a connection's inbound
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    Received(usize),
    WouldBlock,
    PeerShutdown,
}

/// Identifies which stream owned by a [`Connection`] is being addressed.
/// Replaces the source's raw stream pointer with a plain, owned-table-safe
/// identifier (§9's re-architecture guidance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRef {
    Client,
    Upstream(usize),
}

/// Per-client state: a client stream, a map of upstream streams keyed by
/// instance index, the inbound/outbound buffer pair, the decode cursor, and
/// a place to park a fatal error before the event loop tears the
/// connection down. Mirrors §3/§4.4's Connection directly; reference
/// counting from the original is replaced by plain ownership in the event
/// loop's connection table (§9's re-architecture guidance).
pub struct Connection {
    pub client: TcpStream,
    pub upstreams: HashMap<usize, TcpStream>,
    /// "decoded" buffer: the stream of frames flowing in from the last
    /// read, not yet fully forwarded.
    pub dec_buffer: RingBuffer,
    /// "encoded" buffer: synthetic responses built by `createMessage`.
    pub enc_buffer: RingBuffer,
    /// Boundary between bytes already surfaced to the handler as `Message`s
    /// and bytes still pending frame completion. Invariant:
    /// `dec_buffer.begin() <= end_decoded <= dec_buffer.end()`.
    pub end_decoded: BufferPos,
    ready: VecDeque<Message>,
    pub client_backlog: SendBacklog,
    pub upstream_backlogs: HashMap<usize, SendBacklog>,
    /// Upstream instance indices still owing us a 128-byte greeting before
    /// any framed traffic (`greeting_expected_on_fd` in §3's data model,
    /// scoped per-connection since upstream streams aren't pooled across
    /// connections here). The client stream never appears here: the proxy
    /// is the one that *sends* a greeting to the client, it never receives
    /// one from it.
    pub upstream_greeting_expected: HashSet<usize>,
    pub seen_first_client_event: bool,
    pub error: Option<ConnectionError>,
}

impl Connection {
    pub fn new(client: TcpStream, block_size: usize, buffer_cap: usize) -> Self {
        let dec_buffer = RingBuffer::new(block_size, buffer_cap);
        let end_decoded = dec_buffer.begin();
        Self {
            client,
            upstreams: HashMap::new(),
            dec_buffer,
            enc_buffer: RingBuffer::new(block_size, buffer_cap),
            end_decoded,
            ready: VecDeque::new(),
            client_backlog: SendBacklog::default(),
            upstream_backlogs: HashMap::new(),
            upstream_greeting_expected: HashSet::new(),
            seen_first_client_event: false,
            error: None,
        }
    }

    pub fn stream_mut(&mut self, which: StreamRef) -> Option<&mut TcpStream> {
        match which {
            StreamRef::Client => Some(&mut self.client),
            StreamRef::Upstream(i) => self.upstreams.get_mut(&i),
        }
    }

    pub fn is_greeting_expected(&self, which: StreamRef) -> bool {
        match which {
            StreamRef::Client => false,
            StreamRef::Upstream(i) => self.upstream_greeting_expected.contains(&i),
        }
    }

    /// Invariant 2 from §8, checked the way the teacher's tests assert
    /// invariants directly rather than trusting construction alone.
    pub fn decode_cursor_in_range(&self) -> bool {
        self.dec_buffer.begin() <= self.end_decoded && self.end_decoded <= self.dec_buffer.end()
    }

    /// Drives the decode state machine (§4.3) as far as it will go: while a
    /// complete frame is available at `end_decoded`, decode it, advance the
    /// cursor, and queue the `Message` for the handler to pull.
    ///
    /// `which` is the stream that just became readable. While it still owes
    /// us a greeting (§3's priority: greeting check comes before the framed
    /// decode loop), the bytes sitting at `end_decoded` aren't frame-shaped
    /// at all, so this returns immediately and leaves them for the handler
    /// to consume via `deliver_decoded_greeting`.
    pub fn decode_pending(&mut self, which: StreamRef) -> Result<(), ConnectionError> {
        if self.is_greeting_expected(which) {
            return Ok(());
        }
        loop {
            let total = match relay_codec::decode_message_size(&self.dec_buffer, self.end_decoded)? {
                Decoded::NeedMore => break,
                Decoded::Ready(total) => total,
            };
            if !self.dec_buffer.has(self.end_decoded, total) {
                break;
            }
            let msg = relay_codec::decode_message(&self.dec_buffer, self.end_decoded, total)?;
            self.end_decoded = self.end_decoded.advance(total);
            relay_utils::safe_assert!(self.decode_cursor_in_range(), "decode cursor left the buffer's live range");
            self.ready.push_back(msg);
        }
        Ok(())
    }

    pub fn next_decoded_message(&mut self) -> Option<Message> {
        self.ready.pop_front()
    }

    /// Reserves a read-ahead region on `dec_buffer` and receives into it
    /// from whichever stream (client or a given upstream) just became
    /// readable, shrinking the reservation back to the bytes actually read.
    pub fn recv_into_dec_buffer(
        &mut self,
        which: StreamRef,
        read_ahead: usize,
    ) -> Result<RecvOutcome, ConnectionError> {
        let pos = self.dec_buffer.reserve(read_ahead)?;
        let mut slots: [IoSliceMut; 4] = std::array::from_fn(|_| IoSliceMut::new(&mut []));
        let count = self.dec_buffer.iov_mut(pos, read_ahead, &mut slots);
        // Borrow the target stream directly (not via `stream_mut`, which
        // takes `&mut self` as a whole and would conflict with the
        // `dec_buffer` borrow still alive in `slots`).
        let recv_result = match which {
            StreamRef::Client => self.client.recv(&mut slots[..count]),
            StreamRef::Upstream(i) => self
                .upstreams
                .get_mut(&i)
                .expect("recv on an upstream the connection does not own")
                .recv(&mut slots[..count]),
        };
        match recv_result {
            Ok(0) => Ok(RecvOutcome::PeerShutdown),
            Ok(n) => {
                self.dec_buffer.commit(n);
                Ok(RecvOutcome::Received(n))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(RecvOutcome::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    /// Sends the first `n` bytes of `dec_buffer` to `stream`, queuing
    /// whatever the kernel doesn't take immediately onto `backlog` as an
    /// owned copy (safe to do even after the caller drops those bytes from
    /// `dec_buffer` via `skip_decoded`).
    ///
    /// If `backlog` is already non-empty, this never attempts a direct
    /// write: doing so could land these `n` bytes ahead of older backlogged
    /// ones on the same stream, reordering frames (mirrors the teacher's
    /// `write_or_enqueue_with`, which enqueues unconditionally once a
    /// backlog exists rather than racing a fresh write against it).
    pub fn send_from_buffer(
        stream: &mut TcpStream,
        dec_buffer: &RingBuffer,
        backlog: &mut SendBacklog,
        n: usize,
    ) -> Result<(), ConnectionError> {
        if !backlog.is_empty() {
            let mut rest = vec![0u8; n];
            dec_buffer.read_at(dec_buffer.begin(), &mut rest);
            backlog.enqueue(&rest);
            return Ok(());
        }

        let mut slots: [IoSlice; 4] = std::array::from_fn(|_| IoSlice::new(&[]));
        let count = dec_buffer.iov(dec_buffer.begin(), Some(dec_buffer.begin().advance(n)), &mut slots);
        match stream.send(&slots[..count]) {
            Ok(sent) if sent >= n => Ok(()),
            Ok(sent) => {
                let mut rest = vec![0u8; n - sent];
                dec_buffer.read_at(dec_buffer.begin().advance(sent), &mut rest);
                backlog.enqueue(&rest);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let mut rest = vec![0u8; n];
                dec_buffer.read_at(dec_buffer.begin(), &mut rest);
                backlog.enqueue(&rest);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "send failed while forwarding decoded bytes");
                Err(e.into())
            }
        }
    }

    /// Stashes `result`'s error (if any) on the connection's error slot
    /// before handing it back to the caller, so the event loop's
    /// post-dispatch check (`conn.error.is_some()`) sees it and closes the
    /// connection, per spec.md's "record the error on the Connection and
    /// close it".
    fn note_error<T>(&mut self, result: Result<T, ConnectionError>) -> Result<T, ConnectionError> {
        if let Err(e) = &result {
            self.error = Some(e.clone());
        }
        result
    }

    /// `sendDecodedToStream`/`sendDecodedToClient`: forwards the first `n`
    /// bytes of `dec_buffer` to the named stream.
    pub fn send_decoded_to(&mut self, which: StreamRef, n: usize) -> Result<(), ConnectionError> {
        let result = match which {
            StreamRef::Client => {
                Self::send_from_buffer(&mut self.client, &self.dec_buffer, &mut self.client_backlog, n)
            }
            StreamRef::Upstream(i) => {
                let stream = self.upstreams.get_mut(&i).expect("send to an upstream the connection does not own");
                let backlog = self.upstream_backlogs.entry(i).or_default();
                Self::send_from_buffer(stream, &self.dec_buffer, backlog, n)
            }
        };
        self.note_error(result)
    }

    /// `skipLastDecodedMessage(n)`: drops `n` bytes from the front of
    /// `dec_buffer`. Per §9's open-question resolution this is always the
    /// *inbound* buffer, never `enc_buffer` (the source's bug).
    pub fn skip_decoded(&mut self, n: usize) {
        if n > 0 {
            self.dec_buffer.drop_front(n);
        }
    }

    /// `deliverDecodedGreeting()`: once the 128-byte greeting from `which`
    /// is fully buffered, forwards it to the client as-is, drops it from
    /// `dec_buffer`, and clears `which` from `upstream_greeting_expected`.
    /// A no-op (not an error) if the greeting hasn't fully arrived yet, so
    /// the handler can call this on every readable event for a
    /// greeting-expecting stream without tracking readiness itself.
    pub fn deliver_decoded_greeting(&mut self, which: StreamRef) -> Result<(), ConnectionError> {
        let len = relay_codec::iproto::GREETING_LEN;
        if !self.dec_buffer.has(self.end_decoded, len) {
            return Ok(());
        }
        // send_decoded_to already records failures on self.error; note_error
        // here as well so this method's contract holds on its own.
        let result = self.send_decoded_to(StreamRef::Client, len);
        if result.is_ok() {
            self.skip_decoded(len);
            self.end_decoded = self.end_decoded.advance(len);
            if let StreamRef::Upstream(i) = which {
                self.upstream_greeting_expected.remove(&i);
            }
        }
        self.note_error(result)
    }

    /// `deliverEncodedGreeting(buf[128])`: writes a synthetic 128-byte
    /// greeting into `enc_buffer` and sends it to the client.
    pub fn deliver_encoded_greeting(&mut self, raw: &[u8; relay_codec::iproto::GREETING_LEN]) -> Result<(), ConnectionError> {
        let result = (|| {
            self.enc_buffer.write(raw)?;
            let n = relay_codec::iproto::GREETING_LEN;
            Self::send_from_enc_buffer(&mut self.client, &self.enc_buffer, &mut self.client_backlog, n)?;
            self.enc_buffer.drop_front(n);
            Ok(())
        })();
        self.note_error(result)
    }

    /// `createMessage(sync, schema, [payload])`: encodes a synthetic OK
    /// response into `enc_buffer` and returns its byte length.
    pub fn create_message(
        &mut self,
        sync: u32,
        schema_id: u32,
        code: u32,
        tuple_payload: Option<&[u8]>,
    ) -> Result<usize, ConnectionError> {
        Ok(relay_codec::encode_response(&mut self.enc_buffer, sync, schema_id, code, tuple_payload)?)
    }

    pub fn create_error_message(
        &mut self,
        sync: u32,
        schema_id: u32,
        error_code: u32,
        error_string: &str,
    ) -> Result<usize, ConnectionError> {
        Ok(relay_codec::encode_error_response(&mut self.enc_buffer, sync, schema_id, error_code, error_string)?)
    }

    /// `sendEncodedToClient(n)`: writes the first `n` bytes of `enc_buffer`
    /// to the client and drops them.
    pub fn send_encoded_to_client(&mut self, n: usize) -> Result<(), ConnectionError> {
        let result = (|| {
            Self::send_from_enc_buffer(&mut self.client, &self.enc_buffer, &mut self.client_backlog, n)?;
            self.enc_buffer.drop_front(n);
            Ok(())
        })();
        self.note_error(result)
    }

    fn send_from_enc_buffer(
        stream: &mut TcpStream,
        enc_buffer: &RingBuffer,
        backlog: &mut SendBacklog,
        n: usize,
    ) -> Result<(), ConnectionError> {
        Self::send_from_buffer(stream, enc_buffer, backlog, n)
    }
}
