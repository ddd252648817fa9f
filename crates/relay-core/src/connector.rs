use relay_codec::Message;

use crate::{
    config::UpstreamConfig,
    connection::{Connection, StreamRef},
    error::ConnectionError,
};

/// Performs the actual non-blocking connect-and-register for
/// `HandlerContext::connect`. Implemented by the event loop, which is the
/// only thing holding a `mio::Registry` and a token allocator — kept as a
/// trait so `connector.rs` itself stays free of `mio` and of the loop's
/// bookkeeping.
pub trait UpstreamConnect {
    fn connect(
        &mut self,
        conn: &mut Connection,
        opts: &[UpstreamConfig],
        instance: usize,
    ) -> Result<StreamRef, ConnectionError>;
}

/// The view of a single readable-event dispatch handed to the handler
/// closure. Bundles the connection the event fired on, which stream
/// triggered it, and a backend for opening upstream connections — "current
/// receiver" from the source's Connector, made an explicit borrow instead of
/// a pair of mutable globals.
pub struct HandlerContext<'a> {
    conn: &'a mut Connection,
    current_stream: StreamRef,
    is_first_client_event: bool,
    opts: &'a [UpstreamConfig],
    backend: &'a mut dyn UpstreamConnect,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        conn: &'a mut Connection,
        current_stream: StreamRef,
        is_first_client_event: bool,
        opts: &'a [UpstreamConfig],
        backend: &'a mut dyn UpstreamConnect,
    ) -> Self {
        Self { conn, current_stream, is_first_client_event, opts, backend }
    }

    pub fn is_recv_from_client(&self) -> bool {
        self.current_stream == StreamRef::Client
    }

    pub fn is_client_first_request(&self) -> bool {
        self.is_recv_from_client() && self.is_first_client_event
    }

    pub fn is_greeting_expected(&self) -> bool {
        self.conn.is_greeting_expected(self.current_stream)
    }

    pub fn deliver_decoded_greeting(&mut self) -> Result<(), ConnectionError> {
        self.conn.deliver_decoded_greeting(self.current_stream)
    }

    pub fn deliver_encoded_greeting(&mut self, raw: &[u8; relay_codec::iproto::GREETING_LEN]) -> Result<(), ConnectionError> {
        self.conn.deliver_encoded_greeting(raw)
    }

    pub fn get_next_decoded_message(&mut self) -> Option<Message> {
        self.conn.next_decoded_message()
    }

    pub fn connect(&mut self, instance: usize) -> Result<StreamRef, ConnectionError> {
        self.backend.connect(self.conn, self.opts, instance)
    }

    pub fn send_decoded_to_stream(&mut self, stream: StreamRef, n: usize) -> Result<(), ConnectionError> {
        self.conn.send_decoded_to(stream, n)
    }

    pub fn send_decoded_to_client(&mut self, n: usize) -> Result<(), ConnectionError> {
        self.conn.send_decoded_to(StreamRef::Client, n)
    }

    pub fn skip_last_decoded_message(&mut self, n: usize) {
        self.conn.skip_decoded(n)
    }

    pub fn send_encoded_to_client(&mut self, n: usize) -> Result<(), ConnectionError> {
        self.conn.send_encoded_to_client(n)
    }

    pub fn create_message(
        &mut self,
        sync: u32,
        schema_id: u32,
        code: u32,
        tuple_payload: Option<&[u8]>,
    ) -> Result<usize, ConnectionError> {
        self.conn.create_message(sync, schema_id, code, tuple_payload)
    }

    pub fn create_error_message(
        &mut self,
        sync: u32,
        schema_id: u32,
        error_code: u32,
        error_string: &str,
    ) -> Result<usize, ConnectionError> {
        self.conn.create_error_message(sync, schema_id, error_code, error_string)
    }

    pub fn current_stream(&self) -> StreamRef {
        self.current_stream
    }
}

/// `FnMut(&mut HandlerContext)` is the Rust shape of the source's
/// link-time-specialized `customHandler` template: user code configured
/// once at `Connector` construction time and re-entered on every readable
/// event.
pub type Handler = Box<dyn FnMut(&mut HandlerContext) + Send>;

/// Top-level facade bound to a handler and a fixed set of upstream
/// instances. Owns everything the handler needs that isn't event-loop
/// plumbing; the event loop owns the mio side and calls
/// [`Connector::dispatch`] once per readable event.
pub struct Connector {
    pub listen_addr: String,
    pub listen_port: u16,
    upstream_opts: Vec<UpstreamConfig>,
    handler: Handler,
}

impl Connector {
    pub fn new(listen_addr: String, listen_port: u16, upstream_opts: Vec<UpstreamConfig>, handler: Handler) -> Self {
        Self { listen_addr, listen_port, upstream_opts, handler }
    }

    pub fn upstream_opts(&self) -> &[UpstreamConfig] {
        &self.upstream_opts
    }

    /// Invokes the handler once, bound to `conn`/`current_stream`, handing
    /// it a [`HandlerContext`] that scopes every helper in §4.6's table to
    /// this one connection and stream for the duration of the call.
    pub fn dispatch(
        &mut self,
        conn: &mut Connection,
        current_stream: StreamRef,
        is_first_client_event: bool,
        backend: &mut dyn UpstreamConnect,
    ) {
        let mut ctx = HandlerContext::new(conn, current_stream, is_first_client_event, &self.upstream_opts, backend);
        (self.handler)(&mut ctx);
    }
}
