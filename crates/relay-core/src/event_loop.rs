use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use mio::{Events, Interest, Poll, Registry, Token, event::Event, net::TcpListener as MioTcpListener};
use relay_net::{StreamStatus, TcpStream};
use tracing::{debug, info, warn};

use crate::{
    config::{RelayConfig, UpstreamConfig},
    connection::{Connection, RecvOutcome, StreamRef},
    connector::{Connector, UpstreamConnect},
};

const LISTENER_TOKEN: Token = Token(usize::MAX);

fn make_token(conn_id: usize, which: StreamRef) -> Token {
    let tag = match which {
        StreamRef::Client => 0usize,
        StreamRef::Upstream(i) => i + 1,
    };
    Token((conn_id << 16) | tag)
}

fn decode_token(token: Token) -> (usize, StreamRef) {
    let raw = token.0;
    let conn_id = raw >> 16;
    let tag = raw & 0xFFFF;
    let which = if tag == 0 { StreamRef::Client } else { StreamRef::Upstream(tag - 1) };
    (conn_id, which)
}

/// Borrows only `poll`'s registry for the duration of one `connect()` call,
/// so it can be handed to [`Connector::dispatch`] alongside a `&mut
/// Connection` and a `&mut Connector` without the three borrows fighting
/// over all of `EventLoop`.
struct ConnectBackend<'a> {
    registry: &'a Registry,
    conn_id: usize,
}

impl UpstreamConnect for ConnectBackend<'_> {
    fn connect(
        &mut self,
        conn: &mut Connection,
        opts: &[UpstreamConfig],
        instance: usize,
    ) -> Result<StreamRef, crate::error::ConnectionError> {
        if let Some(stream) = conn.upstreams.get(&instance) {
            if stream.status() != StreamStatus::Dead {
                return Ok(StreamRef::Upstream(instance));
            }
        }
        let cfg = opts
            .get(instance)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unknown upstream instance index"))?;
        let addr: SocketAddr = format!("{}:{}", cfg.address, cfg.service)
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid upstream address"))?;

        let mut stream = TcpStream::connect(addr)?;
        let token = make_token(self.conn_id, StreamRef::Upstream(instance));
        self.registry.register(stream.mio_source(), token, Interest::READABLE | Interest::WRITABLE)?;

        if cfg.is_tnt {
            conn.upstream_greeting_expected.insert(instance);
        }
        conn.upstreams.insert(instance, stream);
        debug!(conn_id = self.conn_id, instance, %addr, "opened upstream connection");
        Ok(StreamRef::Upstream(instance))
    }
}

/// Readiness multiplexer (§4.5). Owns the listening socket, the table of
/// live connections keyed by a per-accept id, and the [`Connector`] that
/// carries the handler closure and upstream configuration.
pub struct EventLoop {
    poll: Poll,
    listener: MioTcpListener,
    connections: HashMap<usize, Connection>,
    next_conn_id: usize,
    block_size: usize,
    buffer_cap: usize,
    read_ahead: usize,
    max_connections: u32,
    connector: Connector,
}

impl EventLoop {
    pub fn new(config: &RelayConfig, connector: Connector) -> io::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.listen_addr, config.listen_port)
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid listen address"))?;
        let listener = MioTcpListener::bind(addr)?;
        let poll = Poll::new()?;
        Ok(Self {
            poll,
            listener,
            connections: HashMap::new(),
            next_conn_id: 0,
            block_size: 16 * 1024,
            buffer_cap: config.read_ahead_bytes() as usize * 4,
            read_ahead: config.read_ahead_bytes() as usize,
            max_connections: config.max_connections(),
            connector,
        })
    }

    /// The address actually bound, useful when `listen_port` was `0`.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until `running` is cleared (by a Ctrl-C handler, typically),
    /// then closes every remaining connection before returning. Mirrors
    /// §4.5's dispatch loop and §5's graceful-shutdown note.
    pub fn run(&mut self, running: &AtomicBool) -> io::Result<()> {
        self.poll.registry().register(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)?;
        let mut events = Events::with_capacity(256);

        while running.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(Duration::from_millis(200))) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_all();
                    continue;
                }
                let (conn_id, which) = decode_token(event.token());
                self.dispatch_event(conn_id, which, event);
            }
        }

        info!("shutdown requested, draining and closing connections");
        let conn_ids: Vec<usize> = self.connections.keys().copied().collect();
        for conn_id in conn_ids {
            self.close_connection(conn_id);
        }
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut mio_stream, peer_addr)) => {
                    if self.connections.len() as u32 >= self.max_connections {
                        warn!(cap = self.max_connections, %peer_addr, "rejecting connection: at capacity");
                        let _ = mio_stream.shutdown(std::net::Shutdown::Both);
                        continue;
                    }
                    let mut stream = match TcpStream::from_accepted(mio_stream, peer_addr) {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(error = %e, "failed to wrap accepted socket");
                            continue;
                        }
                    };
                    let conn_id = self.next_conn_id;
                    self.next_conn_id += 1;
                    let token = make_token(conn_id, StreamRef::Client);
                    if let Err(e) =
                        self.poll.registry().register(stream.mio_source(), token, Interest::READABLE | Interest::WRITABLE)
                    {
                        warn!(error = %e, "failed to register accepted client socket");
                        continue;
                    }
                    let conn = Connection::new(stream, self.block_size, self.buffer_cap);
                    self.connections.insert(conn_id, conn);
                    info!(conn_id, %peer_addr, "accepted client connection");

                    // Tarantool servers greet before any request arrives; give
                    // the handler a chance to act as soon as the connection
                    // exists, not only once the client has written bytes
                    // (S5's "synthesizes a greeting as its first action").
                    let conn = self.connections.get_mut(&conn_id).expect("just inserted");
                    let mut backend = ConnectBackend { registry: self.poll.registry(), conn_id };
                    self.connector.dispatch(conn, StreamRef::Client, true, &mut backend);
                    if let Some(conn) = self.connections.get_mut(&conn_id) {
                        conn.seen_first_client_event = true;
                        if conn.error.is_some() {
                            self.close_connection(conn_id);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // §4.5: a single accept error never stops the loop.
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn dispatch_event(&mut self, conn_id: usize, which: StreamRef, event: &Event) {
        if !self.connections.contains_key(&conn_id) {
            return;
        }

        if let StreamRef::Upstream(instance) = which {
            let conn = self.connections.get_mut(&conn_id).expect("checked above");
            if let Some(stream) = conn.upstreams.get_mut(&instance) {
                if stream.status() == StreamStatus::Connecting && event.is_writable() {
                    if let Err(e) = stream.finish_connect() {
                        warn!(conn_id, instance, error = %e, "upstream connect failed");
                        self.close_connection(conn_id);
                        return;
                    }
                }
            }
        }

        if event.is_writable() {
            self.flush_backlog(conn_id, which);
            if !self.connections.contains_key(&conn_id) {
                return;
            }
        }

        if !event.is_readable() {
            return;
        }

        let is_first_client_event = {
            let conn = self.connections.get_mut(&conn_id).expect("checked above");
            let is_first = which == StreamRef::Client && !conn.seen_first_client_event;
            if which == StreamRef::Client {
                conn.seen_first_client_event = true;
            }
            is_first
        };

        let recv_outcome = {
            let conn = self.connections.get_mut(&conn_id).expect("checked above");
            conn.recv_into_dec_buffer(which, self.read_ahead)
        };
        match recv_outcome {
            Ok(RecvOutcome::Received(n)) => debug!(conn_id, ?which, n, "received bytes"),
            Ok(RecvOutcome::WouldBlock) => return,
            Ok(RecvOutcome::PeerShutdown) => {
                debug!(conn_id, ?which, "peer shutdown");
                self.close_connection(conn_id);
                return;
            }
            Err(e) => {
                warn!(conn_id, ?which, error = %e, "recv failed, closing connection");
                self.close_connection(conn_id);
                return;
            }
        }

        let decode_result = {
            let conn = self.connections.get_mut(&conn_id).expect("checked above");
            conn.decode_pending(which)
        };
        if let Err(e) = decode_result {
            warn!(conn_id, error = %e, "frame decode failed, closing connection (protocol contract breach)");
            self.close_connection(conn_id);
            return;
        }

        let conn = self.connections.get_mut(&conn_id).expect("checked above");
        let mut backend = ConnectBackend { registry: self.poll.registry(), conn_id };
        self.connector.dispatch(conn, which, is_first_client_event, &mut backend);

        if let Some(conn) = self.connections.get(&conn_id) {
            if conn.error.is_some() {
                self.close_connection(conn_id);
            }
        }
    }

    fn flush_backlog(&mut self, conn_id: usize, which: StreamRef) {
        let Some(conn) = self.connections.get_mut(&conn_id) else { return };
        let result = match which {
            StreamRef::Client => conn.client_backlog.try_flush(&mut conn.client),
            StreamRef::Upstream(i) => {
                let Some(stream) = conn.upstreams.get_mut(&i) else { return };
                let backlog = conn.upstream_backlogs.entry(i).or_default();
                backlog.try_flush(stream)
            }
        };
        if let Err(e) = result {
            warn!(conn_id, ?which, error = %e, "send failed while draining backlog, closing connection");
            self.close_connection(conn_id);
        }
    }

    fn close_connection(&mut self, conn_id: usize) {
        let Some(mut conn) = self.connections.remove(&conn_id) else { return };
        let registry = self.poll.registry();
        let _ = registry.deregister(conn.client.mio_source());
        for stream in conn.upstreams.values_mut() {
            let _ = registry.deregister(stream.mio_source());
        }
        conn.client.shutdown();
        for stream in conn.upstreams.values_mut() {
            stream.shutdown();
        }
        debug!(conn_id, "closed connection");
    }
}
