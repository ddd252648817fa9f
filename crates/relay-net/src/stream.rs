use std::{
    io::{self, IoSlice, IoSliceMut, Read, Write},
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
};

use mio::net::TcpStream as MioTcpStream;
use tracing::warn;

/// Readiness state of a [`Stream`], surfaced instead of raising on
/// would-block so the event loop can decide when to re-arm interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Dead,
    Connecting,
    Ready,
    NeedRead,
    NeedWrite,
}

/// Non-blocking TCP socket. `recv`/`send` never block; a would-block result
/// is reflected in `status()` rather than through an error variant the
/// caller must special-case on every call site.
pub struct TcpStream {
    inner: MioTcpStream,
    peer_addr: SocketAddr,
    status: StreamStatus,
}

impl TcpStream {
    /// Begins a non-blocking connect. The socket is `Connecting` until a
    /// writable event lets the caller confirm it via
    /// [`Self::finish_connect`].
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let inner = MioTcpStream::connect(addr)?;
        inner.set_nodelay(true)?;
        Ok(Self { peer_addr: addr, inner, status: StreamStatus::Connecting })
    }

    /// Wraps an already-accepted socket, which is usable immediately.
    pub fn from_accepted(inner: MioTcpStream, peer_addr: SocketAddr) -> io::Result<Self> {
        inner.set_nodelay(true)?;
        Ok(Self { peer_addr, inner, status: StreamStatus::Ready })
    }

    #[inline]
    pub fn status(&self) -> StreamStatus {
        self.status
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Gives the event loop the raw `mio` socket for registry
    /// register/reregister/deregister calls.
    #[inline]
    pub fn mio_source(&mut self) -> &mut MioTcpStream {
        &mut self.inner
    }

    /// Confirms a non-blocking connect after a writable readiness event.
    /// Returns `Ok(true)` once connected, `Ok(false)` if still pending (not
    /// expected once writable fires, but handled defensively), and `Err` on
    /// a connection failure.
    pub fn finish_connect(&mut self) -> io::Result<bool> {
        match self.inner.take_error()? {
            Some(err) => Err(err),
            None => {
                self.status = StreamStatus::Ready;
                Ok(true)
            }
        }
    }

    /// Reads into `iov`. `Ok(0)` is a clean peer shutdown; `Err(WouldBlock)`
    /// means no data is ready right now (status is updated to `NeedRead`).
    pub fn recv(&mut self, iov: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        match self.inner.read_vectored(iov) {
            Ok(n) => {
                self.status = StreamStatus::Ready;
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.status = StreamStatus::NeedRead;
                Err(e)
            }
            Err(e) => {
                warn!(peer = %self.peer_addr, error = %e, "tcp recv failed");
                Err(e)
            }
        }
    }

    /// Writes from `iov`. `Ok(0)` means the kernel send buffer is full right
    /// now (congested, not an error); `Err(WouldBlock)` is equivalent and
    /// sets status to `NeedWrite`.
    pub fn send(&mut self, iov: &[IoSlice<'_>]) -> io::Result<usize> {
        match self.inner.write_vectored(iov) {
            Ok(n) => {
                self.status = StreamStatus::Ready;
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.status = StreamStatus::NeedWrite;
                Err(e)
            }
            Err(e) => {
                warn!(peer = %self.peer_addr, error = %e, "tcp send failed");
                Err(e)
            }
        }
    }

    pub fn shutdown(&mut self) {
        let _ = self.inner.shutdown(std::net::Shutdown::Both);
        self.status = StreamStatus::Dead;
    }
}

/// Sets the kernel `SO_SNDBUF`/`SO_RCVBUF` sizes on a stream. Used to bound
/// memory for connection-heavy deployments or to force backpressure in
/// tests.
pub fn set_socket_buf_size(stream: &TcpStream, size: usize) {
    let fd = stream.inner.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            std::ptr::from_ref(&size).cast::<libc::c_void>(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            std::ptr::from_ref(&size).cast::<libc::c_void>(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
