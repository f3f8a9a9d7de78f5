use anyhow::{bail, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::os::fd::RawFd;
use std::time::Duration;

/// Chunk size for a single non-blocking read.
pub const IOBUF_SIZE: usize = 16 * 1024;

const BACKLOG: i32 = 6;
const LINGER: Duration = Duration::from_secs(1);

pub fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

pub fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

/// Build the listening socket: SO_REUSEADDR, optional SO_LINGER for a graceful
/// close, non-blocking, close-on-exec, backlog 6. Ports below 1024 are
/// rejected; the upper bound is enforced by the u16 type.
pub fn bind_listener(port: u16, linger: bool) -> Result<TcpListener> {
    if port < 1024 {
        bail!("port {port} outside the usable range 1024-65535");
    }

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if linger {
        socket.set_linger(Some(LINGER))?;
    }
    socket.set_nonblocking(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

/// Per-connection protocol state driven by the event loop.
///
/// The engine owns the table of sessions and hands each one to at most one
/// worker at a time; implementations therefore never see concurrent calls.
/// Construction replaces `init`, dropping the session closes its socket.
pub trait Session: Send {
    fn peer(&self) -> SocketAddr;

    fn raw_fd(&self) -> RawFd;

    /// Pull bytes from the socket into the session's read buffer. Drains to
    /// would-block in edge-triggered mode, reads once in level-triggered mode.
    /// `Ok(0)` means the peer closed its half of the stream.
    fn read(&mut self) -> io::Result<usize>;

    /// Push buffered response bytes to the socket until done or would-block.
    fn write(&mut self) -> io::Result<usize>;

    /// Run the protocol over the buffered input. `true` means a response is
    /// staged and the connection wants WRITE interest; `false` means more
    /// input is needed first.
    fn process(&mut self) -> bool;

    fn pending_write(&self) -> usize;

    fn keep_alive(&self) -> bool;
}
