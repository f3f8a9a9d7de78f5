use crate::request::{ParseOutcome, Request};
use crate::response::Response;
use std::io::{self, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use transport::{interrupted, would_block, Session, IOBUF_SIZE};

// combined cap on buffered request and response bytes per connection
const MAX_BUFFERED: usize = 8 * 1024 * 1024;

/// One HTTP/1.1 connection: socket, buffered input, the staged response and
/// the parser state that carries across keep-alive requests.
pub struct HttpSession {
    stream: TcpStream,
    addr: SocketAddr,
    et: bool,
    root: Arc<PathBuf>,
    read_buf: Vec<u8>,
    head: Vec<u8>,
    body: Vec<u8>,
    head_sent: usize,
    body_sent: usize,
    request: Request,
    keep_alive: bool,
}

impl HttpSession {
    pub fn new(stream: TcpStream, addr: SocketAddr, et: bool, root: Arc<PathBuf>) -> Self {
        Self {
            stream,
            addr,
            et,
            root,
            read_buf: Vec::new(),
            head: Vec::new(),
            body: Vec::new(),
            head_sent: 0,
            body_sent: 0,
            request: Request::new(),
            keep_alive: false,
        }
    }

    fn stage(&mut self, response: Response) {
        self.head = response.head;
        self.body = response.body;
        self.head_sent = 0;
        self.body_sent = 0;
    }

    fn advance_write(&mut self, mut n: usize) {
        let head_left = self.head.len() - self.head_sent;
        let from_head = n.min(head_left);
        self.head_sent += from_head;
        n -= from_head;
        self.body_sent += n;
    }
}

impl Session for HttpSession {
    fn peer(&self) -> SocketAddr {
        self.addr
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; IOBUF_SIZE];

        loop {
            match self.stream.read(&mut chunk) {
                // a half-closed peer ends the connection even if bytes arrived
                Ok(0) => return Ok(0),
                Ok(n) => {
                    if self.read_buf.len() + n > MAX_BUFFERED {
                        return Err(io::Error::other("per-connection read buffer cap hit"));
                    }
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    total += n;
                    if !self.et {
                        break;
                    }
                }
                Err(err) if would_block(&err) => {
                    if total > 0 {
                        break;
                    }
                    return Err(err);
                }
                Err(err) if interrupted(&err) => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }

    fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;

        while self.pending_write() > 0 {
            let bufs = [
                IoSlice::new(&self.head[self.head_sent..]),
                IoSlice::new(&self.body[self.body_sent..]),
            ];
            match self.stream.write_vectored(&bufs) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "stream closed")),
                Ok(n) => {
                    self.advance_write(n);
                    total += n;
                }
                Err(err) if would_block(&err) => {
                    if total > 0 {
                        break;
                    }
                    return Err(err);
                }
                Err(err) if interrupted(&err) => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }

    fn process(&mut self) -> bool {
        match self.request.parse(&mut self.read_buf) {
            ParseOutcome::Incomplete => false,
            ParseOutcome::Complete => {
                self.keep_alive = self.request.keep_alive();
                let response = if self.request.method() == "GET" {
                    Response::build(&self.root, self.request.path(), self.keep_alive)
                } else {
                    self.keep_alive = false;
                    Response::error(400, false)
                };
                debug!(
                    peer = %self.addr,
                    method = self.request.method(),
                    path = self.request.path(),
                    status = response.status,
                    "request"
                );
                self.stage(response);
                self.request.reset();
                true
            }
            ParseOutcome::Bad => {
                debug!(peer = %self.addr, "malformed request");
                self.keep_alive = false;
                self.read_buf.clear();
                self.request.reset();
                self.stage(Response::error(400, false));
                true
            }
        }
    }

    fn pending_write(&self) -> usize {
        (self.head.len() - self.head_sent) + (self.body.len() - self.body_sent)
    }

    fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}
