use crate::config::Config;
use crate::pool::TaskPool;
use crate::reactor::{EpollEvent, EpollFlags, Reactor};
use crate::timer::TimerHeap;
use anyhow::{Context, Result};
use nix::errno::Errno;
use slab::Slab;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use transport::{interrupted, would_block, Session};

const EVENT_CAPACITY: usize = 1024;
const LISTENER: u64 = u64::MAX;
const WAKER: u64 = u64::MAX - 1;
const BUSY_REPLY: &[u8] = b"Server busy!";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct ConnId(NonZeroUsize);

impl ConnId {
    fn from_slab_key(key: usize) -> Self {
        Self(NonZeroUsize::new(key + 1).unwrap())
    }

    fn to_slab_key(self) -> usize {
        self.0.get() - 1
    }

    fn token(self) -> u64 {
        self.to_slab_key() as u64
    }

    fn from_token(token: u64) -> Self {
        Self::from_slab_key(token as usize)
    }
}

struct Entry<S> {
    fd: RawFd,
    sess: Arc<Mutex<S>>,
}

/// State reachable from worker threads: the reactor for rearming, the
/// retirement queue for connections a worker has finished off, and the waker
/// that interrupts a blocked `epoll_wait`.
struct Shared {
    reactor: Reactor,
    conn_interest: EpollFlags,
    retired: Mutex<Vec<(ConnId, RawFd)>>,
    waker: UnixStream,
    stopping: AtomicBool,
}

impl Shared {
    fn wake(&self) {
        let _ = (&self.waker).write(&[1]);
    }

    /// Worker-side close: pull the fd out of the reactor now, let the
    /// dispatcher drop the table entry. The socket itself closes once the last
    /// session handle is gone, which is always after the deregistration here.
    fn retire(&self, id: ConnId, fd: RawFd) {
        let _ = self.reactor.unregister(fd);
        lock(&self.retired).push((id, fd));
        self.wake();
    }

    fn rearm(&self, fd: RawFd, id: ConnId, ready: EpollFlags) -> bool {
        match self.reactor.modify(fd, id.token(), ready | self.conn_interest) {
            Ok(()) => true,
            Err(err) => {
                // the dispatcher can have closed this connection underneath us
                debug!(fd, %err, "rearm failed");
                false
            }
        }
    }
}

#[derive(Clone, Copy)]
enum TaskKind {
    Read,
    Write,
}

struct Task<S> {
    kind: TaskKind,
    id: ConnId,
    sess: Arc<Mutex<S>>,
}

/// Remote control for a running server; cheap to clone across threads.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.wake();
    }
}

/// The connection-multiplexing engine: owns the listener, the connection
/// table, the timing heap and the worker pool, and drives them from a single
/// dispatcher thread.
///
/// The dispatcher never reads or writes connection sockets; it accepts,
/// classifies readiness events, extends idle timers and submits tasks. All
/// socket I/O and protocol work happens on pool workers, which rearm the
/// ONESHOT registration when they hand the connection back.
pub struct Server<S, F> {
    cfg: Config,
    listener: TcpListener,
    shared: Arc<Shared>,
    waker_rx: UnixStream,
    clients: Slab<Entry<S>>,
    timer: TimerHeap,
    pool: TaskPool<Task<S>>,
    factory: F,
    events: Vec<EpollEvent>,
}

impl<S, F> Server<S, F>
where
    S: Session + 'static,
    F: Fn(TcpStream, SocketAddr) -> S,
{
    pub fn bind(cfg: Config, factory: F) -> Result<Self> {
        let listener = transport::bind_listener(cfg.port, cfg.linger)?;

        let reactor = Reactor::new()?;
        let (waker_rx, waker_tx) = UnixStream::pair().context("create waker pipe")?;
        waker_rx.set_nonblocking(true)?;
        waker_tx.set_nonblocking(true)?;

        let mut conn_interest = EpollFlags::EPOLLONESHOT | EpollFlags::EPOLLRDHUP;
        if cfg.trig_mode.conn_et() {
            conn_interest |= EpollFlags::EPOLLET;
        }
        let mut listen_interest = EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
        if cfg.trig_mode.listen_et() {
            listen_interest |= EpollFlags::EPOLLET;
        }

        reactor
            .register(listener.as_raw_fd(), LISTENER, listen_interest)
            .context("register listener")?;
        reactor
            .register(waker_rx.as_raw_fd(), WAKER, EpollFlags::EPOLLIN)
            .context("register waker")?;

        let shared = Arc::new(Shared {
            reactor,
            conn_interest,
            retired: Mutex::new(Vec::new()),
            waker: waker_tx,
            stopping: AtomicBool::new(false),
        });

        let pool = {
            let shared = Arc::clone(&shared);
            TaskPool::new(cfg.workers, move |task| run_task(&shared, task))?
        };

        info!(
            port = cfg.port,
            workers = cfg.workers,
            timeout_ms = cfg.timeout_ms,
            listen_mode = if cfg.trig_mode.listen_et() { "ET" } else { "LT" },
            conn_mode = if cfg.trig_mode.conn_et() { "ET" } else { "LT" },
            "server up"
        );

        Ok(Self {
            cfg,
            listener,
            shared,
            waker_rx,
            clients: Slab::new(),
            timer: TimerHeap::new(),
            pool,
            factory,
            events: vec![EpollEvent::empty(); EVENT_CAPACITY],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn run(mut self) -> Result<()> {
        loop {
            if self.shared.stopping.load(Ordering::Acquire) {
                break;
            }

            let mut wait_ms = -1i64;
            if self.cfg.timeout_enabled() {
                let now = Instant::now();
                while let Some(key) = self.timer.pop_expired(now) {
                    debug!(key, "idle timeout");
                    self.close_conn(ConnId::from_slab_key(key));
                }
                if let Some(next) = self.timer.next_timeout(now) {
                    wait_ms = next.as_millis() as i64 + 1;
                }
            }

            self.reap_retired();

            let count = match self.shared.reactor.wait(&mut self.events, wait_ms) {
                Ok(count) => count,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("epoll_wait"),
            };

            for i in 0..count {
                let event = self.events[i];
                self.handle_event(event.data(), event.events());
            }
        }

        self.shutdown();
        Ok(())
    }

    fn handle_event(&mut self, token: u64, flags: EpollFlags) {
        match token {
            LISTENER => self.accept_clients(),
            WAKER => {
                self.drain_waker();
                self.reap_retired();
            }
            token => {
                let id = ConnId::from_token(token);
                if flags
                    .intersects(EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR)
                {
                    // hangup wins over any pending readability
                    self.close_conn(id);
                } else if flags.contains(EpollFlags::EPOLLIN) {
                    self.dispatch(id, TaskKind::Read);
                } else if flags.contains(EpollFlags::EPOLLOUT) {
                    self.dispatch(id, TaskKind::Write);
                } else {
                    warn!(token, ?flags, "unexpected event");
                }
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if self.clients.len() >= self.cfg.max_clients {
                        self.reject_client(stream, addr);
                    } else if let Err(err) = self.add_client(stream, addr) {
                        warn!(%err, "failed to admit client");
                    }
                }
                Err(ref err) if would_block(err) => break,
                Err(ref err) if interrupted(err) => continue,
                Err(err) => {
                    error!(%err, "accept failed");
                    break;
                }
            }
            if !self.cfg.trig_mode.listen_et() {
                break;
            }
        }
    }

    fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        stream
            .set_nonblocking(true)
            .context("set client non-blocking")?;
        let fd = stream.as_raw_fd();
        let sess = (self.factory)(stream, addr);

        let key = self.clients.insert(Entry {
            fd,
            sess: Arc::new(Mutex::new(sess)),
        });
        let id = ConnId::from_slab_key(key);

        if self.cfg.timeout_enabled() {
            self.timer.add(key, self.deadline());
        }

        if let Err(err) = self.shared.reactor.register(
            fd,
            id.token(),
            EpollFlags::EPOLLIN | self.shared.conn_interest,
        ) {
            self.timer.cancel(key);
            self.clients.remove(key);
            return Err(err).context("register client with epoll");
        }

        info!(fd, %addr, clients = self.clients.len(), "client in");
        Ok(())
    }

    fn reject_client(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        warn!(%addr, clients = self.clients.len(), "client table full");
        let _ = stream.write_all(BUSY_REPLY);
    }

    fn dispatch(&mut self, id: ConnId, kind: TaskKind) {
        let Some(entry) = self.clients.get(id.to_slab_key()) else {
            debug!("event for unknown connection");
            return;
        };
        let sess = Arc::clone(&entry.sess);

        // extend on the loop thread, before the task exists, so the expiry
        // sweep never races a rearm
        if self.cfg.timeout_enabled() {
            self.timer.adjust(id.to_slab_key(), self.deadline());
        }

        self.pool.submit(Task { kind, id, sess });
    }

    fn close_conn(&mut self, id: ConnId) {
        let key = id.to_slab_key();
        let Some(entry) = self.clients.try_remove(key) else {
            debug!("close for unknown connection");
            return;
        };
        self.timer.cancel(key);
        let _ = self.shared.reactor.unregister(entry.fd);
        info!(fd = entry.fd, clients = self.clients.len(), "client out");
        // dropping the entry closes the socket once workers let go of it
    }

    fn reap_retired(&mut self) {
        let retired = std::mem::take(&mut *lock(&self.shared.retired));
        for (id, fd) in retired {
            match self.clients.get(id.to_slab_key()) {
                // fd mismatch means the slab key was already recycled
                Some(entry) if entry.fd == fd => self.close_conn(id),
                _ => {}
            }
        }
    }

    fn drain_waker(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.waker_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(ref err) if would_block(err) => break,
                Err(ref err) if interrupted(err) => continue,
                Err(err) => {
                    warn!(%err, "waker drain failed");
                    break;
                }
            }
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.cfg.timeout_ms as u64)
    }

    fn shutdown(&mut self) {
        info!(clients = self.clients.len(), "server stopping");
        let _ = self.shared.reactor.unregister(self.listener.as_raw_fd());
        let keys: Vec<usize> = self.clients.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_conn(ConnId::from_slab_key(key));
        }
        // TaskPool::drop finishes in-flight tasks and joins the workers
    }
}

fn run_task<S: Session>(shared: &Shared, task: Task<S>) {
    let mut sess = task.sess.lock().unwrap_or_else(PoisonError::into_inner);
    let fd = sess.raw_fd();

    let alive = panic::catch_unwind(AssertUnwindSafe(|| match task.kind {
        TaskKind::Read => on_read(shared, task.id, &mut *sess),
        TaskKind::Write => on_write(shared, task.id, &mut *sess),
    }));

    match alive {
        Ok(true) => {}
        Ok(false) => shared.retire(task.id, fd),
        Err(_) => {
            warn!(fd, "session panicked; closing connection");
            shared.retire(task.id, fd);
        }
    }
}

fn on_read<S: Session>(shared: &Shared, id: ConnId, sess: &mut S) -> bool {
    match sess.read() {
        Ok(0) => {
            debug!(fd = sess.raw_fd(), peer = %sess.peer(), "peer closed");
            false
        }
        Ok(_) => on_process(shared, id, sess),
        // spurious wakeup; let the protocol look at what is already buffered
        Err(ref err) if would_block(err) => on_process(shared, id, sess),
        Err(err) => {
            debug!(fd = sess.raw_fd(), %err, "read failed");
            false
        }
    }
}

fn on_write<S: Session>(shared: &Shared, id: ConnId, sess: &mut S) -> bool {
    match sess.write() {
        Ok(_) => {
            if sess.pending_write() == 0 {
                if sess.keep_alive() {
                    // the read buffer may already hold a pipelined request
                    return on_process(shared, id, sess);
                }
                return false;
            }
            shared.rearm(sess.raw_fd(), id, EpollFlags::EPOLLOUT)
        }
        Err(ref err) if would_block(err) => shared.rearm(sess.raw_fd(), id, EpollFlags::EPOLLOUT),
        Err(err) => {
            debug!(fd = sess.raw_fd(), %err, "write failed");
            false
        }
    }
}

fn on_process<S: Session>(shared: &Shared, id: ConnId, sess: &mut S) -> bool {
    let ready = if sess.process() {
        EpollFlags::EPOLLOUT
    } else {
        EpollFlags::EPOLLIN
    };
    shared.rearm(sess.raw_fd(), id, ready)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
