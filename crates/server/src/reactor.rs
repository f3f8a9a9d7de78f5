use anyhow::{Context, Result};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollTimeout};
use std::os::fd::{BorrowedFd, RawFd};

pub use nix::sys::epoll::{EpollEvent, EpollFlags};

/// Readiness notification over `epoll(7)`.
///
/// Registrations carry a u64 token in the event payload; the event loop maps
/// tokens back to connections. All mutating calls take `&self`, so workers can
/// rearm ONESHOT descriptors through a shared handle while the loop thread
/// waits.
pub struct Reactor {
    epoll: Epoll,
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).context("epoll_create1")?;
        Ok(Self { epoll })
    }

    pub fn register(&self, fd: RawFd, token: u64, interest: EpollFlags) -> nix::Result<()> {
        self.epoll.add(borrow(fd), EpollEvent::new(interest, token))
    }

    /// Rearm interest on an already-registered descriptor. Required after
    /// every ONESHOT delivery.
    pub fn modify(&self, fd: RawFd, token: u64, interest: EpollFlags) -> nix::Result<()> {
        self.epoll.modify(borrow(fd), &mut EpollEvent::new(interest, token))
    }

    /// Remove a descriptor. Must happen before `close(2)` so the kernel never
    /// delivers events for a recycled fd number.
    pub fn unregister(&self, fd: RawFd) -> nix::Result<()> {
        self.epoll.delete(borrow(fd))
    }

    /// Block up to `timeout_ms` (-1 = until an event, 0 = poll) and fill
    /// `events`. Returns the number of ready entries.
    pub fn wait(&self, events: &mut [EpollEvent], timeout_ms: i64) -> nix::Result<usize> {
        let timeout = if timeout_ms < 0 {
            EpollTimeout::NONE
        } else {
            // clamping only costs an extra wakeup; the loop re-checks timers
            EpollTimeout::from(timeout_ms.min(i64::from(u16::MAX)) as u16)
        };
        self.epoll.wait(events, timeout)
    }
}

// The connection table keeps every registered fd open until after its
// unregister call, so the borrow never outlives the descriptor.
fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}
