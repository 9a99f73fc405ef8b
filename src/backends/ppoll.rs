use std::{
    cell::{Cell, RefCell},
    io,
    os::fd::{BorrowedFd, RawFd},
    rc::Rc,
    time::{Duration, Instant},
};

use nix::poll::{poll, PollFd, PollFlags};
use tracing::debug;

use crate::{
    backend::{Backend, BackendDescriptor},
    backends::{dispatch_timers, SourceTable},
    error::{Error, Result},
    event_loop::EventLoop,
    mask::EventMask,
    source::{EventSource, Handler},
};

pub static DESCRIPTOR: BackendDescriptor = BackendDescriptor {
    name: "poll",
    construct,
};

fn construct() -> io::Result<EventLoop> {
    Ok(EventLoop::with_backend(Rc::new(PpollBackend::new())))
}

/// Adapter over plain `poll(2)`.
///
/// The poll set is rebuilt from the registered sources on every iteration,
/// so watch replacement needs no kernel bookkeeping at all. Deviation from
/// the contract's ideal: an in-flight `poll` cannot be unblocked from
/// another thread, so `exit` only takes effect on the next wakeup; it is
/// meant to be called from a handler running on the loop thread.
pub struct PpollBackend {
    table: RefCell<SourceTable>,
    exit_requested: Cell<bool>,
    running: Cell<bool>,
    next_key: Cell<usize>,
}

impl PpollBackend {
    pub fn new() -> PpollBackend {
        PpollBackend {
            table: RefCell::new(SourceTable::new()),
            exit_requested: Cell::new(false),
            running: Cell::new(false),
            next_key: Cell::new(1),
        }
    }

    fn retire_if_spent(&self, source: &EventSource) {
        {
            let inner = source.inner.borrow();
            if inner.dead || !inner.registered {
                return;
            }
        }
        if source.has_active_watch() {
            return;
        }
        {
            let mut inner = source.inner.borrow_mut();
            inner.registered = false;
            inner.fd_armed = false;
            inner.deadline = None;
        }
        self.table.borrow_mut().remove(source.key());
    }

    fn poll_once(&self) -> io::Result<()> {
        let watched = self.table.borrow().fd_watched();

        // The sources own their descriptors for the duration of the watch;
        // fd validity is the caller's precondition.
        let borrowed: Vec<BorrowedFd<'_>> = watched
            .iter()
            .map(|s| unsafe { BorrowedFd::borrow_raw(s.raw_fd().unwrap_or(-1)) })
            .collect();
        let mut fds: Vec<PollFd<'_>> = watched
            .iter()
            .zip(&borrowed)
            .map(|(s, fd)| PollFd::new(fd, request_flags(s.fd_kinds())))
            .collect();

        let timeout = timeout_ms(self.table.borrow().nearest_timeout(Instant::now()));
        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(()),
            Err(errno) => return Err(io::Error::from(errno)),
        }

        let revents: Vec<PollFlags> = fds
            .iter()
            .map(|pfd| pfd.revents().unwrap_or(PollFlags::empty()))
            .collect();
        drop(fds);
        drop(borrowed);

        for (source, revents) in watched.iter().zip(revents) {
            let reason = delivered_mask(revents) & source.fd_kinds();
            if reason.is_empty() {
                continue;
            }
            source.fire(reason);
            self.retire_if_spent(source);
        }

        dispatch_timers(&self.table, Instant::now(), |source| {
            self.retire_if_spent(source)
        });
        Ok(())
    }
}

impl Backend for PpollBackend {
    fn name(&self) -> &'static str {
        DESCRIPTOR.name
    }

    fn source_alloc(&self, handler: Handler) -> Result<EventSource> {
        let key = self.next_key.get();
        self.next_key.set(key + 1);
        Ok(EventSource::new(key, handler))
    }

    fn source_free(&self, source: &EventSource) {
        if source.is_registered() {
            self.table.borrow_mut().remove(source.key());
        }
        source.mark_dead();
    }

    fn set_fd(&self, source: &EventSource, fd: RawFd, flags: EventMask) -> Result<()> {
        if source.is_dead() {
            return Err(Error::NotRegistered);
        }
        // The poll set is derived from the configuration each iteration, so
        // replacing it is atomic by construction.
        source.set_fd_config(fd, flags);
        let mut inner = source.inner.borrow_mut();
        inner.fd_armed = inner.registered && !inner.fd_flags.fd_kinds().is_empty();
        Ok(())
    }

    fn set_timeout(
        &self,
        source: &EventSource,
        interval: Option<Duration>,
        flags: EventMask,
    ) -> Result<()> {
        if source.is_dead() {
            return Err(Error::NotRegistered);
        }
        source.set_timeout_config(interval, flags);
        Ok(())
    }

    fn add(&self, source: &EventSource) -> Result<()> {
        if source.is_dead() {
            return Err(Error::NotRegistered);
        }
        if source.is_registered() {
            return Err(Error::AlreadyRegistered);
        }
        {
            let mut inner = source.inner.borrow_mut();
            inner.registered = true;
            inner.fd_armed = inner.fd.is_some() && !inner.fd_flags.fd_kinds().is_empty();
            inner.deadline = inner.timeout.map(|interval| Instant::now() + interval);
        }
        self.table.borrow_mut().insert(source.clone_handle());
        Ok(())
    }

    fn remove(&self, source: &EventSource) -> Result<()> {
        if !source.is_registered() {
            return Err(Error::NotRegistered);
        }
        {
            let mut inner = source.inner.borrow_mut();
            inner.registered = false;
            inner.fd_armed = false;
            inner.deadline = None;
        }
        self.table.borrow_mut().remove(source.key());
        Ok(())
    }

    fn run(&self) {
        if self.running.replace(true) {
            return;
        }
        loop {
            if self.exit_requested.replace(false) {
                break;
            }
            if self.table.borrow().is_empty() {
                break;
            }
            if let Err(err) = self.poll_once() {
                debug!(%err, "poll failed, leaving the loop");
                break;
            }
        }
        self.running.set(false);
    }

    fn exit(&self) {
        self.exit_requested.set(true);
    }

    fn close(&self) {
        self.table.replace(SourceTable::new());
    }
}

fn request_flags(kinds: EventMask) -> PollFlags {
    let mut flags = PollFlags::empty();
    if kinds.contains(EventMask::READABLE) {
        flags |= PollFlags::POLLIN | PollFlags::POLLPRI;
    }
    if kinds.contains(EventMask::WRITABLE) {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

fn delivered_mask(revents: PollFlags) -> EventMask {
    let mut mask = EventMask::empty();
    let readable =
        PollFlags::POLLIN | PollFlags::POLLPRI | PollFlags::POLLHUP | PollFlags::POLLERR;
    if revents.intersects(readable) {
        mask |= EventMask::READABLE;
    }
    if revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR) {
        mask |= EventMask::WRITABLE;
    }
    mask
}

/// Milliseconds until the nearest deadline, rounded up; `-1` blocks.
fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(timeout) => {
            let ms = (timeout.as_nanos() + 999_999) / 1_000_000;
            ms.min(i32::MAX as u128) as i32
        }
    }
}
