use std::{
    cell::{Cell, RefCell},
    io,
    os::fd::RawFd,
    rc::Rc,
    time::{Duration, Instant},
};

use polling::Poller;
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
    name: "polling",
    construct,
};

fn construct() -> io::Result<EventLoop> {
    Ok(EventLoop::with_backend(Rc::new(PollerBackend::new()?)))
}

/// Adapter over [`polling::Poller`] (epoll / kqueue underneath).
///
/// `polling` delivers fd events in oneshot mode, so persistent watches are
/// re-armed with `modify` after every delivery. Timer watches share the
/// single wait: each iteration sleeps until the nearest deadline. `exit`
/// is usable from another execution context here, since `notify` unblocks
/// an in-flight wait.
pub struct PollerBackend {
    poller: Poller,
    table: RefCell<SourceTable>,
    exit_requested: Cell<bool>,
    running: Cell<bool>,
    next_key: Cell<usize>,
}

impl PollerBackend {
    pub fn new() -> io::Result<PollerBackend> {
        Ok(PollerBackend {
            poller: Poller::new()?,
            table: RefCell::new(SourceTable::new()),
            exit_requested: Cell::new(false),
            running: Cell::new(false),
            next_key: Cell::new(1),
        })
    }

    fn dispatch_fd(&self, event: &polling::Event) {
        let source = match self.table.borrow().find(event.key) {
            Some(source) => source,
            None => return,
        };

        let mut delivered = EventMask::empty();
        if event.readable {
            delivered |= EventMask::READABLE;
        }
        if event.writable {
            delivered |= EventMask::WRITABLE;
        }

        let reason = delivered & source.fd_kinds();
        if !reason.is_empty() {
            source.fire(reason);
        }
        self.rearm_fd(&source);
    }

    /// Puts the oneshot-delivered fd watch back into the state the source's
    /// configuration asks for.
    fn rearm_fd(&self, source: &EventSource) {
        let (dead, registered, fd, flags) = {
            let inner = source.inner.borrow();
            (inner.dead, inner.registered, inner.fd, inner.fd_flags)
        };
        if dead || !registered {
            // A reentrant free or remove already disarmed everything.
            return;
        }
        let fd = match fd {
            Some(fd) => fd,
            None => return,
        };

        if !flags.fd_kinds().is_empty() {
            if let Err(err) = self.poller.modify(fd, interest(source.key(), flags)) {
                debug!(fd, %err, "failed to re-arm fd watch");
            }
        } else {
            // A ONCE watch just spent itself.
            let _ = self.poller.delete(fd);
            source.inner.borrow_mut().fd_armed = false;
            self.retire_if_spent(source);
        }
    }

    /// Unregisters a source that no longer has any watch able to fire.
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
        self.disarm(source);
        let mut inner = source.inner.borrow_mut();
        inner.registered = false;
        inner.deadline = None;
        drop(inner);
        self.table.borrow_mut().remove(source.key());
    }

    fn disarm(&self, source: &EventSource) {
        let mut inner = source.inner.borrow_mut();
        if inner.fd_armed {
            if let Some(fd) = inner.fd {
                let _ = self.poller.delete(fd);
            }
            inner.fd_armed = false;
        }
    }
}

impl Backend for PollerBackend {
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
            self.disarm(source);
            self.table.borrow_mut().remove(source.key());
        }
        source.mark_dead();
    }

    fn set_fd(&self, source: &EventSource, fd: RawFd, flags: EventMask) -> Result<()> {
        if source.is_dead() {
            return Err(Error::NotRegistered);
        }
        let flags = flags & (EventMask::READABLE | EventMask::WRITABLE | EventMask::ONCE);
        let key = source.key();
        let (registered, old_fd, old_flags, armed) = {
            let inner = source.inner.borrow();
            (inner.registered, inner.fd, inner.fd_flags, inner.fd_armed)
        };

        let want_arm = registered && !flags.fd_kinds().is_empty();
        if registered {
            // Swap the live watch before committing, so a failure leaves the
            // previous configuration (and its armed watch) intact.
            match old_fd {
                Some(old) if armed && old == fd && want_arm => {
                    self.poller.modify(fd, interest(key, flags))?;
                }
                Some(old) if armed => {
                    self.poller.delete(old)?;
                    if want_arm {
                        if let Err(err) = self.poller.add(fd, interest(key, flags)) {
                            let _ = self.poller.add(old, interest(key, old_flags));
                            return Err(err.into());
                        }
                    }
                }
                _ if want_arm => {
                    self.poller.add(fd, interest(key, flags))?;
                }
                _ => {}
            }
        }

        source.set_fd_config(fd, flags);
        source.inner.borrow_mut().fd_armed = want_arm;
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

        if let Some(fd) = source.raw_fd() {
            if !source.fd_kinds().is_empty() {
                let flags = source.inner.borrow().fd_flags;
                self.poller.add(fd, interest(source.key(), flags))?;
                source.inner.borrow_mut().fd_armed = true;
            }
        }
        {
            let mut inner = source.inner.borrow_mut();
            inner.registered = true;
            inner.deadline = inner.timeout.map(|interval| Instant::now() + interval);
        }
        self.table.borrow_mut().insert(source.clone_handle());
        Ok(())
    }

    fn remove(&self, source: &EventSource) -> Result<()> {
        if !source.is_registered() {
            return Err(Error::NotRegistered);
        }
        self.disarm(source);
        {
            let mut inner = source.inner.borrow_mut();
            inner.registered = false;
            inner.deadline = None;
        }
        self.table.borrow_mut().remove(source.key());
        Ok(())
    }

    fn run(&self) {
        if self.running.replace(true) {
            return;
        }
        let mut events = Vec::new();
        loop {
            if self.exit_requested.replace(false) {
                break;
            }
            if self.table.borrow().is_empty() {
                break;
            }

            let timeout = self.table.borrow().nearest_timeout(Instant::now());
            events.clear();
            match self.poller.wait(&mut events, timeout) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(%err, "poller wait failed, leaving the loop");
                    break;
                }
            }

            for event in &events {
                self.dispatch_fd(event);
            }
            dispatch_timers(&self.table, Instant::now(), |source| {
                self.retire_if_spent(source)
            });
        }
        self.running.set(false);
    }

    fn exit(&self) {
        self.exit_requested.set(true);
        let _ = self.poller.notify();
    }

    fn close(&self) {
        // Drop all registrations; the poller itself goes with the instance.
        self.table.replace(SourceTable::new());
    }
}

fn interest(key: usize, flags: EventMask) -> polling::Event {
    polling::Event {
        key,
        readable: flags.contains(EventMask::READABLE),
        writable: flags.contains(EventMask::WRITABLE),
    }
}
