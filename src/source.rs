use std::{
    cell::RefCell,
    os::fd::RawFd,
    rc::Rc,
    time::{Duration, Instant},
};

use crate::mask::EventMask;

/// Callback invoked when a source fires, with the source itself, the watched
/// descriptor (if any) and the reasons for this particular firing.
pub type Handler = Box<dyn FnMut(&EventSource, Option<RawFd>, EventMask)>;

/// An event source: one fd watch, one timeout watch, one handler.
///
/// A source is allocated through [`EventLoop::source_alloc`] and owned by the
/// loop that allocated it; this handle must never be passed to a different
/// loop. A source with neither an fd nor a timeout configured is legal but
/// never fires.
///
/// [`EventLoop::source_alloc`]: crate::EventLoop::source_alloc
pub struct EventSource {
    pub(crate) inner: Rc<RefCell<InnerSource>>,
}

/// The mutable state of a source.
///
/// Dispatchers hold a clone of the `Rc` across a handler invocation, so a
/// reentrant free from inside the handler only marks the source `dead` and
/// the storage goes away once the invocation unwinds.
pub(crate) struct InnerSource {
    /// Taken out while being invoked, so the handler can reconfigure or free
    /// its own source without a double borrow.
    pub(crate) handler: Option<Handler>,

    /// Watched descriptor, if any.
    pub(crate) fd: Option<RawFd>,

    /// Requested readiness conditions plus `ONCE`, for the fd watch.
    pub(crate) fd_flags: EventMask,

    /// Whether the fd watch is currently armed against the underlying loop.
    pub(crate) fd_armed: bool,

    /// Relative timeout interval; present iff a timeout watch is configured.
    pub(crate) timeout: Option<Duration>,

    /// Whether the timeout watch disables itself after one firing.
    pub(crate) timeout_once: bool,

    /// Next expiry, maintained while the source is registered.
    pub(crate) deadline: Option<Instant>,

    /// Whether the source is currently known to the running loop.
    pub(crate) registered: bool,

    /// Set by `source_free`; a dead source never fires again.
    pub(crate) dead: bool,

    /// Backend registration key, unique per loop instance.
    pub(crate) key: usize,
}

impl EventSource {
    pub(crate) fn new(key: usize, handler: Handler) -> EventSource {
        EventSource {
            inner: Rc::new(RefCell::new(InnerSource {
                handler: Some(handler),
                fd: None,
                fd_flags: EventMask::empty(),
                fd_armed: false,
                timeout: None,
                timeout_once: false,
                deadline: None,
                registered: false,
                dead: false,
                key,
            })),
        }
    }

    /// Internal clone; the public handle is deliberately not `Clone` so the
    /// alloc/free pairing stays with the caller.
    pub(crate) fn clone_handle(&self) -> EventSource {
        EventSource {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn key(&self) -> usize {
        self.inner.borrow().key
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.inner.borrow().fd
    }

    pub(crate) fn fd_kinds(&self) -> EventMask {
        self.inner.borrow().fd_flags.fd_kinds()
    }

    /// Whether the source is currently registered with its loop.
    pub fn is_registered(&self) -> bool {
        self.inner.borrow().registered
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.inner.borrow().dead
    }

    /// Replaces the fd configuration. Does not touch the timeout watch.
    pub(crate) fn set_fd_config(&self, fd: RawFd, flags: EventMask) {
        let mut inner = self.inner.borrow_mut();
        inner.fd = Some(fd);
        inner.fd_flags = flags & (EventMask::READABLE | EventMask::WRITABLE | EventMask::ONCE);
    }

    /// Replaces the timeout configuration. `None` disables the timeout watch
    /// without touching the fd watch.
    pub(crate) fn set_timeout_config(&self, interval: Option<Duration>, flags: EventMask) {
        let mut inner = self.inner.borrow_mut();
        match interval {
            Some(interval) => {
                inner.timeout = Some(interval);
                inner.timeout_once = flags.contains(EventMask::ONCE);
                if inner.registered {
                    inner.deadline = Some(Instant::now() + interval);
                }
            }
            None => {
                inner.timeout = None;
                inner.deadline = None;
            }
        }
    }

    /// Marks the source logically gone. The backing storage is released once
    /// the last internal clone drops, which may be after the handler
    /// currently executing for it returns.
    pub(crate) fn mark_dead(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.dead = true;
        inner.registered = false;
        inner.deadline = None;
        inner.handler = None;
    }

    /// Invokes the handler for one firing and applies the `ONCE` rule
    /// independently per watch kind.
    ///
    /// The handler runs with no borrow of the source held, so it may
    /// reconfigure, remove or free its own source reentrantly.
    pub(crate) fn fire(&self, reason: EventMask) {
        let (mut handler, fd) = {
            let mut inner = self.inner.borrow_mut();
            if inner.dead || !inner.registered {
                return;
            }
            (inner.handler.take(), inner.fd)
        };

        if let Some(handler) = handler.as_mut() {
            handler(self, fd, reason);
        }

        let mut inner = self.inner.borrow_mut();
        if inner.dead {
            // Freed from inside its own handler; the handler is dropped when
            // this invocation frame unwinds.
            return;
        }
        if inner.handler.is_none() {
            inner.handler = handler;
        }

        if !reason.fd_kinds().is_empty() && inner.fd_flags.contains(EventMask::ONCE) {
            // One-shot fd watch: disable the conditions, keep the source.
            inner.fd_flags.remove(EventMask::READABLE | EventMask::WRITABLE);
        }
        if reason.contains(EventMask::TIMEOUT) && inner.timeout_once {
            inner.timeout = None;
            inner.deadline = None;
        }
    }

    /// Whether any watch could still fire for this source.
    pub(crate) fn has_active_watch(&self) -> bool {
        let inner = self.inner.borrow();
        let fd_watch = inner.fd.is_some() && !inner.fd_flags.fd_kinds().is_empty();
        fd_watch || inner.timeout.is_some()
    }
}

impl std::fmt::Debug for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("EventSource")
            .field("key", &inner.key)
            .field("fd", &inner.fd)
            .field("fd_flags", &inner.fd_flags)
            .field("timeout", &inner.timeout)
            .field("registered", &inner.registered)
            .field("dead", &inner.dead)
            .finish()
    }
}
