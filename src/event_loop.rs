use std::{os::fd::RawFd, rc::Rc, time::Duration};

use tracing::debug;

use crate::{
    backend::Backend,
    error::Result,
    mask::EventMask,
    registry,
    source::EventSource,
};

/// A loop instance bound to one backend.
///
/// Every operation forwards argument-preservingly to the backend's
/// [`Backend`] implementation; the façade adds nothing beyond a diagnostic
/// trace when a forwarded operation reports failure. Handles are cheap
/// clones over the same instance, so a handler can capture one and drive
/// the loop it is running on.
///
/// A loop and all sources allocated from it belong to the thread running
/// it. Passing a source to a loop other than the one that allocated it is a
/// precondition violation, not a recoverable error.
#[derive(Clone)]
pub struct EventLoop {
    backend: Rc<dyn Backend>,
}

impl EventLoop {
    /// Wraps a backend into a loop handle. Adapters call this from their
    /// standalone constructor.
    pub fn with_backend(backend: Rc<dyn Backend>) -> EventLoop {
        EventLoop { backend }
    }

    /// Constructs a loop from the process-wide backend registry. See
    /// [`crate::create`].
    pub fn create(preferred: Option<&str>) -> Option<EventLoop> {
        registry::create(preferred)
    }

    /// The name of the backend this loop is bound to.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Allocates an unconfigured source whose handler is invoked with the
    /// source, the watched fd (if any) and the reason mask of the firing.
    pub fn source_alloc(
        &self,
        handler: impl FnMut(&EventSource, Option<RawFd>, EventMask) + 'static,
    ) -> Result<EventSource> {
        let res = self.backend.source_alloc(Box::new(handler));
        if let Err(err) = &res {
            debug!(op = "source_alloc", %err, "backend reported failure");
        }
        res
    }

    /// Frees a source allocated from this loop. Safe to call from inside
    /// the source's own handler; destruction is then deferred until the
    /// handler returns.
    pub fn source_free(&self, source: &EventSource) {
        self.backend.source_free(source);
    }

    /// Sets the source's fd watch. Relevant flags: `READABLE`, `WRITABLE`
    /// and `ONCE`. Replaces any previous fd configuration.
    pub fn set_fd(&self, source: &EventSource, fd: RawFd, flags: EventMask) -> Result<()> {
        let res = self.backend.set_fd(source, fd, flags);
        if let Err(err) = &res {
            debug!(op = "set_fd", key = source.key(), fd, %err, "backend reported failure");
        }
        res
    }

    /// Sets the source's timeout watch; `None` disables it. The only
    /// relevant flag is `ONCE`.
    pub fn set_timeout(
        &self,
        source: &EventSource,
        interval: Option<Duration>,
        flags: EventMask,
    ) -> Result<()> {
        let res = self.backend.set_timeout(source, interval, flags);
        if let Err(err) = &res {
            debug!(op = "set_timeout", key = source.key(), %err, "backend reported failure");
        }
        res
    }

    /// Registers the source with the running loop; watches become live here.
    pub fn add(&self, source: &EventSource) -> Result<()> {
        let res = self.backend.add(source);
        if let Err(err) = &res {
            debug!(op = "add", key = source.key(), %err, "backend reported failure");
        }
        res
    }

    /// Unregisters the source, disarming both watches. The configuration is
    /// kept, so a later `add` restores the watches as configured.
    pub fn remove(&self, source: &EventSource) -> Result<()> {
        let res = self.backend.remove(source);
        if let Err(err) = &res {
            debug!(op = "remove", key = source.key(), %err, "backend reported failure");
        }
        res
    }

    /// Runs the loop until [`EventLoop::exit`] is called, the underlying
    /// loop terminates, or no sources remain registered.
    pub fn run(&self) {
        self.backend.run();
    }

    /// Makes the loop return from `run`. Safe even if `run` was never
    /// entered.
    pub fn exit(&self) {
        self.backend.exit();
    }

    /// Destroys this loop instance. Outstanding cloned handles keep the
    /// allocation alive until they drop, but the backend is torn down here.
    pub fn close(self) {
        self.backend.close();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("backend", &self.backend.name())
            .finish()
    }
}
