use std::{io, os::fd::RawFd, time::Duration};

use crate::{
    error::Result,
    event_loop::EventLoop,
    mask::EventMask,
    source::{EventSource, Handler},
};

/// The operations an event-loop adapter must supply.
///
/// The façade ([`EventLoop`]) forwards every public operation here
/// unchanged; an adapter translates them into calls against one concrete
/// underlying loop. A loop instance and every source it allocated belong to
/// a single thread.
///
/// `run`, `exit` and `close` are infallible by contract: an adapter must
/// absorb internal failures there or treat them as fatal.
pub trait Backend {
    /// The name this adapter registers under.
    fn name(&self) -> &'static str;

    /// Allocates an unconfigured source bound to this loop.
    fn source_alloc(&self, handler: Handler) -> Result<EventSource>;

    /// Releases a source. If a handler invocation for it is in progress the
    /// storage outlives the invocation, but the source fires no further
    /// callbacks either way.
    fn source_free(&self, source: &EventSource);

    /// Replaces the source's fd watch. On an already-registered source the
    /// live watch is swapped, never stacked; on failure the previous
    /// configuration stays intact.
    fn set_fd(&self, source: &EventSource, fd: RawFd, flags: EventMask) -> Result<()>;

    /// Replaces the source's timeout watch, independently of the fd watch.
    /// `None` disables it. Same replacement and failure rules as `set_fd`.
    fn set_timeout(
        &self,
        source: &EventSource,
        interval: Option<Duration>,
        flags: EventMask,
    ) -> Result<()>;

    /// Registers the source; this is the point its watches go live.
    /// Adding an already-registered source is rejected.
    fn add(&self, source: &EventSource) -> Result<()>;

    /// Unregisters the source, disarming both watches. Removing a source
    /// that is not registered is reported, not ignored.
    fn remove(&self, source: &EventSource) -> Result<()>;

    /// Blocks until [`Backend::exit`] is called, the underlying loop
    /// terminates on its own, or no sources remain registered.
    fn run(&self);

    /// Makes the loop return from `run`. Safe to call when `run` was never
    /// entered; the next `run` then returns immediately.
    fn exit(&self);

    /// Tears the loop down. Sources allocated from it must already be freed.
    fn close(&self);
}

/// A registered backend: its name plus its standalone constructor.
///
/// Adapters hand a `&'static` descriptor to [`crate::registry::register`]
/// before any loop is created; registration is explicit rather than a
/// load-time side effect.
pub struct BackendDescriptor {
    /// Name used for selection in [`crate::create`].
    pub name: &'static str,

    /// Constructs a loop instance bound to a freshly allocated underlying
    /// loop.
    pub construct: fn() -> io::Result<EventLoop>,
}
