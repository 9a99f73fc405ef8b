use std::sync::Mutex;

use tracing::debug;

use crate::{backend::BackendDescriptor, backends, event_loop::EventLoop};

/// An ordered list of known backends.
///
/// The process-wide default lives behind [`register`] and [`create`]; the
/// type itself is plain data so selection semantics can be exercised on a
/// private instance.
pub struct Registry {
    backends: Vec<&'static BackendDescriptor>,
}

impl Registry {
    pub const fn new() -> Registry {
        Registry {
            backends: Vec::new(),
        }
    }

    /// Appends a backend. Registering the same descriptor twice is a no-op;
    /// identity is the descriptor's address, not its name.
    pub fn register(&mut self, backend: &'static BackendDescriptor) {
        if self.backends.iter().any(|b| std::ptr::eq(*b, backend)) {
            return;
        }
        self.backends.push(backend);
    }

    /// Constructs a loop instance.
    ///
    /// With a preferred name, only an exactly matching backend is
    /// considered; a miss yields `None` rather than a fallback. Without
    /// one, the first registered backend wins. An empty registry yields
    /// `None`.
    pub fn create(&self, preferred: Option<&str>) -> Option<EventLoop> {
        let descriptor = match preferred {
            Some(name) => self.backends.iter().find(|b| b.name == name)?,
            None => self.backends.first()?,
        };
        match (descriptor.construct)() {
            Ok(el) => Some(el),
            Err(err) => {
                debug!(backend = descriptor.name, %err, "backend constructor failed");
                None
            }
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.backends.iter().map(|b| b.name)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new()
    }
}

static GLOBAL: Mutex<Registry> = Mutex::new(Registry::new());

/// Adds a backend to the process-wide registry. Idempotent per descriptor.
pub fn register(backend: &'static BackendDescriptor) {
    GLOBAL.lock().unwrap().register(backend);
}

/// Registers the adapters shipped with this crate, in preference order:
/// "polling" first, then "poll".
pub fn register_default_backends() {
    register(&backends::poller::DESCRIPTOR);
    register(&backends::ppoll::DESCRIPTOR);
}

/// Constructs a loop from the process-wide registry. See
/// [`Registry::create`] for the selection rules.
pub fn create(preferred: Option<&str>) -> Option<EventLoop> {
    GLOBAL.lock().unwrap().create(preferred)
}
