//! A uniform interface for watching file descriptors and timeouts, satisfied
//! by pluggable event-loop backends.
//!
//! Client code allocates [`EventSource`]s from an [`EventLoop`], configures
//! an fd watch and/or a timeout watch on each, registers them and runs the
//! loop; the loop invokes each source's handler with a reason mask whenever
//! a watch fires. Which underlying polling mechanism services the watches is
//! decided once, at loop creation, through the backend registry.
//!
//! ```no_run
//! use std::time::Duration;
//! use anyloop::EventMask;
//!
//! anyloop::register_default_backends();
//! let el = anyloop::create(None).expect("no backend available");
//!
//! let source = el
//!     .source_alloc(|_source, _fd, mask| {
//!         if mask.contains(EventMask::TIMEOUT) {
//!             println!("tick");
//!         }
//!     })
//!     .unwrap();
//! el.set_timeout(&source, Some(Duration::from_millis(500)), EventMask::ONCE)
//!     .unwrap();
//! el.add(&source).unwrap();
//!
//! // Returns on its own: the one-shot timeout fires, the source
//! // unregisters itself, and no sources remain.
//! el.run();
//!
//! el.source_free(&source);
//! el.close();
//! ```
//!
//! Backends implement the [`Backend`] trait and self-describe through a
//! [`BackendDescriptor`]; two adapters ship with the crate, one over the
//! `polling` crate and one over plain `poll(2)`.

mod backend;
pub mod backends;
mod error;
mod event_loop;
#[cfg(test)]
mod event_loop_test;
mod mask;
pub mod registry;
mod source;

pub use backend::{Backend, BackendDescriptor};
pub use error::{Error, Result};
pub use event_loop::EventLoop;
pub use mask::EventMask;
pub use registry::{create, register, register_default_backends, Registry};
pub use source::{EventSource, Handler};
