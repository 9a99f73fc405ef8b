use std::time::{Duration, Instant};

use crate::source::EventSource;

pub mod poller;
pub mod ppoll;

/// Registered sources of one loop instance, in registration order.
///
/// Dispatch works on handle clones taken out of the table, so handlers may
/// mutate the table reentrantly while a firing is delivered.
pub(crate) struct SourceTable {
    entries: Vec<EventSource>,
}

impl SourceTable {
    pub(crate) fn new() -> SourceTable {
        SourceTable {
            entries: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(&mut self, source: EventSource) {
        self.entries.push(source);
    }

    pub(crate) fn remove(&mut self, key: usize) -> Option<EventSource> {
        let pos = self.entries.iter().position(|s| s.key() == key)?;
        Some(self.entries.remove(pos))
    }

    pub(crate) fn find(&self, key: usize) -> Option<EventSource> {
        self.entries
            .iter()
            .find(|s| s.key() == key)
            .map(|s| s.clone_handle())
    }

    /// Sources whose fd watch should be armed this iteration.
    pub(crate) fn fd_watched(&self) -> Vec<EventSource> {
        self.entries
            .iter()
            .filter(|s| s.raw_fd().is_some() && !s.fd_kinds().is_empty())
            .map(|s| s.clone_handle())
            .collect()
    }

    /// Time until the nearest timer deadline, rounded up so the wait never
    /// wakes before the deadline. `None` when no timer is armed.
    pub(crate) fn nearest_timeout(&self, now: Instant) -> Option<Duration> {
        self.entries
            .iter()
            .filter_map(|s| s.inner.borrow().deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Sources whose deadline has passed, as handle clones.
    pub(crate) fn expired(&self, now: Instant) -> Vec<EventSource> {
        self.entries
            .iter()
            .filter(|s| matches!(s.inner.borrow().deadline, Some(d) if d <= now))
            .map(|s| s.clone_handle())
            .collect()
    }
}

/// Delivers one timer firing to each expired source, re-arming persistent
/// timeouts before the handler runs, the way the watch rules demand. Spent
/// sources are retired through `retire`.
pub(crate) fn dispatch_timers(
    table: &std::cell::RefCell<SourceTable>,
    now: Instant,
    retire: impl Fn(&EventSource),
) {
    let expired = table.borrow().expired(now);
    for source in expired {
        {
            let mut inner = source.inner.borrow_mut();
            if inner.dead || !inner.registered {
                continue;
            }
            // A handler earlier in this batch may have pushed the deadline.
            match inner.deadline {
                Some(deadline) if deadline <= now => {}
                _ => continue,
            }
            if inner.timeout_once {
                inner.deadline = None;
            } else {
                // Interval spacing is measured from the firing, not from the
                // original deadline.
                let interval = inner.timeout.unwrap_or_default();
                inner.deadline = Some(now + interval);
            }
        }
        source.fire(crate::mask::EventMask::TIMEOUT);
        retire(&source);
    }
}
