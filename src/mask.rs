use bitflags::bitflags;

bitflags! {
    /// Reasons a source may fire, and modifiers on how a watch re-arms.
    ///
    /// `READABLE`, `WRITABLE` and `ONCE` configure an fd watch; `ONCE` alone
    /// is meaningful for a timeout watch. In a handler invocation the mask
    /// carries the reasons for that particular firing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventMask: u32 {
        /// The watched descriptor is readable.
        const READABLE = 1;
        /// The watched descriptor is writable.
        const WRITABLE = 2;
        /// The timeout interval elapsed.
        const TIMEOUT = 4;
        /// Disable the watch after it fires once instead of re-arming it.
        const ONCE = 8;
    }
}

impl EventMask {
    /// The readiness conditions of an fd watch, modifiers stripped.
    pub(crate) fn fd_kinds(self) -> EventMask {
        self & (EventMask::READABLE | EventMask::WRITABLE)
    }
}
