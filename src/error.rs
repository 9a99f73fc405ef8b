use std::io;

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the loop operations.
///
/// Every variant maps onto the platform errno vocabulary through
/// [`Error::errno`]; success is simply `Ok`.
#[derive(Debug, Error)]
pub enum Error {
    /// Source allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The source is unknown to the loop, already removed, or freed.
    #[error("source is not registered")]
    NotRegistered,

    /// `add` was called on a source that is already registered.
    #[error("source is already registered")]
    AlreadyRegistered,

    /// The underlying event-loop mechanism rejected the request.
    #[error("backend error: {0}")]
    Backend(#[from] io::Error),
}

impl Error {
    /// The errno equivalent of this error.
    pub fn errno(&self) -> Errno {
        match self {
            Error::OutOfMemory => Errno::ENOMEM,
            Error::NotRegistered => Errno::ENOENT,
            Error::AlreadyRegistered => Errno::EEXIST,
            Error::Backend(err) => err
                .raw_os_error()
                .map(Errno::from_i32)
                .unwrap_or(Errno::EIO),
        }
    }
}
