//! Error taxonomy of the video-memory subsystem.
//!
//! Every public operation reports one of four kinds. The payload names the
//! precondition that failed so a log line is self-explanatory without a
//! backtrace.

use crate::heap::HeapError;

/// Errors returned by allocate/free/map/flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VidMemError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    #[error("I/O error: {0}")]
    Io(&'static str),
    #[error("not supported: {0}")]
    NotSupported(&'static str),
}

/// Failures reported by the OS memory services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OsError {
    #[error("no memory available")]
    NoMemory,
    #[error("address fault")]
    Fault,
    #[error("bad file descriptor")]
    BadDescriptor,
    #[error("operation not supported by the platform")]
    Unsupported,
}

impl From<OsError> for VidMemError {
    fn from(value: OsError) -> Self {
        match value {
            OsError::NoMemory => Self::OutOfMemory("OS allocator exhausted"),
            OsError::Fault => Self::Io("OS reported an address fault"),
            OsError::BadDescriptor => Self::InvalidArgument("bad file descriptor"),
            OsError::Unsupported => Self::NotSupported("OS service unavailable"),
        }
    }
}

impl From<HeapError> for VidMemError {
    fn from(value: HeapError) -> Self {
        match value {
            HeapError::Exhausted => Self::OutOfMemory("heap has no free block large enough"),
            HeapError::InvalidSize => Self::InvalidArgument("invalid heap request size"),
            HeapError::InvalidAlignment => Self::InvalidArgument("alignment is not a power of two"),
            HeapError::StaleBlock => Self::InvalidArgument("heap block already freed"),
        }
    }
}

/// Result type used throughout the crate.
pub type Result<T, E = VidMemError> = core::result::Result<T, E>;
