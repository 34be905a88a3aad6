use std::io;

use crate::registry::Handle;

pub type Result<T> = std::result::Result<T, ShmemLibError>;

#[derive(Debug, thiserror::Error)]
pub enum ShmemLibError {
    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),

    /// An OS call failed; `source` carries the errno.
    #[error("OS error ({context}): {source}")]
    Os {
        context: String,
        #[source]
        source: io::Error,
    },

    // raw_sync hands out non-Send boxed errors; keep the message only
    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Mutex was poisoned")]
    PoisonedLock,

    #[error("Logic error: {0}")]
    Logic(String),

    /// No free block in a full pass of the ring. The segment is undersized for
    /// the message rate; callers must not retry inline.
    #[error("Ring exhausted: no free block among {blocks} blocks of {block_size} bytes in {segment}")]
    Exhausted {
        segment: String,
        blocks: usize,
        block_size: usize,
    },

    #[error("Double free of block at offset {offset}")]
    DoubleFree { offset: usize },

    #[error("Null pointer dereferenced")]
    NullPointer,

    #[error("Shared memory handle {0} is not registered")]
    NotRegistered(Handle),

    #[error("Pointer at offset {offset} is not valid in {segment}")]
    InvalidPointer { segment: String, offset: usize },

    #[error("Insufficient message buffer size: requested {requested}, available {available}")]
    BufferOverflow { requested: usize, available: usize },

    #[error("Read past end of message buffer: requested {requested}, available {available}")]
    BufferUnderrun { requested: usize, available: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ShmemLibError {
    pub fn os(context: impl Into<String>) -> Self {
        ShmemLibError::Os {
            context: context.into(),
            source: io::Error::last_os_error(),
        }
    }

    pub fn lock(err: Box<dyn std::error::Error>) -> Self {
        ShmemLibError::Lock(err.to_string())
    }

    pub fn logic(message: impl Into<String>) -> Self {
        ShmemLibError::Logic(message.into())
    }

    /// Errors that signal a process-level resource problem rather than
    /// something the call site can recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShmemLibError::Exhausted { .. })
    }
}

impl<T> From<std::sync::PoisonError<T>> for ShmemLibError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        ShmemLibError::PoisonedLock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion_is_the_only_fatal_class() {
        let exhausted = ShmemLibError::Exhausted {
            segment: "/ring".to_string(),
            blocks: 4,
            block_size: 68,
        };
        assert!(exhausted.is_fatal());
        assert!(!ShmemLibError::DoubleFree { offset: 0 }.is_fatal());
        assert!(!ShmemLibError::NullPointer.is_fatal());
    }

    #[test]
    fn os_error_keeps_context() {
        let err = ShmemLibError::Os {
            context: "shm_open /missing".to_string(),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        let text = err.to_string();
        assert!(text.contains("shm_open /missing"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
