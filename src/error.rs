//! Error kinds raised by the allocator core.
//!
//! The four kinds mirror the four ways a caller can misuse a buffer or
//! a pool: bad arguments, use-after-dispose, refcount abuse, and asking
//! a collaborator (the stream adapter) for something it doesn't do.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("buffer access: {0}")]
    BufferAccess(String),

    #[error("reference count: {0}")]
    RefCount(String),

    #[error("not supported: {0}")]
    NotSupported(String),
}

impl BufError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        BufError::InvalidArgument(msg.into())
    }

    pub(crate) fn access(msg: impl Into<String>) -> Self {
        BufError::BufferAccess(msg.into())
    }

    pub(crate) fn refcount(msg: impl Into<String>) -> Self {
        BufError::RefCount(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        BufError::NotSupported(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, BufError>;

/// The stream adapter speaks `std::io`; map our error kinds onto the
/// closest `io::ErrorKind`.
impl From<BufError> for std::io::Error {
    fn from(err: BufError) -> Self {
        use std::io::ErrorKind;

        let kind = match &err {
            BufError::InvalidArgument(_) => ErrorKind::InvalidInput,
            BufError::BufferAccess(_) => ErrorKind::Other,
            BufError::RefCount(_) => ErrorKind::Other,
            BufError::NotSupported(_) => ErrorKind::Unsupported,
        };

        std::io::Error::new(kind, err)
    }
}
