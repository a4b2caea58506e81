// vim: tw=80
//! Common type definitions used throughout subfiling

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use std::{fmt, io};

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so it
/// can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// A process's index within a communicator
pub type Rank = usize;

/// Zero-based index of a subfile within one logical file
pub type SubfileIdx = usize;

/// Subfiling's error type.  Basically just an errno
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive, Serialize)]
pub enum Error {
    #[error("No such file or directory")]
    ENOENT          = libc::ENOENT as isize,
    #[error("Interrupted system call")]
    EINTR           = libc::EINTR as isize,
    #[error("Input/output error")]
    EIO             = libc::EIO as isize,
    #[error("Device not configured")]
    ENXIO           = libc::ENXIO as isize,
    #[error("Bad file descriptor")]
    EBADF           = libc::EBADF as isize,
    #[error("Resource temporarily unavailable")]
    EAGAIN          = libc::EAGAIN as isize,
    #[error("Cannot allocate memory")]
    ENOMEM          = libc::ENOMEM as isize,
    #[error("File exists")]
    EEXIST          = libc::EEXIST as isize,
    #[error("Invalid argument")]
    EINVAL          = libc::EINVAL as isize,
    #[error("File too large")]
    EFBIG           = libc::EFBIG as isize,
    #[error("No space left on device")]
    ENOSPC          = libc::ENOSPC as isize,
    #[error("Broken pipe")]
    EPIPE           = libc::EPIPE as isize,
    #[error("Value too large to be stored in data type")]
    EOVERFLOW       = libc::EOVERFLOW as isize,
    #[error("Protocol error")]
    EPROTO          = libc::EPROTO as isize,

    // Subfiling-specific errors
    #[error("Unknown error")]
    EUNKNOWN        = 256,
}

impl Error {
    /// Log and convert an error that has no errno-shaped equivalent
    pub fn unhandled_error<E: fmt::Debug>(e: E) -> Error {
        tracing::error!("Unhandled error {:?}", e);
        Error::EUNKNOWN
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        match *e {
            bincode::ErrorKind::Io(ioe) => ioe.raw_os_error()
                .and_then(Error::from_i32)
                .unwrap_or(Error::EPROTO),
            _ => Error::EPROTO
        }
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        e.to_i32().unwrap()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// LCOV_EXCL_STOP
