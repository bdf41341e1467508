// vim: tw=80
//! Common type definitions used throughout the FerroFS bio layer

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use thiserror::Error;
use std::{fmt, io, pin::Pin};

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so
/// it can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Our scatter-gather list.  A slice of reference-counted `IoVec`s.
pub type SGList = Vec<IoVec>;

/// Identifies one physical device known to the `Dispatcher`.
pub type DeviceId = u32;

/// 1-based index identifying which redundant copy an operation targets.
///
/// 0 is only valid as a hint, meaning "any mirror".
pub type MirrorT = u8;

/// Future type of a single physical I/O.
pub type BoxIoFut = Pin<Box<dyn futures::Future<Output = Result<()>> + Send>>;

/// Transfer direction of an I/O request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
    /// A write to a sequential-write-only region.  Physical fragments of one
    /// logical append keep a single logical-offset identity for checksum
    /// addressing purposes.
    ZoneAppend,
}

impl Direction {
    pub fn is_write(self) -> bool {
        !matches!(self, Direction::Read)
    }

    /// Does this direction require strictly ordered submission?
    pub fn is_ordered(self) -> bool {
        matches!(self, Direction::ZoneAppend)
    }
}

/// The bio layer's error type.  Basically just an errno.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq, Primitive)]
pub enum Error {
    #[error("No such file or directory")]
    ENOENT          = libc::ENOENT as isize,
    #[error("Input/output error")]
    EIO             = libc::EIO as isize,
    #[error("Device not configured")]
    ENXIO           = libc::ENXIO as isize,
    #[error("Cannot allocate memory")]
    ENOMEM          = libc::ENOMEM as isize,
    #[error("Operation not supported by device")]
    ENODEV          = libc::ENODEV as isize,
    #[error("Invalid argument")]
    EINVAL          = libc::EINVAL as isize,
    #[error("No space left on device")]
    ENOSPC          = libc::ENOSPC as isize,
    #[error("Resource temporarily unavailable")]
    EAGAIN          = libc::EAGAIN as isize,
    #[error("Operation not supported")]
    EOPNOTSUPP      = libc::EOPNOTSUPP as isize,
    #[error("Operation canceled")]
    ECANCELED       = libc::ECANCELED as isize,

    // FerroFS custom error values below.  Not every target defines an errno
    // for integrity failures, so these use a private range.
    #[error("Integrity check failed")]
    EINTEGRITY      = 256,
    #[error("Unknown error")]
    EUNKNOWN        = 257,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        e.to_i32().unwrap()
    }
}

impl Error {
    pub fn unhandled<E: fmt::Debug>(e: E) {
        panic!("Unhandled error {e:?}")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use super::*;

#[test]
fn error_from_io_error() {
    let e = io::Error::from_raw_os_error(libc::EIO);
    assert_eq!(Error::EIO, Error::from(e));
    let e = io::Error::new(io::ErrorKind::Other, "no errno");
    assert_eq!(Error::EUNKNOWN, Error::from(e));
}

#[test]
fn error_roundtrips_i32() {
    assert_eq!(Some(Error::ENXIO), Error::from_i32(i32::from(Error::ENXIO)));
    assert_eq!(Some(Error::EINTEGRITY), Error::from_i32(256));
}

#[test]
fn direction() {
    assert!(!Direction::Read.is_write());
    assert!(Direction::Write.is_write());
    assert!(Direction::ZoneAppend.is_write());
    assert!(Direction::ZoneAppend.is_ordered());
    assert!(!Direction::Write.is_ordered());
}
}
// LCOV_EXCL_STOP
