// vim: tw=80
//! Common utility functions used throughout the FerroFS bio layer

use std::{
    hash::Hasher,
    ops::{Add, Div, Sub},
};

/// Sectors are the granularity of checksum coverage.  All I/O submitted to
/// this layer must be sector-aligned and sector-sized.
pub const BYTES_PER_SECTOR: usize = 4096;

/// Checksum an `IoVec`
///
/// Hashing a slice with `Hash` would include the slice's length, which we
/// don't want; a sector must hash the same no matter how it's wrapped.
pub fn checksum_iovec<T: AsRef<[u8]>, H: Hasher>(iovec: &T, hasher: &mut H) {
    hasher.write(iovec.as_ref());
}

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + Sub<Output=T>
{
    (dividend + divisor - T::from(1u8)) / divisor
}

// LCOV_EXCL_START
#[cfg(test)]
/// Helper to generate the runtime used by most unit tests
pub fn basic_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

// LCOV_EXCL_STOP
