// vim: tw=80
//! The block-device boundary of the bio layer
//!
//! `BlockDevice` is the underlying submission primitive.  Everything above it
//! (mapping, fan-out, repair) is this crate's job; everything below it (queue
//! scheduling, the actual disks) is somebody else's.

use std::{
    collections::BTreeMap,
    sync::Mutex
};

use futures::future;
#[cfg(test)] use mockall::automock;

use crate::types::*;

/// One physical block device, addressed by byte offset.
///
/// `read_at` and `write_at` must be callable concurrently from multiple
/// tasks.  The returned future completes on an arbitrary context; callers
/// must not block inside its continuation.
#[cfg_attr(test, automock)]
pub trait BlockDevice: Send + Sync {
    /// Read `buf.len()` bytes at `off`, filling `buf`.
    fn read_at(&self, buf: IoVecMut, off: u64) -> BoxIoFut;

    /// Write the contents of `buf` at `off`.
    fn write_at(&self, buf: IoVec, off: u64) -> BoxIoFut;
}

/// Classes of per-device observability counters.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum StatKind {
    ReadErrors,
    WriteErrors,
    FlushErrors,
    /// A copy was found with valid I/O status but bad contents.
    CorruptionErrors,
}

/// Fire-and-forget per-device error accounting.
#[cfg_attr(test, automock)]
pub trait DeviceStats: Send + Sync {
    fn record(&self, dev: DeviceId, kind: StatKind);
}

/// The stock `DeviceStats` sink: per-(device, kind) counters.
#[derive(Default)]
pub struct StatsLedger {
    counts: Mutex<BTreeMap<(DeviceId, StatKind), u64>>,
}

impl StatsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dev: DeviceId, kind: StatKind) -> u64 {
        *self.counts.lock().unwrap().get(&(dev, kind)).unwrap_or(&0)
    }
}

impl DeviceStats for StatsLedger {
    fn record(&self, dev: DeviceId, kind: StatKind) {
        *self.counts.lock().unwrap().entry((dev, kind)).or_insert(0) += 1;
    }
}

/// A memory-backed `BlockDevice`.
///
/// Stands in for a leaf disk in functional tests, the way a file-backed vdev
/// would in production.  Contents start zeroed.
pub struct RamDevice {
    data: Mutex<Vec<u8>>,
}

impl RamDevice {
    pub fn new(size: usize) -> Self {
        RamDevice { data: Mutex::new(vec![0u8; size]) }
    }

    /// Flip every byte in the given range, simulating media corruption.
    pub fn corrupt(&self, off: u64, len: usize) {
        let mut data = self.data.lock().unwrap();
        for b in &mut data[off as usize..off as usize + len] {
            *b = !*b;
        }
    }

    /// Copy out the given range for inspection.
    pub fn snapshot(&self, off: u64, len: usize) -> Vec<u8> {
        self.data.lock().unwrap()[off as usize..off as usize + len].to_vec()
    }
}

impl BlockDevice for RamDevice {
    fn read_at(&self, mut buf: IoVecMut, off: u64) -> BoxIoFut {
        let data = self.data.lock().unwrap();
        let end = off as usize + buf.len();
        let r = if end > data.len() {
            Err(Error::EINVAL)
        } else {
            buf[..].copy_from_slice(&data[off as usize..end]);
            Ok(())
        };
        Box::pin(future::ready(r))
    }

    fn write_at(&self, buf: IoVec, off: u64) -> BoxIoFut {
        let mut data = self.data.lock().unwrap();
        let end = off as usize + buf.len();
        let r = if end > data.len() {
            Err(Error::EINVAL)
        } else {
            data[off as usize..end].copy_from_slice(&buf[..]);
            Ok(())
        };
        Box::pin(future::ready(r))
    }
}

// LCOV_EXCL_STOP
