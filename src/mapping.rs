// vim: tw=80
//! Logical-to-physical mapping boundary
//!
//! A `ChunkMapper` turns a logical byte range into physical targets.  The
//! stripe geometry itself lives behind the trait; this layer only consumes
//! the resolved result and dispatches on its kind.

use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(test)] use mockall::automock;

use crate::types::*;

/// A contiguous physical extent on one device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Stripe {
    pub device: DeviceId,
    pub offset: u64,
}

/// The resolved set of physical copies for one mapping decision.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MirrorSet {
    /// One stripe per mirror, ordered by mirror number (index 0 is mirror 1).
    pub stripes: Vec<Stripe>,
    /// Which entry is primary for this operation.
    pub chosen: MirrorT,
    /// How many mirror write failures this redundancy level can absorb.
    pub max_errors: u32,
}

/// Opaque descriptor of an erasure-coded stripe group.  Only the parity
/// engine interprets it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParityGroup {
    pub id: u64,
}

/// Physical dispatch paths, exhaustively enumerable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Target {
    Single(Stripe),
    Mirror(MirrorSet),
    Parity(ParityGroup),
}

/// One mapping decision.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    /// How much of the requested range this decision covers.  May be shorter
    /// than requested when the range crosses a stripe boundary.
    pub resolved_len: u64,
    /// Total redundant copies backing this range, for read repair.
    pub num_mirrors: MirrorT,
    /// Mirror number this decision targets (reads) or rotates on (parity).
    pub mirror: MirrorT,
    pub target: Target,
}

/// Resolves logical ranges to physical stripe sets.
///
/// Implementations must be callable concurrently and must not block on
/// physical I/O.
#[cfg_attr(test, automock)]
pub trait ChunkMapper: Send + Sync {
    /// Resolve the mapping covering `logical`.  `mirror_hint` of 0 lets the
    /// mapper choose; otherwise the indicated mirror is targeted.
    fn resolve(&self, logical: u64, len: u64, dir: Direction,
               mirror_hint: MirrorT) -> Result<Mapping>;

    /// Resolve exactly one mirror's stripe, bypassing fan-out.  Used by
    /// repair write-back to patch one known-bad copy.
    fn resolve_mirror(&self, logical: u64, len: u64, mirror: MirrorT)
        -> Result<Stripe>;
}

/// An N-way mirror mapper with uniform geometry.
///
/// Every device carries a full copy at identity offsets, and mapping
/// decisions never span a `stripe_len` boundary.  This is the pass-through
/// end of the mapper spectrum; parity layouts live in an external engine.
pub struct UniformMapper {
    devices: Vec<DeviceId>,
    stripe_len: u64,
    max_errors: u32,
    /// Wrapping index of the next mirror to read from.
    // To eliminate the need for atomic divisions, the index is allowed to
    // wrap at 2**32.
    next_read_idx: AtomicU32,
}

impl UniformMapper {
    pub fn new(devices: Vec<DeviceId>, stripe_len: u64, max_errors: u32)
        -> Self
    {
        assert!(!devices.is_empty(), "Need at least one device");
        assert!(stripe_len % crate::util::BYTES_PER_SECTOR as u64 == 0);
        assert!((max_errors as usize) < devices.len());
        UniformMapper {
            devices,
            stripe_len,
            max_errors,
            next_read_idx: AtomicU32::new(0),
        }
    }

    fn read_mirror(&self, hint: MirrorT) -> MirrorT {
        if hint != 0 {
            hint
        } else {
            let idx = self.next_read_idx.fetch_add(1, Ordering::Relaxed);
            (idx as usize % self.devices.len()) as MirrorT + 1
        }
    }
}

impl ChunkMapper for UniformMapper {
    fn resolve(&self, logical: u64, len: u64, dir: Direction,
               mirror_hint: MirrorT) -> Result<Mapping>
    {
        if len == 0 {
            return Err(Error::EINVAL);
        }
        let to_boundary = self.stripe_len - logical % self.stripe_len;
        let resolved_len = len.min(to_boundary);
        let num_mirrors = self.devices.len() as MirrorT;
        if dir.is_write() && self.devices.len() > 1 {
            let stripes = self.devices.iter()
                .map(|d| Stripe { device: *d, offset: logical })
                .collect::<Vec<_>>();
            let target = Target::Mirror(MirrorSet {
                stripes,
                chosen: 1,
                max_errors: self.max_errors,
            });
            Ok(Mapping { resolved_len, num_mirrors, mirror: 1, target })
        } else {
            let mirror = if dir.is_write() {
                1
            } else {
                self.read_mirror(mirror_hint)
            };
            let stripe = self.resolve_mirror(logical, resolved_len, mirror)?;
            Ok(Mapping {
                resolved_len,
                num_mirrors,
                mirror,
                target: Target::Single(stripe),
            })
        }
    }

    fn resolve_mirror(&self, logical: u64, _len: u64, mirror: MirrorT)
        -> Result<Stripe>
    {
        if mirror == 0 || mirror as usize > self.devices.len() {
            return Err(Error::EINVAL);
        }
        Ok(Stripe {
            device: self.devices[mirror as usize - 1],
            offset: logical,
        })
    }
}

// LCOV_EXCL_STOP
